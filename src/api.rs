//! HTTP plumbing for the face service: wire schemas, the JSON transport and
//! per-request cancellation.
//!
//! Every response is narrowed through an explicit schema here. Anything that
//! does not deserialize, or carries out-of-range scores, becomes
//! [`FaceError::Protocol`] before it reaches the client.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::error::{FaceError, Result};
use crate::types::{BatchCompareReport, BatchItemFailure, BatchItemOutcome, CompareOutcome};

pub(crate) const INIT_PATH: &[&str] = &["api", "face-init"];
pub(crate) const COMPARE_PATH: &[&str] = &["api", "face-compare"];
pub(crate) const COMPARE_BATCH_PATH: &[&str] = &["api", "face-compare-batch"];
pub(crate) const USERS_PATH: &[&str] = &["api", "users"];
pub(crate) const HEALTH_PATH: &[&str] = &["health"];
pub(crate) const ROOT_PATH: &[&str] = &[];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ── Cancellation ────────────────────────────────────────────────────────

/// Cancellation handle bound to one in-flight operation.
///
/// Clones share state: cancelling any clone cancels them all.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // `self` keeps the sender alive, so the channel cannot close here.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Set of cancel tokens for the requests a client currently has in flight.
#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    tokens: DashMap<u64, CancelToken>,
    next_id: AtomicU64,
}

impl PendingRequests {
    /// Track a fresh token until the returned guard drops.
    pub(crate) fn register(&self) -> PendingGuard<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancelToken::new();
        self.tokens.insert(id, token.clone());
        PendingGuard {
            owner: self,
            id,
            token,
        }
    }

    /// Cancel and forget every tracked token. Returns how many were cancelled.
    pub(crate) fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        self.tokens.retain(|_, token| {
            token.cancel();
            cancelled += 1;
            false
        });
        cancelled
    }

    pub(crate) fn len(&self) -> usize {
        self.tokens.len()
    }
}

/// Removes its token from [`PendingRequests`] on drop.
pub(crate) struct PendingGuard<'a> {
    owner: &'a PendingRequests,
    id: u64,
    token: CancelToken,
}

impl PendingGuard<'_> {
    pub(crate) fn token(&self) -> &CancelToken {
        &self.token
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.owner.tokens.remove(&self.id);
    }
}

// ── Transport ───────────────────────────────────────────────────────────

/// Per-call settings captured from the client's config/options snapshot.
#[derive(Debug, Clone)]
pub(crate) struct CallContext<'a> {
    pub(crate) base_url: &'a Url,
    pub(crate) auth_token: Option<&'a str>,
    pub(crate) timeout: Duration,
}

/// Resolve `segments` under the service base URL, percent-encoding each one.
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| FaceError::Config(format!("endpoint base URL `{base}` cannot be a base")))?
        .pop_if_empty()
        .extend(segments);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// JSON-over-HTTP transport shared by all operations of one client.
#[derive(Debug, Clone)]
pub(crate) struct Transport {
    http: reqwest::Client,
}

impl Transport {
    pub(crate) fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| FaceError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }

    /// Send one request and decode the 2xx body as `T`.
    ///
    /// The call fails with [`FaceError::Timeout`] once `ctx.timeout` elapses
    /// and with [`FaceError::Cancelled`] as soon as `token` is cancelled; in
    /// both cases the underlying connection attempt is dropped.
    pub(crate) async fn call<B, T>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&B>,
        ctx: &CallContext<'_>,
        token: &CancelToken,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        if token.is_cancelled() {
            return Err(FaceError::Cancelled);
        }

        let url = endpoint(ctx.base_url, segments)?;
        let mut request = self
            .http
            .request(method, url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json");
        if let Some(auth) = ctx.auth_token {
            request = request.bearer_auth(auth);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(FaceError::Http {
                    status: status.as_u16(),
                    status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
                });
            }
            let bytes = response
                .bytes()
                .await
                .map_err(|e| FaceError::Network(format!("failed to read response body: {e}")))?;
            serde_json::from_slice::<T>(&bytes).map_err(|e| {
                FaceError::Protocol(format!(
                    "unexpected response from /{}: {e}",
                    segments.join("/")
                ))
            })
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(FaceError::Cancelled),
            outcome = tokio::time::timeout(ctx.timeout, exchange) => {
                outcome.unwrap_or(Err(FaceError::Timeout(ctx.timeout)))
            }
        }
    }
}

// ── Wire schemas ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InitRequest<'a> {
    pub(crate) image_data: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) user_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CompareRequest<'a> {
    pub(crate) image_data: &'a str,
    pub(crate) user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) threshold: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CompareBatchRequest<'a> {
    pub(crate) image_data_list: Vec<&'a str>,
    pub(crate) user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) threshold: Option<f64>,
}

/// `{ success, message, data? }` wrapper used by the service's POST routes.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    pub(crate) success: bool,
    #[serde(default)]
    pub(crate) message: String,
    #[serde(default = "Option::default")]
    pub(crate) data: Option<T>,
}

impl<T> Envelope<T> {
    /// The payload of a successful response.
    pub(crate) fn into_data(self, operation: &str) -> Result<T> {
        if !self.success {
            return Err(rejection(self.message, operation));
        }
        self.data.ok_or_else(|| {
            FaceError::Protocol(format!("{operation} succeeded without a `data` payload"))
        })
    }

    /// Success flag only; `data` is ignored.
    pub(crate) fn into_message(self, operation: &str) -> Result<String> {
        if !self.success {
            return Err(rejection(self.message, operation));
        }
        Ok(self.message)
    }
}

fn rejection(message: String, operation: &str) -> FaceError {
    if message.trim().is_empty() {
        FaceError::Rejected(format!("{operation} failed"))
    } else {
        FaceError::Rejected(message)
    }
}

/// Accept either a bare `T` or a `{ success, message, data: T }` envelope.
pub(crate) fn narrow_maybe_enveloped<T: DeserializeOwned>(value: Value, operation: &str) -> Result<T> {
    let enveloped = value
        .as_object()
        .is_some_and(|obj| obj.contains_key("success"));
    let protocol = |e: serde_json::Error| {
        FaceError::Protocol(format!("unexpected {operation} response: {e}"))
    };
    if enveloped {
        serde_json::from_value::<Envelope<T>>(value)
            .map_err(protocol)?
            .into_data(operation)
    } else {
        serde_json::from_value::<T>(value).map_err(protocol)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireCompare {
    pub(crate) similarity: f64,
    pub(crate) is_match: bool,
    pub(crate) confidence: f64,
    #[serde(default)]
    pub(crate) threshold: Option<f64>,
}

fn check_unit(field: &str, value: f64) -> Result<f64> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(FaceError::Protocol(format!(
            "{field} {value} is outside [0, 1]"
        )))
    }
}

impl WireCompare {
    /// Range-check and convert; `requested` fills in a missing threshold echo.
    pub(crate) fn into_outcome(self, requested: f64) -> Result<CompareOutcome> {
        Ok(CompareOutcome {
            similarity: check_unit("similarity", self.similarity)?,
            is_match: self.is_match,
            confidence: check_unit("confidence", self.confidence)?,
            threshold_used: self.threshold.unwrap_or(requested),
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireBatchItem {
    pub(crate) index: usize,
    #[serde(flatten)]
    pub(crate) compare: WireCompare,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireBatchError {
    pub(crate) index: usize,
    pub(crate) error: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireBatch {
    pub(crate) results: Vec<WireBatchItem>,
    #[serde(default)]
    pub(crate) errors: Vec<WireBatchError>,
    pub(crate) total: usize,
}

impl WireBatch {
    /// Validate indices against the submitted count and build the report.
    pub(crate) fn into_report(self, submitted: usize, requested: f64) -> Result<BatchCompareReport> {
        if self.total != submitted {
            return Err(FaceError::Protocol(format!(
                "batch response covers {} image(s), {submitted} were sent",
                self.total
            )));
        }
        let mut seen = vec![false; submitted];
        let mut claim = |index: usize| -> Result<()> {
            match seen.get_mut(index) {
                Some(slot) if !*slot => {
                    *slot = true;
                    Ok(())
                }
                Some(_) => Err(FaceError::Protocol(format!(
                    "batch response reports index {index} twice"
                ))),
                None => Err(FaceError::Protocol(format!(
                    "batch response index {index} is out of range"
                ))),
            }
        };

        let mut outcomes = Vec::with_capacity(self.results.len());
        for item in self.results {
            claim(item.index)?;
            outcomes.push(BatchItemOutcome {
                index: item.index,
                outcome: item.compare.into_outcome(requested)?,
            });
        }
        let mut failures = Vec::with_capacity(self.errors.len());
        for item in self.errors {
            claim(item.index)?;
            failures.push(BatchItemFailure {
                index: item.index,
                error: item.error,
            });
        }
        outcomes.sort_by_key(|item| item.index);
        failures.sort_by_key(|item| item.index);

        Ok(BatchCompareReport {
            outcomes,
            failures,
            total: submitted,
            server_side: true,
        })
    }
}

//! [`FaceCompareClient`]: the orchestrator that ties config, retries, the
//! result cache, events and the HTTP transport together.
//!
//! Lifecycle is `Uninitialized -> Ready -> Destroyed`. [`record`] moves the
//! client to `Ready` by establishing an identity; [`clear`] moves it back;
//! [`destroy`] is terminal and makes every later call fail with
//! [`FaceError::Destroyed`].
//!
//! Shared state (identity, destroyed flag, cache) is only mutated under a
//! short-lived lock that is never held across an `.await`. Each completed
//! call commits its identity and cache writes inside one critical section,
//! and results that finish after a `clear`, identity change or `destroy`
//! are returned to their caller without being committed.
//!
//! [`record`]: FaceCompareClient::record
//! [`clear`]: FaceCompareClient::clear
//! [`destroy`]: FaceCompareClient::destroy

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use reqwest::{Method, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::api::{
    COMPARE_BATCH_PATH, COMPARE_PATH, CallContext, CompareBatchRequest, CompareRequest, Envelope,
    HEALTH_PATH, INIT_PATH, InitRequest, PendingRequests, ROOT_PATH, Transport, USERS_PATH,
    WireBatch, WireCompare, narrow_maybe_enveloped,
};
use crate::cache::CacheManager;
use crate::config::{ClientConfig, ClientOptions, ConfigUpdate, ConfigValidator, OptionsUpdate};
use crate::error::{FaceError, Result};
use crate::events::{ClientEvent, EventBus, EventPayload, HandlerId};
use crate::fingerprint::{CacheKind, cache_key};
use crate::image::ImagePayload;
use crate::retry::RetryManager;
use crate::types::{
    BatchCompareReport, BatchItemFailure, BatchItemOutcome, CompareOutcome, HealthStatus,
    InitResult, SystemInfo, UserInfo, UserList,
};

/// Values kept in the result cache.
#[derive(Debug, Clone)]
enum CachedValue {
    Init(InitResult),
    Compare(CompareOutcome),
}

/// Validated config together with its parsed base URL.
#[derive(Debug)]
struct ConfigSnapshot {
    config: ClientConfig,
    base_url: Url,
}

impl ConfigSnapshot {
    fn new(config: ClientConfig) -> Result<Self> {
        ConfigValidator::validate(&config)?;
        let base_url = ConfigValidator::endpoint_url(&config.endpoint_base_url)?;
        Ok(Self { config, base_url })
    }
}

#[derive(Debug, Default)]
struct ClientState {
    identity: Option<String>,
    destroyed: bool,
    /// Bumped whenever identity/cache are reset, so late results can tell
    /// they belong to a previous epoch.
    generation: u64,
}

/// Async client for a remote face-recognition service.
///
/// The client is `Send + Sync`; share it behind an `Arc` to run operations
/// concurrently.
///
/// ```no_run
/// use face_compare::{ClientConfig, FaceCompareClient, ImagePayload};
///
/// # async fn demo(enrolled: &[u8], probe: &[u8]) -> face_compare::Result<()> {
/// let client = FaceCompareClient::new(ClientConfig::new("http://localhost:3001", "alice"))?;
/// client.record(&ImagePayload::from_bytes("jpeg", enrolled)?).await?;
///
/// let outcome = client.compare(&ImagePayload::from_bytes("jpeg", probe)?, None).await?;
/// println!("match={} similarity={:.3}", outcome.is_match, outcome.similarity);
///
/// client.destroy();
/// # Ok(())
/// # }
/// ```
pub struct FaceCompareClient {
    config: RwLock<Arc<ConfigSnapshot>>,
    options: RwLock<Arc<ClientOptions>>,
    transport: Transport,
    cache: CacheManager<CachedValue>,
    events: EventBus,
    state: Mutex<ClientState>,
    pending: PendingRequests,
}

impl fmt::Debug for FaceCompareClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("FaceCompareClient")
            .field("config", &self.config_snapshot().config)
            .field("identity", &state.identity)
            .field("destroyed", &state.destroyed)
            .field("cache_len", &self.cache.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl FaceCompareClient {
    /// Build a client with default [`ClientOptions`].
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_options(config, ClientOptions::default())
    }

    /// Build a client; both `config` and `options` are validated first.
    pub fn with_options(config: ClientConfig, options: ClientOptions) -> Result<Self> {
        let snapshot = ConfigSnapshot::new(config)?;
        ConfigValidator::validate_options(&options)?;

        let events = EventBus::new();
        events.set_logging(options.logging_enabled);
        if options.logging_enabled {
            debug!(
                endpoint = %snapshot.base_url,
                identity = %snapshot.config.identity,
                "client_created"
            );
        }

        let cache = CacheManager::with_capacity(options.cache_max_entries);
        Ok(Self {
            config: RwLock::new(Arc::new(snapshot)),
            options: RwLock::new(Arc::new(options)),
            transport: Transport::new()?,
            cache,
            events,
            state: Mutex::new(ClientState::default()),
            pending: PendingRequests::default(),
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────

    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn config_snapshot(&self) -> Arc<ConfigSnapshot> {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn options_snapshot(&self) -> Arc<ClientOptions> {
        self.options
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn config(&self) -> ClientConfig {
        self.config_snapshot().config.clone()
    }

    pub fn options(&self) -> ClientOptions {
        ClientOptions::clone(&self.options_snapshot())
    }

    /// Identity established by the last successful [`record`](Self::record).
    pub fn identity(&self) -> Option<String> {
        self.lock_state().identity.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.lock_state().identity.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock_state().destroyed
    }

    /// Cached entries, including expired ones not yet looked up.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Requests currently in flight.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn on<F>(&self, event: ClientEvent, handler: F) -> HandlerId
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
    {
        self.events.on(event, handler)
    }

    pub fn off(&self, event: ClientEvent, handler: Option<HandlerId>) -> usize {
        self.events.off(event, handler)
    }

    // ── Operations ──────────────────────────────────────────────────────

    /// Register `image` as the face for the configured identity.
    ///
    /// On success the identity returned by the service becomes the client's
    /// established identity and `initSuccess` is emitted. A cached result for
    /// the same identity and image is reused without a network call.
    pub async fn record(&self, image: &ImagePayload) -> Result<InitResult> {
        let started = Instant::now();
        let options = self.options_snapshot();
        let span = info_span!("face.record", format = image.format(), bytes = image.decoded_len());

        let outcome = self.record_inner(image, &options).instrument(span.clone()).await;
        let _entered = span.enter();
        match outcome {
            Ok((result, cache_hit)) => {
                if options.logging_enabled {
                    info!(
                        user_id = %result.user_id,
                        cache_hit,
                        elapsed_micros = started.elapsed().as_micros() as u64,
                        "record_success"
                    );
                }
                self.events
                    .emit(ClientEvent::InitSuccess, &EventPayload::Init(result.clone()));
                Ok(result)
            }
            Err(err) => Err(self.fail(
                "record",
                Some(ClientEvent::InitError),
                err,
                started,
                options.logging_enabled,
            )),
        }
    }

    async fn record_inner(
        &self,
        image: &ImagePayload,
        options: &ClientOptions,
    ) -> Result<(InitResult, bool)> {
        let generation = self.live_generation()?;
        let config = self.config_snapshot();
        let identity = config.config.identity.as_str();
        let key = cache_key(CacheKind::Init, identity, &image.fingerprint(), None);

        if options.cache_enabled {
            if let Some(CachedValue::Init(hit)) = self.cache.get(&key) {
                self.commit(generation, |state| {
                    state.identity = Some(hit.user_id.clone());
                })?;
                return Ok((hit, true));
            }
        }

        let body = InitRequest {
            image_data: image.as_str(),
            user_id: Some(identity),
        };
        let result = self
            .request::<_, Envelope<InitResult>>(
                "record",
                Method::POST,
                INIT_PATH,
                Some(&body),
                &config,
                options,
            )
            .await?
            .into_data("record")?;
        if result.user_id.trim().is_empty() {
            return Err(FaceError::Protocol(
                "record response carries an empty userId".into(),
            ));
        }

        self.commit(generation, |state| {
            state.identity = Some(result.user_id.clone());
            if options.cache_enabled {
                self.cache
                    .set(key, CachedValue::Init(result.clone()), options.cache_ttl);
            }
        })?;
        Ok((result, false))
    }

    /// Compare `image` against the registered face.
    ///
    /// `threshold` defaults to [`ClientOptions::match_threshold`]. Fails with
    /// [`FaceError::NotInitialized`] before [`record`](Self::record) succeeded.
    pub async fn compare(&self, image: &ImagePayload, threshold: Option<f64>) -> Result<CompareOutcome> {
        let started = Instant::now();
        let options = self.options_snapshot();
        let span = info_span!("face.compare", format = image.format(), bytes = image.decoded_len());

        let outcome = self
            .compare_inner(image, threshold, &options)
            .instrument(span.clone())
            .await;
        let _entered = span.enter();
        match outcome {
            Ok((result, cache_hit)) => {
                if options.logging_enabled {
                    info!(
                        similarity = result.similarity,
                        is_match = result.is_match,
                        threshold = result.threshold_used,
                        cache_hit,
                        elapsed_micros = started.elapsed().as_micros() as u64,
                        "compare_success"
                    );
                }
                self.events
                    .emit(ClientEvent::CompareSuccess, &EventPayload::Compare(result));
                Ok(result)
            }
            Err(err) => Err(self.fail(
                "compare",
                Some(ClientEvent::CompareError),
                err,
                started,
                options.logging_enabled,
            )),
        }
    }

    async fn compare_inner(
        &self,
        image: &ImagePayload,
        threshold: Option<f64>,
        options: &ClientOptions,
    ) -> Result<(CompareOutcome, bool)> {
        let (identity, generation) = self.ready_identity()?;
        let threshold = threshold.unwrap_or(options.match_threshold);
        ConfigValidator::validate_threshold(threshold)?;
        let key = cache_key(
            CacheKind::Compare,
            &identity,
            &image.fingerprint(),
            Some(threshold),
        );

        if options.cache_enabled {
            if let Some(CachedValue::Compare(hit)) = self.cache.get(&key) {
                return Ok((hit, true));
            }
        }

        let config = self.config_snapshot();
        let body = CompareRequest {
            image_data: image.as_str(),
            user_id: &identity,
            threshold: Some(threshold),
        };
        let result = self
            .request::<_, Envelope<WireCompare>>(
                "compare",
                Method::POST,
                COMPARE_PATH,
                Some(&body),
                &config,
                options,
            )
            .await?
            .into_data("compare")?
            .into_outcome(threshold)?;

        if options.cache_enabled {
            self.commit(generation, |_| {
                self.cache
                    .set(key, CachedValue::Compare(result), options.cache_ttl);
            })?;
        }
        Ok((result, false))
    }

    /// Compare several images against the registered face.
    ///
    /// With `enable_batch` the service's batch endpoint is called once (and
    /// retried as a whole on transport failure). Otherwise every image goes
    /// through [`compare`](Self::compare) in order, emitting that call's own
    /// events, and a failing item never stops the ones after it.
    ///
    /// Per-item failures are reported in the returned
    /// [`BatchCompareReport`]. The call only fails when the batch could not
    /// run at all, or with [`FaceError::BatchFailed`] when every item failed.
    /// An empty input yields an empty report.
    pub async fn compare_batch(
        &self,
        images: &[ImagePayload],
        threshold: Option<f64>,
    ) -> Result<BatchCompareReport> {
        let started = Instant::now();
        let options = self.options_snapshot();
        let span = info_span!(
            "face.compare_batch",
            images = images.len(),
            server_side = options.enable_batch
        );

        let outcome = self
            .compare_batch_inner(images, threshold, &options)
            .instrument(span.clone())
            .await;
        let _entered = span.enter();
        match outcome {
            Ok(report) => {
                if options.logging_enabled {
                    info!(
                        total = report.total,
                        success_count = report.success_count(),
                        error_count = report.error_count(),
                        server_side = report.server_side,
                        elapsed_micros = started.elapsed().as_micros() as u64,
                        "compare_batch_complete"
                    );
                }
                self.events
                    .emit(ClientEvent::BatchComplete, &EventPayload::Batch(report.clone()));
                Ok(report)
            }
            Err(err) => Err(self.fail(
                "compare_batch",
                Some(ClientEvent::CompareError),
                err,
                started,
                options.logging_enabled,
            )),
        }
    }

    async fn compare_batch_inner(
        &self,
        images: &[ImagePayload],
        threshold: Option<f64>,
        options: &ClientOptions,
    ) -> Result<BatchCompareReport> {
        let (identity, generation) = self.ready_identity()?;
        let threshold = threshold.unwrap_or(options.match_threshold);
        ConfigValidator::validate_threshold(threshold)?;

        if images.is_empty() {
            return Ok(BatchCompareReport {
                server_side: options.enable_batch,
                ..Default::default()
            });
        }

        let report = if options.enable_batch {
            let config = self.config_snapshot();
            let body = CompareBatchRequest {
                image_data_list: images.iter().map(ImagePayload::as_str).collect(),
                user_id: &identity,
                threshold: Some(threshold),
            };
            let report = self
                .request::<_, Envelope<WireBatch>>(
                    "compare_batch",
                    Method::POST,
                    COMPARE_BATCH_PATH,
                    Some(&body),
                    &config,
                    options,
                )
                .await?
                .into_data("compare_batch")?
                .into_report(images.len(), threshold)?;

            if options.cache_enabled {
                self.commit(generation, |_| {
                    for item in &report.outcomes {
                        let key = cache_key(
                            CacheKind::Compare,
                            &identity,
                            &images[item.index].fingerprint(),
                            Some(threshold),
                        );
                        self.cache
                            .set(key, CachedValue::Compare(item.outcome), options.cache_ttl);
                    }
                })?;
            }
            report
        } else {
            self.compare_sequential(images, threshold, options).await?
        };

        if options.logging_enabled {
            for failure in &report.failures {
                warn!(index = failure.index, error = %failure.error, "batch_item_failed");
            }
        }

        if report.outcomes.is_empty() {
            let first_error = report
                .failures
                .first()
                .map(|f| f.error.clone())
                .unwrap_or_default();
            return Err(FaceError::BatchFailed {
                total: report.total,
                first_error,
            });
        }
        Ok(report)
    }

    async fn compare_sequential(
        &self,
        images: &[ImagePayload],
        threshold: f64,
        options: &ClientOptions,
    ) -> Result<BatchCompareReport> {
        let mut report = BatchCompareReport {
            total: images.len(),
            ..Default::default()
        };
        for (index, image) in images.iter().enumerate() {
            match self.compare(image, Some(threshold)).await {
                Ok(outcome) => report.outcomes.push(BatchItemOutcome { index, outcome }),
                // Nothing after a teardown can succeed.
                Err(err @ (FaceError::Destroyed | FaceError::Cancelled)) => return Err(err),
                Err(err) => {
                    if options.logging_enabled {
                        debug!(index, error = %err, "batch_item_compare_failed");
                    }
                    report.failures.push(BatchItemFailure {
                        index,
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Registration record for the established identity, or the configured
    /// identity when [`record`](Self::record) has not run yet.
    pub async fn get_user_info(&self) -> Result<UserInfo> {
        let user_id = self
            .identity()
            .unwrap_or_else(|| self.config_snapshot().config.identity.clone());
        self.gated_get("get_user_info", Feature::UserLookup, &["api", "users", user_id.as_str()], |value| {
            narrow_maybe_enveloped::<UserInfo>(value, "user info")
        })
        .await
    }

    /// Every subject registered on the service.
    pub async fn list_users(&self) -> Result<UserList> {
        self.gated_get("list_users", Feature::UserLookup, USERS_PATH, |value| {
            parse_enveloped::<UserList>(value, "list users")
        })
        .await
    }

    /// Remove `user_id` from the service. Deleting the client's own
    /// established identity also resets it to uninitialized and clears the
    /// cache.
    pub async fn delete_user(&self, user_id: &str) -> Result<()> {
        let started = Instant::now();
        let options = self.options_snapshot();
        let span = info_span!("face.delete_user", user_id = %user_id);

        let outcome = async {
            self.live_generation()?;
            Self::require(Feature::UserLookup, &options)?;
            if user_id.trim().is_empty() {
                return Err(FaceError::Validation("user id is required".into()));
            }
            let config = self.config_snapshot();
            self.request::<(), Envelope<Value>>(
                "delete_user",
                Method::DELETE,
                &["api", "users", user_id],
                None,
                &config,
                &options,
            )
            .await?
            .into_message("delete_user")
        }
        .instrument(span.clone())
        .await;

        let _entered = span.enter();
        match outcome {
            Ok(message) => {
                let dropped_own = {
                    let mut state = self.lock_state();
                    let own = state.identity.as_deref() == Some(user_id);
                    if own {
                        state.identity = None;
                        state.generation += 1;
                        self.cache.clear();
                    }
                    own
                };
                if options.logging_enabled {
                    info!(
                        dropped_own,
                        message = %message,
                        elapsed_micros = started.elapsed().as_micros() as u64,
                        "delete_user_success"
                    );
                }
                if dropped_own {
                    self.events.emit(ClientEvent::Cleared, &EventPayload::None);
                }
                Ok(())
            }
            Err(err) => Err(self.fail("delete_user", None, err, started, options.logging_enabled)),
        }
    }

    /// Service description from `GET {base}/`.
    pub async fn get_system_info(&self) -> Result<SystemInfo> {
        self.gated_get("get_system_info", Feature::SystemInfo, ROOT_PATH, |value| {
            serde_json::from_value::<SystemInfo>(value)
                .map_err(|e| FaceError::Protocol(format!("unexpected system info response: {e}")))
        })
        .await
    }

    /// Liveness probe against `GET {base}/health`.
    pub async fn health_check(&self) -> Result<HealthStatus> {
        self.gated_get("health_check", Feature::SystemInfo, HEALTH_PATH, |value| {
            serde_json::from_value::<HealthStatus>(value)
                .map_err(|e| FaceError::Protocol(format!("unexpected health response: {e}")))
        })
        .await
    }

    /// Drop the established identity and every cached result. The client
    /// stays usable; call [`record`](Self::record) again before comparing.
    pub fn clear(&self) -> Result<()> {
        {
            let mut state = self.lock_state();
            if state.destroyed {
                return Err(FaceError::Destroyed);
            }
            state.identity = None;
            state.generation += 1;
            self.cache.clear();
        }
        if self.options_snapshot().logging_enabled {
            info!("client_cleared");
        }
        self.events.emit(ClientEvent::Cleared, &EventPayload::None);
        Ok(())
    }

    /// Cancel in-flight requests, drop identity and cache, and make the
    /// client unusable. Calling it again does nothing.
    ///
    /// Handlers registered for `destroyed` run once, then every handler is
    /// unregistered.
    pub fn destroy(&self) {
        {
            let mut state = self.lock_state();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.identity = None;
            state.generation += 1;
            self.cache.clear();
        }
        let cancelled = self.pending.cancel_all();
        if self.options_snapshot().logging_enabled {
            info!(cancelled, "client_destroyed");
        }
        self.events.emit(ClientEvent::Destroyed, &EventPayload::None);
        self.events.clear();
    }

    /// Merge `update` over the current config and revalidate.
    ///
    /// Nothing changes if validation fails. Switching endpoint or identity
    /// resets the client to uninitialized and clears the cache.
    pub fn update_config(&self, update: ConfigUpdate) -> Result<()> {
        let logging = self.options_snapshot().logging_enabled;
        let started = Instant::now();

        let applied = self.apply_config_update(&update);

        match applied {
            Ok(rebased) => {
                if logging {
                    info!(rebased, "config_updated");
                }
                self.events
                    .emit(ClientEvent::ConfigUpdated, &EventPayload::None);
                Ok(())
            }
            Err(err) => Err(self.fail("update_config", None, err, started, logging)),
        }
    }

    /// Merge `update` over the current options and revalidate.
    ///
    /// Requests already in flight keep the options they started with.
    /// Disabling the cache also empties it.
    pub fn update_options(&self, update: OptionsUpdate) -> Result<()> {
        let current = self.options_snapshot();
        let started = Instant::now();

        let applied = self.apply_options_update(&update, &current);

        match applied {
            Ok(next) => {
                if next.logging_enabled {
                    info!(
                        timeout_ms = next.timeout.as_millis() as u64,
                        max_retries = next.max_retries,
                        cache_enabled = next.cache_enabled,
                        match_threshold = next.match_threshold,
                        "options_updated"
                    );
                }
                self.events
                    .emit(ClientEvent::ConfigUpdated, &EventPayload::None);
                Ok(())
            }
            Err(err) => Err(self.fail(
                "update_options",
                None,
                err,
                started,
                current.logging_enabled,
            )),
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Swap in the merged config. Returns whether the subject changed.
    fn apply_config_update(&self, update: &ConfigUpdate) -> Result<bool> {
        let mut state = self.lock_state();
        if state.destroyed {
            return Err(FaceError::Destroyed);
        }
        let current = self.config_snapshot();
        let next = ConfigSnapshot::new(update.apply(&current.config))?;
        let rebased =
            next.base_url != current.base_url || next.config.identity != current.config.identity;
        if rebased {
            state.identity = None;
            state.generation += 1;
            self.cache.clear();
        }
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(next);
        Ok(rebased)
    }

    fn apply_options_update(
        &self,
        update: &OptionsUpdate,
        current: &ClientOptions,
    ) -> Result<ClientOptions> {
        let state = self.lock_state();
        if state.destroyed {
            return Err(FaceError::Destroyed);
        }
        let next = update.apply(current);
        ConfigValidator::validate_options(&next)?;
        if !next.cache_enabled {
            self.cache.clear();
        }
        if next.cache_max_entries != current.cache_max_entries {
            self.cache.resize(next.cache_max_entries);
        }
        self.events.set_logging(next.logging_enabled);
        *self
            .options
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(next.clone());
        drop(state);
        Ok(next)
    }

    /// Current generation, or `Destroyed`.
    fn live_generation(&self) -> Result<u64> {
        let state = self.lock_state();
        if state.destroyed {
            return Err(FaceError::Destroyed);
        }
        Ok(state.generation)
    }

    fn ready_identity(&self) -> Result<(String, u64)> {
        let state = self.lock_state();
        if state.destroyed {
            return Err(FaceError::Destroyed);
        }
        let identity = state.identity.clone().ok_or(FaceError::NotInitialized)?;
        Ok((identity, state.generation))
    }

    /// Apply `update` to shared state in one critical section, unless the
    /// state was reset since `generation` was read.
    fn commit(&self, generation: u64, update: impl FnOnce(&mut ClientState)) -> Result<()> {
        let mut state = self.lock_state();
        if state.destroyed {
            return Err(FaceError::Destroyed);
        }
        if state.generation == generation {
            update(&mut state);
        } else {
            debug!(
                started_in = generation,
                current = state.generation,
                "stale_result_not_committed"
            );
        }
        Ok(())
    }

    fn require(feature: Feature, options: &ClientOptions) -> Result<()> {
        let enabled = match feature {
            Feature::UserLookup => options.enable_user_lookup,
            Feature::SystemInfo => options.enable_system_info,
        };
        if enabled {
            Ok(())
        } else {
            Err(FaceError::FeatureDisabled(feature.as_str()))
        }
    }

    /// Feature-gated, retried GET whose JSON body is narrowed by `parse`.
    async fn gated_get<T>(
        &self,
        operation: &'static str,
        feature: Feature,
        segments: &[&str],
        parse: impl FnOnce(Value) -> Result<T>,
    ) -> Result<T> {
        let started = Instant::now();
        let options = self.options_snapshot();
        let span = info_span!("face.get", operation);

        let outcome = async {
            self.live_generation()?;
            Self::require(feature, &options)?;
            let config = self.config_snapshot();
            let value = self
                .request::<(), Value>(operation, Method::GET, segments, None, &config, &options)
                .await?;
            parse(value)
        }
        .instrument(span.clone())
        .await;

        let _entered = span.enter();
        match outcome {
            Ok(value) => {
                if options.logging_enabled {
                    debug!(
                        operation,
                        elapsed_micros = started.elapsed().as_micros() as u64,
                        "get_success"
                    );
                }
                Ok(value)
            }
            Err(err) => Err(self.fail(operation, None, err, started, options.logging_enabled)),
        }
    }

    /// One retried HTTP exchange. A single cancel token covers every attempt
    /// and the backoff waits between them, so [`destroy`](Self::destroy)
    /// can abort the operation at any point.
    async fn request<B, T>(
        &self,
        label: &'static str,
        method: Method,
        segments: &[&str],
        body: Option<&B>,
        config: &ConfigSnapshot,
        options: &ClientOptions,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let manager = RetryManager::new(options.retry_policy()).with_logging(options.logging_enabled);
        let ctx = CallContext {
            base_url: &config.base_url,
            auth_token: config.config.auth_token.as_deref(),
            timeout: options.timeout,
        };
        let ctx = &ctx;
        let this = self;

        let guard = self.pending.register();
        // destroy() may have run between the last check and registration.
        if self.is_destroyed() {
            return Err(FaceError::Destroyed);
        }
        let token = guard.token();

        manager
            .run_with_retry(label, token, move |attempt| {
                let method = method.clone();
                async move {
                    if options.logging_enabled {
                        debug!(operation = label, attempt, "request_sent");
                    }
                    this.transport
                        .call(method, segments, body, ctx, token)
                        .await
                }
            })
            .await
    }

    /// Log a terminal failure, emit the specific event (if any) and then
    /// `error`, and hand the error back for returning.
    fn fail(
        &self,
        operation: &'static str,
        specific: Option<ClientEvent>,
        err: FaceError,
        started: Instant,
        logging: bool,
    ) -> FaceError {
        if logging {
            warn!(
                operation,
                kind = err.kind(),
                error = %err,
                elapsed_micros = started.elapsed().as_micros() as u64,
                "operation_failed"
            );
        }
        let payload = EventPayload::Failure {
            operation,
            error: err.clone(),
        };
        if let Some(event) = specific {
            self.events.emit(event, &payload);
        }
        self.events.emit(ClientEvent::Error, &payload);
        err
    }
}

#[derive(Debug, Clone, Copy)]
enum Feature {
    UserLookup,
    SystemInfo,
}

impl Feature {
    fn as_str(self) -> &'static str {
        match self {
            Feature::UserLookup => "user lookup",
            Feature::SystemInfo => "system info",
        }
    }
}

fn parse_enveloped<T: DeserializeOwned>(value: Value, operation: &str) -> Result<T> {
    serde_json::from_value::<Envelope<T>>(value)
        .map_err(|e| FaceError::Protocol(format!("unexpected {operation} response: {e}")))?
        .into_data(operation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client() -> FaceCompareClient {
        FaceCompareClient::new(ClientConfig::new("http://127.0.0.1:9", "alice")).unwrap()
    }

    fn image() -> ImagePayload {
        ImagePayload::from_bytes("jpeg", b"probe").unwrap()
    }

    #[test]
    fn client_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FaceCompareClient>();
    }

    #[test]
    fn construction_validates_config_and_options() {
        assert!(matches!(
            FaceCompareClient::new(ClientConfig::new("not-a-url", "alice")),
            Err(FaceError::Config(_))
        ));
        assert!(matches!(
            FaceCompareClient::new(ClientConfig::new("http://localhost:3001", " ")),
            Err(FaceError::Config(_))
        ));
        let bad = ClientOptions {
            max_retries: 0,
            ..Default::default()
        };
        assert!(
            FaceCompareClient::with_options(ClientConfig::new("http://localhost:3001", "a"), bad)
                .is_err()
        );
    }

    #[tokio::test]
    async fn compare_before_record_fails_fast_with_events() {
        let client = client();
        let specific = Arc::new(AtomicUsize::new(0));
        let generic = Arc::new(AtomicUsize::new(0));
        let s = specific.clone();
        client.on(ClientEvent::CompareError, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        let g = generic.clone();
        client.on(ClientEvent::Error, move |_| {
            g.fetch_add(1, Ordering::SeqCst);
        });

        let err = client.compare(&image(), None).await.unwrap_err();
        assert_eq!(err, FaceError::NotInitialized);
        assert_eq!(specific.load(Ordering::SeqCst), 1);
        assert_eq!(generic.load(Ordering::SeqCst), 1);
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn invalid_threshold_is_validation_error() {
        let client = client();
        client.lock_state().identity = Some("alice".into());
        let err = client.compare(&image(), Some(1.5)).await.unwrap_err();
        assert!(matches!(err, FaceError::Validation(_)));
    }

    #[tokio::test]
    async fn disabled_features_fail_without_io() {
        let client = FaceCompareClient::with_options(
            ClientConfig::new("http://127.0.0.1:9", "alice"),
            ClientOptions {
                enable_user_lookup: false,
                enable_system_info: false,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(
            client.get_user_info().await.unwrap_err(),
            FaceError::FeatureDisabled("user lookup")
        );
        assert_eq!(
            client.list_users().await.unwrap_err(),
            FaceError::FeatureDisabled("user lookup")
        );
        assert_eq!(
            client.get_system_info().await.unwrap_err(),
            FaceError::FeatureDisabled("system info")
        );
        assert_eq!(
            client.health_check().await.unwrap_err(),
            FaceError::FeatureDisabled("system info")
        );
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_terminal() {
        let client = client();
        let destroyed = Arc::new(AtomicUsize::new(0));
        let d = destroyed.clone();
        client.on(ClientEvent::Destroyed, move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        client.destroy();
        client.destroy();
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert!(client.is_destroyed());
        assert_eq!(client.events().handler_count(ClientEvent::Destroyed), 0);

        assert_eq!(client.record(&image()).await.unwrap_err(), FaceError::Destroyed);
        assert_eq!(client.compare(&image(), None).await.unwrap_err(), FaceError::Destroyed);
        assert_eq!(client.clear().unwrap_err(), FaceError::Destroyed);
        assert_eq!(
            client.update_options(OptionsUpdate::default()).unwrap_err(),
            FaceError::Destroyed
        );
    }

    #[test]
    fn clear_resets_identity_and_emits() {
        let client = client();
        client.lock_state().identity = Some("alice".into());
        client.cache.set(
            "k",
            CachedValue::Compare(CompareOutcome {
                similarity: 0.5,
                is_match: false,
                confidence: 0.5,
                threshold_used: 0.6,
            }),
            std::time::Duration::from_secs(60),
        );
        let cleared = Arc::new(AtomicUsize::new(0));
        let c = cleared.clone();
        client.on(ClientEvent::Cleared, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        client.clear().unwrap();
        assert!(!client.is_initialized());
        assert_eq!(client.cache_len(), 0);
        assert_eq!(cleared.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn update_config_rejects_atomically() {
        let client = client();
        client.lock_state().identity = Some("alice".into());

        let err = client
            .update_config(ConfigUpdate {
                endpoint_base_url: Some("nope".into()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, FaceError::Config(_)));
        assert_eq!(client.config().endpoint_base_url, "http://127.0.0.1:9");
        assert!(client.is_initialized());
    }

    #[test]
    fn identity_change_resets_state_but_token_change_does_not() {
        let client = client();
        client.lock_state().identity = Some("alice".into());

        client
            .update_config(ConfigUpdate {
                auth_token: Some("t1".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(client.is_initialized());
        assert_eq!(client.config().auth_token.as_deref(), Some("t1"));

        client
            .update_config(ConfigUpdate {
                identity: Some("bob".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(!client.is_initialized());
        assert_eq!(client.config().identity, "bob");
    }

    #[test]
    fn update_options_validates_and_merges() {
        let client = client();
        assert!(
            client
                .update_options(OptionsUpdate {
                    match_threshold: Some(-0.1),
                    ..Default::default()
                })
                .is_err()
        );
        assert_eq!(client.options().match_threshold, 0.6);

        client
            .update_options(OptionsUpdate {
                match_threshold: Some(0.75),
                max_retries: Some(5),
                ..Default::default()
            })
            .unwrap();
        let opts = client.options();
        assert_eq!(opts.match_threshold, 0.75);
        assert_eq!(opts.max_retries, 5);
        assert!(opts.cache_enabled);
    }

    #[test]
    fn stale_commit_is_skipped() {
        let client = client();
        let generation = client.live_generation().unwrap();
        client.clear().unwrap();
        client
            .commit(generation, |state| state.identity = Some("late".into()))
            .unwrap();
        assert!(!client.is_initialized());
    }
}

//! Endpoint/identity configuration, operation options and their validation.
//!
//! [`ClientConfig`] says *where* to talk and *as whom*; [`ClientOptions`] says
//! *how* (timeouts, retries, cache, feature gates). Both are plain serde
//! structs so they can come from code, YAML (see [`crate::settings`]) or the
//! environment, and both pass through [`ConfigValidator`] before the client
//! uses them.
//!
//! ```
//! use face_compare::{ClientConfig, ClientOptions, ConfigValidator, OptionsUpdate};
//!
//! let cfg = ClientConfig::new("http://localhost:3001", "alice");
//! ConfigValidator::validate(&cfg).unwrap();
//!
//! let opts = OptionsUpdate {
//!     match_threshold: Some(0.7),
//!     ..Default::default()
//! }
//! .apply(&ClientOptions::default());
//! assert_eq!(opts.match_threshold, 0.7);
//! assert_eq!(opts.max_retries, 3);
//! ```

use std::fmt;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::error::{FaceError, Result};
use crate::retry::RetryPolicy;

/// Environment variable holding the service base URL.
pub const ENV_ENDPOINT: &str = "FACE_COMPARE_ENDPOINT";
/// Environment variable holding the subject identity.
pub const ENV_IDENTITY: &str = "FACE_COMPARE_IDENTITY";
/// Environment variable holding the optional bearer token.
pub const ENV_TOKEN: &str = "FACE_COMPARE_TOKEN";

/// Where the face service lives and which subject this client acts for.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Absolute `http(s)` base URL of the face service, e.g. `http://localhost:3001`.
    pub endpoint_base_url: String,
    /// Stable subject key under which face data is registered (`userId` on the wire).
    pub identity: String,
    /// Sent as `Authorization: Bearer {token}` when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl ClientConfig {
    pub fn new(endpoint_base_url: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            endpoint_base_url: endpoint_base_url.into(),
            identity: identity.into(),
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Build a config from `FACE_COMPARE_ENDPOINT`, `FACE_COMPARE_IDENTITY` and
    /// the optional `FACE_COMPARE_TOKEN`, then validate it.
    pub fn from_env() -> Result<Self> {
        let endpoint = std::env::var(ENV_ENDPOINT)
            .map_err(|_| FaceError::Config(format!("{ENV_ENDPOINT} is not set")))?;
        let identity = std::env::var(ENV_IDENTITY)
            .map_err(|_| FaceError::Config(format!("{ENV_IDENTITY} is not set")))?;
        let mut cfg = Self::new(endpoint, identity);
        cfg.auth_token = std::env::var(ENV_TOKEN).ok().filter(|t| !t.is_empty());
        ConfigValidator::validate(&cfg)?;
        Ok(cfg)
    }

    /// Overlay any of the `FACE_COMPARE_*` variables that are set.
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Overlay values from `lookup`, keyed by the `FACE_COMPARE_*` names.
    /// An empty token clears the configured one.
    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            self.endpoint_base_url = endpoint;
        }
        if let Some(identity) = lookup(ENV_IDENTITY) {
            self.identity = identity;
        }
        if let Some(token) = lookup(ENV_TOKEN) {
            self.auth_token = Some(token).filter(|t| !t.is_empty());
        }
    }
}

// Keep bearer tokens out of logs.
impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("endpoint_base_url", &self.endpoint_base_url)
            .field("identity", &self.identity)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Tunables for every operation the client performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientOptions {
    /// Deadline for a single HTTP request.
    #[serde(rename = "timeoutMs", with = "crate::serde_millis")]
    pub timeout: Duration,
    /// Total attempts per operation, including the first one.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each following retry.
    #[serde(rename = "retryBaseDelayMs", with = "crate::serde_millis")]
    pub retry_base_delay: Duration,
    /// Upper bound for any single backoff delay.
    #[serde(rename = "retryMaxDelayMs", with = "crate::serde_millis")]
    pub retry_max_delay: Duration,
    /// Spread backoff delays by ±25 %.
    pub retry_jitter: bool,
    pub logging_enabled: bool,
    pub cache_enabled: bool,
    /// Lifetime of a cached init/compare result.
    #[serde(rename = "cacheTtlMs", with = "crate::serde_millis")]
    pub cache_ttl: Duration,
    /// Entry cap; the least recently used result is evicted beyond it.
    pub cache_max_entries: usize,
    /// Similarity cutoff sent with compare calls when the caller passes none.
    pub match_threshold: f64,
    /// Use the server-side batch endpoint instead of sequential compares.
    pub enable_batch: bool,
    pub enable_user_lookup: bool,
    pub enable_system_info: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(10),
            retry_jitter: false,
            logging_enabled: true,
            cache_enabled: true,
            cache_ttl: Duration::from_secs(5 * 60),
            cache_max_entries: DEFAULT_CACHE_CAPACITY,
            match_threshold: 0.6,
            enable_batch: true,
            enable_user_lookup: true,
            enable_system_info: true,
        }
    }
}

impl ClientOptions {
    /// Shorthand for [`ConfigValidator::validate_options`].
    pub fn validate(&self) -> Result<()> {
        ConfigValidator::validate_options(self)
    }

    /// Backoff parameters for the next operation.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            jitter: self.retry_jitter,
        }
    }
}

/// Partial update for [`ClientConfig`]; unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigUpdate {
    pub endpoint_base_url: Option<String>,
    pub identity: Option<String>,
    pub auth_token: Option<String>,
    /// Drop the bearer token. Takes precedence over `auth_token`.
    pub clear_auth_token: bool,
}

impl ConfigUpdate {
    /// Merge over `base`. The result is not validated.
    pub fn apply(&self, base: &ClientConfig) -> ClientConfig {
        let mut next = base.clone();
        if let Some(endpoint) = &self.endpoint_base_url {
            next.endpoint_base_url = endpoint.clone();
        }
        if let Some(identity) = &self.identity {
            next.identity = identity.clone();
        }
        if self.clear_auth_token {
            next.auth_token = None;
        } else if let Some(token) = &self.auth_token {
            next.auth_token = Some(token.clone());
        }
        next
    }
}

/// Partial update for [`ClientOptions`]; unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptionsUpdate {
    #[serde(rename = "timeoutMs", with = "crate::serde_millis::option")]
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    #[serde(rename = "retryBaseDelayMs", with = "crate::serde_millis::option")]
    pub retry_base_delay: Option<Duration>,
    #[serde(rename = "retryMaxDelayMs", with = "crate::serde_millis::option")]
    pub retry_max_delay: Option<Duration>,
    pub retry_jitter: Option<bool>,
    pub logging_enabled: Option<bool>,
    pub cache_enabled: Option<bool>,
    #[serde(rename = "cacheTtlMs", with = "crate::serde_millis::option")]
    pub cache_ttl: Option<Duration>,
    pub cache_max_entries: Option<usize>,
    pub match_threshold: Option<f64>,
    pub enable_batch: Option<bool>,
    pub enable_user_lookup: Option<bool>,
    pub enable_system_info: Option<bool>,
}

impl OptionsUpdate {
    /// Merge over `base`. The result is not validated.
    pub fn apply(&self, base: &ClientOptions) -> ClientOptions {
        ClientOptions {
            timeout: self.timeout.unwrap_or(base.timeout),
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            retry_base_delay: self.retry_base_delay.unwrap_or(base.retry_base_delay),
            retry_max_delay: self.retry_max_delay.unwrap_or(base.retry_max_delay),
            retry_jitter: self.retry_jitter.unwrap_or(base.retry_jitter),
            logging_enabled: self.logging_enabled.unwrap_or(base.logging_enabled),
            cache_enabled: self.cache_enabled.unwrap_or(base.cache_enabled),
            cache_ttl: self.cache_ttl.unwrap_or(base.cache_ttl),
            cache_max_entries: self.cache_max_entries.unwrap_or(base.cache_max_entries),
            match_threshold: self.match_threshold.unwrap_or(base.match_threshold),
            enable_batch: self.enable_batch.unwrap_or(base.enable_batch),
            enable_user_lookup: self.enable_user_lookup.unwrap_or(base.enable_user_lookup),
            enable_system_info: self.enable_system_info.unwrap_or(base.enable_system_info),
        }
    }
}

/// Stateless checks run at construction and on every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Accepts iff the endpoint is an absolute `http(s)` URL with a host and
    /// the identity is non-blank.
    pub fn validate(config: &ClientConfig) -> Result<()> {
        Self::endpoint_url(&config.endpoint_base_url)?;
        if config.identity.trim().is_empty() {
            return Err(FaceError::Config("identity is required".into()));
        }
        Ok(())
    }

    /// Parse and check the endpoint base URL.
    pub fn endpoint_url(endpoint: &str) -> Result<Url> {
        let trimmed = endpoint.trim();
        if trimmed.is_empty() {
            return Err(FaceError::Config("endpoint base URL is required".into()));
        }
        let url = Url::parse(trimmed).map_err(|e| {
            FaceError::Config(format!("endpoint base URL `{trimmed}` is not absolute: {e}"))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FaceError::Config(format!(
                "endpoint base URL must use http or https, got `{}`",
                url.scheme()
            )));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(FaceError::Config(format!(
                "endpoint base URL `{trimmed}` has no host"
            )));
        }
        Ok(url)
    }

    pub fn validate_options(options: &ClientOptions) -> Result<()> {
        if options.timeout.is_zero() {
            return Err(FaceError::Config("timeoutMs must be greater than zero".into()));
        }
        if options.max_retries == 0 {
            return Err(FaceError::Config("maxRetries must be at least 1".into()));
        }
        if options.retry_base_delay > options.retry_max_delay {
            return Err(FaceError::Config(
                "retryBaseDelayMs must not exceed retryMaxDelayMs".into(),
            ));
        }
        Self::validate_threshold(options.match_threshold)?;
        if options.cache_enabled && options.cache_ttl.is_zero() {
            return Err(FaceError::Config(
                "cacheTtlMs must be greater than zero when the cache is enabled".into(),
            ));
        }
        if options.cache_enabled && options.cache_max_entries == 0 {
            return Err(FaceError::Config(
                "cacheMaxEntries must be at least 1 when the cache is enabled".into(),
            ));
        }
        Ok(())
    }

    pub fn validate_threshold(threshold: f64) -> Result<()> {
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(FaceError::Validation(format!(
                "match threshold must be within [0, 1], got {threshold}"
            )));
        }
        Ok(())
    }
}

//! Error types produced by the face-compare client.
//!
//! Every failure the client can surface is a [`FaceError`]. Variants are
//! grouped by how the client treats them:
//!
//! | Error | Category | Retried |
//! |-------|----------|---------|
//! | [`Config`](FaceError::Config) | Configuration | no |
//! | [`Validation`](FaceError::Validation), [`NotInitialized`](FaceError::NotInitialized) | Validation | no |
//! | [`Network`](FaceError::Network), [`Timeout`](FaceError::Timeout) | Transient | yes |
//! | [`Http`](FaceError::Http) | Transport | 408, 429 and 5xx only |
//! | [`Rejected`](FaceError::Rejected) | Service answered `success: false` | no |
//! | [`Protocol`](FaceError::Protocol) | Response contract violation | no |
//! | [`RetryExhausted`](FaceError::RetryExhausted) | Wraps the last transient error | n/a |
//! | [`FeatureDisabled`](FaceError::FeatureDisabled), [`Destroyed`](FaceError::Destroyed), [`Cancelled`](FaceError::Cancelled) | Lifecycle | no |
//!
//! ```rust
//! use face_compare::FaceError;
//!
//! let err = FaceError::Http { status: 503, status_text: "Service Unavailable".into() };
//! assert_eq!(err.to_string(), "HTTP 503: Service Unavailable");
//! assert!(err.is_retryable());
//! assert!(!FaceError::NotInitialized.is_retryable());
//! ```
use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FaceError>;

/// Errors surfaced by [`FaceCompareClient`](crate::FaceCompareClient) and its helpers.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum FaceError {
    /// Endpoint, identity or option values are unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The image payload or call arguments were rejected before any I/O.
    #[error("validation failed: {0}")]
    Validation(String),
    /// `compare` was called before `record` established an identity.
    #[error("face data not initialized; call record() first")]
    NotInitialized,
    /// Transport-level failure (connect, DNS, reset, body read).
    #[error("network error: {0}")]
    Network(String),
    /// The service answered with a non-2xx status.
    #[error("HTTP {status}: {status_text}")]
    Http { status: u16, status_text: String },
    /// The per-request deadline elapsed.
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    /// The request was cancelled because the client is being torn down.
    #[error("request cancelled")]
    Cancelled,
    /// A retried operation kept failing with transient errors.
    #[error("{label} failed after {attempts} attempt(s): {last_error}")]
    RetryExhausted {
        label: String,
        attempts: u32,
        last_error: Box<FaceError>,
    },
    /// The response did not match the expected shape or value ranges.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The service processed the request and reported failure.
    #[error("service rejected request: {0}")]
    Rejected(String),
    /// The operation is switched off in the client options.
    #[error("feature disabled: {0}")]
    FeatureDisabled(&'static str),
    /// The client was destroyed; no further operations are accepted.
    #[error("client has been destroyed")]
    Destroyed,
    /// Every item of a batch comparison failed.
    #[error("batch compare failed for all {total} image(s): {first_error}")]
    BatchFailed { total: usize, first_error: String },
}

impl FaceError {
    /// Whether the retry manager should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FaceError::Network(_) | FaceError::Timeout(_) => true,
            FaceError::Http { status, .. } => {
                *status == 408 || *status == 429 || (500..=599).contains(status)
            }
            _ => false,
        }
    }

    /// Stable snake_case label used in error events and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FaceError::Config(_) => "config",
            FaceError::Validation(_) | FaceError::NotInitialized => "validation",
            FaceError::Network(_) | FaceError::Http { .. } => "network",
            FaceError::Timeout(_) => "timeout",
            FaceError::Cancelled => "cancelled",
            FaceError::RetryExhausted { .. } => "retry_exhausted",
            FaceError::Protocol(_) => "protocol",
            FaceError::Rejected(_) => "rejected",
            FaceError::FeatureDisabled(_) => "feature_disabled",
            FaceError::Destroyed => "destroyed",
            FaceError::BatchFailed { .. } => "batch_failed",
        }
    }

    /// The innermost error, looking through [`RetryExhausted`](FaceError::RetryExhausted).
    pub fn root_cause(&self) -> &FaceError {
        match self {
            FaceError::RetryExhausted { last_error, .. } => last_error.root_cause(),
            other => other,
        }
    }
}

impl From<reqwest::Error> for FaceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FaceError::Protocol(format!("invalid JSON response: {err}"))
        } else {
            FaceError::Network(err.to_string())
        }
    }
}

//! Async client SDK for a remote face-recognition service.
//!
//! The crate wraps the service's HTTP API (register a face, compare probe
//! images, batch compare, user and system lookups) in a
//! [`FaceCompareClient`] that adds the orchestration a capture front end
//! needs:
//!
//! - **Validation** of endpoint/identity config and image payloads before any
//!   network use ([`ConfigValidator`], [`ImagePayload`]).
//! - **Retries** with capped exponential backoff for transient failures
//!   ([`RetryManager`]).
//! - **Caching** of init/compare results keyed by identity, image fingerprint
//!   and threshold ([`CacheManager`]).
//! - **Events** for callers that react to outcomes rather than awaiting them
//!   ([`EventBus`], [`ClientEvent`]).
//! - **Lifecycle**: per-request timeouts, cancellation of in-flight requests
//!   on [`destroy`](FaceCompareClient::destroy).
//!
//! # Example
//!
//! ```no_run
//! use face_compare::{ClientConfig, ClientEvent, ClientOptions, EventPayload, FaceCompareClient, ImagePayload};
//! use std::time::Duration;
//!
//! # async fn run(frame: Vec<u8>, probe: Vec<u8>) -> face_compare::Result<()> {
//! let client = FaceCompareClient::with_options(
//!     ClientConfig::new("http://localhost:3001", "frontdesk-17"),
//!     ClientOptions {
//!         timeout: Duration::from_secs(10),
//!         match_threshold: 0.65,
//!         ..Default::default()
//!     },
//! )?;
//!
//! client.on(ClientEvent::CompareSuccess, |payload| {
//!     if let EventPayload::Compare(outcome) = payload {
//!         println!("similarity {:.3}", outcome.similarity);
//!     }
//! });
//!
//! client.record(&ImagePayload::from_bytes("jpeg", &frame)?).await?;
//! let outcome = client.compare(&ImagePayload::from_bytes("jpeg", &probe)?, None).await?;
//! assert!((0.0..=1.0).contains(&outcome.similarity));
//!
//! client.destroy();
//! # Ok(())
//! # }
//! ```
//!
//! Configuration can also be loaded from YAML with [`ClientSettings`].

mod api;
pub mod cache;
mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod image;
pub mod retry;
mod serde_millis;
pub mod settings;
pub mod types;

pub use api::CancelToken;
pub use cache::{CacheEntry, CacheManager};
pub use client::FaceCompareClient;
pub use config::{
    ClientConfig, ClientOptions, ConfigUpdate, ConfigValidator, ENV_ENDPOINT, ENV_IDENTITY,
    ENV_TOKEN, OptionsUpdate,
};
pub use error::{FaceError, Result};
pub use events::{ClientEvent, EventBus, EventPayload, HandlerId};
pub use fingerprint::{CacheKind, cache_key, fingerprint, fingerprint64};
pub use image::{ImagePayload, MAX_IMAGE_BYTES};
pub use retry::{RetryManager, RetryPolicy};
pub use settings::{ClientSettings, SettingsError};
pub use types::{
    BatchCompareReport, BatchItemFailure, BatchItemOutcome, CompareOutcome, HealthStatus,
    InitResult, SystemInfo, UserInfo, UserList,
};

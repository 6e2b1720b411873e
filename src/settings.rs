//! YAML settings files for the face-compare client.
//!
//! A settings file bundles a [`ClientConfig`] and [`ClientOptions`] so a
//! deployment can be described without code. Options use the same camelCase,
//! millisecond-valued keys as the JSON forms.
//!
//! ## Example
//!
//! ```yaml
//! version: "1.0"
//! name: "kiosk-frontdesk"
//!
//! client:
//!   endpointBaseUrl: "http://localhost:3001"
//!   identity: "frontdesk-user-17"
//!   # authToken: "..."
//!
//! options:
//!   timeoutMs: 15000
//!   maxRetries: 3
//!   retryBaseDelayMs: 500
//!   retryMaxDelayMs: 4000
//!   cacheTtlMs: 120000
//!   matchThreshold: 0.65
//!   enableBatch: true
//! ```
//!
//! `FACE_COMPARE_ENDPOINT`, `FACE_COMPARE_IDENTITY` and `FACE_COMPARE_TOKEN`
//! override the `client` section when
//! [`ClientSettings::with_env_overrides`] is applied.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::FaceCompareClient;
use crate::config::{ClientConfig, ClientOptions, ConfigValidator};
use crate::error::FaceError;

/// Errors that can occur when loading a settings file.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("unsupported settings version: {0}")]
    UnsupportedVersion(String),

    #[error("validation error: {0}")]
    Validation(#[from] FaceError),
}

/// Top-level settings document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Settings format version.
    pub version: String,

    /// Optional deployment name, used only for logging.
    #[serde(default)]
    pub name: Option<String>,

    pub client: ClientConfig,

    #[serde(default)]
    pub options: ClientOptions,
}

impl ClientSettings {
    pub fn new(client: ClientConfig, options: ClientOptions) -> Self {
        Self {
            version: "1.0".to_string(),
            name: None,
            client,
            options,
        }
    }

    /// Load and validate a YAML settings file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML settings from a string.
    pub fn from_yaml(yaml: &str) -> Result<Self, SettingsError> {
        let settings: ClientSettings = serde_yaml::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Overlay `FACE_COMPARE_*` environment variables onto `client` and
    /// revalidate.
    pub fn with_env_overrides(mut self) -> Result<Self, SettingsError> {
        self.client.apply_env_overrides();
        self.validate()?;
        Ok(self)
    }

    pub fn to_yaml(&self) -> Result<String, SettingsError> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        match self.version.as_str() {
            "1.0" | "1" => {}
            v => return Err(SettingsError::UnsupportedVersion(v.to_string())),
        }
        ConfigValidator::validate(&self.client)?;
        ConfigValidator::validate_options(&self.options)?;
        Ok(())
    }

    /// Build a client from these settings.
    pub fn into_client(self) -> Result<FaceCompareClient, SettingsError> {
        if self.options.logging_enabled {
            tracing::debug!(name = ?self.name, version = %self.version, "settings_loaded");
        }
        Ok(FaceCompareClient::with_options(self.client, self.options)?)
    }
}

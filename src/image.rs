//! Image payloads as base64 data URLs.
//!
//! The face service accepts `data:image/<format>;base64,<data>` strings. A
//! payload is checked before any network use: the format tag must be present
//! and the decoded size must stay within [`MAX_IMAGE_BYTES`]. Pixel data is
//! not decoded here; the service does that.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{FaceError, Result};
use crate::fingerprint::fingerprint;

/// Largest decoded image the client will send (10 MiB).
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

const DATA_PREFIX: &str = "data:image/";
const BASE64_MARKER: &str = ";base64,";

/// A validated base64 data-URL image.
#[derive(Clone, PartialEq, Eq)]
pub struct ImagePayload {
    data_url: String,
    format: String,
    decoded_len: usize,
}

impl ImagePayload {
    /// Validate an existing data URL.
    pub fn from_data_url(data_url: impl Into<String>) -> Result<Self> {
        let data_url = data_url.into();
        let rest = data_url.strip_prefix(DATA_PREFIX).ok_or_else(|| {
            FaceError::Validation("image must be a data URL starting with `data:image/`".into())
        })?;
        let (format, encoded) = rest.split_once(BASE64_MARKER).ok_or_else(|| {
            FaceError::Validation("image data URL must be base64 encoded".into())
        })?;
        if format.is_empty() || !format.bytes().all(is_format_byte) {
            return Err(FaceError::Validation(format!(
                "image format tag `{format}` is invalid"
            )));
        }
        if encoded.is_empty() {
            return Err(FaceError::Validation("image data is empty".into()));
        }

        let padding = encoded.bytes().rev().take_while(|b| *b == b'=').count();
        let decoded_len = base64::decoded_len_estimate(encoded.len()).saturating_sub(padding);
        if decoded_len > MAX_IMAGE_BYTES {
            return Err(FaceError::Validation(format!(
                "image is {decoded_len} bytes, limit is {MAX_IMAGE_BYTES}"
            )));
        }

        let format = format.to_ascii_lowercase();
        Ok(Self {
            data_url,
            format,
            decoded_len,
        })
    }

    /// Encode raw image bytes (e.g. a captured JPEG frame) as a data URL.
    ///
    /// `format` is the subtype after `image/`, such as `jpeg` or `png`.
    pub fn from_bytes(format: &str, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_IMAGE_BYTES {
            return Err(FaceError::Validation(format!(
                "image is {} bytes, limit is {MAX_IMAGE_BYTES}",
                bytes.len()
            )));
        }
        let encoded = STANDARD.encode(bytes);
        Self::from_data_url(format!("{DATA_PREFIX}{format}{BASE64_MARKER}{encoded}"))
    }

    pub fn as_str(&self) -> &str {
        &self.data_url
    }

    /// Lower-cased subtype, e.g. `jpeg`.
    pub fn format(&self) -> &str {
        &self.format
    }

    /// Estimated decoded size in bytes.
    pub fn decoded_len(&self) -> usize {
        self.decoded_len
    }

    /// Cache fingerprint of the full data URL.
    pub fn fingerprint(&self) -> String {
        fingerprint(self.data_url.as_bytes())
    }
}

fn is_format_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.')
}

impl TryFrom<String> for ImagePayload {
    type Error = FaceError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_data_url(value)
    }
}

impl TryFrom<&str> for ImagePayload {
    type Error = FaceError;

    fn try_from(value: &str) -> Result<Self> {
        Self::from_data_url(value)
    }
}

// Payloads run to megabytes; print the shape, not the data.
impl fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePayload")
            .field("format", &self.format)
            .field("decoded_len", &self.decoded_len)
            .finish()
    }
}

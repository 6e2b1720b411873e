//! Payload fingerprints and cache keys.
//!
//! The fingerprint is a memoization aid only. It is a 64-bit multiplicative
//! rolling hash (FNV-1a step, splitmix finalizer) with the payload length
//! folded in; it is not collision resistant against adversarial input.
//! Payloads up to [`FULL_SCAN_LIMIT`] bytes mix every byte. Larger payloads
//! mix a fixed-stride sample of about `FULL_SCAN_LIMIT` bytes plus the whole
//! tail, so the cost stays flat for multi-megabyte photos.

use std::fmt;

/// Payloads at or below this size are hashed byte by byte.
pub const FULL_SCAN_LIMIT: usize = 1 << 20;

/// Bytes at the end of a large payload that are always mixed in full.
const TAIL_BYTES: usize = 4096;

const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const PRIME: u64 = 0x0000_0100_0000_01b3;
const GOLDEN: u64 = 0x9e37_79b9_7f4a_7c15;

#[inline]
fn mix(hash: u64, byte: u8) -> u64 {
    (hash ^ u64::from(byte)).wrapping_mul(PRIME)
}

fn finalize(mut h: u64) -> u64 {
    h = (h ^ (h >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    h = (h ^ (h >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    h ^ (h >> 31)
}

/// Raw 64-bit fingerprint of `bytes`.
pub fn fingerprint64(bytes: &[u8]) -> u64 {
    let len = bytes.len();
    let mut hash = OFFSET_BASIS;

    if len <= FULL_SCAN_LIMIT {
        for &b in bytes {
            hash = mix(hash, b);
        }
    } else {
        let stride = len.div_ceil(FULL_SCAN_LIMIT);
        for &b in bytes.iter().step_by(stride) {
            hash = mix(hash, b);
        }
        for &b in &bytes[len - TAIL_BYTES..] {
            hash = mix(hash, b);
        }
    }

    hash ^= (len as u64).wrapping_mul(GOLDEN);
    finalize(hash)
}

/// Hex fingerprint with the payload length appended, e.g. `9f0c…e1-1a2b`.
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:016x}-{:x}", fingerprint64(bytes), bytes.len())
}

/// Which operation a cache entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Init,
    Compare,
}

impl CacheKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheKind::Init => "init",
            CacheKind::Compare => "compare",
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the cache key for `(operation, identity, image, threshold)`.
///
/// The identity is length-prefixed so separators inside it cannot make two
/// different tuples render the same key. The threshold uses Rust's
/// shortest round-trip float formatting, so distinct values never share a key.
/// `-0.0` is folded into `0.0` first, since both mean the same cutoff.
pub fn cache_key(
    kind: CacheKind,
    identity: &str,
    image_fingerprint: &str,
    threshold: Option<f64>,
) -> String {
    let threshold = threshold.map_or_else(|| "-".to_string(), |t| (t + 0.0).to_string());
    format!(
        "{kind}:{}:{identity}:{image_fingerprint}:{threshold}",
        identity.len()
    )
}

//! General utilities shared across the crate.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;

/// Returns the current Unix timestamp in seconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen
/// in practice).
#[must_use]
pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Encodes bytes as standard base64 (used for the wire protocol's JSON
/// fields: `snonce`, `conn`, `cnonce`).
#[must_use]
pub fn b64_encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decodes standard base64.
pub fn b64_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(s)
}

/// Encodes bytes as URL-safe, unpadded base64 (used for the `token` query
/// parameter, which rides inside a URL).
#[must_use]
pub fn b64_url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decodes URL-safe, unpadded base64.
pub fn b64_url_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(s)
}

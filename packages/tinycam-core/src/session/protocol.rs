//! Wire message shapes for the `/stream` WebSocket protocol, kept
//! deliberately flat and small - this is not a general message envelope,
//! just the two JSON frames the handshake exchanges.

use serde::{Deserialize, Serialize};

/// Raw query-string parameters carried on the `/stream` upgrade request.
/// Left as strings so malformed values can be reported as `AuthFailure`
/// (401) rather than a generic extractor rejection.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub token: String,
    pub exp: String,
    pub cnonce: String,
}

/// The server's only text frame, sent immediately after upgrade.
#[derive(Debug, Serialize)]
pub struct Hello {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub snonce: String,
    pub conn: String,
    pub w: u32,
    pub h: u32,
    pub fps: u32,
    pub codec: String,
    pub exp: u64,
}

impl Hello {
    #[must_use]
    pub fn new(snonce: &[u8; 16], conn_id: &[u8; 4], w: u32, h: u32, fps: u32, codec: &str, exp: u64) -> Self {
        Self {
            kind: "hello",
            snonce: crate::utils::b64_encode(snonce),
            conn: crate::utils::b64_encode(conn_id),
            w,
            h,
            fps,
            codec: codec.to_string(),
            exp,
        }
    }
}

/// The client's single handshake-completing text frame. `type` must be one
/// of `start`, `request`, or `ready`; `conn`/`exp`, if present, must match
/// the values the server sent in `hello`.
#[derive(Debug, Deserialize)]
pub struct ClientStart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub conn: Option<String>,
    #[serde(default)]
    pub exp: Option<u64>,
}

impl ClientStart {
    /// The `type` values accepted as a valid handshake completion.
    pub const ACCEPTED_KINDS: [&'static str; 3] = ["start", "request", "ready"];

    #[must_use]
    pub fn is_accepted_kind(&self) -> bool {
        Self::ACCEPTED_KINDS.contains(&self.kind.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_serializes_expected_shape() {
        let hello = Hello::new(&[1; 16], &[2; 4], 1920, 1080, 30, "h264", 1_700_000_000);
        let json = serde_json::to_value(&hello).unwrap();
        assert_eq!(json["type"], "hello");
        assert_eq!(json["codec"], "h264");
        assert_eq!(json["w"], 1920);
    }

    #[test]
    fn client_start_accepts_compatibility_kinds() {
        for kind in ["start", "request", "ready"] {
            let msg: ClientStart =
                serde_json::from_str(&format!(r#"{{"type":"{kind}"}}"#)).unwrap();
            assert!(msg.is_accepted_kind());
        }
    }

    #[test]
    fn client_start_rejects_unknown_kind() {
        let msg: ClientStart = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert!(!msg.is_accepted_kind());
    }
}

//! Client-side mirror of the `/stream` WebSocket protocol.
//!
//! Specified only to the extent needed to exercise the server end-to-end:
//! it opens the WebSocket, completes the handshake, and for every binary
//! frame enforces the same invariants the server enforces on the way in
//! (min length, conn-id prefix, strictly-increasing counter, AEAD
//! verification) before forwarding the plaintext to a container-agnostic
//! sink. Grounded on the same HKDF/AES-GCM idiom as [`crate::crypto`]
//! (`mealycpp-ECE4301.../leader-main.rs`) and on the teacher's WebSocket
//! handler shape, mirrored for the client side.

use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::crypto::{self, SessionCrypto};
use crate::error::{TinycamError, TinycamResult};
use crate::session::protocol::Hello;
use crate::utils::{b64_decode, b64_encode};

/// How the in-memory media buffer retains appended frames.
#[derive(Debug, Clone, Copy)]
pub enum Retention {
    /// Never trims; the buffer only grows.
    Grow,
    /// Periodically drops buffered content older than `now - minutes`.
    Window {
        /// Retention window, in minutes.
        minutes: u64,
    },
}

/// One appended plaintext chunk with the wall-clock time it arrived, so
/// [`MediaBuffer::trim_older_than`] can implement the `Window` retention
/// mode.
struct Entry {
    received_at: Instant,
    bytes: Vec<u8>,
}

/// Container-agnostic sink for decrypted frames: an append-only (or
/// window-trimmed) buffer a real player would hand to a decoder.
///
/// Tracks whether the underlying sink is "paused" after the first append,
/// mirroring the source's first-frame fallback: callers can inspect
/// [`MediaBuffer::needs_first_frame_recovery`] and, after seeking the real
/// sink to the end, clear it with [`MediaBuffer::mark_recovered`].
pub struct MediaBuffer {
    retention: Retention,
    entries: Vec<Entry>,
    total_len: usize,
    needs_recovery: bool,
}

impl MediaBuffer {
    /// Creates an empty buffer with the given retention policy.
    #[must_use]
    pub fn new(retention: Retention) -> Self {
        Self {
            retention,
            entries: Vec::new(),
            total_len: 0,
            needs_recovery: false,
        }
    }

    /// Appends one decrypted frame. The first append flags
    /// [`MediaBuffer::needs_first_frame_recovery`] (a real sink is often
    /// paused until the caller seeks past the freshly-appended init
    /// segment).
    pub fn append(&mut self, bytes: Vec<u8>) {
        if self.entries.is_empty() {
            self.needs_recovery = true;
        }
        self.total_len += bytes.len();
        self.entries.push(Entry {
            received_at: Instant::now(),
            bytes,
        });
        if let Retention::Window { minutes } = self.retention {
            self.trim_older_than(Duration::from_secs(minutes * 60));
        }
    }

    /// Whether the first-frame recovery (seek-to-end-and-resume) still
    /// needs to run. Not a protocol requirement - a recovery strategy for
    /// sinks that pause after their first append.
    #[must_use]
    pub fn needs_first_frame_recovery(&self) -> bool {
        self.needs_recovery
    }

    /// Marks first-frame recovery as done.
    pub fn mark_recovered(&mut self) {
        self.needs_recovery = false;
    }

    /// Total bytes currently buffered.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// Number of frames currently buffered.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.entries.len()
    }

    fn trim_older_than(&mut self, max_age: Duration) {
        let now = Instant::now();
        while let Some(front) = self.entries.first() {
            if now.duration_since(front.received_at) > max_age {
                self.total_len -= front.bytes.len();
                self.entries.remove(0);
            } else {
                break;
            }
        }
    }
}

/// Default interval between the client's application-level `ping` frames:
/// half the server's default inactivity timeout, so a connection that's
/// merely quiet never trips the server's watchdog.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
/// Default receive-inactivity watchdog: if nothing arrives for this long,
/// the connection is presumed dead and `run` returns an error.
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);

/// Client-side mirror of the streaming protocol: opens the WebSocket,
/// performs the handshake, and drives [`Player::run`] to hand off decrypted
/// frames to a [`MediaBuffer`].
pub struct Player {
    url: String,
    access_key: [u8; 32],
    ping_interval: Duration,
    watchdog_timeout: Duration,
}

#[derive(Serialize)]
struct PingFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    ts: u64,
}

#[derive(Serialize)]
struct ClientStartFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    conn: &'a str,
    exp: u64,
}

impl Player {
    /// Builds a player that will connect to `url` (the full `/stream?...`
    /// URL, already carrying `token`/`exp`/`cnonce`) using `access_key` to
    /// derive the session key.
    #[must_use]
    pub fn new(url: impl Into<String>, access_key: [u8; 32]) -> Self {
        Self {
            url: url.into(),
            access_key,
            ping_interval: DEFAULT_PING_INTERVAL,
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
        }
    }

    /// Overrides the interval between application-level `ping` frames.
    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Overrides the receive-inactivity watchdog timeout.
    #[must_use]
    pub fn with_watchdog_timeout(mut self, timeout: Duration) -> Self {
        self.watchdog_timeout = timeout;
        self
    }

    /// Connects, completes the handshake, and streams decrypted frames into
    /// `buffer` until the connection closes or a protocol violation occurs.
    pub async fn run(&self, cnonce: [u8; 16], buffer: &mut MediaBuffer) -> TinycamResult<()> {
        let (mut socket, _response) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| TinycamError::Internal(format!("websocket connect failed: {e}")))?;

        let hello_text = match socket.next().await {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(_)) => {
                return Err(TinycamError::HandshakeFailure(
                    "expected text hello frame".into(),
                ))
            }
            Some(Err(e)) => return Err(TinycamError::Internal(format!("websocket error: {e}"))),
            None => return Err(TinycamError::HandshakeFailure("connection closed before hello".into())),
        };

        let hello: Hello = serde_json::from_str(&hello_text)
            .map_err(|e| TinycamError::HandshakeFailure(format!("malformed hello: {e}")))?;

        let snonce: [u8; 16] = b64_decode(&hello.snonce)
            .map_err(|e| TinycamError::HandshakeFailure(format!("malformed snonce: {e}")))?
            .try_into()
            .map_err(|_| TinycamError::HandshakeFailure("snonce must be 16 bytes".into()))?;
        let conn_id: [u8; 4] = b64_decode(&hello.conn)
            .map_err(|e| TinycamError::HandshakeFailure(format!("malformed conn: {e}")))?
            .try_into()
            .map_err(|_| TinycamError::HandshakeFailure("conn must be 4 bytes".into()))?;

        let session_key = crypto::derive_session_key(&self.access_key, &cnonce, &snonce);
        let aad = crypto::build_aad(
            &conn_id,
            hello.exp,
            &hello.codec,
            hello.w,
            hello.h,
            hello.fps,
        );
        let mut crypto_session = SessionCrypto::new(session_key, conn_id, aad);

        let start = ClientStartFrame {
            kind: "start",
            conn: &hello.conn,
            exp: hello.exp,
        };
        let start_json = serde_json::to_string(&start)
            .map_err(|e| TinycamError::Internal(format!("serializing start frame: {e}")))?;
        socket
            .send(WsMessage::Text(start_json.into()))
            .await
            .map_err(|e| TinycamError::Internal(format!("sending start frame: {e}")))?;

        let mut ping_ticker = tokio::time::interval(self.ping_interval);

        loop {
            tokio::select! {
                _ = ping_ticker.tick() => {
                    let ping = PingFrame {
                        kind: "ping",
                        ts: crate::utils::now_unix_secs(),
                    };
                    let ping_json = serde_json::to_string(&ping)
                        .map_err(|e| TinycamError::Internal(format!("serializing ping frame: {e}")))?;
                    if socket.send(WsMessage::Text(ping_json.into())).await.is_err() {
                        break;
                    }
                }
                message = tokio::time::timeout(self.watchdog_timeout, socket.next()) => {
                    let message = match message {
                        Ok(inner) => inner,
                        Err(_) => {
                            return Err(TinycamError::Internal(
                                "receive watchdog: no data from server".into(),
                            ));
                        }
                    };
                    match message {
                        Some(Ok(WsMessage::Binary(record))) => match crypto_session.decrypt_frame(&record) {
                            Ok(plaintext) => {
                                let first_append = buffer.frame_count() == 0;
                                buffer.append(plaintext);
                                if first_append && buffer.needs_first_frame_recovery() {
                                    // The recovery strategy (seek-to-end-and-resume) is a
                                    // caller concern - the real media sink lives outside
                                    // this crate. We only surface that it's needed.
                                }
                            }
                            Err(e) => {
                                log::debug!("dropping frame that failed verification: {e}");
                            }
                        },
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(TinycamError::Internal(format!("websocket error: {e}"))),
                    }
                }
            }
        }

        Ok(())
    }

    /// Builds the full `/stream` URL from a base `ws://`/`wss://` origin,
    /// an access key used to compute `token`, and a freshly-generated
    /// `cnonce`.
    #[must_use]
    pub fn build_url(origin: &str, access_key: &[u8; 32], exp: u64, cnonce: &[u8; 16]) -> String {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;

        let mut mac = Hmac::<Sha256>::new_from_slice(access_key)
            .expect("HMAC-SHA256 accepts any key length, 32 bytes always valid");
        mac.update(format!("stream:{exp}").as_bytes());
        let token = crate::utils::b64_url_encode(&mac.finalize().into_bytes());

        format!(
            "{origin}/stream?token={token}&exp={exp}&cnonce={}",
            urlencoding_b64(&b64_encode(cnonce))
        )
    }
}

/// Percent-encodes the `+`/`/`/`=` characters standard base64 can produce,
/// so it survives unescaped inside a query string component.
fn urlencoding_b64(s: &str) -> String {
    s.replace('+', "%2B").replace('/', "%2F").replace('=', "%3D")
}

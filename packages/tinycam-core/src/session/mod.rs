//! `StreamSession`: the `/stream` WebSocket endpoint state machine
//! (PreAccept -> Accepted -> AwaitStart -> Streaming -> Closing -> Closed).
//!
//! Grounded on the teacher's `handle_ws`/`ws_handler` pair
//! (`api/ws.rs`): upgrade handler splits the socket, a `tokio::select!` loop
//! drives the receive side and timers, and an RAII guard
//! (here, `Subscription`) unregisters the connection on drop. Encryption and
//! the single outbound writer are new - grounded on the pack's per-session
//! AEAD examples plus a single-writer-task concurrency model for the
//! outbound side.

mod auth;
pub mod protocol;

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::broadcast::Broadcaster;
use crate::crypto::{self, SessionCrypto};
use crate::init_cache::InitCache;
use crate::queue::DEFAULT_CAPACITY;

use protocol::{ClientStart, Hello, StreamQuery};

/// Default time allowed for the client to send its `start` frame.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);
/// Minimum configurable start timeout.
pub const MIN_START_TIMEOUT: Duration = Duration::from_secs(2);
/// Maximum configurable start timeout.
pub const MAX_START_TIMEOUT: Duration = Duration::from_secs(3600);
/// Default streaming inactivity timeout.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);
/// Budget for the polite close handshake before the socket is abandoned.
const CLOSE_BUDGET: Duration = Duration::from_secs(1);
/// Size of each preroll slice pushed onto the outbound queue.
const PREROLL_SLICE_SIZE: usize = 64 * 1024;

/// Close codes the server uses.
#[derive(Debug, Clone, Copy)]
enum CloseReason {
    Normal,
    GoingAway,
    PolicyViolation,
    InternalError,
    ShuttingDown,
}

impl CloseReason {
    fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::PolicyViolation => 1008,
            Self::InternalError => 1011,
            Self::ShuttingDown => 1013,
        }
    }

    fn reason_text(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::GoingAway => "going away",
            Self::PolicyViolation => "policy violation",
            Self::InternalError => "internal error",
            Self::ShuttingDown => "server shutting down",
        }
    }
}

/// Stream parameters bound into every session's AAD and sent in `hello`.
/// An immutable snapshot matching the encoder config currently running;
/// the caller rebuilds `StreamingApp` across encoder restarts that change
/// these values.
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Shared state for the `/stream` endpoint: everything a `StreamSession`
/// needs that outlives any single connection.
pub struct StreamingApp {
    access_key: [u8; 32],
    init_cache: Arc<InitCache>,
    broadcaster: Arc<Broadcaster>,
    params: StreamParams,
    start_timeout: Duration,
    inactivity_timeout: Duration,
    queue_capacity: usize,
    shutdown: CancellationToken,
}

impl StreamingApp {
    #[must_use]
    pub fn new(
        access_key: [u8; 32],
        init_cache: Arc<InitCache>,
        broadcaster: Arc<Broadcaster>,
        params: StreamParams,
    ) -> Self {
        Self {
            access_key,
            init_cache,
            broadcaster,
            params,
            start_timeout: DEFAULT_START_TIMEOUT,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            queue_capacity: DEFAULT_CAPACITY,
            shutdown: CancellationToken::new(),
        }
    }

    /// Overrides the start-frame timeout (clamped to the supported range).
    #[must_use]
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout.clamp(MIN_START_TIMEOUT, MAX_START_TIMEOUT);
        self
    }

    /// Overrides the streaming inactivity timeout.
    #[must_use]
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Overrides the per-session outbound queue capacity (clamped).
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = crate::queue::clamp_capacity(capacity);
        self
    }

    /// Cancellation token that, when triggered, asks every live session to
    /// close with the server-shutting-down status.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Triggers a coordinated shutdown of every live session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Axum handler for `GET /stream`. Validates credentials before upgrading;
/// on failure responds 401 without ever sending `hello`.
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<StreamQuery>,
    State(app): State<Arc<StreamingApp>>,
) -> Response {
    match auth::verify(&app.access_key, &query) {
        Ok(accepted) => ws
            .on_upgrade(move |socket| async move {
                run_session(socket, app, accepted.exp, accepted.cnonce).await;
            })
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn run_session(socket: WebSocket, app: Arc<StreamingApp>, exp: u64, cnonce: [u8; 16]) {
    let (mut sender, mut receiver) = socket.split();

    let conn_id = crypto::random_conn_id();
    let snonce = crypto::random_handshake_nonce();
    let session_key = crypto::derive_session_key(&app.access_key, &cnonce, &snonce);
    let aad = crypto::build_aad(
        &conn_id,
        exp,
        &app.params.codec,
        app.params.width,
        app.params.height,
        app.params.fps,
    );

    let hello = Hello::new(
        &snonce,
        &conn_id,
        app.params.width,
        app.params.height,
        app.params.fps,
        &app.params.codec,
        exp,
    );
    let Ok(hello_json) = serde_json::to_string(&hello) else {
        close_immediately(&mut sender, CloseReason::InternalError).await;
        return;
    };
    if sender.send(Message::Text(hello_json.into())).await.is_err() {
        return;
    }

    let start_wait = tokio::time::timeout(app.start_timeout, receiver.next()).await;
    let reason = match start_wait {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ClientStart>(&text) {
            Ok(start) if start.is_accepted_kind() => {
                let conn_ok = start
                    .conn
                    .as_deref()
                    .map(|c| c == crate::utils::b64_encode(&conn_id))
                    .unwrap_or(true);
                let exp_ok = start.exp.map(|e| e == exp).unwrap_or(true);
                if conn_ok && exp_ok {
                    None
                } else {
                    Some(CloseReason::PolicyViolation)
                }
            }
            _ => Some(CloseReason::PolicyViolation),
        },
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => Some(CloseReason::Normal),
        Ok(Some(Ok(_))) => Some(CloseReason::PolicyViolation),
        Ok(Some(Err(_))) => Some(CloseReason::InternalError),
        Err(_) => Some(CloseReason::PolicyViolation),
    };

    if let Some(reason) = reason {
        close_immediately(&mut sender, reason).await;
        return;
    }

    let subscription = app.broadcaster.subscribe(app.queue_capacity);
    let queue = subscription.queue().clone();

    let snapshot = app.init_cache.snapshot();
    if !snapshot.is_empty() {
        for chunk in snapshot.chunks(PREROLL_SLICE_SIZE) {
            queue.push(Bytes::copy_from_slice(chunk));
        }
    }

    let (close_tx, close_rx) = oneshot::channel::<CloseReason>();
    let writer = tokio::spawn(run_writer(
        sender,
        queue,
        SessionCrypto::new(session_key, conn_id, aad),
        close_rx,
    ));

    let shutdown = app.shutdown_token();
    let inactivity_timeout = app.inactivity_timeout;
    let mut close_tx = Some(close_tx);
    let mut send_reason = |reason: CloseReason| {
        if let Some(tx) = close_tx.take() {
            let _ = tx.send(reason);
        }
    };

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                send_reason(CloseReason::ShuttingDown);
                break;
            }
            msg = tokio::time::timeout(inactivity_timeout, receiver.next()) => {
                match msg {
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                        send_reason(CloseReason::Normal);
                        break;
                    }
                    Ok(Some(Ok(_))) => continue, // any frame resets the timeout on the next loop
                    Ok(Some(Err(_))) => {
                        send_reason(CloseReason::InternalError);
                        break;
                    }
                    Err(_) => {
                        send_reason(CloseReason::PolicyViolation);
                        break;
                    }
                }
            }
        }
    }

    drop(subscription);
    let _ = tokio::time::timeout(CLOSE_BUDGET, writer).await;
}

async fn run_writer(
    mut sender: futures::stream::SplitSink<WebSocket, Message>,
    queue: Arc<crate::queue::DropOldestQueue<Bytes>>,
    mut crypto_session: SessionCrypto,
    close_rx: oneshot::Receiver<CloseReason>,
) {
    while let Some(chunk) = queue.pop().await {
        let record = crypto_session.encrypt_frame(&chunk);
        if sender.send(Message::Binary(record.into())).await.is_err() {
            return;
        }
    }

    let reason = close_rx.await.unwrap_or(CloseReason::InternalError);
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: reason.code(),
            reason: Cow::Borrowed(reason.reason_text()).into(),
        })))
        .await;
}

async fn close_immediately(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    reason: CloseReason,
) {
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: reason.code(),
            reason: Cow::Borrowed(reason.reason_text()).into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reason_codes_match_wire_spec() {
        assert_eq!(CloseReason::Normal.code(), 1000);
        assert_eq!(CloseReason::GoingAway.code(), 1001);
        assert_eq!(CloseReason::PolicyViolation.code(), 1008);
        assert_eq!(CloseReason::InternalError.code(), 1011);
        assert_eq!(CloseReason::ShuttingDown.code(), 1013);
    }

    #[test]
    fn start_timeout_is_clamped() {
        let app = StreamingApp::new(
            [0u8; 32],
            Arc::new(InitCache::new(crate::init_cache::ContainerKind::Cluster)),
            Arc::new(Broadcaster::new()),
            StreamParams {
                codec: "vp8".into(),
                width: 640,
                height: 480,
                fps: 15,
            },
        )
        .with_start_timeout(Duration::from_secs(1));
        assert_eq!(app.start_timeout, MIN_START_TIMEOUT);
    }

    // End-to-end scenarios: a real axum server bound to an ephemeral port,
    // driven by a real `tokio-tungstenite` client.

    use axum::routing::get;
    use axum::Router;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn token_for(access_key: &[u8; 32], exp: u64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(access_key).unwrap();
        mac.update(format!("stream:{exp}").as_bytes());
        crate::utils::b64_url_encode(&mac.finalize().into_bytes())
    }

    async fn spawn_test_server(app: Arc<StreamingApp>) -> std::net::SocketAddr {
        let router = Router::new()
            .route("/stream", get(stream_handler))
            .with_state(app);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router.into_make_service())
                .await
                .unwrap();
        });
        addr
    }

    fn stream_url(addr: std::net::SocketAddr, access_key: &[u8; 32], exp: u64, cnonce: &[u8; 16]) -> String {
        format!(
            "ws://{addr}/stream?token={}&exp={exp}&cnonce={}",
            token_for(access_key, exp),
            crate::utils::b64_encode(cnonce).replace('+', "%2B").replace('/', "%2F").replace('=', "%3D"),
        )
    }

    #[tokio::test]
    async fn s1_successful_handshake_and_first_frame() {
        let access_key = [7u8; 32];
        let init_cache = Arc::new(InitCache::new(crate::init_cache::ContainerKind::Cluster));
        let broadcaster = Arc::new(Broadcaster::new());
        let app = Arc::new(StreamingApp::new(
            access_key,
            init_cache,
            broadcaster.clone(),
            StreamParams {
                codec: "h264".into(),
                width: 1920,
                height: 1080,
                fps: 30,
            },
        ));

        let addr = spawn_test_server(app).await;
        let exp = crate::utils::now_unix_secs() + 60;
        let cnonce = [1u8; 16];
        let url = stream_url(addr, &access_key, exp, &cnonce);

        let (mut ws, _response) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let hello_text = match ws.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => text,
            other => panic!("expected text hello frame, got {other:?}"),
        };
        let hello: Hello = serde_json::from_str(&hello_text).unwrap();
        assert_eq!(hello.exp, exp);
        assert_eq!(crate::utils::b64_decode(&hello.conn).unwrap().len(), 4);
        assert_eq!(crate::utils::b64_decode(&hello.snonce).unwrap().len(), 16);

        let start = serde_json::json!({"type": "start", "conn": hello.conn, "exp": hello.exp});
        ws.send(WsMessage::Text(start.to_string().into()))
            .await
            .unwrap();

        // Give the session a moment to subscribe before it broadcasts.
        tokio::time::sleep(Duration::from_millis(50)).await;
        broadcaster.broadcast(Bytes::from_static(b"first-chunk"));

        let record = match tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("frame arrives in time")
            .unwrap()
            .unwrap()
        {
            WsMessage::Binary(bytes) => bytes,
            other => panic!("expected binary frame, got {other:?}"),
        };

        let counter = u64::from_be_bytes(record[4..12].try_into().unwrap());
        assert_eq!(counter, 1);
        assert_eq!(&record[0..4], crate::utils::b64_decode(&hello.conn).unwrap().as_slice());
    }

    #[tokio::test]
    async fn s2_expired_token_is_rejected_before_upgrade() {
        let access_key = [7u8; 32];
        let app = Arc::new(StreamingApp::new(
            access_key,
            Arc::new(InitCache::new(crate::init_cache::ContainerKind::Cluster)),
            Arc::new(Broadcaster::new()),
            StreamParams {
                codec: "h264".into(),
                width: 640,
                height: 480,
                fps: 30,
            },
        ));
        let addr = spawn_test_server(app).await;
        let exp = crate::utils::now_unix_secs().saturating_sub(1);
        let cnonce = [2u8; 16];
        let url = stream_url(addr, &access_key, exp, &cnonce);

        let err = tokio_tungstenite::connect_async(&url).await.unwrap_err();
        match err {
            tokio_tungstenite::tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), 401);
            }
            other => panic!("expected an HTTP 401 rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn s3_bad_cnonce_length_is_rejected_before_upgrade() {
        let access_key = [7u8; 32];
        let app = Arc::new(StreamingApp::new(
            access_key,
            Arc::new(InitCache::new(crate::init_cache::ContainerKind::Cluster)),
            Arc::new(Broadcaster::new()),
            StreamParams {
                codec: "h264".into(),
                width: 640,
                height: 480,
                fps: 30,
            },
        ));
        let addr = spawn_test_server(app).await;
        let exp = crate::utils::now_unix_secs() + 60;
        let short_cnonce = crate::utils::b64_encode(&[3u8; 15]); // 15 bytes, not 16
        let url = format!(
            "ws://{addr}/stream?token={}&exp={exp}&cnonce={short_cnonce}",
            token_for(&access_key, exp),
        );

        let err = tokio_tungstenite::connect_async(&url).await.unwrap_err();
        match err {
            tokio_tungstenite::tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), 401);
            }
            other => panic!("expected an HTTP 401 rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn s4_missing_start_frame_closes_with_policy_violation() {
        let access_key = [7u8; 32];
        let app = Arc::new(
            StreamingApp::new(
                access_key,
                Arc::new(InitCache::new(crate::init_cache::ContainerKind::Cluster)),
                Arc::new(Broadcaster::new()),
                StreamParams {
                    codec: "h264".into(),
                    width: 640,
                    height: 480,
                    fps: 30,
                },
            )
            .with_start_timeout(MIN_START_TIMEOUT),
        );
        let addr = spawn_test_server(app).await;
        let exp = crate::utils::now_unix_secs() + 60;
        let cnonce = [4u8; 16];
        let url = stream_url(addr, &access_key, exp, &cnonce);

        let (mut ws, _response) = tokio_tungstenite::connect_async(&url).await.unwrap();
        // Consume `hello`, then send nothing.
        let _ = ws.next().await.unwrap().unwrap();

        let close = tokio::time::timeout(MIN_START_TIMEOUT + Duration::from_secs(2), async {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Close(frame))) => return frame,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) | None => return None,
                }
            }
        })
        .await
        .expect("server closes within the configured start timeout");

        assert_eq!(close.map(|f| f.code.into()), Some(1008u16));
    }

    #[tokio::test]
    async fn streaming_inactivity_timeout_closes_with_policy_violation() {
        let access_key = [7u8; 32];
        let inactivity_timeout = Duration::from_millis(200);
        let app = Arc::new(
            StreamingApp::new(
                access_key,
                Arc::new(InitCache::new(crate::init_cache::ContainerKind::Cluster)),
                Arc::new(Broadcaster::new()),
                StreamParams {
                    codec: "h264".into(),
                    width: 640,
                    height: 480,
                    fps: 30,
                },
            )
            .with_inactivity_timeout(inactivity_timeout),
        );
        let addr = spawn_test_server(app).await;
        let exp = crate::utils::now_unix_secs() + 60;
        let cnonce = [5u8; 16];
        let url = stream_url(addr, &access_key, exp, &cnonce);

        let (mut ws, _response) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let hello_text = match ws.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => text,
            other => panic!("expected text hello frame, got {other:?}"),
        };
        let hello: Hello = serde_json::from_str(&hello_text).unwrap();

        let start = serde_json::json!({"type": "start", "conn": hello.conn, "exp": hello.exp});
        ws.send(WsMessage::Text(start.to_string().into()))
            .await
            .unwrap();
        // Now in Streaming state; send nothing further and let the
        // inactivity watchdog fire.

        let close = tokio::time::timeout(inactivity_timeout + Duration::from_secs(2), async {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Close(frame))) => return frame,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) | None => return None,
                }
            }
        })
        .await
        .expect("server closes within the configured inactivity timeout");

        assert_eq!(close.map(|f| f.code.into()), Some(1008u16));
    }
}

//! WebSocket transport server using Axum.
//!
//! Handles the HTTP upgrade to WebSocket, enforces the connection limit,
//! and hands each accepted socket to the [`ConnectionHandler`] as a
//! frame source / frame sink pair.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::frame::{ConnectionHandler, FrameSink, FrameSource, TransportError};

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 4412,
            hostname: "127.0.0.1".into(),
            max_connections: Some(64),
        }
    }
}

/// Shared state for the transport server.
struct AppState<H: ConnectionHandler> {
    handler: Arc<H>,
    slots: Arc<ConnectionSlots>,
}

/// Counts connections from the moment their upgrade is accepted, so
/// concurrent upgrades cannot overshoot the limit.
struct ConnectionSlots {
    active: AtomicUsize,
    max: Option<usize>,
}

/// A reserved connection slot, released on drop.
struct SlotGuard {
    slots: Arc<ConnectionSlots>,
}

impl ConnectionSlots {
    fn new(max: Option<usize>) -> Self {
        Self {
            active: AtomicUsize::new(0),
            max,
        }
    }

    fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        match self.max {
            Some(max) => {
                self.active
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
                    .ok()?;
            }
            None => {
                self.active.fetch_add(1, Ordering::AcqRel);
            }
        }
        Some(SlotGuard {
            slots: Arc::clone(self),
        })
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The transport server: accepts WebSocket connections.
pub struct TransportServer {
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Server task handle
    handle: Option<tokio::task::JoinHandle<()>>,
    /// Actual bound port
    port: u16,
}

impl TransportServer {
    /// Bind and start serving connections with the given handler.
    pub async fn start<H: ConnectionHandler>(
        config: TransportConfig,
        handler: Arc<H>,
    ) -> Result<Self, TransportError> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let state = Arc::new(AppState {
            handler,
            slots: Arc::new(ConnectionSlots::new(config.max_connections)),
        });

        let app = Router::new()
            .route("/connect", get(ws_upgrade_handler::<H>))
            .route("/health", get(health_handler::<H>))
            .with_state(state);

        let addr: SocketAddr = format!("{}:{}", config.hostname, config.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();

        info!("Exec agent listening on ws://{}:{}/connect", config.hostname, actual_port);

        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await;
            if let Err(e) = served {
                warn!("Transport server stopped with error: {e}");
            }
        });

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            port: actual_port,
        })
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting connections and wait for the listener to wind down.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("Transport server stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler<H: ConnectionHandler>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    let Some(slot) = state.slots.try_acquire() else {
        warn!(
            "Connection rejected: max connections reached ({})",
            state.slots.max.unwrap_or_default()
        );
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    debug!("Connection slot reserved ({} active)", state.slots.active());

    // A failed upgrade drops the callback, and the slot with it.
    ws.on_upgrade(move |socket| async move {
        handle_ws_connection(socket, state).await;
        drop(slot);
    })
    .into_response()
}

async fn health_handler<H: ConnectionHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.handler.connection_count(),
    }))
}

async fn handle_ws_connection<H: ConnectionHandler>(socket: WebSocket, state: Arc<AppState<H>>) {
    let (ws_tx, ws_rx) = socket.split();
    state
        .handler
        .serve(WsSource { inner: ws_rx }, WsSink { inner: ws_tx })
        .await;
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket halves
// ─────────────────────────────────────────────────────────────────────────────

struct WsSource {
    inner: SplitStream<WebSocket>,
}

struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

impl FrameSource for WsSource {
    async fn receive(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Binary(data)) => {
                    return Some(
                        String::from_utf8(data.to_vec()).map_err(|_| TransportError::InvalidUtf8),
                    );
                }
                Ok(Message::Close(_)) => {
                    debug!("Peer sent close frame");
                    return None;
                }
                // Pongs to pings are queued by the websocket layer itself.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Err(e) => return Some(Err(TransportError::WebSocket(e.to_string()))),
            }
        }
    }
}

impl FrameSink for WsSink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.inner.send(Message::Close(None)).await;
        let _ = self.inner.close().await;
    }
}

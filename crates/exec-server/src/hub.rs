//! ConnectionHub: owns connection lifecycle.
//!
//! Each accepted connection gets one inbound loop (frames are dispatched
//! one at a time, in arrival order) and one writer task draining its
//! outbound queue. Responses and events share that queue, so frames are
//! never interleaved on the wire.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use exec_protocol::{Event, EventBody, EventTypes, Periodical};
use exec_transport::{ConnectionHandler, FrameSink, FrameSource, TransportError};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ConnectionId;
use crate::correlator::Correlator;
use crate::dispatcher::{ConnectionScope, Dispatcher};
use crate::event_bus::EventBus;
use crate::outbound::{EventDelivery, Outbound, OutboundFrame};
use crate::router::Router;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each connection's outbound queue, in frames.
    pub queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

/// Body of the `connected` greeting.
#[derive(Serialize)]
struct ConnectedBody {
    #[serde(flatten)]
    base: EventBody,
    channel: String,
    text: String,
}

impl Periodical for ConnectedBody {
    fn set_time(&mut self, time: DateTime<Utc>) {
        self.base.set_time(time);
    }
}

pub struct ConnectionHub {
    dispatcher: Dispatcher,
    bus: Arc<EventBus>,
    config: HubConfig,
    connections: DashMap<ConnectionId, CancellationToken>,
    shutdown: CancellationToken,
}

impl ConnectionHub {
    pub fn new(router: Arc<Router>, bus: Arc<EventBus>, config: HubConfig) -> Self {
        info!(
            "Connection hub ready: {} methods, queue capacity {}, overflow policy {}",
            router.len(),
            config.queue_capacity,
            bus.policy()
        );
        Self {
            dispatcher: Dispatcher::new(router),
            bus,
            config,
            connections: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Close every live connection.
    pub fn shutdown(&self) {
        info!("Closing {} connections", self.connections.len());
        self.shutdown.cancel();
    }

    /// Close a single connection. Returns false if it is not live.
    pub fn disconnect(&self, connection: &str) -> bool {
        match self.connections.get(connection) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn greet(connection: &str, outbound: &Outbound) {
        let body = ConnectedBody {
            base: EventBody::default(),
            channel: connection.to_string(),
            text: "Connected to exec agent".into(),
        };
        match Event::now(EventTypes::CONNECTED, body) {
            Ok(event) => {
                if outbound.try_send_event(Arc::new(event)) != EventDelivery::Queued {
                    warn!(%connection, "Could not queue connected event");
                }
            }
            Err(e) => warn!(%connection, "Failed to build connected event: {e}"),
        }
    }
}

impl ConnectionHandler for ConnectionHub {
    async fn serve<R: FrameSource, W: FrameSink>(&self, mut source: R, sink: W) {
        let connection: ConnectionId = Uuid::new_v4().to_string();
        let cancel = self.shutdown.child_token();
        let (outbound, rx) = Outbound::channel(self.config.queue_capacity, cancel.clone());
        let correlator = Arc::new(Correlator::new());

        self.connections.insert(connection.clone(), cancel.clone());
        // Greeting goes in before the subscription so it is the first frame.
        Self::greet(&connection, &outbound);
        self.bus.subscribe(connection.clone(), outbound.clone());
        info!(%connection, "Client connected (total: {})", self.connections.len());

        let writer = tokio::spawn(write_loop(connection.clone(), rx, sink, cancel.clone()));

        let scope = ConnectionScope {
            id: connection.clone(),
            correlator: correlator.clone(),
            outbound: outbound.clone(),
            cancel: cancel.clone(),
        };

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = source.receive() => frame,
            };
            match frame {
                Some(Ok(text)) => self.dispatcher.dispatch(&text, &scope).await,
                // Not an envelope: swallowed like any other parse error.
                Some(Err(TransportError::InvalidUtf8)) => {
                    warn!(%connection, "Dropping frame: not valid UTF-8");
                }
                Some(Err(e)) => {
                    warn!(%connection, "Transport error: {e}");
                    break;
                }
                None => {
                    debug!(%connection, "Peer closed connection");
                    break;
                }
            }
        }

        self.bus.unsubscribe(&connection);
        let discarded = correlator.discard_all();
        cancel.cancel();
        self.connections.remove(&connection);
        drop(scope);
        drop(outbound);

        if let Err(e) = writer.await {
            warn!(%connection, "Writer task failed: {e}");
        }
        info!(
            %connection,
            discarded,
            "Client disconnected (total: {})",
            self.connections.len()
        );
    }

    fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// Drain one connection's outbound queue onto its sink.
async fn write_loop<W: FrameSink>(
    connection: ConnectionId,
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut sink: W,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(%connection, "Skipping unencodable frame: {e}");
                continue;
            }
        };
        if let Err(e) = sink.send(text).await {
            warn!(%connection, "Write failed: {e}");
            cancel.cancel();
            break;
        }
    }
    sink.close().await;
}

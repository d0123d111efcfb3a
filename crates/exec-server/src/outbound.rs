//! Per-connection outbound queue handle.
//!
//! Every frame a connection writes goes through one bounded mpsc queue
//! drained by that connection's single writer task. Responses wait for
//! room; events never do.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use exec_protocol::{Event, RpcResponse};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// A frame waiting to be written.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Response(RpcResponse),
    Event(Arc<Event>),
}

impl OutboundFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Response(response) => serde_json::to_string(response),
            Self::Event(event) => serde_json::to_string(event.as_ref()),
        }
    }
}

/// Outcome of a non-blocking event push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDelivery {
    Queued,
    Full,
    Closed,
}

/// Cloneable producer side of a connection's outbound queue.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<OutboundFrame>,
    dropped: Arc<AtomicU64>,
    close: CancellationToken,
}

impl Outbound {
    /// Create a queue of `capacity` frames. `close` is cancelled to ask the
    /// owning connection to shut down.
    pub fn channel(
        capacity: usize,
        close: CancellationToken,
    ) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
                close,
            },
            rx,
        )
    }

    /// Enqueue a response, waiting for room. Returns false once the writer
    /// is gone.
    pub async fn send_response(&self, response: RpcResponse) -> bool {
        self.tx.send(OutboundFrame::Response(response)).await.is_ok()
    }

    /// Enqueue an event without waiting.
    pub fn try_send_event(&self, event: Arc<Event>) -> EventDelivery {
        match self.tx.try_send(OutboundFrame::Event(event)) {
            Ok(()) => EventDelivery::Queued,
            Err(TrySendError::Full(_)) => EventDelivery::Full,
            Err(TrySendError::Closed(_)) => EventDelivery::Closed,
        }
    }

    /// Count one event dropped for this connection; returns the new total.
    pub fn record_drop(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Ask the owning connection to close.
    pub fn request_close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled() || self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exec_protocol::{EventBody, RequestId};
    use serde_json::json;

    fn event() -> Arc<Event> {
        Arc::new(Event::now("tick", EventBody::default()).unwrap())
    }

    #[tokio::test]
    async fn frames_keep_enqueue_order() {
        let (out, mut rx) = Outbound::channel(4, CancellationToken::new());
        assert_eq!(out.try_send_event(event()), EventDelivery::Queued);
        assert!(out.send_response(RpcResponse::success(RequestId::from(1), json!({}))).await);

        assert!(matches!(rx.recv().await, Some(OutboundFrame::Event(_))));
        assert!(matches!(rx.recv().await, Some(OutboundFrame::Response(_))));
    }

    #[test]
    fn full_queue_refuses_events() {
        let (out, _rx) = Outbound::channel(1, CancellationToken::new());
        assert_eq!(out.try_send_event(event()), EventDelivery::Queued);
        assert_eq!(out.try_send_event(event()), EventDelivery::Full);
        assert_eq!(out.record_drop(), 1);
        assert_eq!(out.dropped_events(), 1);
    }

    #[tokio::test]
    async fn closed_receiver_is_reported() {
        let (out, rx) = Outbound::channel(2, CancellationToken::new());
        drop(rx);
        assert_eq!(out.try_send_event(event()), EventDelivery::Closed);
        assert!(!out.send_response(RpcResponse::success(RequestId::from(1), json!({}))).await);
        assert!(out.is_closed());
    }

    #[test]
    fn event_frame_encodes_type_and_body() {
        let frame = OutboundFrame::Event(event());
        let wire: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(wire["type"], "tick");
        assert!(wire["body"]["time"].is_string());
        assert!(wire.get("id").is_none());
    }
}

//! Frame-level transport traits.

use std::future::Future;

/// Errors raised by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid listen address: {0}")]
    InvalidAddress(#[from] std::net::AddrParseError),
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("connection closed")]
    Closed,
}

/// Read half of a connection.
pub trait FrameSource: Send + 'static {
    /// Next inbound frame. `None` once the peer has closed the connection.
    fn receive(&mut self) -> impl Future<Output = Option<Result<String, TransportError>>> + Send;
}

/// Write half of a connection. Only one task ever owns it.
pub trait FrameSink: Send + 'static {
    fn send(&mut self, frame: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Implemented by the protocol layer; the transport calls it once per
/// accepted connection and the returned future lives as long as the
/// connection does.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn serve<R: FrameSource, W: FrameSink>(
        &self,
        source: R,
        sink: W,
    ) -> impl Future<Output = ()> + Send;

    /// Number of connections currently being served.
    fn connection_count(&self) -> usize;
}

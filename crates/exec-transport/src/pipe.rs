//! In-memory transport backed by tokio channels.
//!
//! `pipe()` returns the two halves the server side consumes plus a
//! [`PipePeer`] that plays the client.

use tokio::sync::mpsc;

use crate::frame::{FrameSink, FrameSource, TransportError};

pub struct PipeSource {
    rx: mpsc::Receiver<String>,
}

pub struct PipeSink {
    tx: Option<mpsc::Sender<String>>,
}

/// Client end of a pipe.
pub struct PipePeer {
    tx: Option<mpsc::Sender<String>>,
    rx: mpsc::Receiver<String>,
}

/// Create a connected in-memory transport.
pub fn pipe(capacity: usize) -> (PipeSource, PipeSink, PipePeer) {
    let (client_tx, server_rx) = mpsc::channel(capacity);
    let (server_tx, client_rx) = mpsc::channel(capacity);
    (
        PipeSource { rx: server_rx },
        PipeSink { tx: Some(server_tx) },
        PipePeer {
            tx: Some(client_tx),
            rx: client_rx,
        },
    )
}

impl FrameSource for PipeSource {
    async fn receive(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

impl FrameSink for PipeSink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

impl PipePeer {
    /// Send a raw frame to the server side.
    pub async fn send(&self, frame: impl Into<String>) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame.into()).await.map_err(|_| TransportError::Closed)
    }

    pub async fn send_json(&self, value: &serde_json::Value) -> Result<(), TransportError> {
        self.send(value.to_string()).await
    }

    /// Next frame written by the server; `None` once the server closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Next frame parsed as JSON.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        let frame = self.recv().await?;
        serde_json::from_str(&frame).ok()
    }

    /// Close the client's write direction; the server sees end of stream.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

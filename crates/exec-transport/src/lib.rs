//! Exec agent transport layer.
//!
//! Provides the WebSocket transport for the agent and an in-memory pipe
//! used by tests. A transport only moves frames: one JSON object per
//! message, in each direction. It handles:
//! - Accepting connections (WebSocket upgrade)
//! - Splitting each connection into a frame source and a frame sink
//! - Connection limits and the health endpoint
//!
//! The transport is decoupled from protocol handling via the
//! `ConnectionHandler` trait.

pub mod frame;
pub mod pipe;
pub mod server;

pub use frame::{ConnectionHandler, FrameSink, FrameSource, TransportError};
pub use pipe::{PipePeer, PipeSink, PipeSource, pipe};
pub use server::{TransportConfig, TransportServer};

//! Exec agent protocol types.
//!
//! JSON-RPC 2.0 compatible envelopes for the exec agent: requests,
//! responses, errors, and uncorrelated server events. This crate is the
//! single source of truth for method names, event types, and error codes.

pub mod error;
pub mod event;
pub mod event_types;
pub mod jsonrpc;
pub mod methods;

pub use error::{RpcError, RpcErrorCode};
pub use event::{Event, EventBody, EventError, Periodical};
pub use event_types::{EventType, EventTypes};
pub use jsonrpc::{
    DecodeError, HandlerResult, JSONRPC_VERSION, RequestId, RpcErrorResponse, RpcRequest,
    RpcResponse, RpcSuccessResponse,
};
pub use methods::{MethodName, Methods};

//! Exec agent handlers.
//!
//! Every JSON-RPC method is served by one [`Handler`]. Handlers declare the
//! method they answer, how they execute, how their params are decoded, and
//! what they do. The server's router maps method names to handlers; nothing
//! here knows about connections or wire frames.

pub mod process;

use std::future::Future;
use std::sync::Arc;

use exec_protocol::{Event, RequestId, RpcError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// How the dispatcher runs a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Runs inline on the connection's inbound task; the response is
    /// written before the next frame of that connection is read.
    Sync,
    /// Runs on its own task; the response is written whenever it finishes.
    Async,
    /// Runs on its own task and never answers. A request that carried an
    /// id still gets an empty result so the id is not left dangling.
    FireAndForget,
}

/// Per-call context handed to [`Handler::invoke`].
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Connection the call arrived on.
    pub connection_id: String,
    /// Correlation id of the call, `None` for notifications.
    pub request_id: Option<RequestId>,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new(
        connection_id: impl Into<String>,
        request_id: Option<RequestId>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            request_id,
            cancel,
        }
    }

    /// True once the owning connection has gone away.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the owning connection goes away. Long-running handlers
    /// race their work against this and return [`HandlerError::Cancelled`].
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Why a handler did not produce a result.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// A protocol error chosen by the handler, sent as-is.
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// Anything else; reported as an internal error with the cause in `data`.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
    /// The call observed cancellation. Nothing is sent.
    #[error("call cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn into_rpc_error(self) -> RpcError {
        match self {
            Self::Rpc(e) => e,
            Self::Internal(e) => RpcError::internal_with_cause(format!("{e:#}")),
            Self::Cancelled => RpcError::internal("Call cancelled"),
        }
    }
}

/// A single JSON-RPC method.
pub trait Handler: Send + Sync + 'static {
    type Params: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    /// Exact wire method name, e.g. `process.start`.
    fn method(&self) -> &str;

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Sync
    }

    /// Decode the raw `params` member. Absent params decode as JSON `null`,
    /// so `()` and `Option<T>` params accept calls without any.
    fn decode_params(&self, raw: Option<Value>) -> Result<Self::Params, RpcError> {
        parse_params(raw)
    }

    fn invoke(
        &self,
        params: Self::Params,
        cx: CallContext,
    ) -> impl Future<Output = Result<Self::Output, HandlerError>> + Send;
}

/// Decode raw params with serde, reporting failures as `InvalidParams`.
pub fn parse_params<T: DeserializeOwned>(raw: Option<Value>) -> Result<T, RpcError> {
    serde_json::from_value(raw.unwrap_or(Value::Null))
        .map_err(|e| RpcError::invalid_params(format!("Invalid parameters: {e}")))
}

/// Callback services use to publish events to subscribed connections.
pub type EventPublisher = Arc<dyn Fn(Event) + Send + Sync>;

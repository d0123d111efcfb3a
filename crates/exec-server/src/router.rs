//! Router: maps method names to handlers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use exec_protocol::RpcError;
use exec_protocol::methods::split_method;
use exec_services::{CallContext, ExecutionMode, Handler, HandlerError};
use serde_json::Value;
use tracing::info;

/// A handler invocation with params already decoded.
pub type CallFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("method {0} is already registered")]
    DuplicateMethod(String),
    #[error("method name {0:?} is not of the form resource.action")]
    InvalidMethodName(String),
}

/// Object-safe wrapper for the Handler trait.
trait HandlerDyn: Send + Sync {
    fn mode_dyn(&self) -> ExecutionMode;
    fn call_dyn(self: Arc<Self>, raw: Option<Value>, cx: CallContext) -> Result<CallFuture, RpcError>;
}

impl<H: Handler> HandlerDyn for H {
    fn mode_dyn(&self) -> ExecutionMode {
        self.mode()
    }

    fn call_dyn(self: Arc<Self>, raw: Option<Value>, cx: CallContext) -> Result<CallFuture, RpcError> {
        let params = self.decode_params(raw)?;
        Ok(Box::pin(async move {
            let output = self.invoke(params, cx).await?;
            serde_json::to_value(output).map_err(|e| HandlerError::Internal(e.into()))
        }))
    }
}

/// A resolved method.
#[derive(Clone)]
pub struct Route {
    handler: Arc<dyn HandlerDyn>,
}

impl Route {
    pub fn mode(&self) -> ExecutionMode {
        self.handler.mode_dyn()
    }

    /// Decode `params` with the handler's schema and prepare the call.
    /// Nothing runs until the returned future is polled.
    pub fn call(&self, params: Option<Value>, cx: CallContext) -> Result<CallFuture, RpcError> {
        self.handler.clone().call_dyn(params, cx)
    }
}

/// Method table. Filled at startup, then shared read-only behind an `Arc`.
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own method name.
    pub fn register<H: Handler>(&mut self, handler: H) -> Result<(), RouterError> {
        let method = handler.method().to_string();
        if split_method(&method).is_none() {
            return Err(RouterError::InvalidMethodName(method));
        }
        if self.routes.contains_key(&method) {
            return Err(RouterError::DuplicateMethod(method));
        }
        info!("Registering method: {method} ({:?})", handler.mode());
        self.routes.insert(
            method,
            Route {
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    pub fn route(&self, method: &str) -> Option<Route> {
        self.routes.get(method).cloned()
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

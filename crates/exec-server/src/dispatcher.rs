//! Dispatcher: turns one inbound frame into at most one response.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use exec_protocol::{DecodeError, RequestId, RpcError, RpcRequest, RpcResponse};
use exec_services::{CallContext, ExecutionMode, HandlerError};
use futures_util::FutureExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ConnectionId;
use crate::correlator::{Correlator, CorrelatorError};
use crate::outbound::Outbound;
use crate::router::{CallFuture, Router};

/// Per-connection state a dispatch needs.
#[derive(Clone)]
pub struct ConnectionScope {
    pub id: ConnectionId,
    pub correlator: Arc<Correlator>,
    pub outbound: Outbound,
    pub cancel: CancellationToken,
}

pub struct Dispatcher {
    router: Arc<Router>,
}

impl Dispatcher {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Handle one inbound frame.
    ///
    /// Sync handlers finish before this returns; async and fire-and-forget
    /// handlers are spawned and answer through the scope's outbound queue.
    pub async fn dispatch(&self, frame: &str, scope: &ConnectionScope) {
        let request = match RpcRequest::decode(frame) {
            Ok(request) => request,
            Err(DecodeError { id: Some(id), error }) => {
                debug!(connection = %scope.id, %id, "Rejecting request: {error}");
                if !scope.outbound.send_response(RpcResponse::error(id, error)).await {
                    debug!(connection = %scope.id, "Connection gone before rejection was sent");
                }
                return;
            }
            Err(DecodeError { id: None, error }) => {
                warn!(connection = %scope.id, "Dropping frame: {error}");
                return;
            }
        };

        let RpcRequest { id, method, params, .. } = request;
        debug!(connection = %scope.id, id = ?id, "Dispatching {method}");

        if let Some(id) = &id {
            match scope.correlator.begin(id) {
                Ok(()) => {}
                Err(CorrelatorError::DuplicateId(id)) => {
                    warn!(connection = %scope.id, %id, "Duplicate request id for {method}");
                    let response = RpcResponse::error(id.clone(), RpcError::duplicate_id(&id));
                    if !scope.outbound.send_response(response).await {
                        debug!(connection = %scope.id, "Connection gone before rejection was sent");
                    }
                    return;
                }
                Err(CorrelatorError::Closed) => return,
            }
        }

        let Some(route) = self.router.route(&method) else {
            let error = RpcError::method_not_found(&method);
            finish(scope, &method, id, Err(error.into())).await;
            return;
        };

        let cx = CallContext::new(scope.id.clone(), id.clone(), scope.cancel.clone());
        let call = match route.call(params, cx) {
            Ok(call) => call,
            Err(error) => {
                finish(scope, &method, id, Err(error.into())).await;
                return;
            }
        };

        match route.mode() {
            ExecutionMode::Sync => {
                let result = run_guarded(call).await;
                finish(scope, &method, id, result).await;
            }
            ExecutionMode::Async => {
                let scope = scope.clone();
                tokio::spawn(async move {
                    let result = run_guarded(call).await;
                    finish(&scope, &method, id, result).await;
                });
            }
            ExecutionMode::FireAndForget => {
                if id.is_some() {
                    finish(scope, &method, id, Ok(json!({}))).await;
                }
                let connection = scope.id.clone();
                tokio::spawn(async move {
                    if let Err(e) = run_guarded(call).await {
                        warn!(%connection, "{method} failed: {}", e.into_rpc_error().message);
                    }
                });
            }
        }
    }
}

/// Run a call, turning a panic into an internal error.
async fn run_guarded(call: CallFuture) -> Result<Value, HandlerError> {
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::Rpc(RpcError::internal_with_cause(format!(
            "handler panicked: {}",
            panic_message(panic.as_ref())
        )))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

/// Deliver the terminal outcome of a call.
async fn finish(
    scope: &ConnectionScope,
    method: &str,
    id: Option<RequestId>,
    result: Result<Value, HandlerError>,
) {
    let Some(id) = id else {
        match result {
            Ok(_) => {}
            Err(HandlerError::Cancelled) => debug!(connection = %scope.id, "{method} cancelled"),
            Err(e) => warn!(
                connection = %scope.id,
                "Notification {method} failed: {}",
                e.into_rpc_error().message
            ),
        }
        return;
    };

    let result = match result {
        Ok(value) => Ok(value),
        Err(HandlerError::Cancelled) => {
            scope.correlator.complete(&id);
            debug!(connection = %scope.id, %id, "{method} cancelled, no response");
            return;
        }
        Err(e) => Err(e.into_rpc_error()),
    };

    if !scope.correlator.complete(&id) {
        return;
    }
    if !scope.outbound.send_response(RpcResponse::from_result(id, result)).await {
        debug!(connection = %scope.id, "Connection gone before {method} response was sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::OutboundFrame;
    use exec_protocol::RpcErrorCode;
    use exec_services::Handler;
    use serde::Deserialize;
    use std::time::Duration;
    use tokio::sync::{Notify, mpsc};
    use tokio::time::timeout;

    struct Echo;

    impl Handler for Echo {
        type Params = Value;
        type Output = Value;

        fn method(&self) -> &str {
            "test.echo"
        }

        async fn invoke(&self, p: Value, _cx: CallContext) -> Result<Value, HandlerError> {
            Ok(p)
        }
    }

    struct Boom;

    impl Handler for Boom {
        type Params = ();
        type Output = ();

        fn method(&self) -> &str {
            "test.boom"
        }

        async fn invoke(&self, _p: (), _cx: CallContext) -> Result<(), HandlerError> {
            panic!("kaboom")
        }
    }

    /// Waits until released, then answers.
    struct Gate {
        open: Arc<Notify>,
    }

    #[derive(Deserialize)]
    struct GateParams {
        tag: String,
    }

    impl Handler for Gate {
        type Params = GateParams;
        type Output = String;

        fn method(&self) -> &str {
            "test.gate"
        }

        fn mode(&self) -> ExecutionMode {
            ExecutionMode::Async
        }

        async fn invoke(&self, p: GateParams, cx: CallContext) -> Result<String, HandlerError> {
            tokio::select! {
                _ = self.open.notified() => Ok(p.tag),
                _ = cx.cancelled() => Err(HandlerError::Cancelled),
            }
        }
    }

    struct Fire {
        fired: Arc<Notify>,
    }

    impl Handler for Fire {
        type Params = ();
        type Output = ();

        fn method(&self) -> &str {
            "test.fire"
        }

        fn mode(&self) -> ExecutionMode {
            ExecutionMode::FireAndForget
        }

        async fn invoke(&self, _p: (), _cx: CallContext) -> Result<(), HandlerError> {
            self.fired.notify_one();
            Ok(())
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        scope: ConnectionScope,
        rx: mpsc::Receiver<OutboundFrame>,
        open: Arc<Notify>,
        fired: Arc<Notify>,
    }

    fn fixture() -> Fixture {
        let open = Arc::new(Notify::new());
        let fired = Arc::new(Notify::new());
        let mut router = Router::new();
        router.register(Echo).unwrap();
        router.register(Boom).unwrap();
        router.register(Gate { open: open.clone() }).unwrap();
        router.register(Fire { fired: fired.clone() }).unwrap();

        let cancel = CancellationToken::new();
        let (outbound, rx) = Outbound::channel(16, cancel.clone());
        Fixture {
            dispatcher: Dispatcher::new(Arc::new(router)),
            scope: ConnectionScope {
                id: "conn-1".into(),
                correlator: Arc::new(Correlator::new()),
                outbound,
                cancel,
            },
            rx,
            open,
            fired,
        }
    }

    async fn next_response(rx: &mut mpsc::Receiver<OutboundFrame>) -> RpcResponse {
        match timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(OutboundFrame::Response(r))) => r,
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sync_call_answers_with_same_id() {
        let mut f = fixture();
        f.dispatcher
            .dispatch(r#"{"jsonrpc":"2.0","id":"x-1","method":"test.echo","params":{"v":1}}"#, &f.scope)
            .await;
        let resp = next_response(&mut f.rx).await;
        assert_eq!(resp.id(), &RequestId::from("x-1"));
        assert_eq!(resp.into_result().unwrap(), json!({"v": 1}));
        assert_eq!(f.scope.correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn notification_never_answers() {
        let mut f = fixture();
        f.dispatcher.dispatch(r#"{"jsonrpc":"2.0","method":"test.echo"}"#, &f.scope).await;
        f.dispatcher.dispatch(r#"{"jsonrpc":"2.0","method":"no.such"}"#, &f.scope).await;
        f.dispatcher.dispatch(r#"{"jsonrpc":"2.0","method":"test.boom"}"#, &f.scope).await;
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn parse_error_is_dropped() {
        let mut f = fixture();
        f.dispatcher.dispatch("{nope", &f.scope).await;
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_method_reports_method_not_found() {
        let mut f = fixture();
        f.dispatcher.dispatch(r#"{"jsonrpc":"2.0","id":5,"method":"no.such.method"}"#, &f.scope).await;
        let err = next_response(&mut f.rx).await.into_result().unwrap_err();
        assert_eq!(err.error_code(), RpcErrorCode::MethodNotFound);
    }

    #[tokio::test]
    async fn bad_params_report_invalid_params() {
        let mut f = fixture();
        f.dispatcher
            .dispatch(r#"{"jsonrpc":"2.0","id":6,"method":"test.gate","params":{"tag":3}}"#, &f.scope)
            .await;
        let err = next_response(&mut f.rx).await.into_result().unwrap_err();
        assert_eq!(err.error_code(), RpcErrorCode::InvalidParams);
        assert_eq!(f.scope.correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn invalid_request_with_id_is_answered() {
        let mut f = fixture();
        f.dispatcher.dispatch(r#"{"jsonrpc":"1.0","id":3,"method":"test.echo"}"#, &f.scope).await;
        let resp = next_response(&mut f.rx).await;
        assert_eq!(resp.id(), &RequestId::from(3));
        assert_eq!(resp.into_result().unwrap_err().error_code(), RpcErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn panic_becomes_internal_error() {
        let mut f = fixture();
        f.dispatcher.dispatch(r#"{"jsonrpc":"2.0","id":9,"method":"test.boom"}"#, &f.scope).await;
        let err = next_response(&mut f.rx).await.into_result().unwrap_err();
        assert_eq!(err.error_code(), RpcErrorCode::InternalError);
        let cause = err.data.unwrap()["cause"].as_str().unwrap().to_string();
        assert!(cause.contains("kaboom"));
    }

    #[tokio::test]
    async fn duplicate_outstanding_id_is_rejected() {
        let mut f = fixture();
        let frame = r#"{"jsonrpc":"2.0","id":1,"method":"test.gate","params":{"tag":"first"}}"#;
        f.dispatcher.dispatch(frame, &f.scope).await;
        f.dispatcher
            .dispatch(r#"{"jsonrpc":"2.0","id":1,"method":"test.gate","params":{"tag":"second"}}"#, &f.scope)
            .await;

        let dup = next_response(&mut f.rx).await;
        assert_eq!(dup.into_result().unwrap_err().error_code(), RpcErrorCode::DuplicateId);

        f.open.notify_one();
        let first = next_response(&mut f.rx).await;
        assert_eq!(first.id(), &RequestId::from(1));
        assert_eq!(first.into_result().unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn duplicate_rejection_to_gone_connection_is_dropped() {
        let Fixture { dispatcher, scope, rx, open, .. } = fixture();
        dispatcher
            .dispatch(r#"{"jsonrpc":"2.0","id":2,"method":"test.gate","params":{"tag":"a"}}"#, &scope)
            .await;
        drop(rx);

        timeout(
            Duration::from_secs(2),
            dispatcher.dispatch(r#"{"jsonrpc":"2.0","id":2,"method":"test.echo"}"#, &scope),
        )
        .await
        .unwrap();
        // The original call still owns the id.
        assert_eq!(scope.correlator.outstanding(), 1);
        open.notify_one();
    }

    #[tokio::test]
    async fn fire_and_forget_answers_empty_result() {
        let mut f = fixture();
        f.dispatcher.dispatch(r#"{"jsonrpc":"2.0","id":4,"method":"test.fire"}"#, &f.scope).await;
        let resp = next_response(&mut f.rx).await;
        assert_eq!(resp.into_result().unwrap(), json!({}));
        timeout(Duration::from_secs(2), f.fired.notified()).await.unwrap();
    }

    #[tokio::test]
    async fn closed_connection_suppresses_async_response() {
        let mut f = fixture();
        f.dispatcher
            .dispatch(r#"{"jsonrpc":"2.0","id":7,"method":"test.gate","params":{"tag":"late"}}"#, &f.scope)
            .await;
        assert_eq!(f.scope.correlator.outstanding(), 1);

        assert_eq!(f.scope.correlator.discard_all(), 1);
        f.scope.cancel.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.rx.try_recv().is_err());
    }
}

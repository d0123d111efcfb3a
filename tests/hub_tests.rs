//! Connection hub tests over the in-memory pipe transport.

use std::sync::Arc;
use std::time::Duration;

use exec_protocol::{Event, EventBody};
use exec_server::{ConnectionHub, EventBus, HubConfig, OverflowPolicy, Router};
use exec_services::process::{
    GetLogs, GetProcess, GetProcesses, KillProcess, ProcessRegistry, StartProcess, WaitProcess,
};
use exec_transport::{ConnectionHandler, PipePeer, pipe};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct Agent {
    hub: Arc<ConnectionHub>,
    registry: Arc<ProcessRegistry>,
}

fn agent(policy: OverflowPolicy, queue_capacity: usize) -> Agent {
    let bus = Arc::new(EventBus::new(policy));
    let registry = Arc::new(ProcessRegistry::new(bus.publisher()));

    let mut router = Router::new();
    router.register(StartProcess::new(registry.clone())).unwrap();
    router.register(KillProcess::new(registry.clone())).unwrap();
    router.register(GetProcess::new(registry.clone())).unwrap();
    router.register(GetProcesses::new(registry.clone())).unwrap();
    router.register(GetLogs::new(registry.clone())).unwrap();
    router.register(WaitProcess::new(registry.clone())).unwrap();

    let hub = Arc::new(ConnectionHub::new(
        Arc::new(router),
        bus,
        HubConfig { queue_capacity },
    ));
    Agent { hub, registry }
}

/// Open a pipe connection and consume the greeting.
async fn connect(hub: &Arc<ConnectionHub>, pipe_capacity: usize) -> (PipePeer, JoinHandle<()>) {
    let (source, sink, mut peer) = pipe(pipe_capacity);
    let hub = hub.clone();
    let serving = tokio::spawn(async move { hub.serve(source, sink).await });
    let greeting = recv(&mut peer).await;
    assert_eq!(greeting["type"], "connected");
    (peer, serving)
}

async fn recv(peer: &mut PipePeer) -> Value {
    timeout(Duration::from_secs(10), peer.recv_json())
        .await
        .expect("Timeout waiting for frame")
        .expect("Connection closed")
}

async fn request(peer: &PipePeer, id: Value, method: &str, params: Value) {
    peer.send_json(&json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
        .await
        .unwrap();
}

/// Next frame that is a response, skipping events.
async fn next_response(peer: &mut PipePeer) -> Value {
    loop {
        let frame = recv(peer).await;
        if frame.get("type").is_none() {
            return frame;
        }
    }
}

fn tick() -> Event {
    Event::now("tick", EventBody::default()).unwrap()
}

#[tokio::test]
async fn sync_responses_keep_request_order() {
    let a = agent(OverflowPolicy::DropEvent, 64);
    let (mut peer, _serving) = connect(&a.hub, 16).await;

    for id in 1..=3 {
        request(&peer, json!(id), "process.getProcesses", json!({})).await;
    }
    for id in 1..=3 {
        assert_eq!(next_response(&mut peer).await["id"], id);
    }
}

#[tokio::test]
async fn notifications_never_answer() {
    let a = agent(OverflowPolicy::DropEvent, 64);
    let (mut peer, _serving) = connect(&a.hub, 16).await;

    // Success, handler error, unknown method, bad params: all silent.
    peer.send_json(&json!({"jsonrpc": "2.0", "method": "process.getProcesses"})).await.unwrap();
    peer.send_json(&json!({"jsonrpc": "2.0", "method": "process.getProcess", "params": {"pid": 999}}))
        .await
        .unwrap();
    peer.send_json(&json!({"jsonrpc": "2.0", "id": null, "method": "no.such"})).await.unwrap();
    peer.send_json(&json!({"jsonrpc": "2.0", "method": "process.kill", "params": {}})).await.unwrap();

    request(&peer, json!("after"), "process.getProcesses", json!({})).await;
    assert_eq!(next_response(&mut peer).await["id"], "after");
}

#[tokio::test]
async fn duplicate_outstanding_id_is_rejected() {
    let a = agent(OverflowPolicy::DropEvent, 64);
    let (mut peer, _serving) = connect(&a.hub, 16).await;

    let pid = a.registry.start("sleeper", "sleep 30", "").unwrap().pid;

    request(&peer, json!(1), "process.wait", json!({"pid": pid})).await;
    request(&peer, json!(1), "process.wait", json!({"pid": pid})).await;

    let dup = next_response(&mut peer).await;
    assert_eq!(dup["id"], 1);
    assert_eq!(dup["error"]["code"], -32003);

    a.registry.kill(pid).unwrap();
    let first = next_response(&mut peer).await;
    assert_eq!(first["id"], 1);
    assert_eq!(first["result"]["pid"], pid);
}

#[tokio::test]
async fn closing_with_outstanding_call_produces_no_response() {
    let a = agent(OverflowPolicy::DropEvent, 64);
    let (mut peer, serving) = connect(&a.hub, 16).await;
    assert_eq!(a.hub.connection_count(), 1);

    let pid = a.registry.start("sleeper", "sleep 30", "").unwrap().pid;
    request(&peer, json!(7), "process.wait", json!({"pid": pid})).await;
    peer.close();

    timeout(Duration::from_secs(5), serving).await.unwrap().unwrap();
    assert_eq!(a.hub.connection_count(), 0);

    while let Some(frame) = timeout(Duration::from_secs(5), peer.recv_json()).await.unwrap() {
        assert!(frame.get("id").is_none(), "unexpected response after close: {frame}");
    }
    a.registry.shutdown();
}

#[tokio::test]
async fn events_reach_current_subscribers_only() {
    let a = agent(OverflowPolicy::DropEvent, 64);
    let (mut first, _s1) = connect(&a.hub, 16).await;
    let (mut second, _s2) = connect(&a.hub, 16).await;

    assert_eq!(a.hub.event_bus().publish(tick()), 2);
    assert_eq!(recv(&mut first).await["type"], "tick");
    assert_eq!(recv(&mut second).await["type"], "tick");

    // No replay for a late subscriber.
    let (mut late, _s3) = connect(&a.hub, 16).await;
    assert!(timeout(Duration::from_millis(100), late.recv()).await.is_err());
}

#[tokio::test]
async fn process_events_fan_out_to_all_connections() {
    let a = agent(OverflowPolicy::DropEvent, 64);
    let (mut first, _s1) = connect(&a.hub, 16).await;
    let (mut second, _s2) = connect(&a.hub, 16).await;

    request(&first, json!(1), "process.start", json!({"name": "n", "commandLine": "true"})).await;

    for peer in [&mut first, &mut second] {
        loop {
            let frame = recv(peer).await;
            if frame["type"] == "process_started" {
                assert_eq!(frame["body"]["commandLine"], "true");
                break;
            }
        }
    }
}

#[tokio::test]
async fn drop_policy_keeps_slow_connection_open() {
    let a = agent(OverflowPolicy::DropEvent, 1);
    let (mut peer, _serving) = connect(&a.hub, 1).await;

    // Peer is not reading: pipe, writer, and queue fill up.
    let delivered: usize = (0..20).map(|_| a.hub.event_bus().publish(tick())).sum();
    assert!(delivered < 20);
    assert_eq!(a.hub.connection_count(), 1);

    // Responses are never dropped.
    request(&peer, json!("r"), "process.getProcesses", json!({})).await;
    assert_eq!(next_response(&mut peer).await["id"], "r");
}

#[tokio::test]
async fn disconnect_policy_closes_slow_connection() {
    let a = agent(OverflowPolicy::Disconnect, 1);
    let (mut peer, serving) = connect(&a.hub, 1).await;

    for _ in 0..20 {
        a.hub.event_bus().publish(tick());
    }

    timeout(Duration::from_secs(5), serving).await.unwrap().unwrap();
    assert_eq!(a.hub.connection_count(), 0);
    assert_eq!(a.hub.event_bus().subscriber_count(), 0);
    while timeout(Duration::from_secs(5), peer.recv()).await.unwrap().is_some() {}
}

#[tokio::test]
async fn shutdown_closes_every_connection() {
    let a = agent(OverflowPolicy::DropEvent, 64);
    let (mut first, s1) = connect(&a.hub, 16).await;
    let (_second, s2) = connect(&a.hub, 16).await;

    a.hub.shutdown();
    timeout(Duration::from_secs(5), s1).await.unwrap().unwrap();
    timeout(Duration::from_secs(5), s2).await.unwrap().unwrap();
    assert_eq!(a.hub.connection_count(), 0);
    assert!(timeout(Duration::from_secs(5), first.recv()).await.unwrap().is_none());
}

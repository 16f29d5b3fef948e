//! WebSocket integration tests

mod common;

use concierge::config::Catalog;
use concierge::store::Store;
use concierge::AppState;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn setup_server() -> (SocketAddr, sqlx::SqlitePool) {
    let pool = common::memory_pool().await;

    let catalog = Catalog::bundled().expect("bundled catalog is valid");
    let store = Store::new(pool.clone());
    let executor = Arc::new(catalog.static_executor());
    let orchestrator = Arc::new(
        catalog
            .into_orchestrator(executor)
            .with_escalation_handler(Arc::new(store.clone())),
    );
    store.record_events(orchestrator.clone());

    let state = AppState::new(pool.clone(), orchestrator);
    let app = concierge::app(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, pool)
}

async fn connect(addr: SocketAddr) -> Client {
    let url = format!("ws://{}/ws", addr);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws_stream
}

async fn send(ws: &mut Client, msg: Value) {
    ws.send(Message::Text(msg.to_string().into())).await.unwrap();
}

async fn recv(ws: &mut Client) -> Value {
    match timeout(Duration::from_secs(5), ws.next()).await {
        Ok(Some(Ok(Message::Text(response)))) => serde_json::from_str(&response).unwrap(),
        other => panic!("Expected text message, got {:?}", other),
    }
}

/// Read messages until one matches, skipping the rest
async fn recv_until(ws: &mut Client, wanted: impl Fn(&Value) -> bool) -> Value {
    loop {
        let json = recv(ws).await;
        if wanted(&json) {
            return json;
        }
    }
}

fn is_event(name: &'static str) -> impl Fn(&Value) -> bool {
    move |json| json["type"] == "event" && json["event"]["event"] == name
}

#[tokio::test]
async fn test_websocket_invalid_message() {
    let (addr, _pool) = setup_server().await;
    let mut ws = connect(addr).await;

    send(&mut ws, json!({"type": "teleport"})).await;

    let json = recv(&mut ws).await;
    assert_eq!(json["type"], "error");
    assert!(json["message"].as_str().unwrap().starts_with("Invalid message"));
}

#[tokio::test]
async fn test_websocket_submit_task_resolves() {
    let (addr, _pool) = setup_server().await;
    let mut ws = connect(addr).await;

    send(&mut ws, json!({"type": "subscribe"})).await;
    assert_eq!(recv(&mut ws).await["type"], "subscribed");

    send(
        &mut ws,
        json!({"type": "submit_task", "text": "cancel order ORD-1", "actor": "alice"}),
    )
    .await;

    let accepted = recv_until(&mut ws, |json| json["type"] == "task_accepted").await;
    let task_id = accepted["task_id"].as_str().unwrap().to_string();

    let resolved = recv_until(&mut ws, is_event("task_resolved")).await;
    assert_eq!(resolved["event"]["task_id"], task_id);
    assert_eq!(
        resolved["event"]["outcome"]["text"],
        "Order ORD-1 has been cancelled (confirmation MOD-789)."
    );

    send(&mut ws, json!({"type": "get_task", "task_id": task_id})).await;
    let json = recv_until(&mut ws, |json| json["type"] == "task").await;
    assert_eq!(json["task"]["status"], "resolved");
    assert_eq!(json["task"]["actor"], "alice");
    assert_eq!(json["task"]["owner"], "order-specialist");
}

#[tokio::test]
async fn test_websocket_refund_approval_flow() {
    let (addr, _pool) = setup_server().await;
    let mut ws = connect(addr).await;

    send(&mut ws, json!({"type": "subscribe"})).await;
    recv(&mut ws).await;

    send(
        &mut ws,
        json!({
            "type": "submit_task",
            "text": "The product I received is damaged, I want a refund of $150 for ORD-123456"
        }),
    )
    .await;

    let requested = recv_until(&mut ws, is_event("approval_requested")).await;
    let approval_id = requested["event"]["approval_id"].as_str().unwrap().to_string();
    assert_eq!(requested["event"]["capability"], "process_refund");

    send(&mut ws, json!({"type": "list_approvals"})).await;
    let json = recv_until(&mut ws, |json| json["type"] == "approvals").await;
    assert_eq!(json["approvals"].as_array().unwrap().len(), 1);
    assert_eq!(json["approvals"][0]["id"], approval_id);

    send(
        &mut ws,
        json!({"type": "decide", "approval_id": approval_id, "decision": "approve"}),
    )
    .await;
    let json = recv_until(&mut ws, |json| json["type"] == "task").await;
    assert_eq!(json["task"]["status"], "resolved");
    assert_eq!(json["task"]["outcome"]["text"], "Refund REF-456 of $150 is approved.");

    // A second decision is refused
    send(
        &mut ws,
        json!({"type": "decide", "approval_id": approval_id, "decision": "reject"}),
    )
    .await;
    let json = recv_until(&mut ws, |json| json["type"] == "error").await;
    assert!(json["message"].as_str().unwrap().contains("already decided"));
}

#[tokio::test]
async fn test_websocket_subscription_filters_by_task() {
    let (addr, _pool) = setup_server().await;
    let mut submitter = connect(addr).await;
    let mut watcher = connect(addr).await;

    send(&mut submitter, json!({"type": "subscribe"})).await;
    recv(&mut submitter).await;
    send(
        &mut submitter,
        json!({"type": "submit_task", "text": "Please cancel my order"}),
    )
    .await;
    let accepted = recv_until(&mut submitter, |json| json["type"] == "task_accepted").await;
    let task_id = accepted["task_id"].as_str().unwrap().to_string();
    let requested = recv_until(&mut submitter, is_event("input_requested")).await;
    assert_eq!(requested["event"]["reason"], "missing order_id");

    send(&mut watcher, json!({"type": "subscribe", "task_id": task_id})).await;
    assert_eq!(recv(&mut watcher).await["task_id"], task_id);

    // Unrelated task on the same server
    send(
        &mut submitter,
        json!({"type": "submit_task", "text": "What is your return policy?"}),
    )
    .await;
    recv_until(&mut submitter, |json| json["type"] == "task_accepted").await;

    send(
        &mut submitter,
        json!({"type": "provide_input", "task_id": task_id, "fields": {"order_id": "ORD-8"}}),
    )
    .await;

    loop {
        let json = recv(&mut watcher).await;
        assert_eq!(json["event"]["task_id"], task_id);
        if json["event"]["event"] == "task_resolved" {
            break;
        }
    }
}

#[tokio::test]
async fn test_websocket_escalation_queue() {
    let (addr, _pool) = setup_server().await;
    let mut ws = connect(addr).await;

    send(&mut ws, json!({"type": "subscribe"})).await;
    recv(&mut ws).await;

    send(
        &mut ws,
        json!({"type": "submit_task", "text": "tell me a joke", "actor": "bob"}),
    )
    .await;
    let escalated = recv_until(&mut ws, is_event("task_escalated")).await;
    let task_id = escalated["event"]["task_id"].as_str().unwrap().to_string();
    assert_eq!(escalated["event"]["reason"], "no matching specialist");

    send(&mut ws, json!({"type": "list_escalations"})).await;
    let json = recv_until(&mut ws, |json| json["type"] == "escalations").await;
    let escalations = json["escalations"].as_array().unwrap();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0]["task_id"], task_id);
    assert_eq!(escalations[0]["actor"], "bob");
    assert_eq!(escalations[0]["invocations"], json!([]));

    send(&mut ws, json!({"type": "acknowledge_escalation", "task_id": task_id})).await;
    let json = recv_until(&mut ws, |json| json["type"] == "escalation_acknowledged").await;
    assert_eq!(json["task_id"], task_id);

    send(&mut ws, json!({"type": "list_escalations"})).await;
    let json = recv_until(&mut ws, |json| json["type"] == "escalations").await;
    assert!(json["escalations"].as_array().unwrap().is_empty());

    send(
        &mut ws,
        json!({"type": "list_escalations", "include_acknowledged": true}),
    )
    .await;
    let json = recv_until(&mut ws, |json| json["type"] == "escalations").await;
    assert_eq!(json["escalations"][0]["acknowledged"], true);
}

#[tokio::test]
async fn test_websocket_cancel_unknown_task() {
    let (addr, _pool) = setup_server().await;
    let mut ws = connect(addr).await;

    send(
        &mut ws,
        json!({"type": "cancel_task", "task_id": uuid::Uuid::new_v4()}),
    )
    .await;

    let json = recv(&mut ws).await;
    assert_eq!(json["type"], "error");
    assert!(json["message"].as_str().unwrap().contains("not found"));
}

//! WebSocket server handler
//!
//! Clients submit tasks, decide approvals, cancel tasks, answer clarification
//! requests and browse the escalation queue. Orchestrator events are forwarded
//! once the client subscribes.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use uuid::Uuid;

use crate::dispatch::{ApprovalRequest, Decision, OrchestratorEvent};
use crate::error::AppError;
use crate::models::{Escalation, SubmitTaskRequest, Task};
use crate::AppState;

type Sender = SplitSink<WebSocket, Message>;

/// WebSocket handler
pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Event forwarding for one connection
struct Subscription {
    events: BroadcastStream<OrchestratorEvent>,
    /// Only forward events for this task when set
    task_id: Option<Uuid>,
}

async fn next_event(
    subscription: &mut Option<Subscription>,
) -> Option<Result<OrchestratorEvent, BroadcastStreamRecvError>> {
    match subscription {
        Some(sub) => sub.events.next().await,
        None => std::future::pending().await,
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscription: Option<Subscription> = None;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                };

                let client_msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        let error = ServerMessage::Error {
                            message: format!("Invalid message: {}", e),
                        };
                        if send_json(&mut sender, &error).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                if let ClientMessage::Subscribe { task_id } = client_msg {
                    subscription = Some(Subscription {
                        events: BroadcastStream::new(state.orchestrator.subscribe()),
                        task_id,
                    });
                    if send_json(&mut sender, &ServerMessage::Subscribed { task_id }).await.is_err() {
                        break;
                    }
                    continue;
                }

                let reply = match handle_message(&state, client_msg).await {
                    Ok(reply) => reply,
                    Err(e) => ServerMessage::Error {
                        message: e.to_string(),
                    },
                };
                if send_json(&mut sender, &reply).await.is_err() {
                    break;
                }
            }
            event = next_event(&mut subscription) => {
                let event = match event {
                    Some(Ok(event)) => event,
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        tracing::warn!(skipped, "WebSocket subscriber lagged behind events");
                        continue;
                    }
                    None => {
                        subscription = None;
                        continue;
                    }
                };

                let wanted = subscription
                    .as_ref()
                    .and_then(|s| s.task_id)
                    .map_or(true, |id| id == event.task_id());
                if wanted && send_json(&mut sender, &ServerMessage::Event { event }).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn handle_message(state: &Arc<AppState>, msg: ClientMessage) -> crate::error::Result<ServerMessage> {
    let orchestrator = &state.orchestrator;

    let reply = match msg {
        ClientMessage::SubmitTask { text, fields, actor } => {
            let (payload, actor) = SubmitTaskRequest { text, fields, actor }.into_parts();
            let task_id = orchestrator.accept_task(payload, actor).await;
            ServerMessage::TaskAccepted { task_id }
        }
        ClientMessage::GetTask { task_id } => {
            let task = match orchestrator.get_task(task_id).await {
                Ok(task) => task,
                // Tasks from earlier runs only live in the store
                Err(_) => state.store.get_task(task_id).await?,
            };
            ServerMessage::Task { task }
        }
        ClientMessage::ListTasks => ServerMessage::Tasks {
            tasks: orchestrator.list_tasks().await,
        },
        ClientMessage::Decide {
            approval_id,
            decision,
            note,
        } => {
            let task = orchestrator.decide(approval_id, decision, note).await?;
            ServerMessage::Task { task }
        }
        ClientMessage::CancelTask { task_id } => {
            let task = orchestrator.cancel_task(task_id).await?;
            ServerMessage::Task { task }
        }
        ClientMessage::ProvideInput { task_id, fields } => {
            if fields.is_empty() {
                return Err(AppError::BadRequest("No fields provided".to_string()));
            }
            let task = orchestrator.provide_input(task_id, fields).await?;
            ServerMessage::Task { task }
        }
        ClientMessage::ListApprovals => ServerMessage::Approvals {
            approvals: orchestrator.pending_approvals().await,
        },
        ClientMessage::ListEscalations { include_acknowledged } => ServerMessage::Escalations {
            escalations: state.store.list_escalations(include_acknowledged).await?,
        },
        ClientMessage::AcknowledgeEscalation { task_id } => {
            state.store.acknowledge_escalation(task_id).await?;
            ServerMessage::EscalationAcknowledged { task_id }
        }
        ClientMessage::Subscribe { task_id } => ServerMessage::Subscribed { task_id },
    };
    Ok(reply)
}

async fn send_json(sender: &mut Sender, msg: &ServerMessage) -> Result<(), ()> {
    let text = match serde_json::to_string(msg) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Failed to serialize message: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await.map_err(|e| {
        tracing::error!("Failed to send message: {}", e);
    })
}

/// Messages from client to server
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Submit a task; it is driven in the background
    SubmitTask {
        text: String,
        #[serde(default)]
        fields: Map<String, Value>,
        actor: Option<String>,
    },
    GetTask {
        task_id: Uuid,
    },
    ListTasks,
    /// Approve or reject a pending invocation
    Decide {
        approval_id: Uuid,
        decision: Decision,
        note: Option<String>,
    },
    CancelTask {
        task_id: Uuid,
    },
    /// Supply fields a task is waiting for
    ProvideInput {
        task_id: Uuid,
        fields: Map<String, Value>,
    },
    ListApprovals,
    ListEscalations {
        #[serde(default)]
        include_acknowledged: bool,
    },
    AcknowledgeEscalation {
        task_id: Uuid,
    },
    /// Start receiving orchestrator events, optionally for one task only
    Subscribe {
        task_id: Option<Uuid>,
    },
}

/// Messages from server to client
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TaskAccepted { task_id: Uuid },
    Task { task: Task },
    Tasks { tasks: Vec<Task> },
    Approvals { approvals: Vec<ApprovalRequest> },
    Escalations { escalations: Vec<Escalation> },
    EscalationAcknowledged { task_id: Uuid },
    Subscribed { task_id: Option<Uuid> },
    Event { event: OrchestratorEvent },
    /// Error occurred
    Error { message: String },
}

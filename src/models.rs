//! Data models for tasks and their invocation records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::dispatch::approval::{ApprovalRequest, ApprovalStatus};

/// Free text plus structured fields describing what the requester wants
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl TaskPayload {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// A field value, treating null as absent
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty() && self.fields.values().all(Value::is_null)
    }
}

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted, not yet routed
    New,
    /// Assigned to a specialist that has not started
    Routed,
    /// The owning specialist is working on it
    InProgress,
    /// Paused at the approval gate
    AwaitingApproval,
    /// Paused until the requester supplies missing information
    AwaitingInput,
    Resolved,
    Escalated,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::New => "new",
            TaskStatus::Routed => "routed",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::AwaitingApproval => "awaiting_approval",
            TaskStatus::AwaitingInput => "awaiting_input",
            TaskStatus::Resolved => "resolved",
            TaskStatus::Escalated => "escalated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Resolved | TaskStatus::Escalated)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(TaskStatus::New),
            "routed" => Ok(TaskStatus::Routed),
            "in_progress" => Ok(TaskStatus::InProgress),
            "awaiting_approval" => Ok(TaskStatus::AwaitingApproval),
            "awaiting_input" => Ok(TaskStatus::AwaitingInput),
            "resolved" => Ok(TaskStatus::Resolved),
            "escalated" => Ok(TaskStatus::Escalated),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// What the requester gets back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutcome {
    Answer {
        text: String,
    },
    Cancelled,
    Escalated {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    NeedsInput {
        reason: String,
    },
}

/// How a single capability invocation ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationOutcome {
    Succeeded {
        result: Value,
    },
    Failed {
        error: String,
    },
    Suspended {
        approval_id: Uuid,
    },
    Rejected {
        approval_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
}

impl InvocationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationOutcome::Succeeded { .. } => "succeeded",
            InvocationOutcome::Failed { .. } => "failed",
            InvocationOutcome::Suspended { .. } => "suspended",
            InvocationOutcome::Rejected { .. } => "rejected",
        }
    }
}

/// Audit entry for one invocation attempt; never modified once appended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub seq: u32,
    pub specialist: String,
    pub capability: String,
    pub arguments: Value,
    pub outcome: InvocationOutcome,
    pub recorded_at: DateTime<Utc>,
}

/// A unit of work owned by at most one specialist at a time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub payload: TaskPayload,
    /// Who submitted the task
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TaskOutcome>,
    /// Specialists that owned the task, oldest first
    #[serde(default)]
    pub ownership: Vec<String>,
    #[serde(default)]
    pub handoffs: usize,
    #[serde(default)]
    pub invocations: Vec<InvocationRecord>,
    #[serde(default)]
    pub approvals: Vec<ApprovalRequest>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(payload: TaskPayload, actor: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payload,
            actor: actor.into(),
            owner: None,
            status: TaskStatus::New,
            outcome: None,
            ownership: Vec::new(),
            handoffs: 0,
            invocations: Vec::new(),
            approvals: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn transition_error(&self, action: &str) -> String {
        format!(
            "Cannot {} task {} with status: {}",
            action,
            self.id,
            self.status.as_str()
        )
    }

    fn set_owner(&mut self, specialist: &str) {
        self.owner = Some(specialist.to_string());
        self.ownership.push(specialist.to_string());
    }

    /// Assign the task to its first (or re-routed) specialist
    pub fn assign(&mut self, specialist: &str) -> Result<(), String> {
        if !matches!(self.status, TaskStatus::New | TaskStatus::AwaitingInput) {
            return Err(self.transition_error("assign"));
        }
        self.set_owner(specialist);
        self.status = TaskStatus::Routed;
        self.outcome = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move ownership to another specialist
    pub fn hand_off(&mut self, specialist: &str) -> Result<(), String> {
        if self.status != TaskStatus::InProgress {
            return Err(self.transition_error("hand off"));
        }
        self.set_owner(specialist);
        self.handoffs += 1;
        self.status = TaskStatus::Routed;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Let the owning specialist start working
    pub fn start(&mut self) -> Result<(), String> {
        if self.status != TaskStatus::Routed {
            return Err(self.transition_error("start"));
        }
        self.status = TaskStatus::InProgress;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Park the task at the approval gate
    pub fn suspend(&mut self, request: ApprovalRequest) -> Result<(), String> {
        if self.status != TaskStatus::InProgress {
            return Err(self.transition_error("suspend"));
        }
        self.approvals.push(request);
        self.status = TaskStatus::AwaitingApproval;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Continue after the pending approval was decided
    pub fn resume(&mut self) -> Result<(), String> {
        if self.status != TaskStatus::AwaitingApproval || self.has_pending_approval() {
            return Err(self.transition_error("resume"));
        }
        self.status = TaskStatus::InProgress;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Ask the requester for more information
    pub fn await_input(&mut self, reason: impl Into<String>) -> Result<(), String> {
        if !matches!(
            self.status,
            TaskStatus::New | TaskStatus::InProgress | TaskStatus::AwaitingInput
        ) {
            return Err(self.transition_error("request input for"));
        }
        self.owner = None;
        self.status = TaskStatus::AwaitingInput;
        self.outcome = Some(TaskOutcome::NeedsInput {
            reason: reason.into(),
        });
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn resolve(&mut self, answer: impl Into<String>) -> Result<(), String> {
        self.finish(TaskOutcome::Answer {
            text: answer.into(),
        })
    }

    pub fn escalate(&mut self, reason: impl Into<String>, error: Option<String>) -> Result<(), String> {
        if self.status.is_terminal() || self.has_pending_approval() {
            return Err(self.transition_error("escalate"));
        }
        self.status = TaskStatus::Escalated;
        self.outcome = Some(TaskOutcome::Escalated {
            reason: reason.into(),
            error,
        });
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Cancel the task, rejecting any pending approval first
    pub fn cancel(&mut self) -> Result<(), String> {
        if self.status.is_terminal() {
            return Err(self.transition_error("cancel"));
        }
        let now = Utc::now();
        for request in self.approvals.iter_mut().filter(|r| r.is_pending()) {
            request.status = ApprovalStatus::Rejected;
            request.note = Some("cancelled".to_string());
            request.decided_at = Some(now);
        }
        self.finish(TaskOutcome::Cancelled)
    }

    fn finish(&mut self, outcome: TaskOutcome) -> Result<(), String> {
        if self.status.is_terminal() || self.has_pending_approval() {
            return Err(self.transition_error("resolve"));
        }
        self.status = TaskStatus::Resolved;
        self.outcome = Some(outcome);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Append to the invocation record and return the entry's sequence number
    pub fn record(
        &mut self,
        specialist: &str,
        capability: &str,
        arguments: Value,
        outcome: InvocationOutcome,
    ) -> u32 {
        let seq = self.invocations.len() as u32;
        self.invocations.push(InvocationRecord {
            seq,
            specialist: specialist.to_string(),
            capability: capability.to_string(),
            arguments,
            outcome,
            recorded_at: Utc::now(),
        });
        self.updated_at = Utc::now();
        seq
    }

    pub fn has_pending_approval(&self) -> bool {
        self.approvals.iter().any(ApprovalRequest::is_pending)
    }

    pub fn pending_approval(&self) -> Option<&ApprovalRequest> {
        self.approvals.iter().find(|r| r.is_pending())
    }

    pub fn approval_mut(&mut self, approval_id: Uuid) -> Option<&mut ApprovalRequest> {
        self.approvals.iter_mut().find(|r| r.id == approval_id)
    }

    /// The final answer text, if the task resolved with one
    pub fn answer(&self) -> Option<&str> {
        match &self.outcome {
            Some(TaskOutcome::Answer { text }) => Some(text),
            _ => None,
        }
    }
}

/// A task waiting in the human escalation queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub task_id: Uuid,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specialist: Option<String>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub escalated_at: DateTime<Utc>,
    /// Invocation record of the task at the moment it was escalated
    pub invocations: Vec<InvocationRecord>,
    pub acknowledged: bool,
}

/// Request to submit a new task
#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub text: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    pub actor: Option<String>,
}

impl SubmitTaskRequest {
    pub fn into_parts(self) -> (TaskPayload, String) {
        let actor = self.actor.unwrap_or_else(|| "anonymous".to_string());
        (
            TaskPayload {
                text: self.text,
                fields: self.fields,
            },
            actor,
        )
    }
}

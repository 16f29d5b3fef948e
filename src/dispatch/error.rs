//! Error taxonomy for routing, policy execution and approval gating

use thiserror::Error;
use uuid::Uuid;

use crate::executor::ExecutionError;

#[derive(Error, Debug, Clone)]
pub enum OrchestrationError {
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Duplicate capability: {0}")]
    DuplicateCapability(String),

    #[error("Specialist {specialist} is not permitted to invoke {capability}")]
    CapabilityNotPermitted {
        specialist: String,
        capability: String,
    },

    #[error("No matching specialist for task {task_id}")]
    UnroutableTask { task_id: Uuid },

    #[error("Task {task_id} exceeded the maximum handoff depth of {max_depth}")]
    HandoffLoop { task_id: Uuid, max_depth: usize },

    #[error("Approval request {0} has already been decided")]
    AlreadyDecided(Uuid),

    #[error("Capability execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Approval request not found: {0}")]
    ApprovalNotFound(Uuid),

    #[error("Unknown specialist: {0}")]
    UnknownSpecialist(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Invalid catalog: {0}")]
    InvalidCatalog(String),
}

impl OrchestrationError {
    /// Short reason attached to a task escalated because of this error
    pub fn escalation_reason(&self) -> &'static str {
        match self {
            OrchestrationError::UnroutableTask { .. } => "no matching specialist",
            OrchestrationError::CapabilityNotPermitted { .. } => "capability not permitted",
            OrchestrationError::HandoffLoop { .. } => "handoff limit exceeded",
            OrchestrationError::Execution(_) => "capability execution failed",
            OrchestrationError::UnknownCapability(_) => "unknown capability",
            OrchestrationError::UnknownSpecialist(_) => "unknown specialist",
            _ => "internal orchestration error",
        }
    }
}

/// Result type for orchestration operations
pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

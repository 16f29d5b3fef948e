//! Approval gate
//!
//! Every capability invocation passes through the gate. Normal capabilities run
//! straight away; approval-required ones produce a pending [`ApprovalRequest`]
//! and are only executed once someone approves them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use super::capability::{Capability, CapabilityRegistry};
use super::error::{OrchestrationError, OrchestrationResult};
use crate::executor::{CapabilityExecutor, ExecutionError};

/// Status of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for a decision
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            _ => Err(format!("Invalid approval status: {}", s)),
        }
    }
}

/// External decision on a pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Decision::Approve),
            "reject" => Ok(Decision::Reject),
            _ => Err(format!("Invalid decision: {}", s)),
        }
    }
}

/// A capability call a specialist wants to make
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub task_id: Uuid,
    pub specialist: String,
    pub capability: String,
    pub arguments: Value,
}

/// A paused invocation waiting for a decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub task_id: Uuid,
    pub specialist: String,
    pub capability: String,
    pub arguments: Value,
    pub status: ApprovalStatus,
    /// Note left by the decider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn new(invocation: &Invocation) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: invocation.task_id,
            specialist: invocation.specialist.clone(),
            capability: invocation.capability.clone(),
            arguments: invocation.arguments.clone(),
            status: ApprovalStatus::Pending,
            note: None,
            created_at: Utc::now(),
            decided_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    /// Rebuild the invocation this request paused
    pub fn invocation(&self) -> Invocation {
        Invocation {
            task_id: self.task_id,
            specialist: self.specialist.clone(),
            capability: self.capability.clone(),
            arguments: self.arguments.clone(),
        }
    }

    /// Record a decision; a request can only be decided once
    pub fn decide(&mut self, decision: Decision, note: Option<String>) -> OrchestrationResult<()> {
        if !self.is_pending() {
            return Err(OrchestrationError::AlreadyDecided(self.id));
        }
        self.status = match decision {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Reject => ApprovalStatus::Rejected,
        };
        self.note = note;
        self.decided_at = Some(Utc::now());
        Ok(())
    }
}

/// Result of submitting an invocation to the gate
#[derive(Debug, Clone)]
pub enum GateOutcome {
    /// The capability ran and produced this result
    Completed(Value),
    /// The invocation is parked until [`ApprovalRequest::decide`] is called
    Suspended(ApprovalRequest),
}

pub struct ApprovalGate {
    registry: CapabilityRegistry,
    executor: Arc<dyn CapabilityExecutor>,
}

impl ApprovalGate {
    pub fn new(registry: CapabilityRegistry, executor: Arc<dyn CapabilityExecutor>) -> Self {
        Self { registry, executor }
    }

    /// Run the invocation now, or park it if the capability is sensitive
    ///
    /// Arguments are validated before parking so that an approver never sees
    /// an invocation that could not run.
    pub async fn submit(&self, invocation: &Invocation) -> OrchestrationResult<GateOutcome> {
        let capability = self.registry.lookup(&invocation.capability)?;
        validate_arguments(capability, &invocation.arguments)?;

        if capability.requires_approval(&invocation.arguments) {
            let request = ApprovalRequest::new(invocation);
            tracing::info!(
                task_id = %invocation.task_id,
                approval_id = %request.id,
                capability = %invocation.capability,
                "Invocation suspended pending approval"
            );
            return Ok(GateOutcome::Suspended(request));
        }

        let result = self.execute(invocation).await?;
        Ok(GateOutcome::Completed(result))
    }

    /// Validate and execute, bypassing the sensitivity check
    ///
    /// Used for normal capabilities and for invocations that were approved.
    pub async fn execute(&self, invocation: &Invocation) -> OrchestrationResult<Value> {
        let capability = self.registry.lookup(&invocation.capability)?;

        validate_arguments(capability, &invocation.arguments)?;

        let result = self
            .executor
            .execute(&capability.id, &invocation.arguments)
            .await?;

        capability
            .output
            .validate(&result)
            .map_err(|reason| ExecutionError::InvalidOutput {
                capability: capability.id.clone(),
                reason,
            })?;

        tracing::debug!(
            task_id = %invocation.task_id,
            capability = %capability.id,
            "Capability executed"
        );
        Ok(result)
    }
}

fn validate_arguments(capability: &Capability, arguments: &Value) -> Result<(), ExecutionError> {
    capability
        .input
        .validate(arguments)
        .map_err(|reason| ExecutionError::InvalidArguments {
            capability: capability.id.clone(),
            reason,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::capability::{FieldKind, Schema, Sensitivity};
    use crate::executor::StaticExecutor;
    use serde_json::json;

    fn invocation(capability: &str, arguments: Value) -> Invocation {
        Invocation {
            task_id: Uuid::new_v4(),
            specialist: "issue-resolver".to_string(),
            capability: capability.to_string(),
            arguments,
        }
    }

    fn gate_with(executor: Arc<StaticExecutor>) -> ApprovalGate {
        let registry = CapabilityRegistry::from_capabilities(vec![
            Capability::new("run_diagnostic", Sensitivity::Normal)
                .with_input(Schema::new().field("issue_description", FieldKind::String))
                .with_output(Schema::new().field("solutions", FieldKind::Array)),
            Capability::new("process_refund", Sensitivity::ApprovalRequired)
                .with_input(Schema::new().field("amount", FieldKind::Number)),
        ])
        .unwrap();
        ApprovalGate::new(registry, executor)
    }

    #[test]
    fn test_approval_status_as_str() {
        assert_eq!(ApprovalStatus::Pending.as_str(), "pending");
        assert_eq!(ApprovalStatus::Approved.as_str(), "approved");
        assert_eq!(ApprovalStatus::Rejected.as_str(), "rejected");
        assert_eq!(
            "rejected".parse::<ApprovalStatus>().unwrap(),
            ApprovalStatus::Rejected
        );
    }

    #[test]
    fn test_decision_from_str() {
        assert_eq!("approve".parse::<Decision>().unwrap(), Decision::Approve);
        assert_eq!("reject".parse::<Decision>().unwrap(), Decision::Reject);
        assert!("maybe".parse::<Decision>().is_err());
    }

    #[test]
    fn test_approval_request_new() {
        let inv = invocation("process_refund", json!({"amount": 150}));
        let request = ApprovalRequest::new(&inv);

        assert_eq!(request.task_id, inv.task_id);
        assert_eq!(request.capability, "process_refund");
        assert!(request.is_pending());
        assert!(request.decided_at.is_none());
        assert_eq!(request.invocation(), inv);
    }

    #[test]
    fn test_approval_request_decide_once() {
        let mut request = ApprovalRequest::new(&invocation("process_refund", json!({})));

        request
            .decide(Decision::Reject, Some("over budget".to_string()))
            .unwrap();
        assert_eq!(request.status, ApprovalStatus::Rejected);
        assert_eq!(request.note.as_deref(), Some("over budget"));
        assert!(request.decided_at.is_some());

        let second = request.decide(Decision::Approve, None);
        assert!(matches!(second, Err(OrchestrationError::AlreadyDecided(id)) if id == request.id));
        assert_eq!(request.status, ApprovalStatus::Rejected);
    }

    #[tokio::test]
    async fn test_submit_normal_executes() {
        let executor = Arc::new(
            StaticExecutor::default().with_response("run_diagnostic", json!({"solutions": ["Charge it"]})),
        );
        let gate = gate_with(executor.clone());

        let outcome = gate
            .submit(&invocation(
                "run_diagnostic",
                json!({"issue_description": "won't turn on"}),
            ))
            .await
            .unwrap();

        match outcome {
            GateOutcome::Completed(result) => assert_eq!(result["solutions"][0], "Charge it"),
            GateOutcome::Suspended(_) => panic!("Expected the capability to run"),
        }
        assert_eq!(executor.call_count("run_diagnostic").await, 1);
    }

    #[tokio::test]
    async fn test_submit_sensitive_suspends_without_executing() {
        let executor =
            Arc::new(StaticExecutor::default().with_response("process_refund", json!({"refund_id": "REF-456"})));
        let gate = gate_with(executor.clone());

        let outcome = gate
            .submit(&invocation("process_refund", json!({"amount": 150})))
            .await
            .unwrap();

        assert!(matches!(outcome, GateOutcome::Suspended(ref r) if r.is_pending()));
        assert_eq!(executor.call_count("process_refund").await, 0);
    }

    #[tokio::test]
    async fn test_execute_rejects_invalid_arguments() {
        let executor = Arc::new(StaticExecutor::default());
        let gate = gate_with(executor.clone());

        let result = gate
            .execute(&invocation("run_diagnostic", json!({})))
            .await;

        assert!(matches!(
            result,
            Err(OrchestrationError::Execution(ExecutionError::InvalidArguments { .. }))
        ));
        assert!(executor.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_execute_rejects_invalid_output() {
        let executor =
            Arc::new(StaticExecutor::default().with_response("run_diagnostic", json!({"solutions": "none"})));
        let gate = gate_with(executor);

        let result = gate
            .execute(&invocation(
                "run_diagnostic",
                json!({"issue_description": "broken"}),
            ))
            .await;

        assert!(matches!(
            result,
            Err(OrchestrationError::Execution(ExecutionError::InvalidOutput { .. }))
        ));
    }

    #[tokio::test]
    async fn test_submit_sensitive_validates_before_suspending() {
        let gate = gate_with(Arc::new(StaticExecutor::default()));
        let result = gate
            .submit(&invocation("process_refund", json!({"amount": "lots"})))
            .await;
        assert!(matches!(
            result,
            Err(OrchestrationError::Execution(ExecutionError::InvalidArguments { .. }))
        ));
    }

    #[tokio::test]
    async fn test_submit_unknown_capability() {
        let gate = gate_with(Arc::new(StaticExecutor::default()));
        let result = gate.submit(&invocation("teleport", json!({}))).await;
        assert!(matches!(result, Err(OrchestrationError::UnknownCapability(_))));
    }
}

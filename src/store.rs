//! Database store for task snapshots, invocation records and escalations

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::dispatch::{EscalationHandler, EscalationTicket, Orchestrator};
use crate::error::{AppError, Result};
use crate::models::{Escalation, InvocationRecord, Task};

/// Database store
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // Task operations

    /// Upsert a task snapshot and append any new invocation records
    pub async fn save_task(&self, task: &Task) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, actor, owner, status, payload, outcome, ownership, handoffs, approvals, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                owner = excluded.owner,
                status = excluded.status,
                payload = excluded.payload,
                outcome = excluded.outcome,
                ownership = excluded.ownership,
                handoffs = excluded.handoffs,
                approvals = excluded.approvals,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(task.id.to_string())
        .bind(&task.actor)
        .bind(task.owner.as_deref())
        .bind(task.status.as_str())
        .bind(serde_json::to_string(&task.payload)?)
        .bind(task.outcome.as_ref().map(serde_json::to_string).transpose()?)
        .bind(serde_json::to_string(&task.ownership)?)
        .bind(task.handoffs as i64)
        .bind(serde_json::to_string(&task.approvals)?)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&mut *tx)
        .await?;

        // Records are append-only; existing sequence numbers are left alone
        for record in &task.invocations {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO invocation_records (task_id, seq, specialist, capability, arguments, outcome, recorded_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(task.id.to_string())
            .bind(record.seq as i64)
            .bind(&record.specialist)
            .bind(&record.capability)
            .bind(serde_json::to_string(&record.arguments)?)
            .bind(serde_json::to_string(&record.outcome)?)
            .bind(record.recorded_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, actor, owner, status, payload, outcome, ownership, handoffs, approvals, created_at, updated_at
            FROM tasks
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Task {} not found", id)))?;

        let mut task: Task = row.try_into()?;
        task.invocations = self.get_invocations(id).await?;
        Ok(task)
    }

    /// Invocation records of a task in sequence order
    pub async fn get_invocations(&self, task_id: Uuid) -> Result<Vec<InvocationRecord>> {
        let rows = sqlx::query_as::<_, InvocationRow>(
            r#"
            SELECT seq, specialist, capability, arguments, outcome, recorded_at
            FROM invocation_records
            WHERE task_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    // Escalation queue

    pub async fn enqueue_escalation(&self, ticket: &EscalationTicket) -> Result<()> {
        let invocations = serde_json::to_string(&ticket.invocations)?;

        sqlx::query(
            r#"
            INSERT INTO escalations (task_id, actor, specialist, reason, error, escalated_at, invocations, acknowledged)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(task_id) DO UPDATE SET
                reason = excluded.reason,
                error = excluded.error,
                escalated_at = excluded.escalated_at,
                invocations = excluded.invocations,
                acknowledged = 0
            "#,
        )
        .bind(ticket.task_id.to_string())
        .bind(&ticket.actor)
        .bind(ticket.specialist.as_deref())
        .bind(&ticket.reason)
        .bind(ticket.error.as_deref())
        .bind(ticket.escalated_at)
        .bind(&invocations)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Escalations oldest first; acknowledged ones only when asked for
    pub async fn list_escalations(&self, include_acknowledged: bool) -> Result<Vec<Escalation>> {
        let rows = sqlx::query_as::<_, EscalationRow>(
            r#"
            SELECT task_id, actor, specialist, reason, error, escalated_at, invocations, acknowledged
            FROM escalations
            WHERE acknowledged = 0 OR ?
            ORDER BY escalated_at ASC
            "#,
        )
        .bind(include_acknowledged)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Mark an escalation as picked up by a human
    pub async fn acknowledge_escalation(&self, task_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE escalations SET acknowledged = 1 WHERE task_id = ?
            "#,
        )
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "Escalation for task {} not found",
                task_id
            )));
        }
        Ok(())
    }

    /// Persist a task snapshot every time the orchestrator reports progress on it
    pub fn record_events(&self, orchestrator: Arc<Orchestrator>) -> JoinHandle<()> {
        let mut rx = orchestrator.subscribe();
        let store = self.clone();

        tokio::spawn(async move {
            loop {
                let task_id = match rx.recv().await {
                    Ok(event) => event.task_id(),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Task recorder lagged, snapshotting every live task");
                        store.save_live_tasks(&orchestrator).await;
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let task = match orchestrator.get_task(task_id).await {
                    Ok(task) => task,
                    Err(e) => {
                        // Evicted tasks were persisted before they went
                        tracing::debug!(task_id = %task_id, error = %e, "Task no longer live");
                        continue;
                    }
                };
                if let Err(e) = store.save_task(&task).await {
                    tracing::error!(task_id = %task_id, error = %e, "Failed to persist task");
                }
            }
        })
    }
}

impl Store {
    /// Persist a snapshot of every task the orchestrator still holds
    pub async fn save_live_tasks(&self, orchestrator: &Orchestrator) -> usize {
        let mut saved = 0;
        for task in orchestrator.list_tasks().await {
            match self.save_task(&task).await {
                Ok(()) => saved += 1,
                Err(e) => {
                    tracing::error!(task_id = %task.id, error = %e, "Failed to persist task")
                }
            }
        }
        saved
    }
}

#[async_trait]
impl EscalationHandler for Store {
    async fn escalated(&self, ticket: EscalationTicket) {
        tracing::warn!(
            task_id = %ticket.task_id,
            reason = %ticket.reason,
            "Task escalated to human handling"
        );
        if let Err(e) = self.enqueue_escalation(&ticket).await {
            tracing::error!(task_id = %ticket.task_id, error = %e, "Failed to enqueue escalation");
        }
    }
}

// Internal row types for sqlx

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    actor: String,
    owner: Option<String>,
    status: String,
    payload: String,
    outcome: Option<String>,
    ownership: String,
    handoffs: i64,
    approvals: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = AppError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(Task {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| AppError::Internal(format!("Invalid UUID: {}", e)))?,
            payload: serde_json::from_str(&row.payload)?,
            actor: row.actor,
            owner: row.owner,
            status: row
                .status
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid status: {}", e)))?,
            outcome: row.outcome.as_deref().map(serde_json::from_str).transpose()?,
            ownership: serde_json::from_str(&row.ownership)?,
            handoffs: usize::try_from(row.handoffs)
                .map_err(|e| AppError::Internal(format!("Invalid handoff count: {}", e)))?,
            invocations: Vec::new(),
            approvals: serde_json::from_str(&row.approvals)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InvocationRow {
    seq: i64,
    specialist: String,
    capability: String,
    arguments: String,
    outcome: String,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<InvocationRow> for InvocationRecord {
    type Error = AppError;

    fn try_from(row: InvocationRow) -> Result<Self> {
        Ok(InvocationRecord {
            seq: u32::try_from(row.seq)
                .map_err(|e| AppError::Internal(format!("Invalid sequence number: {}", e)))?,
            specialist: row.specialist,
            capability: row.capability,
            arguments: serde_json::from_str(&row.arguments)?,
            outcome: serde_json::from_str(&row.outcome)?,
            recorded_at: row.recorded_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EscalationRow {
    task_id: String,
    actor: String,
    specialist: Option<String>,
    reason: String,
    error: Option<String>,
    escalated_at: DateTime<Utc>,
    invocations: String,
    acknowledged: bool,
}

impl TryFrom<EscalationRow> for Escalation {
    type Error = AppError;

    fn try_from(row: EscalationRow) -> Result<Self> {
        Ok(Escalation {
            task_id: Uuid::parse_str(&row.task_id)
                .map_err(|e| AppError::Internal(format!("Invalid UUID: {}", e)))?,
            actor: row.actor,
            specialist: row.specialist,
            reason: row.reason,
            error: row.error,
            escalated_at: row.escalated_at,
            invocations: serde_json::from_str(&row.invocations)?,
            acknowledged: row.acknowledged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::approval::{ApprovalRequest, Invocation};
    use crate::models::{InvocationOutcome, TaskOutcome, TaskPayload, TaskStatus};
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> Store {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        Store::new(pool)
    }

    fn sample_task() -> Task {
        let mut task = Task::new(
            TaskPayload::new("refund $150 for ORD-1").with_field("amount", 150),
            "alice",
        );
        task.assign("issue-resolver").unwrap();
        task.start().unwrap();
        task
    }

    fn ticket(task_id: Uuid, reason: &str) -> EscalationTicket {
        EscalationTicket {
            task_id,
            actor: "alice".to_string(),
            specialist: Some("issue-resolver".to_string()),
            reason: reason.to_string(),
            error: None,
            escalated_at: Utc::now(),
            invocations: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_save_and_get_task() {
        let store = setup_test_db().await;
        let mut task = sample_task();
        task.record(
            "issue-resolver",
            "run_diagnostic",
            json!({"issue_description": "broken"}),
            InvocationOutcome::Succeeded {
                result: json!({"solutions": []}),
            },
        );
        task.resolve("Try charging it").unwrap();

        store.save_task(&task).await.unwrap();
        let fetched = store.get_task(task.id).await.unwrap();

        assert_eq!(fetched.id, task.id);
        assert_eq!(fetched.status, TaskStatus::Resolved);
        assert_eq!(fetched.payload, task.payload);
        assert_eq!(fetched.ownership, vec!["issue-resolver"]);
        assert_eq!(
            fetched.outcome,
            Some(TaskOutcome::Answer {
                text: "Try charging it".to_string()
            })
        );
        assert_eq!(fetched.invocations.len(), 1);
        assert_eq!(fetched.invocations[0].capability, "run_diagnostic");
    }

    #[tokio::test]
    async fn test_get_task_not_found() {
        let store = setup_test_db().await;
        let result = store.get_task(Uuid::new_v4()).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_save_task_updates_snapshot() {
        let store = setup_test_db().await;
        let mut task = sample_task();
        let request = ApprovalRequest::new(&Invocation {
            task_id: task.id,
            specialist: "issue-resolver".to_string(),
            capability: "process_refund".to_string(),
            arguments: json!({"amount": 150}),
        });
        let approval_id = request.id;
        task.record(
            "issue-resolver",
            "process_refund",
            json!({"amount": 150}),
            InvocationOutcome::Suspended { approval_id },
        );
        task.suspend(request).unwrap();
        store.save_task(&task).await.unwrap();

        let fetched = store.get_task(task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::AwaitingApproval);
        assert!(fetched.has_pending_approval());

        task.cancel().unwrap();
        store.save_task(&task).await.unwrap();

        let fetched = store.get_task(task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Resolved);
        assert_eq!(fetched.outcome, Some(TaskOutcome::Cancelled));
        assert!(!fetched.has_pending_approval());
        assert_eq!(fetched.invocations.len(), 1);
    }

    #[tokio::test]
    async fn test_invocation_records_are_append_only() {
        let store = setup_test_db().await;
        let mut task = sample_task();
        task.record(
            "issue-resolver",
            "run_diagnostic",
            json!({}),
            InvocationOutcome::Failed {
                error: "offline".to_string(),
            },
        );
        store.save_task(&task).await.unwrap();

        // A rewritten record with the same sequence number is ignored
        task.invocations[0].outcome = InvocationOutcome::Succeeded { result: json!({}) };
        task.record(
            "issue-resolver",
            "create_support_ticket",
            json!({}),
            InvocationOutcome::Succeeded {
                result: json!({"ticket_id": "TKT-1"}),
            },
        );
        store.save_task(&task).await.unwrap();

        let records = store.get_invocations(task.id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome.as_str(), "failed");
        assert_eq!(records[1].seq, 1);
    }

    #[tokio::test]
    async fn test_escalation_queue() {
        let store = setup_test_db().await;
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        store
            .enqueue_escalation(&ticket(first, "no matching specialist"))
            .await
            .unwrap();
        store
            .enqueue_escalation(&ticket(second, "customer requested a human"))
            .await
            .unwrap();

        let open = store.list_escalations(false).await.unwrap();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].task_id, first);
        assert!(!open[0].acknowledged);

        store.acknowledge_escalation(first).await.unwrap();

        let open = store.list_escalations(false).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].task_id, second);

        let all = store.list_escalations(true).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_escalation() {
        let store = setup_test_db().await;
        let result = store.acknowledge_escalation(Uuid::new_v4()).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_store_as_escalation_handler() {
        let store = setup_test_db().await;
        let mut task = sample_task();
        task.record(
            "issue-resolver",
            "run_diagnostic",
            json!({"issue_description": "no power"}),
            InvocationOutcome::Failed {
                error: "diagnostics offline".to_string(),
            },
        );
        let mut escalation = ticket(task.id, "handoff limit exceeded");
        escalation.invocations = task.invocations.clone();

        store.escalated(escalation).await;

        let escalations = store.list_escalations(false).await.unwrap();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].reason, "handoff limit exceeded");
        assert_eq!(escalations[0].specialist.as_deref(), Some("issue-resolver"));
        assert_eq!(escalations[0].invocations, task.invocations);
    }

    #[tokio::test]
    async fn test_recorder_catches_up_after_lag() {
        let store = setup_test_db().await;
        let catalog = crate::config::Catalog::bundled().unwrap();
        let executor = Arc::new(catalog.static_executor());
        let orchestrator = Arc::new(catalog.into_orchestrator(executor).with_config(
            crate::dispatch::OrchestratorConfig {
                event_capacity: 1,
                ..Default::default()
            },
        ));
        let recorder = store.record_events(orchestrator.clone());

        let mut ids = Vec::new();
        for _ in 0..3 {
            let task = orchestrator
                .submit_task(TaskPayload::new("cancel order ORD-1"), "alice")
                .await;
            assert_eq!(task.status, TaskStatus::Resolved);
            ids.push(task.id);
        }

        for _ in 0..100 {
            let mut stored = 0;
            for id in &ids {
                if let Ok(task) = store.get_task(*id).await {
                    if task.status == TaskStatus::Resolved {
                        stored += 1;
                    }
                }
            }
            if stored == ids.len() {
                recorder.abort();
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("recorder never persisted the final snapshots");
    }

    #[tokio::test]
    async fn test_task_row_try_from_invalid_uuid() {
        let row = TaskRow {
            id: "not-a-uuid".to_string(),
            actor: "alice".to_string(),
            owner: None,
            status: "new".to_string(),
            payload: r#"{"text":"hi"}"#.to_string(),
            outcome: None,
            ownership: "[]".to_string(),
            handoffs: 0,
            approvals: "[]".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let result: Result<Task> = row.try_into();
        assert!(matches!(result, Err(AppError::Internal(_))));
    }

    #[tokio::test]
    async fn test_task_row_try_from_invalid_status() {
        let row = TaskRow {
            id: Uuid::new_v4().to_string(),
            actor: "alice".to_string(),
            owner: None,
            status: "done".to_string(),
            payload: r#"{"text":"hi"}"#.to_string(),
            outcome: None,
            ownership: "[]".to_string(),
            handoffs: 0,
            approvals: "[]".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let result: Result<Task> = row.try_into();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_invocation_row_try_from_bad_json() {
        let row = InvocationRow {
            seq: 0,
            specialist: "issue-resolver".to_string(),
            capability: "run_diagnostic".to_string(),
            arguments: "{".to_string(),
            outcome: r#"{"status":"failed","error":"x"}"#.to_string(),
            recorded_at: Utc::now(),
        };
        let result: Result<InvocationRecord> = row.try_into();
        assert!(matches!(result, Err(AppError::Serialization(_))));
    }
}

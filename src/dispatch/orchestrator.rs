//! Orchestrator for routing tasks and driving specialists
//!
//! The orchestrator handles:
//! - Task intake, routing and clarification
//! - Driving the owning specialist's policy until the task pauses
//! - Relaying invocations through the approval gate and resuming on decisions
//! - Handoffs with a depth limit
//! - Escalation and event broadcasting

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::approval::{ApprovalGate, ApprovalRequest, Decision, GateOutcome, Invocation};
use super::capability::CapabilityRegistry;
use super::error::{OrchestrationError, OrchestrationResult};
use super::router::{RouteDecision, TaskRouter};
use super::specialist::{Action, PolicyCursor, RejectionPolicy, SpecialistSet};
use crate::executor::CapabilityExecutor;
use crate::models::{InvocationOutcome, InvocationRecord, Task, TaskOutcome, TaskPayload, TaskStatus};

/// Tunables for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Handoffs allowed per task before it is escalated
    pub max_handoff_depth: usize,
    /// How long resolved and escalated tasks stay in memory
    pub retention: Duration,
    /// Capacity of the event channel; slow subscribers lag beyond it
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_handoff_depth: 3,
            retention: Duration::from_secs(15 * 60),
            event_capacity: 256,
        }
    }
}

/// Events emitted by the orchestrator
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    TaskAccepted {
        task_id: Uuid,
        actor: String,
    },
    TaskRouted {
        task_id: Uuid,
        specialist: String,
    },
    /// An invocation reached the record, whatever its outcome
    CapabilityInvoked {
        task_id: Uuid,
        specialist: String,
        capability: String,
        outcome: String,
    },
    ApprovalRequested {
        approval_id: Uuid,
        task_id: Uuid,
        capability: String,
        arguments: Value,
    },
    ApprovalDecided {
        approval_id: Uuid,
        task_id: Uuid,
        decision: Decision,
    },
    TaskHandedOff {
        task_id: Uuid,
        from: String,
        to: String,
        depth: usize,
    },
    InputRequested {
        task_id: Uuid,
        reason: String,
    },
    TaskResolved {
        task_id: Uuid,
        outcome: TaskOutcome,
    },
    TaskEscalated {
        task_id: Uuid,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TaskCancelled {
        task_id: Uuid,
    },
}

impl OrchestratorEvent {
    pub fn task_id(&self) -> Uuid {
        match self {
            OrchestratorEvent::TaskAccepted { task_id, .. }
            | OrchestratorEvent::TaskRouted { task_id, .. }
            | OrchestratorEvent::CapabilityInvoked { task_id, .. }
            | OrchestratorEvent::ApprovalRequested { task_id, .. }
            | OrchestratorEvent::ApprovalDecided { task_id, .. }
            | OrchestratorEvent::TaskHandedOff { task_id, .. }
            | OrchestratorEvent::InputRequested { task_id, .. }
            | OrchestratorEvent::TaskResolved { task_id, .. }
            | OrchestratorEvent::TaskEscalated { task_id, .. }
            | OrchestratorEvent::TaskCancelled { task_id } => *task_id,
        }
    }
}

/// A task handed over to human handling
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationTicket {
    pub task_id: Uuid,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specialist: Option<String>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub escalated_at: DateTime<Utc>,
    /// Everything the task invoked before it was escalated
    pub invocations: Vec<InvocationRecord>,
}

/// Receives escalated tasks
#[async_trait]
pub trait EscalationHandler: Send + Sync {
    async fn escalated(&self, ticket: EscalationTicket);
}

/// Escalation handler that only logs
pub struct LogEscalations;

#[async_trait]
impl EscalationHandler for LogEscalations {
    async fn escalated(&self, ticket: EscalationTicket) {
        tracing::warn!(
            task_id = %ticket.task_id,
            reason = %ticket.reason,
            error = ?ticket.error,
            "Task escalated to human handling"
        );
    }
}

struct TaskEntry {
    task: Task,
    /// Resume point of the owning specialist's policy
    cursor: PolicyCursor,
    cancelled: Arc<AtomicBool>,
}

impl TaskEntry {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct TaskHandle {
    entry: Arc<Mutex<TaskEntry>>,
    /// Raised by `cancel_task` without waiting for the entry lock
    cancelled: Arc<AtomicBool>,
}

enum Flow {
    Continue,
    Pause,
}

pub struct Orchestrator {
    registry: CapabilityRegistry,
    specialists: SpecialistSet,
    router: TaskRouter,
    gate: ApprovalGate,
    config: OrchestratorConfig,
    /// Tasks by ID; each task is serialized by its own mutex
    tasks: RwLock<HashMap<Uuid, TaskHandle>>,
    /// Pending approval request ID -> task ID
    approvals: RwLock<HashMap<Uuid, Uuid>>,
    escalations: Arc<dyn EscalationHandler>,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl Orchestrator {
    pub fn new(
        registry: CapabilityRegistry,
        specialists: SpecialistSet,
        router: TaskRouter,
        executor: Arc<dyn CapabilityExecutor>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            gate: ApprovalGate::new(registry.clone(), executor),
            registry,
            specialists,
            router,
            config: OrchestratorConfig::default(),
            tasks: RwLock::new(HashMap::new()),
            approvals: RwLock::new(HashMap::new()),
            escalations: Arc::new(LogEscalations),
            event_tx,
        }
    }

    /// Replace the defaults; subscriptions taken before this call see no events
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        self.event_tx = event_tx;
        self.config = config;
        self
    }

    pub fn with_escalation_handler(mut self, handler: Arc<dyn EscalationHandler>) -> Self {
        self.escalations = handler;
        self
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn specialists(&self) -> &SpecialistSet {
        &self.specialists
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn insert(&self, payload: TaskPayload, actor: String) -> (Uuid, Arc<Mutex<TaskEntry>>) {
        let mut task = Task::new(payload, actor);
        self.router.enrich(&mut task.payload);
        let task_id = task.id;
        let actor = task.actor.clone();

        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = Arc::new(Mutex::new(TaskEntry {
            task,
            cursor: PolicyCursor::new(),
            cancelled: cancelled.clone(),
        }));
        {
            let mut tasks = self.tasks.write().await;
            tasks.insert(
                task_id,
                TaskHandle {
                    entry: entry.clone(),
                    cancelled,
                },
            );
        }

        tracing::info!(task_id = %task_id, actor = %actor, "Task accepted");
        self.emit(OrchestratorEvent::TaskAccepted { task_id, actor });
        (task_id, entry)
    }

    /// Submit a task and drive it until it resolves, escalates or pauses
    pub async fn submit_task(&self, payload: TaskPayload, actor: impl Into<String>) -> Task {
        let (_, entry) = self.insert(payload, actor.into()).await;
        let mut guard = entry.lock().await;
        self.dispatch(&mut guard).await;
        guard.task.clone()
    }

    /// Accept a task and drive it in the background
    pub async fn accept_task(self: &Arc<Self>, payload: TaskPayload, actor: impl Into<String>) -> Uuid {
        let (task_id, entry) = self.insert(payload, actor.into()).await;
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut guard = entry.lock().await;
            orchestrator.dispatch(&mut guard).await;
        });
        task_id
    }

    /// Decide a pending approval and resume its task at the suspended step
    pub async fn decide(
        &self,
        approval_id: Uuid,
        decision: Decision,
        note: Option<String>,
    ) -> OrchestrationResult<Task> {
        let task_id = {
            let approvals = self.approvals.read().await;
            approvals.get(&approval_id).copied()
        };
        let task_id = match task_id {
            Some(task_id) => task_id,
            None => return Err(self.missing_approval(approval_id).await),
        };
        let entry = self.entry(task_id).await?;
        let mut guard = entry.lock().await;
        let entry = &mut *guard;

        let request = entry
            .task
            .approval_mut(approval_id)
            .ok_or(OrchestrationError::ApprovalNotFound(approval_id))?;
        request.decide(decision, note.clone())?;
        let invocation = request.invocation();
        self.approvals.write().await.remove(&approval_id);

        tracing::info!(
            task_id = %task_id,
            approval_id = %approval_id,
            decision = decision.as_str(),
            "Approval decided"
        );
        self.emit(OrchestratorEvent::ApprovalDecided {
            approval_id,
            task_id,
            decision,
        });

        let resumed = match decision {
            Decision::Approve => self.resume_approved(entry, invocation).await,
            Decision::Reject => self.resume_rejected(entry, invocation, approval_id, note).await,
        };
        match resumed {
            Ok(Flow::Continue) => self.run(entry).await,
            Ok(Flow::Pause) => {}
            Err(e) => self.fail(entry, e).await,
        }

        Ok(entry.task.clone())
    }

    /// Why an approval ID is not in the pending index
    async fn missing_approval(&self, approval_id: Uuid) -> OrchestrationError {
        for entry in self.entries().await {
            let guard = entry.lock().await;
            if guard.task.approvals.iter().any(|r| r.id == approval_id) {
                return OrchestrationError::AlreadyDecided(approval_id);
            }
        }
        OrchestrationError::ApprovalNotFound(approval_id)
    }

    async fn resume_approved(
        &self,
        entry: &mut TaskEntry,
        invocation: Invocation,
    ) -> OrchestrationResult<Flow> {
        entry
            .task
            .resume()
            .map_err(OrchestrationError::InvalidStateTransition)?;
        if entry.is_cancelled() {
            return Ok(Flow::Pause);
        }
        let result = self.execute(entry, &invocation).await?;
        entry.cursor.complete(&invocation.capability, result);
        Ok(Flow::Continue)
    }

    async fn resume_rejected(
        &self,
        entry: &mut TaskEntry,
        invocation: Invocation,
        approval_id: Uuid,
        note: Option<String>,
    ) -> OrchestrationResult<Flow> {
        self.record(
            entry,
            &invocation,
            InvocationOutcome::Rejected { approval_id, note },
        );
        entry
            .task
            .resume()
            .map_err(OrchestrationError::InvalidStateTransition)?;

        let specialist = self.specialists.lookup(&invocation.specialist)?;
        match specialist.on_rejected(&entry.cursor) {
            RejectionPolicy::Resolve { message } => {
                self.resolve(entry, TaskOutcome::Answer { text: message })?;
                Ok(Flow::Pause)
            }
            RejectionPolicy::Escalate { reason } => {
                self.escalate(entry, reason, None).await;
                Ok(Flow::Pause)
            }
            RejectionPolicy::Continue => {
                entry.cursor.skip();
                Ok(Flow::Continue)
            }
        }
    }

    /// Cancel a task; a pending approval is rejected by the cancellation
    ///
    /// A running task stops before its next capability invocation.
    pub async fn cancel_task(&self, task_id: Uuid) -> OrchestrationResult<Task> {
        let handle = self.handle(task_id).await?;
        handle.cancelled.store(true, Ordering::SeqCst);
        let mut guard = handle.entry.lock().await;

        let pending: Vec<Uuid> = guard
            .task
            .approvals
            .iter()
            .filter(|r| r.is_pending())
            .map(|r| r.id)
            .collect();
        guard
            .task
            .cancel()
            .map_err(OrchestrationError::InvalidStateTransition)?;
        {
            let mut approvals = self.approvals.write().await;
            for approval_id in &pending {
                approvals.remove(approval_id);
            }
        }

        tracing::info!(task_id = %task_id, "Task cancelled");
        self.emit(OrchestratorEvent::TaskCancelled { task_id });
        Ok(guard.task.clone())
    }

    /// Merge requester-supplied fields into a task awaiting input and route it again
    pub async fn provide_input(
        &self,
        task_id: Uuid,
        fields: Map<String, Value>,
    ) -> OrchestrationResult<Task> {
        let entry = self.entry(task_id).await?;
        let mut guard = entry.lock().await;

        if guard.task.status != TaskStatus::AwaitingInput {
            return Err(OrchestrationError::InvalidStateTransition(format!(
                "Task {} is not awaiting input (status: {})",
                task_id,
                guard.task.status.as_str()
            )));
        }

        for (name, value) in fields {
            if !value.is_null() {
                guard.task.payload.fields.insert(name, value);
            }
        }
        self.router.enrich(&mut guard.task.payload);
        self.dispatch(&mut guard).await;
        Ok(guard.task.clone())
    }

    pub async fn get_task(&self, task_id: Uuid) -> OrchestrationResult<Task> {
        let entry = self.entry(task_id).await?;
        let guard = entry.lock().await;
        Ok(guard.task.clone())
    }

    /// All tasks, oldest first
    pub async fn list_tasks(&self) -> Vec<Task> {
        let mut tasks = Vec::new();
        for entry in self.entries().await {
            tasks.push(entry.lock().await.task.clone());
        }
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Pending approval requests across all tasks, oldest first
    pub async fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        let mut pending = Vec::new();
        for entry in self.entries().await {
            let guard = entry.lock().await;
            pending.extend(guard.task.pending_approval().cloned());
        }
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    /// Drop resolved and escalated tasks that have been idle for the retention period
    pub async fn evict_finished(&self) -> usize {
        let cutoff = match chrono::Duration::from_std(self.config.retention) {
            Ok(retention) => Utc::now() - retention,
            Err(_) => return 0,
        };

        let handles: Vec<(Uuid, TaskHandle)> = {
            let tasks = self.tasks.read().await;
            tasks.iter().map(|(id, h)| (*id, h.clone())).collect()
        };
        let mut expired = HashSet::new();
        for (task_id, handle) in handles {
            // A locked entry is still being driven
            let Ok(guard) = handle.entry.try_lock() else {
                continue;
            };
            if guard.task.status.is_terminal() && guard.task.updated_at <= cutoff {
                expired.insert(task_id);
            }
        }
        if expired.is_empty() {
            return 0;
        }

        self.tasks.write().await.retain(|id, _| !expired.contains(id));
        self.approvals
            .write()
            .await
            .retain(|_, task_id| !expired.contains(task_id));
        tracing::debug!(evicted = expired.len(), "Evicted finished tasks");
        expired.len()
    }

    /// Evict finished tasks periodically until the orchestrator is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let orchestrator: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                match orchestrator.upgrade() {
                    Some(orchestrator) => {
                        orchestrator.evict_finished().await;
                    }
                    None => break,
                }
            }
        })
    }

    async fn handle(&self, task_id: Uuid) -> OrchestrationResult<TaskHandle> {
        let tasks = self.tasks.read().await;
        tasks
            .get(&task_id)
            .cloned()
            .ok_or(OrchestrationError::TaskNotFound(task_id))
    }

    async fn entry(&self, task_id: Uuid) -> OrchestrationResult<Arc<Mutex<TaskEntry>>> {
        Ok(self.handle(task_id).await?.entry)
    }

    async fn entries(&self) -> Vec<Arc<Mutex<TaskEntry>>> {
        let tasks = self.tasks.read().await;
        tasks.values().map(|h| h.entry.clone()).collect()
    }

    /// Route a new (or clarified) task and run its specialist
    async fn dispatch(&self, entry: &mut TaskEntry) {
        if !matches!(
            entry.task.status,
            TaskStatus::New | TaskStatus::AwaitingInput
        ) {
            return;
        }

        match self.router.route(&entry.task, &self.specialists, &[]) {
            Ok(RouteDecision::Assign(specialist)) => {
                if let Err(e) = entry.task.assign(&specialist) {
                    self.fail(entry, OrchestrationError::InvalidStateTransition(e))
                        .await;
                    return;
                }
                entry.cursor = PolicyCursor::new();
                tracing::info!(task_id = %entry.task.id, specialist = %specialist, "Task routed");
                self.emit(OrchestratorEvent::TaskRouted {
                    task_id: entry.task.id,
                    specialist,
                });
                self.run(entry).await;
            }
            Ok(RouteDecision::Clarify { reason }) => {
                if let Err(e) = self.request_input(entry, reason) {
                    self.fail(entry, e).await;
                }
            }
            Err(e) => self.fail(entry, e).await,
        }
    }

    async fn run(&self, entry: &mut TaskEntry) {
        loop {
            if entry.is_cancelled() {
                tracing::info!(task_id = %entry.task.id, "Task stopped for cancellation");
                return;
            }
            match self.step(entry).await {
                Ok(Flow::Continue) => continue,
                Ok(Flow::Pause) => return,
                Err(e) if entry.is_cancelled() => {
                    tracing::debug!(task_id = %entry.task.id, error = %e, "Error after cancellation");
                    return;
                }
                Err(e) => {
                    self.fail(entry, e).await;
                    return;
                }
            }
        }
    }

    /// Perform the owning specialist's next action
    async fn step(&self, entry: &mut TaskEntry) -> OrchestrationResult<Flow> {
        if entry.task.status == TaskStatus::Routed {
            entry
                .task
                .start()
                .map_err(OrchestrationError::InvalidStateTransition)?;
        }
        let owner = entry.task.owner.clone().ok_or_else(|| {
            OrchestrationError::InvalidStateTransition(format!("Task {} has no owner", entry.task.id))
        })?;
        let specialist = self.specialists.lookup(&owner)?;

        let action = specialist.handle(&entry.task.payload, &mut entry.cursor)?;
        tracing::debug!(
            task_id = %entry.task.id,
            specialist = %owner,
            rule = specialist.rule_name(&entry.cursor),
            "Policy step"
        );
        match action {
            Action::Invoke {
                capability,
                arguments,
            } => {
                let invocation = Invocation {
                    task_id: entry.task.id,
                    specialist: owner,
                    capability,
                    arguments,
                };
                self.invoke(entry, invocation).await
            }
            Action::Handoff { target } => self.hand_off(entry, &owner, &target),
            Action::Escalate { reason } => {
                self.escalate(entry, reason, None).await;
                Ok(Flow::Pause)
            }
            Action::Resolve { answer } => {
                self.resolve(entry, TaskOutcome::Answer { text: answer })?;
                Ok(Flow::Pause)
            }
        }
    }

    async fn invoke(&self, entry: &mut TaskEntry, invocation: Invocation) -> OrchestrationResult<Flow> {
        let outcome = match self.gate.submit(&invocation).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record_failure(entry, &invocation, &e);
                return Err(e);
            }
        };

        match outcome {
            GateOutcome::Completed(result) => {
                self.record(
                    entry,
                    &invocation,
                    InvocationOutcome::Succeeded {
                        result: result.clone(),
                    },
                );
                entry.cursor.complete(&invocation.capability, result);
                Ok(Flow::Continue)
            }
            GateOutcome::Suspended(request) => {
                let approval_id = request.id;
                self.record(entry, &invocation, InvocationOutcome::Suspended { approval_id });
                entry
                    .task
                    .suspend(request)
                    .map_err(OrchestrationError::InvalidStateTransition)?;
                {
                    let mut approvals = self.approvals.write().await;
                    approvals.insert(approval_id, invocation.task_id);
                }

                self.emit(OrchestratorEvent::ApprovalRequested {
                    approval_id,
                    task_id: invocation.task_id,
                    capability: invocation.capability,
                    arguments: invocation.arguments,
                });
                Ok(Flow::Pause)
            }
        }
    }

    /// Execute an approved invocation and record the outcome
    async fn execute(&self, entry: &mut TaskEntry, invocation: &Invocation) -> OrchestrationResult<Value> {
        match self.gate.execute(invocation).await {
            Ok(result) => {
                self.record(
                    entry,
                    invocation,
                    InvocationOutcome::Succeeded {
                        result: result.clone(),
                    },
                );
                Ok(result)
            }
            Err(e) => {
                self.record_failure(entry, invocation, &e);
                Err(e)
            }
        }
    }

    fn record_failure(&self, entry: &mut TaskEntry, invocation: &Invocation, error: &OrchestrationError) {
        if let OrchestrationError::Execution(error) = error {
            self.record(
                entry,
                invocation,
                InvocationOutcome::Failed {
                    error: error.to_string(),
                },
            );
        }
    }

    fn record(&self, entry: &mut TaskEntry, invocation: &Invocation, outcome: InvocationOutcome) {
        let status = outcome.as_str().to_string();
        entry.task.record(
            &invocation.specialist,
            &invocation.capability,
            invocation.arguments.clone(),
            outcome,
        );
        self.emit(OrchestratorEvent::CapabilityInvoked {
            task_id: invocation.task_id,
            specialist: invocation.specialist.clone(),
            capability: invocation.capability.clone(),
            outcome: status,
        });
    }

    fn hand_off(&self, entry: &mut TaskEntry, from: &str, target: &str) -> OrchestrationResult<Flow> {
        let task_id = entry.task.id;
        if entry.task.handoffs >= self.config.max_handoff_depth {
            return Err(OrchestrationError::HandoffLoop {
                task_id,
                max_depth: self.config.max_handoff_depth,
            });
        }

        match self
            .router
            .route_handoff(&entry.task, &self.specialists, target, from)?
        {
            RouteDecision::Assign(next) => {
                entry
                    .task
                    .hand_off(&next)
                    .map_err(OrchestrationError::InvalidStateTransition)?;
                entry.cursor = PolicyCursor::new();

                tracing::info!(
                    task_id = %task_id,
                    from = %from,
                    to = %next,
                    depth = entry.task.handoffs,
                    "Task handed off"
                );
                self.emit(OrchestratorEvent::TaskHandedOff {
                    task_id,
                    from: from.to_string(),
                    to: next,
                    depth: entry.task.handoffs,
                });
                Ok(Flow::Continue)
            }
            RouteDecision::Clarify { reason } => {
                self.request_input(entry, reason)?;
                Ok(Flow::Pause)
            }
        }
    }

    fn request_input(&self, entry: &mut TaskEntry, reason: String) -> OrchestrationResult<()> {
        entry
            .task
            .await_input(reason.clone())
            .map_err(OrchestrationError::InvalidStateTransition)?;
        tracing::info!(task_id = %entry.task.id, reason = %reason, "Task awaiting input");
        self.emit(OrchestratorEvent::InputRequested {
            task_id: entry.task.id,
            reason,
        });
        Ok(())
    }

    fn resolve(&self, entry: &mut TaskEntry, outcome: TaskOutcome) -> OrchestrationResult<()> {
        let result = match &outcome {
            TaskOutcome::Answer { text } => entry.task.resolve(text.clone()),
            _ => Err(format!("Cannot resolve task {} with {:?}", entry.task.id, outcome)),
        };
        result.map_err(OrchestrationError::InvalidStateTransition)?;

        tracing::info!(task_id = %entry.task.id, "Task resolved");
        self.emit(OrchestratorEvent::TaskResolved {
            task_id: entry.task.id,
            outcome,
        });
        Ok(())
    }

    async fn fail(&self, entry: &mut TaskEntry, error: OrchestrationError) {
        tracing::warn!(task_id = %entry.task.id, error = %error, "Task failed");
        self.escalate(entry, error.escalation_reason().to_string(), Some(error.to_string()))
            .await;
    }

    async fn escalate(&self, entry: &mut TaskEntry, reason: String, error: Option<String>) {
        let task = &mut entry.task;
        if let Err(e) = task.escalate(reason.clone(), error.clone()) {
            tracing::error!(task_id = %task.id, error = %e, "Failed to escalate task");
            return;
        }

        // The handler has the ticket before anyone hears about it
        self.escalations
            .escalated(EscalationTicket {
                task_id: task.id,
                actor: task.actor.clone(),
                specialist: task.owner.clone(),
                reason: reason.clone(),
                error: error.clone(),
                escalated_at: Utc::now(),
                invocations: task.invocations.clone(),
            })
            .await;
        self.emit(OrchestratorEvent::TaskEscalated {
            task_id: task.id,
            reason,
            error,
        });
    }
}

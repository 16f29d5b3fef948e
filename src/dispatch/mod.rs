//! Task dispatch: capability registry, routing, specialist policies and
//! approval gating
//!
//! Tasks are routed to exactly one bounded specialist context at a time.
//! Specialists invoke capabilities through the approval gate, which parks
//! sensitive invocations until a human decides them.

pub mod approval;
pub mod capability;
pub mod error;
pub mod orchestrator;
pub mod router;
pub mod specialist;

pub use approval::{ApprovalGate, ApprovalRequest, ApprovalStatus, Decision, GateOutcome, Invocation};
pub use capability::{Capability, CapabilityRegistry, FieldKind, RegistryBuilder, Schema, Sensitivity};
pub use error::{OrchestrationError, OrchestrationResult};
pub use orchestrator::{
    EscalationHandler, EscalationTicket, LogEscalations, Orchestrator, OrchestratorConfig,
    OrchestratorEvent,
};
pub use router::{ExtractorConfig, FieldExtractor, RouteDecision, TaskRouter};
pub use specialist::{Predicate, RejectionPolicy, SpecialistContext, SpecialistSet, Step};

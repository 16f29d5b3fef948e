//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use concierge::config::Catalog;
use concierge::dispatch::{EscalationHandler, EscalationTicket, Orchestrator, OrchestratorConfig};
use concierge::executor::{CapabilityExecutor, ExecutionError, StaticExecutor};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Escalation handler that keeps every ticket
#[derive(Default)]
pub struct CollectEscalations(pub Mutex<Vec<EscalationTicket>>);

#[async_trait]
impl EscalationHandler for CollectEscalations {
    async fn escalated(&self, ticket: EscalationTicket) {
        self.0.lock().await.push(ticket);
    }
}

impl CollectEscalations {
    pub async fn tickets(&self) -> Vec<EscalationTicket> {
        self.0.lock().await.clone()
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub executor: Arc<StaticExecutor>,
    pub escalations: Arc<CollectEscalations>,
}

/// Orchestrator over the bundled customer service catalog and its fixtures
pub fn customer_service() -> Harness {
    let catalog = Catalog::bundled().expect("bundled catalog is valid");
    harness(catalog, OrchestratorConfig::default())
}

pub fn harness(catalog: Catalog, config: OrchestratorConfig) -> Harness {
    let executor = Arc::new(catalog.static_executor());
    let escalations = Arc::new(CollectEscalations::default());
    let orchestrator = catalog
        .into_orchestrator(executor.clone())
        .with_config(config)
        .with_escalation_handler(escalations.clone());

    Harness {
        orchestrator: Arc::new(orchestrator),
        executor,
        escalations,
    }
}

/// Backend that answers from fixtures after a fixed delay
pub struct SlowExecutor {
    inner: Arc<StaticExecutor>,
    delay: Duration,
}

#[async_trait]
impl CapabilityExecutor for SlowExecutor {
    async fn execute(&self, capability_id: &str, arguments: &Value) -> Result<Value, ExecutionError> {
        tokio::time::sleep(self.delay).await;
        self.inner.execute(capability_id, arguments).await
    }
}

/// Customer service orchestrator whose backend takes `delay` per invocation
pub fn slow_customer_service(delay: Duration) -> Harness {
    let catalog = Catalog::bundled().expect("bundled catalog is valid");
    let executor = Arc::new(catalog.static_executor());
    let escalations = Arc::new(CollectEscalations::default());
    let slow = Arc::new(SlowExecutor {
        inner: executor.clone(),
        delay,
    });
    let orchestrator = catalog
        .into_orchestrator(slow)
        .with_escalation_handler(escalations.clone());

    Harness {
        orchestrator: Arc::new(orchestrator),
        executor,
        escalations,
    }
}

/// Two specialists that keep handing the task to each other
pub fn ping_pong_catalog() -> Catalog {
    Catalog::from_json(
        r#"{
            "capabilities": [
                {"id": "noop", "keywords": ["noop"]}
            ],
            "specialists": [
                {
                    "name": "ping",
                    "keywords": ["ping"],
                    "capabilities": ["noop"],
                    "rules": [
                        {"name": "bounce", "when": {"type": "always"}, "steps": [{"type": "handoff", "target": "pong"}]}
                    ]
                },
                {
                    "name": "pong",
                    "keywords": ["pong"],
                    "capabilities": ["noop"],
                    "rules": [
                        {"name": "bounce", "when": {"type": "always"}, "steps": [{"type": "handoff", "target": "ping"}]}
                    ]
                }
            ]
        }"#,
    )
    .expect("ping-pong catalog is valid")
}

/// In-memory database with the schema applied
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

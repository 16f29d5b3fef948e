//! Server settings and the capability/specialist catalog

use clap::Parser;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::{
    Capability, CapabilityRegistry, ExtractorConfig, FieldExtractor, OrchestrationError,
    OrchestrationResult, Orchestrator, OrchestratorConfig, RegistryBuilder, SpecialistContext,
    SpecialistSet, TaskRouter,
};
use crate::executor::{CapabilityExecutor, HttpExecutor, StaticExecutor};

const BUNDLED_CATALOG: &str = include_str!("../catalog/customer_service.json");

#[derive(Parser, Debug, Clone)]
#[command(name = "concierge")]
#[command(about = "Task router with human approval gating for sensitive capabilities")]
#[command(version)]
pub struct Settings {
    /// SQLite database URL
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:concierge.db")]
    pub database_url: String,

    /// Address to listen on
    #[arg(long, env = "CONCIERGE_BIND", default_value = "0.0.0.0:3000")]
    pub bind: String,

    /// JSON catalog of capabilities and specialists (bundled catalog if absent)
    #[arg(long, env = "CONCIERGE_CATALOG")]
    pub catalog: Option<PathBuf>,

    /// Base URL of the capability service (catalog fixtures if absent)
    #[arg(long, env = "CONCIERGE_EXECUTOR_URL")]
    pub executor_url: Option<String>,

    /// Handoffs allowed per task before it is escalated
    #[arg(long, env = "CONCIERGE_MAX_HANDOFF_DEPTH", default_value_t = 3)]
    pub max_handoff_depth: usize,

    /// Seconds a resolved or escalated task stays in memory after its last change
    #[arg(long, env = "CONCIERGE_TASK_RETENTION_SECS", default_value_t = 900)]
    pub task_retention_secs: u64,
}

impl Settings {
    pub fn load_catalog(&self) -> anyhow::Result<Catalog> {
        match &self.catalog {
            Some(path) => Catalog::load(path),
            None => Ok(Catalog::bundled()?),
        }
    }

    /// The execution backend selected by the settings
    pub fn executor(&self, catalog: &Catalog) -> Arc<dyn CapabilityExecutor> {
        match &self.executor_url {
            Some(url) => {
                tracing::info!(url = %url, "Using HTTP capability backend");
                Arc::new(HttpExecutor::new(url.clone()))
            }
            None => {
                tracing::info!("Using catalog fixtures as capability backend");
                Arc::new(catalog.static_executor())
            }
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_handoff_depth: self.max_handoff_depth,
            retention: Duration::from_secs(self.task_retention_secs),
            ..Default::default()
        }
    }
}

/// On-disk catalog format
#[derive(Debug, Deserialize)]
struct CatalogFile {
    capabilities: Vec<Capability>,
    specialists: Vec<SpecialistContext>,
    #[serde(default)]
    extractors: Vec<ExtractorConfig>,
    /// Canned capability results for the static backend
    #[serde(default)]
    fixtures: HashMap<String, Value>,
}

/// Validated catalog, ready to build an orchestrator from
#[derive(Debug, Clone)]
pub struct Catalog {
    pub registry: CapabilityRegistry,
    pub specialists: SpecialistSet,
    pub router: TaskRouter,
    pub fixtures: HashMap<String, Value>,
}

impl Catalog {
    pub fn from_json(json: &str) -> OrchestrationResult<Self> {
        let file: CatalogFile =
            serde_json::from_str(json).map_err(|e| OrchestrationError::InvalidCatalog(e.to_string()))?;

        let mut builder = RegistryBuilder::new();
        for capability in file.capabilities {
            builder.register(capability)?;
        }
        let registry = builder.seal();

        for id in file.fixtures.keys() {
            registry.lookup(id)?;
        }

        let specialists = SpecialistSet::new(file.specialists, &registry)?;
        let extractors = file
            .extractors
            .iter()
            .map(FieldExtractor::from_config)
            .collect::<OrchestrationResult<Vec<_>>>()?;

        tracing::debug!(
            capabilities = registry.len(),
            specialists = specialists.len(),
            extractors = extractors.len(),
            "Catalog loaded"
        );

        Ok(Self {
            router: TaskRouter::new(registry.clone(), extractors),
            registry,
            specialists,
            fixtures: file.fixtures,
        })
    }

    /// The customer service catalog shipped with the server
    pub fn bundled() -> OrchestrationResult<Self> {
        Self::from_json(BUNDLED_CATALOG)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read catalog {}: {}", path.display(), e))?;
        Ok(Self::from_json(&json)?)
    }

    pub fn static_executor(&self) -> StaticExecutor {
        StaticExecutor::new(self.fixtures.clone())
    }

    pub fn into_orchestrator(self, executor: Arc<dyn CapabilityExecutor>) -> Orchestrator {
        Orchestrator::new(self.registry, self.specialists, self.router, executor)
    }
}

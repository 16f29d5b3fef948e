//! Capability execution backends
//!
//! The core never runs side effects itself: every capability invocation goes
//! through a [`CapabilityExecutor`]. Two backends ship with the server: an HTTP
//! bridge that forwards invocations to a tool service, and a static backend that
//! answers from catalog fixtures.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

/// Failure reported by (or on the way to) a capability backend
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionError {
    #[error("Backend error: {message}")]
    Backend { message: String },

    #[error("Invalid arguments for {capability}: {reason}")]
    InvalidArguments { capability: String, reason: String },

    #[error("Invalid output from {capability}: {reason}")]
    InvalidOutput { capability: String, reason: String },

    #[error("No backend available for capability {capability}")]
    Unavailable { capability: String },
}

impl ExecutionError {
    pub fn backend(message: impl Into<String>) -> Self {
        ExecutionError::Backend {
            message: message.into(),
        }
    }
}

/// Executes a capability with already-validated arguments
#[async_trait]
pub trait CapabilityExecutor: Send + Sync {
    async fn execute(&self, capability_id: &str, arguments: &Value) -> Result<Value, ExecutionError>;
}

/// HTTP bridge to an external tool service
///
/// Each invocation is a `POST {base_url}/capabilities/{id}` with the argument
/// object as JSON body. A 2xx JSON response is the capability result.
pub struct HttpExecutor {
    client: Client,
    base_url: String,
}

impl HttpExecutor {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl CapabilityExecutor for HttpExecutor {
    async fn execute(&self, capability_id: &str, arguments: &Value) -> Result<Value, ExecutionError> {
        let response = self
            .client
            .post(format!("{}/capabilities/{}", self.base_url, capability_id))
            .json(arguments)
            .send()
            .await
            .map_err(|e| ExecutionError::backend(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ExecutionError::backend(format!(
                "{} returned {} - {}",
                capability_id, status, text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ExecutionError::backend(format!("Failed to parse result: {}", e)))
    }
}

/// Backend answering every capability with a fixed result
///
/// Calls are remembered so callers can check what actually ran.
#[derive(Default)]
pub struct StaticExecutor {
    responses: HashMap<String, Value>,
    failures: HashMap<String, String>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl StaticExecutor {
    pub fn new(responses: HashMap<String, Value>) -> Self {
        Self {
            responses,
            failures: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Set the result returned for a capability
    pub fn with_response(mut self, capability_id: impl Into<String>, result: Value) -> Self {
        self.responses.insert(capability_id.into(), result);
        self
    }

    /// Make a capability fail with a backend error
    pub fn with_failure(mut self, capability_id: impl Into<String>, message: impl Into<String>) -> Self {
        self.failures.insert(capability_id.into(), message.into());
        self
    }

    /// Invocations executed so far, in order
    pub async fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().await.clone()
    }

    /// Number of times a capability was executed
    pub async fn call_count(&self, capability_id: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id == capability_id)
            .count()
    }
}

#[async_trait]
impl CapabilityExecutor for StaticExecutor {
    async fn execute(&self, capability_id: &str, arguments: &Value) -> Result<Value, ExecutionError> {
        self.calls
            .lock()
            .await
            .push((capability_id.to_string(), arguments.clone()));

        if let Some(message) = self.failures.get(capability_id) {
            return Err(ExecutionError::backend(message.clone()));
        }

        self.responses
            .get(capability_id)
            .cloned()
            .ok_or_else(|| ExecutionError::Unavailable {
                capability: capability_id.to_string(),
            })
    }
}

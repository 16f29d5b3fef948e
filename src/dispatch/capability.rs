//! Capability registry
//!
//! Declares the side-effecting operations available to specialists, each with
//! typed input/output schemas and a sensitivity tier. Capabilities are
//! registered on a [`RegistryBuilder`] and become immutable once sealed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::error::{OrchestrationError, OrchestrationResult};

/// Sensitivity tier of a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    /// Executes immediately
    #[default]
    Normal,
    /// Suspends the task until an external approve/reject decision
    ApprovalRequired,
}

impl Sensitivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sensitivity::Normal => "normal",
            Sensitivity::ApprovalRequired => "approval_required",
        }
    }
}

impl std::str::FromStr for Sensitivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Sensitivity::Normal),
            "approval_required" => Ok(Sensitivity::ApprovalRequired),
            _ => Err(format!("Invalid sensitivity tier: {}", s)),
        }
    }
}

/// JSON type expected for a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::Any => "any",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default = "default_required")]
    pub required: bool,
}

/// Object schema for capability arguments or results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required field
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    /// Add an optional field
    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Check a value against the schema. Null counts as absent.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        let object = value
            .as_object()
            .ok_or_else(|| "expected a JSON object".to_string())?;

        for spec in &self.fields {
            match object.get(&spec.name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        return Err(format!("missing field {}", spec.name));
                    }
                }
                Some(v) if !spec.kind.accepts(v) => {
                    return Err(format!(
                        "field {} must be of type {}",
                        spec.name,
                        spec.kind.as_str()
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Numeric argument bound under which an approval-required capability runs
/// without approval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalThreshold {
    pub field: String,
    pub above: f64,
}

/// A side-effecting operation available to specialists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input: Schema,
    #[serde(default)]
    pub output: Schema,
    #[serde(default)]
    pub sensitivity: Sensitivity,
    /// Words that suggest a task needs this capability
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_threshold: Option<ApprovalThreshold>,
}

impl Capability {
    pub fn new(id: impl Into<String>, sensitivity: Sensitivity) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            input: Schema::default(),
            output: Schema::default(),
            sensitivity,
            keywords: Vec::new(),
            approval_threshold: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input(mut self, schema: Schema) -> Self {
        self.input = schema;
        self
    }

    pub fn with_output(mut self, schema: Schema) -> Self {
        self.output = schema;
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_threshold(mut self, field: impl Into<String>, above: f64) -> Self {
        self.approval_threshold = Some(ApprovalThreshold {
            field: field.into(),
            above,
        });
        self
    }

    /// Whether invoking with these arguments must wait for a decision
    pub fn requires_approval(&self, arguments: &Value) -> bool {
        if self.sensitivity == Sensitivity::Normal {
            return false;
        }
        match &self.approval_threshold {
            None => true,
            // A missing or non-numeric bound field stays gated
            Some(threshold) => arguments
                .get(&threshold.field)
                .and_then(Value::as_f64)
                .map_or(true, |v| v > threshold.above),
        }
    }
}

/// Mutable registry used while the catalog is being assembled
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    capabilities: Vec<Capability>,
    index: HashMap<String, usize>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability; identifiers must be unique
    pub fn register(&mut self, capability: Capability) -> OrchestrationResult<()> {
        if self.index.contains_key(&capability.id) {
            return Err(OrchestrationError::DuplicateCapability(capability.id));
        }
        self.index
            .insert(capability.id.clone(), self.capabilities.len());
        self.capabilities.push(capability);
        Ok(())
    }

    /// Freeze the registry. Nothing can be registered afterwards.
    pub fn seal(self) -> CapabilityRegistry {
        tracing::debug!(count = self.capabilities.len(), "Capability registry sealed");
        CapabilityRegistry {
            inner: Arc::new(RegistryInner {
                capabilities: self.capabilities,
                index: self.index,
            }),
        }
    }
}

#[derive(Debug)]
struct RegistryInner {
    capabilities: Vec<Capability>,
    index: HashMap<String, usize>,
}

/// Sealed, read-only capability registry
///
/// Cheaply cloneable; clones share the same immutable table, so no locking
/// is needed while tasks are routed concurrently.
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    inner: Arc<RegistryInner>,
}

impl CapabilityRegistry {
    /// Build and seal a registry in one go
    pub fn from_capabilities(
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> OrchestrationResult<Self> {
        let mut builder = RegistryBuilder::new();
        for capability in capabilities {
            builder.register(capability)?;
        }
        Ok(builder.seal())
    }

    pub fn lookup(&self, id: &str) -> OrchestrationResult<&Capability> {
        self.inner
            .index
            .get(id)
            .map(|&i| &self.inner.capabilities[i])
            .ok_or_else(|| OrchestrationError::UnknownCapability(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.index.contains_key(id)
    }

    /// Capabilities in registration order, optionally restricted to one tier
    pub fn list(&self, tier: Option<Sensitivity>) -> Capabilities<'_> {
        Capabilities {
            inner: self.inner.capabilities.iter(),
            tier,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.capabilities.is_empty()
    }
}

/// Lazy iterator over registered capabilities; clone it to restart
#[derive(Debug, Clone)]
pub struct Capabilities<'a> {
    inner: std::slice::Iter<'a, Capability>,
    tier: Option<Sensitivity>,
}

impl<'a> Iterator for Capabilities<'a> {
    type Item = &'a Capability;

    fn next(&mut self) -> Option<Self::Item> {
        let tier = self.tier;
        self.inner
            .find(|c| tier.map_or(true, |t| c.sensitivity == t))
    }
}

//! Specialist contexts and their declarative policies
//!
//! A specialist owns a fixed subset of capabilities and an ordered list of
//! rules. The first rule whose predicate matches the task is selected and its
//! steps are walked with a [`PolicyCursor`], which can be parked at the
//! approval gate and picked up again later without re-running earlier steps.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use super::capability::CapabilityRegistry;
use super::error::{OrchestrationError, OrchestrationResult};
use super::router::mentions;
use crate::models::TaskPayload;

/// Condition over a task payload selecting a policy rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    #[default]
    Always,
    /// Text mentions at least one of the phrases
    Mentions { any: Vec<String> },
    HasField { field: String },
    /// Numeric field strictly greater than `value`
    FieldAbove { field: String, value: f64 },
    All { of: Vec<Predicate> },
    Any { of: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    pub fn matches(&self, payload: &TaskPayload) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Mentions { any } => any.iter().any(|p| mentions(&payload.text, p)),
            Predicate::HasField { field } => payload.has_field(field),
            Predicate::FieldAbove { field, value } => payload
                .field(field)
                .and_then(as_number)
                .map_or(false, |v| v > *value),
            Predicate::All { of } => of.iter().all(|p| p.matches(payload)),
            Predicate::Any { of } => of.iter().any(|p| p.matches(payload)),
            Predicate::Not { predicate } => !predicate.matches(payload),
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// What to do when an approval-gated invocation is rejected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RejectionPolicy {
    Resolve { message: String },
    Escalate { reason: String },
    /// Skip the rejected step and carry on with the rule
    Continue,
}

/// One step of a policy rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Invoke {
        capability: String,
        /// Argument templates, see [`render`]
        #[serde(default)]
        args: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_rejected: Option<RejectionPolicy>,
    },
    Respond {
        template: String,
    },
    Handoff {
        target: String,
    },
    Escalate {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,
    #[serde(default)]
    pub when: Predicate,
    pub steps: Vec<Step>,
}

/// Bounded context with its own capability subset and policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialistContext {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Phrases the router scores tasks against
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Capabilities this specialist may invoke, in declaration order
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Payload fields that must be present before the specialist starts
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    /// Step taken when no rule matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Step>,
}

/// Next thing the orchestrator should do for a task
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Invoke { capability: String, arguments: Value },
    Handoff { target: String },
    Escalate { reason: String },
    Resolve { answer: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    Rule(usize),
    Fallback,
}

/// Resume point inside a specialist policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyCursor {
    pub selection: Option<Selection>,
    pub step: usize,
    /// Capability results by capability id
    pub bindings: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_capability: Option<String>,
}

impl PolicyCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a capability result and move past the invoke step
    pub fn complete(&mut self, capability: &str, result: Value) {
        self.bindings.insert(capability.to_string(), result);
        self.last_capability = Some(capability.to_string());
        self.step += 1;
    }

    pub fn skip(&mut self) {
        self.step += 1;
    }
}

impl SpecialistContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            keywords: Vec::new(),
            capabilities: Vec::new(),
            required_fields: Vec::new(),
            rules: Vec::new(),
            fallback: None,
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_required_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_rule(mut self, name: impl Into<String>, when: Predicate, steps: Vec<Step>) -> Self {
        self.rules.push(PolicyRule {
            name: name.into(),
            when,
            steps,
        });
        self
    }

    pub fn with_fallback(mut self, step: Step) -> Self {
        self.fallback = Some(step);
        self
    }

    pub fn permits(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// First required field the payload is missing
    pub fn missing_field(&self, payload: &TaskPayload) -> Option<&str> {
        self.required_fields
            .iter()
            .find(|f| !payload.has_field(f))
            .map(String::as_str)
    }

    fn select(&self, payload: &TaskPayload) -> Selection {
        self.rules
            .iter()
            .position(|rule| rule.when.matches(payload))
            .map_or(Selection::Fallback, Selection::Rule)
    }

    fn current_step(&self, cursor: &PolicyCursor) -> Option<Step> {
        match cursor.selection? {
            Selection::Rule(i) => self.rules.get(i)?.steps.get(cursor.step).cloned(),
            Selection::Fallback if cursor.step == 0 => {
                Some(self.fallback.clone().unwrap_or_else(|| Step::Escalate {
                    reason: "no applicable policy".to_string(),
                }))
            }
            Selection::Fallback => None,
        }
    }

    /// Name of the selected rule, for logging
    pub fn rule_name(&self, cursor: &PolicyCursor) -> &str {
        match cursor.selection {
            Some(Selection::Rule(i)) => self.rules.get(i).map_or("fallback", |r| r.name.as_str()),
            _ => "fallback",
        }
    }

    /// Advance the policy to its next action
    ///
    /// The cursor only moves past an invoke step when the caller reports the
    /// result with [`PolicyCursor::complete`], so a suspended invocation is
    /// resumed at the same step.
    pub fn handle(&self, payload: &TaskPayload, cursor: &mut PolicyCursor) -> OrchestrationResult<Action> {
        if cursor.selection.is_none() {
            cursor.selection = Some(self.select(payload));
            cursor.step = 0;
        }

        let Some(step) = self.current_step(cursor) else {
            return Ok(Action::Resolve {
                answer: self.summary(cursor),
            });
        };

        match step {
            Step::Invoke {
                capability, args, ..
            } => {
                if !self.permits(&capability) {
                    return Err(OrchestrationError::CapabilityNotPermitted {
                        specialist: self.name.clone(),
                        capability,
                    });
                }
                let arguments = render_args(&args, payload, &cursor.bindings);
                Ok(Action::Invoke {
                    capability,
                    arguments,
                })
            }
            Step::Respond { template } => Ok(Action::Resolve {
                answer: render_text(&template, payload, &cursor.bindings),
            }),
            Step::Handoff { target } => Ok(Action::Handoff { target }),
            Step::Escalate { reason } => Ok(Action::Escalate {
                reason: render_text(&reason, payload, &cursor.bindings),
            }),
        }
    }

    /// How to continue after the invocation at the cursor was rejected
    pub fn on_rejected(&self, cursor: &PolicyCursor) -> RejectionPolicy {
        match self.current_step(cursor) {
            Some(Step::Invoke {
                on_rejected: Some(policy),
                ..
            }) => policy,
            Some(Step::Invoke { capability, .. }) => RejectionPolicy::Resolve {
                message: format!("{} rejected", capability),
            },
            _ => RejectionPolicy::Resolve {
                message: "request rejected".to_string(),
            },
        }
    }

    fn summary(&self, cursor: &PolicyCursor) -> String {
        match cursor
            .last_capability
            .as_ref()
            .and_then(|c| cursor.bindings.get(c).map(|r| (c, r)))
        {
            Some((capability, result)) => {
                format!("{} handled the request: {} returned {}", self.name, capability, result)
            }
            None => format!("{} handled the request", self.name),
        }
    }
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\}").expect("placeholder pattern is valid")
    })
}

/// Resolve `text`, a payload field, or a dotted path into a capability result
fn lookup(path: &str, payload: &TaskPayload, bindings: &Map<String, Value>) -> Option<Value> {
    let mut segments = path.split('.');
    let head = segments.next()?;

    let mut current = if head == "text" {
        Value::String(payload.text.clone())
    } else if let Some(value) = payload.field(head) {
        value.clone()
    } else {
        bindings.get(head)?.clone()
    };

    for segment in segments {
        current = match current {
            Value::Object(mut map) => map.remove(segment)?,
            Value::Array(mut items) => {
                let index: usize = segment.parse().ok()?;
                if index >= items.len() {
                    return None;
                }
                items.swap_remove(index)
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Render a template into a JSON value
///
/// A template that is exactly one placeholder keeps the referenced value's
/// type (null when missing); anything else becomes a string.
pub fn render(template: &str, payload: &TaskPayload, bindings: &Map<String, Value>) -> Value {
    if let Some(caps) = placeholder().captures(template) {
        if caps.get(0).map(|m| m.as_str()) == Some(template) {
            return lookup(&caps[1], payload, bindings).unwrap_or(Value::Null);
        }
    }
    Value::String(render_text(template, payload, bindings))
}

/// Render a template into text; missing placeholders become empty
pub fn render_text(template: &str, payload: &TaskPayload, bindings: &Map<String, Value>) -> String {
    placeholder()
        .replace_all(template, |caps: &regex::Captures| {
            match lookup(&caps[1], payload, bindings) {
                Some(Value::String(s)) => s,
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            }
        })
        .into_owned()
}

fn render_value(value: &Value, payload: &TaskPayload, bindings: &Map<String, Value>) -> Value {
    match value {
        Value::String(template) => render(template, payload, bindings),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| render_value(v, payload, bindings))
                .collect(),
        ),
        Value::Object(map) => render_args(map, payload, bindings),
        other => other.clone(),
    }
}

fn render_args(args: &Map<String, Value>, payload: &TaskPayload, bindings: &Map<String, Value>) -> Value {
    Value::Object(
        args.iter()
            .map(|(k, v)| (k.clone(), render_value(v, payload, bindings)))
            .collect(),
    )
}

/// Validated, immutable set of specialists in declaration order
#[derive(Debug, Clone)]
pub struct SpecialistSet {
    specialists: Arc<Vec<SpecialistContext>>,
}

impl SpecialistSet {
    /// Check names, capabilities and handoff targets against the registry
    pub fn new(
        specialists: Vec<SpecialistContext>,
        registry: &CapabilityRegistry,
    ) -> OrchestrationResult<Self> {
        let mut names = HashSet::new();
        for specialist in &specialists {
            if !names.insert(specialist.name.as_str()) {
                return Err(OrchestrationError::InvalidCatalog(format!(
                    "duplicate specialist {}",
                    specialist.name
                )));
            }
            for capability in &specialist.capabilities {
                registry.lookup(capability)?;
            }
        }

        for specialist in &specialists {
            let steps = specialist
                .rules
                .iter()
                .flat_map(|r| r.steps.iter())
                .chain(specialist.fallback.iter());
            for step in steps {
                match step {
                    Step::Handoff { target } if !names.contains(target.as_str()) => {
                        return Err(OrchestrationError::UnknownSpecialist(target.clone()));
                    }
                    Step::Invoke { capability, .. } => {
                        registry.lookup(capability)?;
                    }
                    _ => {}
                }
            }
        }

        Ok(Self {
            specialists: Arc::new(specialists),
        })
    }

    pub fn get(&self, name: &str) -> Option<&SpecialistContext> {
        self.specialists.iter().find(|s| s.name == name)
    }

    pub fn lookup(&self, name: &str) -> OrchestrationResult<&SpecialistContext> {
        self.get(name)
            .ok_or_else(|| OrchestrationError::UnknownSpecialist(name.to_string()))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SpecialistContext> {
        self.specialists.iter()
    }

    pub fn len(&self) -> usize {
        self.specialists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specialists.is_empty()
    }
}

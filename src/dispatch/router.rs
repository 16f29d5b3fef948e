//! Deterministic task routing
//!
//! Routing never invokes a capability. A task is scored against every
//! specialist's keywords; ties go to the specialist that covers the task's
//! required capability, then to the narrowest capability set, then to
//! declaration order.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::cmp::Reverse;

use super::capability::CapabilityRegistry;
use super::error::{OrchestrationError, OrchestrationResult};
use super::specialist::{SpecialistContext, SpecialistSet};
use crate::models::{Task, TaskPayload};

/// Case-insensitive whole-word (or whole-phrase) match
pub(crate) fn mentions(text: &str, phrase: &str) -> bool {
    let phrase = phrase.trim().to_lowercase();
    if phrase.is_empty() {
        return false;
    }
    let text = text.to_lowercase();

    text.match_indices(&phrase).any(|(start, matched)| {
        let end = start + matched.len();
        let before = text[..start].chars().next_back();
        let after = text[end..].chars().next();
        !before.map_or(false, char::is_alphanumeric) && !after.map_or(false, char::is_alphanumeric)
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    pub field: String,
    pub pattern: String,
    #[serde(default)]
    pub numeric: bool,
}

/// Pulls a structured field out of free text with a regex
///
/// The first capture group is used when the pattern has one, otherwise the
/// whole match.
#[derive(Debug, Clone)]
pub struct FieldExtractor {
    pub field: String,
    pattern: Regex,
    numeric: bool,
}

impl FieldExtractor {
    pub fn new(field: impl Into<String>, pattern: &str, numeric: bool) -> OrchestrationResult<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| OrchestrationError::InvalidCatalog(format!("bad extractor pattern: {}", e)))?;
        Ok(Self {
            field: field.into(),
            pattern,
            numeric,
        })
    }

    pub fn from_config(config: &ExtractorConfig) -> OrchestrationResult<Self> {
        Self::new(config.field.clone(), &config.pattern, config.numeric)
    }

    pub fn extract(&self, text: &str) -> Option<Value> {
        let caps = self.pattern.captures(text)?;
        let matched = caps.get(1).or_else(|| caps.get(0))?.as_str();

        if !self.numeric {
            return Some(Value::String(matched.to_string()));
        }
        let number: f64 = matched.replace(',', "").parse().ok()?;
        if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
            Some(Value::from(number as i64))
        } else {
            Number::from_f64(number).map(Value::Number)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Assign(String),
    Clarify { reason: String },
}

#[derive(Debug, Clone)]
pub struct TaskRouter {
    registry: CapabilityRegistry,
    extractors: Vec<FieldExtractor>,
}

impl TaskRouter {
    pub fn new(registry: CapabilityRegistry, extractors: Vec<FieldExtractor>) -> Self {
        Self {
            registry,
            extractors,
        }
    }

    /// Fill in payload fields that can be read off the task text
    pub fn enrich(&self, payload: &mut TaskPayload) {
        for extractor in &self.extractors {
            if payload.has_field(&extractor.field) {
                continue;
            }
            if let Some(value) = extractor.extract(&payload.text) {
                payload.fields.insert(extractor.field.clone(), value);
            }
        }
    }

    /// The capability the task most likely needs
    ///
    /// An explicit `capability` field wins; otherwise the registered capability
    /// with the most keyword hits, earliest registration breaking ties.
    pub fn required_capability(&self, payload: &TaskPayload) -> Option<String> {
        if let Some(id) = payload.field("capability").and_then(Value::as_str) {
            if self.registry.contains(id) {
                return Some(id.to_string());
            }
        }

        let mut best: Option<(&str, usize)> = None;
        for capability in self.registry.list(None) {
            let hits = score(&capability.keywords, &payload.text);
            if hits > 0 && best.map_or(true, |(_, b)| hits > b) {
                best = Some((&capability.id, hits));
            }
        }
        best.map(|(id, _)| id.to_string())
    }

    /// Pick one specialist for the task, ask for clarification, or fail
    pub fn route(
        &self,
        task: &Task,
        specialists: &SpecialistSet,
        exclude: &[&str],
    ) -> OrchestrationResult<RouteDecision> {
        let payload = &task.payload;
        if payload.is_blank() {
            return Ok(RouteDecision::Clarify {
                reason: "task payload is empty".to_string(),
            });
        }

        let required = self.required_capability(payload);
        let chosen = specialists
            .iter()
            .enumerate()
            .filter(|(_, s)| !exclude.contains(&s.name.as_str()))
            .map(|(index, s)| {
                let relevance = score(&s.keywords, &payload.text);
                let covers = required.as_deref().map_or(false, |c| s.permits(c));
                (s, relevance, covers, index)
            })
            .filter(|(_, relevance, _, _)| *relevance > 0)
            .min_by_key(|(s, relevance, covers, index)| {
                (Reverse(*relevance), Reverse(*covers), s.capabilities.len(), *index)
            })
            .map(|(s, ..)| s)
            .ok_or(OrchestrationError::UnroutableTask { task_id: task.id })?;

        tracing::debug!(
            task_id = %task.id,
            specialist = %chosen.name,
            required = ?required,
            "Task routed"
        );
        Ok(assign(chosen, payload))
    }

    /// Route a handoff: the requested target wins unless it is the specialist
    /// handing off, otherwise normal routing without the previous owner
    pub fn route_handoff(
        &self,
        task: &Task,
        specialists: &SpecialistSet,
        target: &str,
        previous: &str,
    ) -> OrchestrationResult<RouteDecision> {
        match specialists.get(target) {
            Some(specialist) if target != previous => Ok(assign(specialist, &task.payload)),
            _ => self.route(task, specialists, &[previous]),
        }
    }
}

fn score(keywords: &[String], text: &str) -> usize {
    keywords.iter().filter(|k| mentions(text, k)).count()
}

fn assign(specialist: &SpecialistContext, payload: &TaskPayload) -> RouteDecision {
    match specialist.missing_field(payload) {
        Some(field) => RouteDecision::Clarify {
            reason: format!("missing {}", field),
        },
        None => RouteDecision::Assign(specialist.name.clone()),
    }
}

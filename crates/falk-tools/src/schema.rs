// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::tool::ParamMap;

/// Expected JSON shape of one tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    List,
    Object,
}

impl ParamKind {
    fn json_type(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::List => "array",
            ParamKind::Object => "object",
        }
    }

    /// Whether `value` is acceptable for this kind.  Integers are accepted
    /// where numbers are expected.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::List => value.is_array(),
            ParamKind::Object => value.is_object(),
        }
    }
}

/// Declared spec of a single parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub kind: ParamKind,
    pub required: bool,
    pub description: String,
}

impl ParamSpec {
    pub fn required(kind: ParamKind, description: impl Into<String>) -> Self {
        Self { kind, required: true, description: description.into() }
    }

    pub fn optional(kind: ParamKind, description: impl Into<String>) -> Self {
        Self { kind, required: false, description: description.into() }
    }
}

/// Coarse tool grouping used for task-based disclosure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolCategory {
    Filesystem,
    Command,
    Web,
    Browser,
    Vcs,
}

/// Task routing classes a request can be assigned to.
///
/// Each task type maps to the categories worth disclosing; the per-tier
/// count limit is applied on top of this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskType {
    Chat,
    Code,
    Browser,
    #[default]
    General,
}

impl TaskType {
    pub fn categories(&self) -> &'static [ToolCategory] {
        match self {
            TaskType::Chat => &[],
            TaskType::Code => {
                &[ToolCategory::Filesystem, ToolCategory::Command, ToolCategory::Vcs]
            }
            TaskType::Browser => {
                &[ToolCategory::Browser, ToolCategory::Web, ToolCategory::Filesystem]
            }
            TaskType::General => &[
                ToolCategory::Filesystem,
                ToolCategory::Command,
                ToolCategory::Web,
                ToolCategory::Browser,
                ToolCategory::Vcs,
            ],
        }
    }
}

/// Full declaration of a tool: name, description, parameter schema, category.
/// Process-constant; a name maps to at most one handler in the registry.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: BTreeMap<String, ParamSpec>,
    pub category: ToolCategory,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: ToolCategory,
        parameters: impl IntoIterator<Item = (&'static str, ParamSpec)>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            category,
            parameters: parameters
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    /// Validate `params` against this schema.  Assumes normalization and
    /// coercion already ran; unknown parameters are tolerated (models pad
    /// calls with extras), missing required or mistyped ones are not.
    pub fn validate(&self, params: &ParamMap) -> Result<(), String> {
        for (name, spec) in &self.parameters {
            match params.get(name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        return Err(format!("missing required parameter '{name}'"));
                    }
                }
                Some(value) => {
                    if !spec.kind.accepts(value) {
                        return Err(format!(
                            "parameter '{name}' must be {}, got {value}",
                            spec.kind.json_type()
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Render as a JSON Schema object for grammar-constrained engines and
    /// full-style tool prompts.
    pub fn json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for (name, spec) in &self.parameters {
            properties.insert(
                name.clone(),
                json!({ "type": spec.kind.json_type(), "description": spec.description }),
            );
            if spec.required {
                required.push(Value::String(name.clone()));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false
        })
    }

    /// One-line rendering for compact tool prompts:
    /// `name(param, param?): first sentence of the description`.
    pub fn compact_hint(&self) -> String {
        let params: Vec<String> = self
            .parameters
            .iter()
            .map(|(name, spec)| {
                if spec.required {
                    name.clone()
                } else {
                    format!("{name}?")
                }
            })
            .collect();
        let first_sentence = self
            .description
            .split(['.', '\n'])
            .next()
            .unwrap_or("")
            .trim();
        format!("{}({}): {first_sentence}", self.name, params.join(", "))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

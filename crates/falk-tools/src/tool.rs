// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::ToolDefinition;

/// JSON object map used for tool parameters throughout the pipeline.
pub type ParamMap = serde_json::Map<String, Value>;

/// A single tool invocation requested by the model.
///
/// Produced either by the text parser (fenced / inline JSON) or from a
/// native function-call record; both forms flow through the same
/// normalization, repair, dedup, and cap pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub params: ParamMap,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, params: ParamMap) -> Self {
        Self { name: name.into(), params }
    }

    /// Dedup signature: tool name plus canonical parameter serialization.
    /// `serde_json::Map` preserves insertion order, so two calls with the
    /// same keys in different order get distinct signatures; models repeat
    /// calls verbatim, which is the case dedup exists for.
    pub fn signature(&self) -> String {
        format!("{}:{}", self.name, Value::Object(self.params.clone()))
    }

    /// Borrow a string parameter.
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// Failure kinds a tool invocation can produce.
///
/// This is the registry/pipeline half of the error taxonomy; engine errors
/// (`context_overflow`, `rate_limited`, …) live in `falk-model`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Parameters failed validation and could not be repaired.
    SchemaViolation,
    /// The permission gate or a safety rule rejected the call.
    PermissionDenied,
    /// The call exceeded its time bound.
    Timeout,
    /// Non-failure: a write was postponed until gathered data lands.
    Deferred,
    /// Navigation to a throttled domain; final for this request.
    DomainBlocked,
    /// The handler itself failed.
    ToolExecution,
}

/// The result of executing (or declining to execute) a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolResult {
    Ok {
        /// Tool-specific payload; always serializable.  Well-known long keys
        /// (`output`, `content`, `stdout`, `html`, `text`) are subject to
        /// size-cap truncation by the executor.
        payload: Value,
    },
    Err {
        kind: ErrorKind,
        message: String,
    },
}

impl ToolResult {
    pub fn ok(payload: Value) -> Self {
        Self::Ok { payload }
    }

    /// Successful result whose payload is a single `output` string.
    pub fn text(output: impl Into<String>) -> Self {
        Self::Ok { payload: serde_json::json!({ "output": output.into() }) }
    }

    pub fn err(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Err { kind, message: message.into() }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Ok { payload } => Some(payload),
            Self::Err { .. } => None,
        }
    }

    pub fn error(&self) -> Option<(ErrorKind, &str)> {
        match self {
            Self::Ok { .. } => None,
            Self::Err { kind, message } => Some((*kind, message)),
        }
    }

    /// Short status tag used in rendered result blocks.
    pub fn status_tag(&self) -> &'static str {
        if self.is_ok() {
            "OK"
        } else {
            "FAIL"
        }
    }
}

/// Describes the shape of a tool's text output for context-aware truncation.
///
/// When a rendered result exceeds its character budget, the budget manager
/// uses this category to pick the extraction strategy.  Each tool declares
/// its own category; nothing downstream hard-codes tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Terminal / process output: keep head and tail so both the command
    /// preamble and the final result stay visible.
    HeadTail,
    /// Ordered match list: keep the leading matches.
    MatchList,
    /// File content: balanced head + tail window.
    FileContent,
    /// Generic text: hard-truncate at a line boundary.
    #[default]
    Generic,
}

/// Trait that every built-in and port-backed tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Schema and metadata; process-constant.
    fn definition(&self) -> ToolDefinition;

    /// Output shape for context-aware truncation.
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }

    /// Execute with already normalized, sanitized, validated parameters.
    async fn execute(&self, params: &ParamMap) -> ToolResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

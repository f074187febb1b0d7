// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Conservative token estimate: ceil(len / 3.5).
///
/// Real tokenizers yield roughly 3–3.5 chars per token on source code, so
/// this over-estimates slightly; the budget manager would rather compact a
/// turn early than overflow the window.
pub fn est_tokens(text: &str) -> usize {
    (text.len() * 2).div_ceil(7)
}

// ─── Message types ────────────────────────────────────────────────────────────

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: text.into() }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: text.into() }
    }

    /// Approximate token count used for context management.
    pub fn approx_tokens(&self) -> usize {
        est_tokens(&self.content).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

// ─── Prompt assembly ──────────────────────────────────────────────────────────

/// A fully assembled prompt, split along the cache boundary.
///
/// `system_context` is stable across iterations within one request so that a
/// KV-cache-backed engine can reuse the prefix; `user_turn` carries the
/// dynamic context and tool results and changes every iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptAssembly {
    pub system_context: String,
    pub user_turn: String,
}

impl PromptAssembly {
    pub fn approx_tokens(&self) -> usize {
        est_tokens(&self.system_context) + est_tokens(&self.user_turn)
    }
}

// ─── Generation options ───────────────────────────────────────────────────────

/// A tool schema handed to a grammar-capable engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Per-call sampling and constraint options.
#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub repeat_penalty: Option<f32>,
    pub seed: Option<u64>,
    pub stream: bool,
    /// Attached images as data URLs; ignored by engines without vision.
    pub images: Vec<String>,
    /// When set, the engine must constrain decoding to free text or
    /// well-formed calls to one of these tools.  Malformed JSON becomes
    /// structurally impossible.
    pub functions: Option<Vec<ToolSchema>>,
    /// Skip any provider-side fallback model selection.
    pub no_fallback: bool,
}

/// Request sent to a model engine.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub assembly: PromptAssembly,
    /// Prior turns; the engine renders these between the system context and
    /// the current user turn.
    pub history: Vec<Message>,
    pub options: GenerationOptions,
}

// ─── Streamed response ────────────────────────────────────────────────────────

/// Why a generation stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    #[default]
    Natural,
    MaxTokens,
    /// The model emitted one or more grammar-constrained function calls.
    Tools,
    Cancelled,
    Error,
}

/// A native function-call record from a grammar-constrained engine.
///
/// Treated exactly like a text-parsed tool call downstream: it flows through
/// the same repair, dedup, and cap pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallRecord {
    #[serde(rename = "functionName")]
    pub function_name: String,
    pub params: serde_json::Value,
}

/// A single streamed event from the model.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// A text delta streamed from the model
    TextDelta(String),
    /// A reasoning delta, rendered separately from the answer
    ThinkingDelta(String),
    /// A complete native function call
    FunctionCall(FunctionCallRecord),
    /// Final usage statistics
    Usage { input_tokens: u32, output_tokens: u32 },
    /// The stream finished; carries the stop reason
    Done(StopReason),
}

/// Token usage accumulated over one or more turns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

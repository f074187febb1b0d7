// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

use falk_model::Usage;

/// One rendered tool outcome for the host UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultEvent {
    pub tool: String,
    pub ok: bool,
    pub summary: String,
}

/// A plan checklist entry mirrored to the host UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStepView {
    pub description: String,
    pub completed: bool,
}

/// Events streamed from the engine to the host over the IPC boundary.
/// Consumers (the desktop front-end) subscribe to these to drive their
/// output; names mirror the wire events the host emits onward.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// User-visible assistant text, streamed (possibly batched).
    Token(String),
    /// Internal reasoning, rendered separately from the answer.
    ThinkingToken(String),
    /// Marks a new iteration's text origin for replace operations.
    IterationBegin { iteration: u32 },
    /// Replace the current iteration's buffered text (used to wipe raw
    /// tool-call JSON that leaked into the visible stream).
    ReplaceLast(String),
    /// Wipe the current iteration's text after a rollback.
    StreamReset,
    /// A tool is about to execute.
    ToolExecuting { tool: String, params: Value },
    /// Structured results for one iteration's tool batch.
    ToolResults(Vec<ToolResultEvent>),
    /// Plan checklist for the UI.
    TodoUpdate(Vec<PlanStepView>),
    /// Loop position for the progress indicator.
    Progress { iteration: u32, max_iterations: u32 },
    /// Live context utilization.
    ContextUsage { used: usize, total: usize },
    /// Token counters: whole session, this request, last generation.
    TokenStats { session: u64, request: u64, last: u64 },
    /// Pause state changed.
    Paused(bool),
    /// The request was interrupted; emitted exactly once on cancellation.
    Interrupted,
}

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Natural,
    MaxIterationsReached,
    WallClock,
    Cancelled,
    TerminalFailure,
    ContextExhausted,
}

/// Final reply returned to the host when the loop exits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub success: bool,
    pub text: String,
    pub model: String,
    #[serde(rename = "tokensUsed")]
    pub tokens_used: u32,
    #[serde(rename = "toolResults")]
    pub tool_results: Vec<ToolResultEvent>,
    pub iterations: u32,
    pub outcome: RequestOutcome,
    /// Present when `success` is false.
    pub error: Option<String>,
}

impl Reply {
    pub fn failure(model: &str, outcome: RequestOutcome, error: impl Into<String>) -> Self {
        Self {
            success: false,
            text: String::new(),
            model: model.to_string(),
            tokens_used: 0,
            tool_results: Vec::new(),
            iterations: 0,
            outcome,
            error: Some(error.into()),
        }
    }
}

/// Token accounting view used for the `token-stats` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenStats {
    pub session: u64,
    pub request: u64,
    pub last: u64,
}

impl TokenStats {
    pub fn absorb(&mut self, usage: Usage) {
        let total = usage.total() as u64;
        self.session += total;
        self.request += total;
        self.last = total;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

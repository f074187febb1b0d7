// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use falk_model::Message;

/// A file the editor currently has open, passed as prompt context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CurrentFile {
    pub path: String,
    pub content: String,
}

/// Sampling overrides carried on the inbound request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    #[serde(rename = "maxTokens")]
    pub max_tokens: Option<usize>,
    pub seed: Option<u64>,
    #[serde(rename = "repeatPenalty")]
    pub repeat_penalty: Option<f32>,
}

/// The host-to-core request shape.
///
/// Exactly one request is active per session; a newer one supersedes any
/// older in-flight request (see the session controller).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundRequest {
    pub message: String,
    /// Attached images as data URLs.
    pub images: Vec<String>,
    #[serde(rename = "currentFile")]
    pub current_file: Option<CurrentFile>,
    #[serde(rename = "selectedCode")]
    pub selected_code: Option<String>,
    #[serde(rename = "conversationHistory")]
    pub conversation_history: Vec<Message>,
    #[serde(rename = "webSearch")]
    pub web_search: Option<String>,
    #[serde(rename = "cloudProvider")]
    pub cloud_provider: Option<String>,
    #[serde(rename = "cloudModel")]
    pub cloud_model: Option<String>,
    #[serde(rename = "autoMode")]
    pub auto_mode: bool,
    pub params: Option<SamplingParams>,
    #[serde(rename = "maxIterations")]
    pub max_iterations: Option<u32>,
}

impl InboundRequest {
    /// Minimal request carrying only a user message; the common test and
    /// host entry path.
    pub fn text(message: impl Into<String>) -> Self {
        Self { message: message.into(), ..Default::default() }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

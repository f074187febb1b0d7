// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper that returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    /// Named provider configurations.
    ///
    /// Define local endpoints or additional accounts here and reference them
    /// by name from the inbound request's `cloud_provider` field.
    ///
    /// ```yaml
    /// providers:
    ///   workstation_llama:
    ///     provider: local
    ///     name: qwen2.5-coder-7b
    ///     profile:
    ///       effective_ctx: 16384
    ///       tier: small
    /// ```
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ModelConfig>,
}

// ─── Model ────────────────────────────────────────────────────────────────────

/// Coarse parameter-count class of a model.
///
/// The scheduler keys several behaviors on this: grammar-constrained
/// generation duration, rollback retry budget, and how many tools are
/// disclosed per iteration.  Smaller models need more guard rails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// ≤ 8B parameters
    Small,
    /// 8–14B parameters
    Medium,
    /// > 14B parameters (includes all hosted frontier models)
    #[default]
    Large,
}

impl ModelTier {
    /// Number of leading iterations that run with grammar-constrained
    /// generation.  `None` means grammar stays on for the whole request.
    pub fn grammar_iterations(&self) -> Option<u32> {
        match self {
            ModelTier::Small => None,
            ModelTier::Medium => Some(5),
            ModelTier::Large => Some(2),
        }
    }

    /// How many rollback retries a single generation step may consume.
    pub fn rollback_budget(&self) -> u32 {
        match self {
            ModelTier::Small => 4,
            ModelTier::Medium => 3,
            ModelTier::Large => 2,
        }
    }

    /// Upper bound on the number of tool schemas disclosed per iteration.
    /// Small models drown in a 60-tool schema set; narrowing the choice
    /// space measurably improves call validity.
    pub fn tool_disclosure_limit(&self) -> usize {
        match self {
            ModelTier::Small => 12,
            ModelTier::Medium => 20,
            ModelTier::Large => 32,
        }
    }
}

/// How the system preamble is rendered for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptStyle {
    /// Short preamble for models with small context windows.
    Compact,
    #[default]
    Full,
}

/// How tool capabilities are presented in the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolPromptStyle {
    /// No textual schemas at all; the grammar carries the tool definitions.
    GrammarOnly,
    /// One-line-per-tool hint.
    Compact,
    #[default]
    Full,
}

/// Static description of a model's context and response shape.
///
/// The budget manager derives all prompt-size arithmetic from this profile;
/// the values are upper bounds, clamped by whatever the hardware actually
/// loaded (`ModelEngine::hardware_ctx`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Usable context window in tokens.
    #[serde(default = "default_effective_ctx")]
    pub effective_ctx: usize,
    /// Fraction of the window reserved for the response (0.0–1.0).
    #[serde(default = "default_response_reserve_pct")]
    pub response_reserve_pct: f32,
    /// Hard cap on response tokens regardless of window size.
    #[serde(default = "default_max_response_tokens")]
    pub max_response_tokens: usize,
    #[serde(default)]
    pub prompt_style: PromptStyle,
    #[serde(default)]
    pub tool_prompt_style: ToolPromptStyle,
    #[serde(default)]
    pub tier: ModelTier,
}

fn default_effective_ctx() -> usize {
    32_768
}
fn default_response_reserve_pct() -> f32 {
    0.25
}
fn default_max_response_tokens() -> usize {
    4096
}

impl Default for ModelProfile {
    fn default() -> Self {
        Self {
            effective_ctx: default_effective_ctx(),
            response_reserve_pct: default_response_reserve_pct(),
            max_response_tokens: default_max_response_tokens(),
            prompt_style: PromptStyle::Full,
            tool_prompt_style: ToolPromptStyle::Full,
            tier: ModelTier::Large,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "local" | a configured cloud provider id | "mock"
    pub provider: String,
    /// Model name forwarded to the engine
    pub name: String,
    /// Environment variable that holds the API key (read at runtime by the
    /// host's transport; never stored here)
    pub api_key_env: Option<String>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub repeat_penalty: Option<f32>,
    pub seed: Option<u64>,
    /// Recommended inter-call delay in ms when near the provider's RPM
    /// ceiling.  0 means no pacing.
    #[serde(default)]
    pub pacing_ms: u64,
    /// Marks the bundled free-tier provider path: requests through it count
    /// against the daily quota and stream at a deliberately relaxed pace.
    #[serde(default)]
    pub bundled: bool,
    #[serde(default)]
    pub profile: ModelProfile,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "local".into(),
            name: "qwen2.5-coder-14b".into(),
            api_key_env: None,
            temperature: Some(0.2),
            top_p: None,
            top_k: None,
            repeat_penalty: None,
            seed: None,
            pacing_ms: 0,
            bundled: false,
            profile: ModelProfile::default(),
        }
    }
}

// ─── Agent loop ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum generate→execute iterations per request.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Hard wall-clock deadline per request, in minutes.
    #[serde(default = "default_wall_clock_minutes")]
    pub wall_clock_minutes: u64,
    /// How many corrective nudges the failure classifier may spend per request.
    #[serde(default = "default_nudge_budget")]
    pub nudge_budget: u32,
    /// Maximum seamless continuations after a maxTokens stop, per response.
    #[serde(default = "default_continuation_cap")]
    pub continuation_cap: u32,
    /// Detect identical-call and short-cycle repetition and stop the loop.
    #[serde(default = "default_true")]
    pub stuck_detection: bool,
    /// How many recent calls the cycle detector inspects.
    #[serde(default = "default_stuck_window")]
    pub stuck_window: usize,
    /// Context-utilization thresholds for the four compaction phases.
    #[serde(default = "default_compact_results_at")]
    pub compact_results_at: f32,
    #[serde(default = "default_prune_turns_at")]
    pub prune_turns_at: f32,
    #[serde(default = "default_aggressive_at")]
    pub aggressive_at: f32,
    #[serde(default = "default_rotate_at")]
    pub rotate_at: f32,
    /// User/assistant turns preserved verbatim by phase-2 pruning.
    #[serde(default = "default_keep_recent_turns")]
    pub keep_recent_turns: usize,
    /// Share of the prompt budget the dynamic context may occupy.
    #[serde(default = "default_dynamic_cap_pct")]
    pub dynamic_cap_pct: f32,
    /// Reduced dynamic share used on a context-overflow retry.
    #[serde(default = "default_overflow_dynamic_cap_pct")]
    pub overflow_dynamic_cap_pct: f32,
    /// Jaccard similarity above which consecutive responses count as
    /// repetition.
    #[serde(default = "default_repetition_threshold")]
    pub repetition_threshold: f32,
    /// Defer write_file/edit_file when the same response also gathers data.
    /// Disabled automatically for `ModelTier::Small`.
    #[serde(default = "default_true")]
    pub write_deferral: bool,
    /// Post-loop: synthesize the requested output file from gathered web data
    /// when the model claimed completion without writing it.
    #[serde(default = "default_true")]
    pub completion_guarantee: bool,
    /// Route browser screenshots through a vision model when the active
    /// engine cannot accept images.
    #[serde(default = "default_true")]
    pub auto_vision_routing: bool,
}

fn default_max_iterations() -> u32 {
    30
}
fn default_wall_clock_minutes() -> u64 {
    30
}
fn default_nudge_budget() -> u32 {
    2
}
fn default_continuation_cap() -> u32 {
    3
}
fn default_stuck_window() -> usize {
    20
}
fn default_compact_results_at() -> f32 {
    0.60
}
fn default_prune_turns_at() -> f32 {
    0.75
}
fn default_aggressive_at() -> f32 {
    0.85
}
fn default_rotate_at() -> f32 {
    0.92
}
fn default_keep_recent_turns() -> usize {
    6
}
fn default_dynamic_cap_pct() -> f32 {
    0.40
}
fn default_overflow_dynamic_cap_pct() -> f32 {
    0.10
}
fn default_repetition_threshold() -> f32 {
    0.85
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            wall_clock_minutes: default_wall_clock_minutes(),
            nudge_budget: default_nudge_budget(),
            continuation_cap: default_continuation_cap(),
            stuck_detection: true,
            stuck_window: default_stuck_window(),
            compact_results_at: default_compact_results_at(),
            prune_turns_at: default_prune_turns_at(),
            aggressive_at: default_aggressive_at(),
            rotate_at: default_rotate_at(),
            keep_recent_turns: default_keep_recent_turns(),
            dynamic_cap_pct: default_dynamic_cap_pct(),
            overflow_dynamic_cap_pct: default_overflow_dynamic_cap_pct(),
            repetition_threshold: default_repetition_threshold(),
            write_deferral: true,
            completion_guarantee: true,
            auto_vision_routing: true,
        }
    }
}

// ─── Tools ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Default per-call timeout in seconds.
    #[serde(default = "default_tool_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Lower/upper clamp for the run_command timeout parameter.
    #[serde(default = "default_command_timeout_min_secs")]
    pub command_timeout_min_secs: u64,
    #[serde(default = "default_command_timeout_max_secs")]
    pub command_timeout_max_secs: u64,
    /// Serialized tool-result payloads larger than this are truncated on the
    /// well-known long keys (output, content, stdout, html, text).
    #[serde(default = "default_payload_cap_bytes")]
    pub payload_cap_bytes: usize,
    /// Maximum entries in the file undo ledger; oldest evicted beyond this.
    #[serde(default = "default_undo_capacity")]
    pub undo_capacity: usize,
    /// Command glob patterns that run without consulting the permission gate.
    #[serde(default = "default_auto_approve")]
    pub auto_approve_patterns: Vec<String>,
    /// Command glob patterns that are always rejected.
    #[serde(default)]
    pub deny_patterns: Vec<String>,
    /// Tools that must pass the permission gate before executing.
    #[serde(default = "default_destructive_tools")]
    pub destructive_tools: Vec<String>,
}

fn default_tool_timeout_secs() -> u64 {
    60
}
fn default_command_timeout_min_secs() -> u64 {
    5
}
fn default_command_timeout_max_secs() -> u64 {
    300
}
fn default_payload_cap_bytes() -> usize {
    50_000
}
fn default_undo_capacity() -> usize {
    200
}
fn default_auto_approve() -> Vec<String> {
    ["ls *", "ls", "cat *", "git status", "git log*", "git diff*"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_destructive_tools() -> Vec<String> {
    [
        "delete_file",
        "write_file",
        "edit_file",
        "run_command",
        "git_commit",
        "git_push",
        "git_reset",
        "git_branch_delete",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_tool_timeout_secs(),
            command_timeout_min_secs: default_command_timeout_min_secs(),
            command_timeout_max_secs: default_command_timeout_max_secs(),
            payload_cap_bytes: default_payload_cap_bytes(),
            undo_capacity: default_undo_capacity(),
            auto_approve_patterns: default_auto_approve(),
            deny_patterns: Vec::new(),
            destructive_tools: default_destructive_tools(),
        }
    }
}

// ─── Routing ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Pick provider/model automatically from request signals (images,
    /// browser intent, code intent, reasoning intent).
    #[serde(default = "default_true")]
    pub auto_mode: bool,
    /// Detect image/video generation intent and route to the media port
    /// instead of the agent loop.
    #[serde(default = "default_true")]
    pub media_routing: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            auto_mode: true,
            media_routing: true,
        }
    }
}

// ─── Free-tier quota ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Bundled-provider messages allowed per UTC day without a license.
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    /// Override for the counter file location (default: config dir).
    pub counter_file: Option<std::path::PathBuf>,
}

fn default_daily_limit() -> u32 {
    20
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            counter_file: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

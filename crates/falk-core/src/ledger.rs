// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The task ledger: a structured running record of what has been said and
//! done in a request.  It survives context rotation: after the raw message
//! bodies are dropped, `generate_summary` is what re-seeds the model.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use falk_model::est_tokens;
use falk_tools::{ParamMap, ToolResult};

const MAX_FINDINGS: usize = 15;
const MAX_CORRECTIONS: usize = 10;
const MAX_PLAN_STEPS: usize = 12;
/// Beyond this many completed steps, entries older than the most recent
/// [`KEEP_RECENT_STEPS`] are collapsed into per-tool aggregates.
const COMPRESS_BEYOND: usize = 40;
const KEEP_RECENT_STEPS: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    pub description: String,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedStep {
    pub tool: String,
    /// Only the identifying essentials of the call: path, url, query,
    /// command or element ref.
    pub compressed_params: String,
    pub success: bool,
    /// Short outcome tag: page title, byte count, match count, error text.
    pub outcome: String,
    pub iteration: u32,
    pub ts: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CurrentState {
    pub page: Option<String>,
    pub file: Option<String>,
    pub directory: Option<String>,
    pub last_action: Option<String>,
}

/// Summarizer state for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ledger {
    pub goal: String,
    pub plan: Vec<PlanStep>,
    pub completed_steps: Vec<CompletedStep>,
    pub current_state: CurrentState,
    pub key_findings: Vec<String>,
    pub user_corrections: Vec<String>,
    pub rotations: u32,
    pub total_tool_calls: u64,
}

impl Ledger {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            plan: Vec::new(),
            completed_steps: Vec::new(),
            current_state: CurrentState::default(),
            key_findings: Vec::new(),
            user_corrections: Vec::new(),
            rotations: 0,
            total_tool_calls: 0,
        }
    }

    /// Record one executed tool call with a compressed view of its params
    /// and a short outcome tag.
    pub fn record_tool_call(
        &mut self,
        name: &str,
        params: &ParamMap,
        result: &ToolResult,
        iteration: u32,
    ) {
        self.total_tool_calls += 1;
        let compressed = compress_params(params);
        let outcome = outcome_tag(result);
        self.update_current_state(name, params);
        self.completed_steps.push(CompletedStep {
            tool: name.to_string(),
            compressed_params: compressed,
            success: result.is_ok(),
            outcome,
            iteration,
            ts: chrono::Utc::now(),
        });
        self.compress_history();
        self.mark_plan_step_completed(name, params);
    }

    /// Parse a numbered or bulleted plan out of assistant output.
    /// New steps are appended; existing descriptions are not duplicated.
    pub fn record_plan(&mut self, response_text: &str) {
        static PLAN_LINE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"^\s*(?:\d+[.)]|[-*])\s+(.{4,120})$").expect("plan pattern must compile")
        });
        for line in response_text.lines() {
            if self.plan.len() >= MAX_PLAN_STEPS {
                break;
            }
            let Some(caps) = PLAN_LINE.captures(line) else {
                continue;
            };
            let desc = caps[1].trim().trim_end_matches(['.', ':']).to_string();
            if self.plan.iter().any(|s| s.description == desc) {
                continue;
            }
            self.plan.push(PlanStep { description: desc, completed: false });
        }
    }

    /// Detect user corrections and preserve them verbatim.  Corrections
    /// survive every compression pass and every rotation.
    pub fn record_user_context(&mut self, message: &str) {
        static CORRECTION: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(
                r"(?i)\b(no,\s*i meant|that's not|actually|instead of|never\s|always\s|don't\s|do not\s|stop\s)",
            )
            .expect("correction pattern must compile")
        });
        if !CORRECTION.is_match(message) {
            return;
        }
        let verbatim = message.trim().to_string();
        if self.user_corrections.iter().any(|c| c == &verbatim) {
            return;
        }
        if self.user_corrections.len() == MAX_CORRECTIONS {
            self.user_corrections.remove(0);
        }
        self.user_corrections.push(verbatim);
    }

    /// Fuzzy-match a completed tool call against open plan steps by verb
    /// synonyms and the object named in the params.
    pub fn mark_plan_step_completed(&mut self, tool: &str, params: &ParamMap) {
        let verbs = verb_synonyms(tool);
        if verbs.is_empty() {
            return;
        }
        let object = primary_object(params);
        for step in self.plan.iter_mut().filter(|s| !s.completed) {
            let lowered = step.description.to_lowercase();
            let verb_hit = verbs.iter().any(|v| lowered.contains(v));
            let object_hit = object
                .as_ref()
                .map(|o| lowered.contains(o.as_str()))
                .unwrap_or(true);
            if verb_hit && object_hit {
                step.completed = true;
                return;
            }
        }
    }

    pub fn mark_rotation(&mut self) {
        self.rotations += 1;
    }

    pub fn add_finding(&mut self, finding: impl Into<String>) {
        if self.key_findings.len() == MAX_FINDINGS {
            self.key_findings.remove(0);
        }
        self.key_findings.push(finding.into());
    }

    /// Structured summary block re-injected after a context rotation.
    ///
    /// Sections are added in fixed priority order until the token budget is
    /// exhausted; goal and user corrections are always present.
    pub fn generate_summary(&self, max_tokens: usize) -> String {
        let mut out = String::new();
        out.push_str("# Task Ledger\n\n## Goal\n");
        out.push_str(&self.goal);
        out.push('\n');

        if !self.user_corrections.is_empty() {
            out.push_str("\n## User corrections (verbatim)\n");
            for c in &self.user_corrections {
                out.push_str(&format!("- {c}\n"));
            }
        }

        let mut sections: Vec<String> = Vec::new();
        if !self.completed_steps.is_empty() {
            sections.push(format!("\n## Completed work\n{}", self.render_completed()));
        }
        let state = self.render_state();
        if !state.is_empty() {
            sections.push(format!("\n## Current state\n{state}"));
        }
        if !self.key_findings.is_empty() {
            let recent: Vec<String> = self
                .key_findings
                .iter()
                .rev()
                .take(8)
                .rev()
                .map(|f| format!("- {f}"))
                .collect();
            sections.push(format!("\n## Key findings\n{}\n", recent.join("\n")));
        }
        let remaining: Vec<String> = self
            .plan
            .iter()
            .filter(|s| !s.completed)
            .map(|s| format!("- [ ] {}", s.description))
            .collect();
        if !remaining.is_empty() {
            sections.push(format!("\n## Remaining plan\n{}\n", remaining.join("\n")));
        }

        for section in sections {
            if est_tokens(&out) + est_tokens(&section) > max_tokens {
                break;
            }
            out.push_str(&section);
        }
        out.push_str(
            "\nContinue the task from the state above; do not restart completed work.\n",
        );
        out
    }

    /// Completed steps grouped for display, with runs of the same tool
    /// collapsed to `tool ×N`.
    fn render_completed(&self) -> String {
        let mut lines: Vec<String> = Vec::new();
        let mut i = 0;
        while i < self.completed_steps.len() {
            let step = &self.completed_steps[i];
            let mut run = 1;
            while i + run < self.completed_steps.len()
                && self.completed_steps[i + run].tool == step.tool
            {
                run += 1;
            }
            let status = if step.success { "ok" } else { "failed" };
            if run > 1 {
                let successes = self.completed_steps[i..i + run]
                    .iter()
                    .filter(|s| s.success)
                    .count();
                lines.push(format!("- {} ×{run} ({successes} ok)", step.tool));
            } else if step.compressed_params.is_empty() {
                lines.push(format!("- {} {status}: {}", step.tool, step.outcome));
            } else {
                lines.push(format!(
                    "- {} {} {status}: {}",
                    step.tool, step.compressed_params, step.outcome
                ));
            }
            i += run;
        }
        lines.join("\n") + "\n"
    }

    fn render_state(&self) -> String {
        let mut lines = Vec::new();
        if let Some(p) = &self.current_state.page {
            lines.push(format!("- page: {p}"));
        }
        if let Some(f) = &self.current_state.file {
            lines.push(format!("- file: {f}"));
        }
        if let Some(d) = &self.current_state.directory {
            lines.push(format!("- directory: {d}"));
        }
        if let Some(a) = &self.current_state.last_action {
            lines.push(format!("- last action: {a}"));
        }
        if lines.is_empty() {
            String::new()
        } else {
            lines.join("\n") + "\n"
        }
    }

    fn update_current_state(&mut self, tool: &str, params: &ParamMap) {
        let get = |k: &str| params.get(k).and_then(|v| v.as_str()).map(str::to_string);
        match tool {
            "browser_navigate" => self.current_state.page = get("url"),
            "write_file" | "edit_file" | "read_file" => {
                self.current_state.file = get("filePath")
            }
            "list_directory" => self.current_state.directory = get("dirPath"),
            _ => {}
        }
        self.current_state.last_action = Some(tool.to_string());
    }

    /// Collapse history beyond the caps: entries older than the most recent
    /// twenty become one `"(K calls, S succeeded)"` aggregate per tool.
    fn compress_history(&mut self) {
        if self.completed_steps.len() <= COMPRESS_BEYOND {
            return;
        }
        let split = self.completed_steps.len() - KEEP_RECENT_STEPS;
        let old: Vec<CompletedStep> = self.completed_steps.drain(..split).collect();
        let recent: Vec<CompletedStep> = self.completed_steps.drain(..).collect();

        let mut groups: BTreeMap<String, (u32, u32, u32)> = BTreeMap::new();
        for step in &old {
            // Re-aggregate already-collapsed entries by their recorded counts.
            let (calls, successes) = match parse_aggregate(&step.outcome) {
                Some(counts) => counts,
                None => (1, step.success as u32),
            };
            let entry = groups.entry(step.tool.clone()).or_insert((0, 0, 0));
            entry.0 += calls;
            entry.1 += successes;
            entry.2 = entry.2.max(step.iteration);
        }

        self.completed_steps = groups
            .into_iter()
            .map(|(tool, (calls, successes, iteration))| CompletedStep {
                tool,
                compressed_params: String::new(),
                success: successes > 0,
                outcome: format!("({calls} calls, {successes} succeeded)"),
                iteration,
                ts: chrono::Utc::now(),
            })
            .collect();
        self.completed_steps.extend(recent);
    }
}

fn parse_aggregate(outcome: &str) -> Option<(u32, u32)> {
    static AGG: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^\((\d+) calls, (\d+) succeeded\)$").expect("aggregate pattern must compile")
    });
    let caps = AGG.captures(outcome)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

/// Keep only the identifying essentials of a call's parameters.
fn compress_params(params: &ParamMap) -> String {
    for key in ["filePath", "dirPath", "url", "query", "command", "ref"] {
        if let Some(v) = params.get(key).and_then(|v| v.as_str()) {
            return truncate_tag(v);
        }
    }
    String::new()
}

/// Extract a short outcome tag from a tool result.
fn outcome_tag(result: &ToolResult) -> String {
    match result {
        ToolResult::Ok { payload } => {
            if let Some(title) = payload.get("title").and_then(|v| v.as_str()) {
                return truncate_tag(title);
            }
            if let Some(bytes) = payload.get("bytes").and_then(|v| v.as_u64()) {
                return format!("{bytes} bytes");
            }
            if let Some(count) = payload.get("count").and_then(|v| v.as_u64()) {
                return format!("{count} entries");
            }
            if let Some(code) = payload.get("exit_code").and_then(|v| v.as_i64()) {
                return format!("exit {code}");
            }
            for key in ["output", "content", "text"] {
                if let Some(s) = payload.get(key).and_then(|v| v.as_str()) {
                    return truncate_tag(s.lines().next().unwrap_or(""));
                }
            }
            "done".to_string()
        }
        ToolResult::Err { message, .. } => truncate_tag(message),
    }
}

fn truncate_tag(s: &str) -> String {
    let mut tag = s.trim().to_string();
    if tag.len() > 80 {
        // Cut on a char boundary; outcome tags carry arbitrary page titles.
        let cut = tag
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|i| *i <= 77)
            .last()
            .unwrap_or(0);
        tag.truncate(cut);
        tag.push('…');
    }
    tag
}

/// Verb synonym sets used for fuzzy plan matching.
fn verb_synonyms(tool: &str) -> &'static [&'static str] {
    match tool {
        "browser_navigate" => &["navigate", "go to", "open", "visit"],
        "browser_click" => &["click", "select", "choose", "press"],
        "browser_type" => &["type", "enter", "fill", "input"],
        "write_file" => &["write", "create", "save"],
        "edit_file" => &["edit", "update", "modify", "change"],
        "read_file" => &["read", "view", "inspect", "check"],
        "web_search" | "search_codebase" => &["search", "find", "look up"],
        "run_command" => &["run", "execute", "build", "test"],
        _ => &[],
    }
}

/// The most recognizable object word in the params: a file stem or a domain.
fn primary_object(params: &ParamMap) -> Option<String> {
    if let Some(path) = params.get("filePath").and_then(|v| v.as_str()) {
        return std::path::Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase());
    }
    if let Some(url) = params.get("url").and_then(|v| v.as_str()) {
        return url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_lowercase()));
    }
    params
        .get("query")
        .and_then(|v| v.as_str())
        .map(|q| q.to_lowercase())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

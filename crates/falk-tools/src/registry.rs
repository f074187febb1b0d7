// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use falk_config::ToolsConfig;

use crate::policy::{PolicyDecision, ToolPolicy};
use crate::sanitize::{destructive_command, sanitize_path, ssrf_block};
use crate::schema::{TaskType, ToolCategory, ToolDefinition};
use crate::tool::{ErrorKind, OutputCategory, ParamMap, Tool, ToolCall, ToolResult};
use crate::undo::UndoLedger;

/// Host-supplied callback consulted before any tool in the destructive set
/// executes.  Returning `false` yields `err{permission_denied}`.
pub type PermissionGate = Arc<dyn Fn(&str, &ParamMap) -> bool + Send + Sync>;

/// Tool-listing filter: everything, explicit categories, or the categories
/// a task type discloses.
#[derive(Debug, Clone)]
pub enum ListFilter {
    All,
    Categories(Vec<ToolCategory>),
    Task(TaskType),
}

/// Central registry holding all available tools, plus the safety machinery
/// that belongs in the executor rather than in handlers: parameter
/// normalization, path/shell/SSRF sanitization, the permission gate, call
/// timeouts, payload truncation, and the undo ledger.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    cfg: ToolsConfig,
    policy: ToolPolicy,
    project_root: PathBuf,
    undo: Arc<Mutex<UndoLedger>>,
}

impl ToolRegistry {
    pub fn new(project_root: PathBuf, cfg: ToolsConfig) -> Self {
        let policy = ToolPolicy::from_config(&cfg);
        let undo = Arc::new(Mutex::new(UndoLedger::new(cfg.undo_capacity)));
        Self { tools: HashMap::new(), cfg, policy, project_root, undo }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.definition().name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn definition(&self, name: &str) -> Option<ToolDefinition> {
        self.tools.get(name).map(|t| t.definition())
    }

    /// Definitions matching the filter, name-sorted for stable prompts.
    pub fn list(&self, filter: &ListFilter) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| t.definition())
            .filter(|d| match filter {
                ListFilter::All => true,
                ListFilter::Categories(cats) => cats.contains(&d.category),
                ListFilter::Task(task) => task.categories().contains(&d.category),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn output_category(&self, name: &str) -> OutputCategory {
        self.tools
            .get(name)
            .map(|t| t.output_category())
            .unwrap_or_default()
    }

    pub fn undo_ledger(&self) -> Arc<Mutex<UndoLedger>> {
        Arc::clone(&self.undo)
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Execute one call: normalize → sanitize → validate → gate → dispatch
    /// under a timeout → record undo → truncate oversized payloads.
    pub async fn execute(&self, call: &ToolCall, gate: Option<&PermissionGate>) -> ToolResult {
        let Some(tool) = self.tools.get(&call.name) else {
            return ToolResult::err(
                ErrorKind::SchemaViolation,
                format!("unknown tool: {}", call.name),
            );
        };
        let def = tool.definition();

        let params = crate::normalize::normalize(&call.name, call.params.clone());
        let params = self.sanitize_params(params);
        let params = crate::normalize::coerce(&def, params);
        if let Err(reason) = def.validate(&params) {
            return ToolResult::err(ErrorKind::SchemaViolation, reason);
        }

        if let Some(result) = self.safety_check(&call.name, &params, gate) {
            return result;
        }

        debug!(tool = %call.name, "executing tool");

        // Capture prior contents before a mutating call so the ledger entry
        // reflects the true pre-call state.
        let mutation_target = self.mutation_target(&call.name, &params);
        let prior = mutation_target
            .as_ref()
            .and_then(|p| std::fs::read_to_string(p).ok());

        let timeout = self.timeout_for(&call.name, &params);
        let result = match tokio::time::timeout(timeout, tool.execute(&params)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(tool = %call.name, secs = timeout.as_secs(), "tool timed out");
                return ToolResult::err(
                    ErrorKind::Timeout,
                    format!("{} exceeded its {}s time limit", call.name, timeout.as_secs()),
                );
            }
        };

        if result.is_ok() {
            if let Some(path) = mutation_target {
                self.undo.lock().unwrap().record(path, prior);
            }
        }

        match result {
            ToolResult::Ok { payload } => ToolResult::Ok {
                payload: truncate_payload(payload, self.cfg.payload_cap_bytes),
            },
            err => err,
        }
    }

    /// Path parameters are resolved against the project root before the
    /// handler ever sees them.
    fn sanitize_params(&self, mut params: ParamMap) -> ParamMap {
        for key in ["filePath", "dirPath"] {
            if let Some(Value::String(raw)) = params.get(key) {
                let clean = sanitize_path(&self.project_root, raw);
                params.insert(key.into(), Value::String(clean.to_string_lossy().into_owned()));
            }
        }
        params
    }

    /// Shell patterns, SSRF, and the destructive-set permission gate.
    /// Returns `Some(err)` when the call must not run.
    fn safety_check(
        &self,
        name: &str,
        params: &ParamMap,
        gate: Option<&PermissionGate>,
    ) -> Option<ToolResult> {
        if name == "run_command" {
            let command = params.get("command").and_then(|v| v.as_str()).unwrap_or("");
            if let Some(why) = destructive_command(command) {
                return Some(ToolResult::err(
                    ErrorKind::PermissionDenied,
                    format!("command blocked: {why}"),
                ));
            }
            match self.policy.decide(command) {
                PolicyDecision::Deny => {
                    return Some(ToolResult::err(
                        ErrorKind::PermissionDenied,
                        "command matches a deny pattern",
                    ));
                }
                PolicyDecision::Auto => return None,
                PolicyDecision::Ask => {}
            }
        }

        if matches!(name, "http_request" | "fetch_webpage") {
            let url = params.get("url").and_then(|v| v.as_str()).unwrap_or("");
            if let Some(why) = ssrf_block(url) {
                return Some(ToolResult::err(
                    ErrorKind::PermissionDenied,
                    format!("request blocked: {why}"),
                ));
            }
        }

        if self.cfg.destructive_tools.iter().any(|d| d == name) {
            if let Some(gate) = gate {
                if !gate(name, params) {
                    return Some(ToolResult::err(
                        ErrorKind::PermissionDenied,
                        format!("{name} denied by the permission gate"),
                    ));
                }
            }
        }
        None
    }

    fn mutation_target(&self, name: &str, params: &ParamMap) -> Option<PathBuf> {
        if !matches!(name, "write_file" | "edit_file" | "delete_file") {
            return None;
        }
        params
            .get("filePath")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
    }

    fn timeout_for(&self, name: &str, params: &ParamMap) -> Duration {
        if name == "run_command" {
            let requested = params
                .get("timeout_secs")
                .and_then(|v| v.as_u64())
                .unwrap_or(self.cfg.default_timeout_secs);
            Duration::from_secs(requested.clamp(
                self.cfg.command_timeout_min_secs,
                self.cfg.command_timeout_max_secs,
            ))
        } else {
            Duration::from_secs(self.cfg.default_timeout_secs)
        }
    }
}

/// Best-effort truncation of oversized payloads on the well-known long
/// keys.  Other keys are left alone; if the payload is still oversized the
/// rendering layer's per-tool caps bound what reaches the prompt.
fn truncate_payload(mut payload: Value, cap_bytes: usize) -> Value {
    let serialized_len = payload.to_string().len();
    if serialized_len <= cap_bytes {
        return payload;
    }
    let excess = serialized_len - cap_bytes;
    if let Some(obj) = payload.as_object_mut() {
        for key in ["output", "content", "stdout", "html", "text"] {
            let Some(Value::String(s)) = obj.get(key) else {
                continue;
            };
            if s.len() > excess {
                let keep = s.len() - excess;
                let cut = s
                    .char_indices()
                    .take_while(|(i, _)| *i <= keep)
                    .last()
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                let truncated = format!("{}…[truncated {excess} bytes]", &s[..cut]);
                obj.insert(key.to_string(), Value::String(truncated));
                break;
            }
        }
    }
    payload
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

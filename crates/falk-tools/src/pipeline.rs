// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Post-parse call planning: dedup, the browser state-change cap, and
//! write deferral.  Runs after normalization/repair and before execution.

use std::collections::HashSet;

use crate::tool::{ErrorKind, ToolCall, ToolResult};

/// Browser tools that mutate page state.  Element refs go stale after any
/// of these, so a batch containing more than two is almost certainly
/// referencing invalid refs.
pub const BROWSER_STATE_CHANGING: &[&str] = &[
    "browser_navigate",
    "browser_click",
    "browser_type",
    "browser_select",
    "browser_press_key",
    "browser_back",
    "browser_fill_form",
    "browser_drag",
    "browser_file_upload",
];

/// Maximum state-changing browser calls executed per iteration.
pub const BROWSER_STATE_CHANGE_CAP: usize = 2;

/// Data-gathering tools whose results a same-batch write would need.
pub const GATHER_TOOLS: &[&str] = &[
    "web_search",
    "fetch_webpage",
    "http_request",
    "browser_evaluate",
    "browser_get_content",
];

/// Data-writing tools subject to deferral.
pub const WRITE_TOOLS: &[&str] = &["write_file", "edit_file"];

/// What the pipeline decided for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    Run,
    /// Skipped: beyond the browser state-change cap.
    SkipBrowserCap,
    /// Postponed: the same batch gathers data this write would fabricate.
    DeferWrite,
}

#[derive(Debug, Clone)]
pub struct PlannedCall {
    pub call: ToolCall,
    pub action: PlannedAction,
}

/// Plan an iteration's calls.  Returns the planned list (model order
/// preserved) and human-readable notes about skipped or deferred calls.
///
/// `defer_writes` is disabled for the smallest model tier, which cannot
/// recover a deferred write across turns.
pub fn plan(calls: Vec<ToolCall>, defer_writes: bool) -> (Vec<PlannedCall>, Vec<String>) {
    let mut notes = Vec::new();

    // Intra-iteration dedup: identical (tool, params) executes once.
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(calls.len());
    for call in calls {
        if seen.insert(call.signature()) {
            unique.push(call);
        } else {
            notes.push(format!("duplicate {} call collapsed", call.name));
        }
    }

    let has_gather = unique.iter().any(|c| GATHER_TOOLS.contains(&c.name.as_str()));
    let mut state_changes = 0usize;
    let mut planned = Vec::with_capacity(unique.len());

    for call in unique {
        let action = if BROWSER_STATE_CHANGING.contains(&call.name.as_str()) {
            state_changes += 1;
            if state_changes > BROWSER_STATE_CHANGE_CAP {
                notes.push(format!(
                    "{} skipped: element refs are stale after {} state changes",
                    call.name, BROWSER_STATE_CHANGE_CAP
                ));
                PlannedAction::SkipBrowserCap
            } else {
                PlannedAction::Run
            }
        } else if defer_writes && has_gather && WRITE_TOOLS.contains(&call.name.as_str()) {
            notes.push(format!(
                "{} deferred until gathered data is available",
                call.name
            ));
            PlannedAction::DeferWrite
        } else {
            PlannedAction::Run
        };
        planned.push(PlannedCall { call, action });
    }

    (planned, notes)
}

/// The synthetic result attached to a deferred write.  Carries whatever the
/// gather calls in the same batch actually produced, so the model writes
/// real data on its next attempt instead of fabricating content.
pub fn deferred_result(gathered: &[(String, String)]) -> ToolResult {
    let mut message = String::from(
        "Write postponed: this batch also gathers data. \
         Re-issue the write next turn using the gathered results below.",
    );
    for (tool, excerpt) in gathered {
        message.push_str(&format!("\n--- {tool} ---\n{excerpt}"));
    }
    ToolResult::Err { kind: ErrorKind::Deferred, message }
}

/// The immediate result for a call skipped by the browser cap.
pub fn browser_cap_result() -> ToolResult {
    ToolResult::Err {
        kind: ErrorKind::ToolExecution,
        message: format!(
            "Skipped: more than {BROWSER_STATE_CHANGE_CAP} page-state changes in one turn. \
             Take a fresh browser_snapshot and continue with updated element refs."
        ),
    }
}

/// Immediate result for navigation to a throttled domain.
pub fn domain_blocked_result(domain: &str) -> ToolResult {
    ToolResult::Err {
        kind: ErrorKind::DomainBlocked,
        message: format!(
            "Navigation to {domain} is blocked for this request after repeated failures. \
             Use web_search or fetch_webpage instead."
        ),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

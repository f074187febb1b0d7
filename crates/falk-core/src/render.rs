// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Rendering of executed tool results into the structured block fed back
//! to the model on the next iteration.

use serde_json::Value;

use falk_tools::{OutputCategory, ToolCall, ToolRegistry, ToolResult};

use crate::budget::smart_truncate;

/// Default per-result cap in tokens.
const RESULT_CAP_TOKENS: usize = 500;

/// Adaptive cap for browser snapshots, in bytes: small windows get small
/// snapshots.
fn snapshot_cap_chars(effective_ctx: usize) -> usize {
    if effective_ctx <= 8_192 {
        4 * 1024
    } else if effective_ctx <= 16_384 {
        6 * 1024
    } else {
        12 * 1024
    }
}

/// Render one iteration's results as the structured feedback block:
///
/// ```text
/// ## Tool Execution Results
///
/// ### <tool> [OK|FAIL]
/// <tool-specific summary>
/// ```
pub fn render_results_block(
    entries: &[(ToolCall, ToolResult)],
    registry: &ToolRegistry,
    effective_ctx: usize,
) -> String {
    let mut out = String::from("## Tool Execution Results\n");
    for (call, result) in entries {
        out.push_str(&format!("\n### {} [{}]\n", call.name, result.status_tag()));
        let category = registry.output_category(&call.name);
        out.push_str(&render_one(call, result, category, effective_ctx));
        out.push('\n');
    }
    out
}

fn render_one(
    call: &ToolCall,
    result: &ToolResult,
    category: OutputCategory,
    effective_ctx: usize,
) -> String {
    let payload = match result {
        ToolResult::Err { kind, message } => {
            let kind_tag = serde_json::to_string(kind).unwrap_or_default();
            return format!("[{}] {message}", kind_tag.trim_matches('"'));
        }
        ToolResult::Ok { payload } => payload,
    };

    match call.name.as_str() {
        "browser_navigate" => {
            let title = payload.get("title").and_then(Value::as_str).unwrap_or("(untitled)");
            let url = payload.get("url").and_then(Value::as_str).unwrap_or("");
            format!("{title} — {url}")
        }
        "browser_snapshot" => {
            let content = payload.get("content").and_then(Value::as_str).unwrap_or("");
            let cap = snapshot_cap_chars(effective_ctx);
            // The snapshot cap is byte-based; convert to the token cap the
            // truncation helper expects.
            smart_truncate(content, category, (cap * 2) / 7)
        }
        "run_command" => {
            let code = payload.get("exit_code").and_then(Value::as_i64).unwrap_or(-1);
            let output = payload.get("output").and_then(Value::as_str).unwrap_or("");
            format!("exit code {code}\n{}", smart_truncate(output, category, RESULT_CAP_TOKENS))
        }
        "read_file" => {
            let content = payload.get("content").and_then(Value::as_str).unwrap_or("");
            smart_truncate(content, category, RESULT_CAP_TOKENS)
        }
        "web_search" => {
            let count = payload.get("count").and_then(Value::as_u64).unwrap_or(0);
            let output = payload.get("output").and_then(Value::as_str).unwrap_or("");
            format!(
                "{count} results\n{}",
                smart_truncate(output, category, RESULT_CAP_TOKENS)
            )
        }
        _ => {
            // Generic: prefer the well-known text keys, fall back to JSON.
            for key in ["output", "text", "content"] {
                if let Some(s) = payload.get(key).and_then(Value::as_str) {
                    return smart_truncate(s, category, RESULT_CAP_TOKENS);
                }
            }
            let mut rendered = payload.to_string();
            if rendered.len() > 2000 {
                let cut = rendered
                    .char_indices()
                    .map(|(i, _)| i)
                    .take_while(|i| *i <= 2000)
                    .last()
                    .unwrap_or(0);
                rendered.truncate(cut);
                rendered.push('…');
            }
            rendered
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

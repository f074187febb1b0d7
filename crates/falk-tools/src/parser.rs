// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool-call extraction from free-form model output.
//!
//! Extraction order:
//! 1. Fenced JSON blocks tagged `tool_call`, `tool`, or `json` whose root
//!    object carries a `tool` or `name` key.
//! 2. Inline object literals of the same shape outside fences (drift
//!    fallback).
//!
//! Native function-call records from a grammar-constrained engine bypass
//! text parsing entirely; the scheduler converts them to [`ToolCall`]s and
//! sends them through the same repair/dedup/cap pipeline.
//!
//! Extracted spans are removed from `display_text` so raw call JSON never
//! reaches the user-visible stream.

use serde_json::Value;

use crate::normalize::attempt_json_repair;
use crate::tool::{ParamMap, ToolCall};

/// What the parser found in one model response.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub calls: Vec<ToolCall>,
    /// The response with tool-call JSON removed; safe to show the user.
    pub display_text: String,
    pub issues: Vec<String>,
}

/// Explicit state of the line-oriented fence scanner.  Kept as a real enum
/// (not regex back-tracking) so the fence decision is auditable.
enum FenceState {
    Outside,
    /// Inside a fence opened with the given info tag.
    Inside { tag: String, body: String },
}

/// Parse one complete model response.
pub fn parse_response(text: &str) -> ParseOutcome {
    let mut out = ParseOutcome::default();
    let mut state = FenceState::Outside;
    let mut display_lines: Vec<String> = Vec::new();
    // Lines of the fence currently being buffered, replayed into the display
    // text when the fence turns out not to be a tool call.
    let mut fence_lines: Vec<String> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim_start();
        match &mut state {
            FenceState::Outside => {
                if let Some(tag) = trimmed.strip_prefix("```") {
                    state = FenceState::Inside {
                        tag: tag.trim().to_ascii_lowercase(),
                        body: String::new(),
                    };
                    fence_lines = vec![line.to_string()];
                } else {
                    display_lines.push(line.to_string());
                }
            }
            FenceState::Inside { tag, body } => {
                if trimmed.starts_with("```") {
                    fence_lines.push(line.to_string());
                    let consumed = matches!(tag.as_str(), "tool_call" | "tool" | "json")
                        && consume_fence_body(body, &mut out);
                    if !consumed {
                        display_lines.append(&mut fence_lines);
                    }
                    fence_lines.clear();
                    state = FenceState::Outside;
                } else {
                    body.push_str(line);
                    body.push('\n');
                    fence_lines.push(line.to_string());
                }
            }
        }
    }
    // An unterminated fence is kept verbatim; a truncated tool call in it is
    // the repair stage's problem, not the display layer's.
    if matches!(state, FenceState::Inside { .. }) {
        display_lines.append(&mut fence_lines);
    }

    let outside_text = display_lines.join("\n");
    out.display_text = extract_inline_calls(&outside_text, &mut out.calls);
    out
}

/// Try to read `body` as one or more tool calls; returns true when at least
/// one call was extracted (the fence is then dropped from the display text).
fn consume_fence_body(body: &str, out: &mut ParseOutcome) -> bool {
    let parsed: Option<Value> = match serde_json::from_str(body) {
        Ok(v) => Some(v),
        Err(_) => match attempt_json_repair(body) {
            Ok(v) => {
                out.issues.push("repaired malformed tool-call JSON".to_string());
                Some(v)
            }
            Err(_) => None,
        },
    };
    let Some(parsed) = parsed else {
        out.issues.push("unparseable fenced tool-call block".to_string());
        return false;
    };

    match &parsed {
        Value::Array(items) => {
            let calls: Vec<ToolCall> = items.iter().filter_map(call_from_value).collect();
            if calls.is_empty() {
                return false;
            }
            out.calls.extend(calls);
            true
        }
        _ => match call_from_value(&parsed) {
            Some(call) => {
                out.calls.push(call);
                true
            }
            None => false,
        },
    }
}

/// Interpret a JSON value as a tool call: a root object with a `tool` or
/// `name` string key, parameters under `params` / `parameters` /
/// `arguments` / `args`, or the remaining keys when no such object exists.
fn call_from_value(v: &Value) -> Option<ToolCall> {
    let obj = v.as_object()?;
    let name = obj
        .get("tool")
        .or_else(|| obj.get("name"))
        .and_then(|n| n.as_str())?
        .to_string();
    if name.is_empty() {
        return None;
    }

    for key in ["params", "parameters", "arguments", "args"] {
        if let Some(Value::Object(p)) = obj.get(key) {
            return Some(ToolCall::new(name, p.clone()));
        }
    }

    // Drift: parameters spread beside the name key.
    let params: ParamMap = obj
        .iter()
        .filter(|(k, _)| !matches!(k.as_str(), "tool" | "name"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Some(ToolCall::new(name, params))
}

/// Scan non-fence text for inline `{"tool": …}` / `{"name": …}` literals,
/// extract them into `calls`, and return the text with those spans removed.
fn extract_inline_calls(text: &str, calls: &mut Vec<ToolCall>) -> String {
    let mut display = String::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'{' && looks_like_call_start(&text[i..]) {
            if let Some(end) = matching_brace(text, i) {
                let candidate = &text[i..=end];
                if let Ok(v) = serde_json::from_str::<Value>(candidate) {
                    if let Some(call) = call_from_value(&v) {
                        calls.push(call);
                        i = end + 1;
                        continue;
                    }
                }
            }
        }
        // Advance one full character, not one byte.
        let ch_len = text[i..].chars().next().map(char::len_utf8).unwrap_or(1);
        display.push_str(&text[i..i + ch_len]);
        i += ch_len;
    }

    display.trim().to_string()
}

/// Cheap prefilter: does this brace plausibly open a tool-call object?
fn looks_like_call_start(rest: &str) -> bool {
    let head: String = rest.chars().take(24).filter(|c| !c.is_whitespace()).collect();
    head.starts_with("{\"tool\"") || head.starts_with("{\"name\"")
}

/// Index of the brace matching the one at `start`, honoring JSON strings.
fn matching_brace(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (off, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + off);
                }
            }
            _ => {}
        }
    }
    None
}

/// True when the text contains tool-call markup written into the prose
/// instead of the JSON protocol (XML / Hermes-style tags some fine-tunes
/// fall back to).  The classifier uses this to nudge the model back onto
/// the supported format.
pub fn contains_malformed_markup(text: &str) -> bool {
    text.contains("<tool_call>")
        || text.contains("</tool_call>")
        || text.contains("<function=")
        || text.contains("[TOOL_CALL]")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

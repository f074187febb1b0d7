// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Parameter-name drift correction and call repair.
//!
//! Models trained on different tool dialects emit systematically wrong
//! parameter names.  Normalization is a pure `ParamMap → ParamMap` function
//! applied before validation; repair rescues calls that would otherwise be
//! dropped.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::schema::ToolDefinition;
use crate::tool::{ParamMap, ToolCall};

/// Rename `from` to `to` unless the canonical key is already present.
fn rename(params: &mut ParamMap, from: &str, to: &str) {
    if params.contains_key(to) {
        params.remove(from);
        return;
    }
    if let Some(v) = params.remove(from) {
        params.insert(to.to_string(), v);
    }
}

/// Correct known per-tool parameter-name drift.  Pure; unknown tools pass
/// through untouched.
pub fn normalize(tool: &str, mut params: ParamMap) -> ParamMap {
    match tool {
        "browser_click" | "browser_type" | "browser_hover" => {
            rename(&mut params, "selector", "ref");
            if tool == "browser_type" {
                rename(&mut params, "value", "text");
            }
            // "[ref=12]" bracket syntax → "12"
            if let Some(Value::String(s)) = params.get("ref") {
                if let Some(inner) = strip_ref_brackets(s) {
                    params.insert("ref".into(), Value::String(inner));
                }
            }
        }
        "browser_navigate" => {
            for alias in ["href", "link", "src", "page"] {
                rename(&mut params, alias, "url");
            }
        }
        "list_directory" => {
            for alias in ["dir", "directory", "path"] {
                rename(&mut params, alias, "dirPath");
            }
        }
        _ => {}
    }
    // File-path aliases apply to every tool that takes a filePath.
    for alias in ["file_path", "filename", "file_name", "file", "path"] {
        if alias == "path" && tool == "list_directory" {
            continue;
        }
        if params.contains_key(alias) && tool_takes_file_path(tool) {
            rename(&mut params, alias, "filePath");
        }
    }
    params
}

fn tool_takes_file_path(tool: &str) -> bool {
    matches!(
        tool,
        "write_file" | "edit_file" | "read_file" | "delete_file" | "undo_edit"
            | "restore_checkpoint"
    )
}

static REF_BRACKETS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[?ref=(\w+)\]?$").expect("ref pattern must compile"));

fn strip_ref_brackets(s: &str) -> Option<String> {
    REF_BRACKETS.captures(s.trim()).map(|c| c[1].to_string())
}

/// Coerce string-encoded scalars toward the declared parameter kinds:
/// `"42"` → `42`, `"true"` → `true`.  Models running without a grammar do
/// this constantly.
pub fn coerce(def: &ToolDefinition, mut params: ParamMap) -> ParamMap {
    for (name, spec) in &def.parameters {
        let Some(Value::String(s)) = params.get(name) else {
            continue;
        };
        let coerced = match spec.kind {
            crate::schema::ParamKind::Integer => s.trim().parse::<i64>().ok().map(Value::from),
            crate::schema::ParamKind::Number => s.trim().parse::<f64>().ok().map(Value::from),
            crate::schema::ParamKind::Boolean => s.trim().parse::<bool>().ok().map(Value::from),
            _ => None,
        };
        if let Some(v) = coerced {
            params.insert(name.clone(), v);
        }
    }
    params
}

// ─── Repair ───────────────────────────────────────────────────────────────────

/// Attempt to rescue malformed calls.  Calls whose required parameters
/// cannot be recovered are dropped; each drop is reported in the returned
/// issue list.
pub fn repair_calls(
    calls: Vec<ToolCall>,
    response_text: &str,
    lookup: &dyn Fn(&str) -> Option<ToolDefinition>,
) -> (Vec<ToolCall>, Vec<String>) {
    let mut repaired = Vec::with_capacity(calls.len());
    let mut issues = Vec::new();

    for mut call in calls {
        let Some(def) = lookup(&call.name) else {
            issues.push(format!("dropped call to unknown tool '{}'", call.name));
            continue;
        };

        // write_file with empty content: the model often puts the body in a
        // code fence next to the call instead of inside the JSON.
        if call.name == "write_file" {
            let empty = call
                .params
                .get("content")
                .and_then(|v| v.as_str())
                .map(|s| s.is_empty())
                .unwrap_or(true);
            if empty {
                if let Some(body) = largest_code_fence(response_text) {
                    call.params.insert("content".into(), Value::String(body));
                    issues.push(
                        "write_file content re-extracted from surrounding text".to_string(),
                    );
                }
            }
        }

        // Obviously truncated / schemeless URLs.
        if let Some(Value::String(url)) = call.params.get("url") {
            if let Some(fixed) = repair_url(url) {
                call.params.insert("url".into(), Value::String(fixed));
            }
        }

        let coerced = coerce(&def, call.params);
        let candidate = ToolCall::new(call.name.clone(), coerced);
        match def.validate(&candidate.params) {
            Ok(()) => repaired.push(candidate),
            Err(reason) => {
                issues.push(format!("dropped call to '{}': {reason}", call.name));
            }
        }
    }

    (repaired, issues)
}

/// Fix `https:/x`, `www.x`, and schemeless hosts.  Returns `None` when the
/// URL is already well-formed.
fn repair_url(url: &str) -> Option<String> {
    let url = url.trim();
    if let Some(rest) = url.strip_prefix("https:/") {
        if !rest.starts_with('/') {
            return Some(format!("https://{rest}"));
        }
    }
    if let Some(rest) = url.strip_prefix("http:/") {
        if !rest.starts_with('/') {
            return Some(format!("http://{rest}"));
        }
    }
    if !url.contains("://") && (url.starts_with("www.") || looks_like_host(url)) {
        return Some(format!("https://{url}"));
    }
    None
}

fn looks_like_host(s: &str) -> bool {
    let host = s.split('/').next().unwrap_or("");
    host.contains('.')
        && !host.contains(' ')
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'))
}

/// The body of the largest fenced code block that is not itself a tool-call
/// JSON object.
fn largest_code_fence(text: &str) -> Option<String> {
    let mut best: Option<String> = None;
    let mut in_fence = false;
    let mut body = String::new();
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            if in_fence {
                let trimmed = body.trim_end_matches('\n');
                let is_call_json =
                    trimmed.trim_start().starts_with('{') && trimmed.contains("\"tool\"");
                if !is_call_json && best.as_ref().map(|b| b.len()).unwrap_or(0) < trimmed.len() {
                    best = Some(trimmed.to_string());
                }
                body.clear();
            }
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            body.push_str(line);
            body.push('\n');
        }
    }
    best.filter(|b| !b.is_empty())
}

// ─── JSON repair ──────────────────────────────────────────────────────────────

/// Attempt to repair common JSON syntax errors in model-emitted arguments:
/// invalid escape sequences, missing commas between pairs, and truncation.
pub fn attempt_json_repair(json_str: &str) -> anyhow::Result<Value> {
    // 1. Fix invalid JSON escape sequences inside string values.
    let fixed = fix_invalid_json_escapes(json_str);
    if let Ok(v) = serde_json::from_str::<Value>(&fixed) {
        return Ok(v);
    }

    // 2. Fix missing comma between key-value pairs like: "key1"value": "...
    static MISSING_COMMA: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#""([^"]+)"([a-zA-Z_][a-zA-Z0-9_]*)":\s*"#)
            .expect("missing-comma pattern must compile")
    });
    let repaired = MISSING_COMMA.replace_all(&fixed, r#""$1", "$2": "#);
    if let Ok(v) = serde_json::from_str::<Value>(&repaired) {
        return Ok(v);
    }

    // 3. Close a truncated object: balance the trailing quote and brace.
    if !fixed.trim().ends_with('}') {
        let mut completed = fixed.clone();
        let quote_count = fixed.chars().filter(|&c| c == '"').count();
        if quote_count % 2 == 1 {
            completed.push('"');
        }
        if !completed.trim().ends_with('}') {
            completed.push('}');
        }
        if let Ok(v) = serde_json::from_str::<Value>(&completed) {
            return Ok(v);
        }
    }

    anyhow::bail!("JSON repair failed: all repair strategies exhausted")
}

/// Walk through a JSON string and replace any invalid escape sequences inside
/// string values with a properly escaped backslash.
///
/// Valid JSON escape characters are: `"`, `\`, `/`, `b`, `f`, `n`, `r`, `t`, `u`.
/// Anything else (e.g. `\c`, `\p`, `\(`) becomes `\\X` so the result parses.
fn fix_invalid_json_escapes(json_str: &str) -> String {
    let mut result = String::with_capacity(json_str.len() + 16);
    let mut chars = json_str.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::schema::{ParamKind, ParamSpec, ToolCategory};

    fn params(v: Value) -> ParamMap {
        v.as_object().unwrap().clone()
    }

    // ── Drift normalization ───────────────────────────────────────────────────

    #[test]
    fn selector_becomes_ref_for_click() {
        let out = normalize("browser_click", params(json!({"selector": "12"})));
        assert_eq!(out.get("ref").unwrap(), "12");
        assert!(!out.contains_key("selector"));
    }

    #[test]
    fn bracket_ref_syntax_is_stripped() {
        let out = normalize("browser_click", params(json!({"ref": "[ref=7]"})));
        assert_eq!(out.get("ref").unwrap(), "7");
    }

    #[test]
    fn value_becomes_text_for_type() {
        let out = normalize("browser_type", params(json!({"ref": "3", "value": "hi"})));
        assert_eq!(out.get("text").unwrap(), "hi");
    }

    #[test]
    fn navigate_url_aliases() {
        for alias in ["href", "link", "src", "page"] {
            let out = normalize("browser_navigate", params(json!({alias: "https://x.com"})));
            assert_eq!(out.get("url").unwrap(), "https://x.com", "alias {alias}");
        }
    }

    #[test]
    fn file_path_aliases_normalize() {
        for alias in ["file_path", "filename", "file_name", "file"] {
            let out = normalize("write_file", params(json!({alias: "a.txt", "content": "x"})));
            assert_eq!(out.get("filePath").unwrap(), "a.txt", "alias {alias}");
        }
    }

    #[test]
    fn path_becomes_file_path_except_on_list_directory() {
        let out = normalize("read_file", params(json!({"path": "a.txt"})));
        assert_eq!(out.get("filePath").unwrap(), "a.txt");

        let out = normalize("list_directory", params(json!({"path": "src"})));
        assert_eq!(out.get("dirPath").unwrap(), "src");
    }

    #[test]
    fn canonical_key_wins_over_alias() {
        let out = normalize(
            "write_file",
            params(json!({"filePath": "keep.txt", "file": "drop.txt", "content": "x"})),
        );
        assert_eq!(out.get("filePath").unwrap(), "keep.txt");
        assert!(!out.contains_key("file"));
    }

    // ── Coercion ──────────────────────────────────────────────────────────────

    fn def_with_int() -> ToolDefinition {
        ToolDefinition::new(
            "t",
            "test",
            ToolCategory::Command,
            [
                ("count", ParamSpec::optional(ParamKind::Integer, "n")),
                ("flag", ParamSpec::optional(ParamKind::Boolean, "b")),
            ],
        )
    }

    #[test]
    fn string_integer_is_coerced() {
        let out = coerce(&def_with_int(), params(json!({"count": "42"})));
        assert_eq!(out.get("count").unwrap(), 42);
    }

    #[test]
    fn string_bool_is_coerced() {
        let out = coerce(&def_with_int(), params(json!({"flag": "true"})));
        assert_eq!(out.get("flag").unwrap(), true);
    }

    #[test]
    fn unparseable_string_left_alone() {
        let out = coerce(&def_with_int(), params(json!({"count": "many"})));
        assert_eq!(out.get("count").unwrap(), "many");
    }

    // ── Repair ────────────────────────────────────────────────────────────────

    fn write_file_def() -> ToolDefinition {
        ToolDefinition::new(
            "write_file",
            "write",
            ToolCategory::Filesystem,
            [
                ("filePath", ParamSpec::required(ParamKind::String, "path")),
                ("content", ParamSpec::required(ParamKind::String, "content")),
            ],
        )
    }

    #[test]
    fn empty_write_content_recovered_from_fence() {
        let text = "Writing the file now.\n```python\nprint('hi')\n```";
        let call = ToolCall::new(
            "write_file",
            params(json!({"filePath": "a.py", "content": ""})),
        );
        let (calls, issues) = repair_calls(vec![call], text, &|n| {
            (n == "write_file").then(write_file_def)
        });
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].params.get("content").unwrap(), "print('hi')");
        assert!(issues.iter().any(|i| i.contains("re-extracted")));
    }

    #[test]
    fn unrecoverable_call_is_dropped_with_issue() {
        let call = ToolCall::new("write_file", params(json!({"content": "x"})));
        let (calls, issues) =
            repair_calls(vec![call], "", &|n| (n == "write_file").then(write_file_def));
        assert!(calls.is_empty());
        assert!(issues[0].contains("filePath"));
    }

    #[test]
    fn unknown_tool_is_dropped_with_issue() {
        let call = ToolCall::new("no_such_tool", ParamMap::new());
        let (calls, issues) = repair_calls(vec![call], "", &|_| None);
        assert!(calls.is_empty());
        assert!(issues[0].contains("unknown tool"));
    }

    #[test]
    fn truncated_url_scheme_is_reconstructed() {
        assert_eq!(repair_url("https:/example.com"), Some("https://example.com".into()));
        assert_eq!(repair_url("www.example.com"), Some("https://www.example.com".into()));
        assert_eq!(repair_url("example.com/page"), Some("https://example.com/page".into()));
        assert_eq!(repair_url("https://fine.example.com"), None);
    }

    // ── JSON repair ───────────────────────────────────────────────────────────

    #[test]
    fn invalid_escape_is_fixed() {
        let v = attempt_json_repair(r#"{"path": "C:\projects\app"}"#).unwrap();
        assert!(v["path"].as_str().unwrap().contains("projects"));
    }

    #[test]
    fn truncated_object_is_closed() {
        let v = attempt_json_repair(r#"{"url": "https://example.com"#).unwrap();
        assert_eq!(v["url"], "https://example.com");
    }

    #[test]
    fn hopeless_input_errors() {
        assert!(attempt_json_repair("not json at all [[[").is_err());
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use falk_config::{PromptStyle, ToolPromptStyle};
use falk_tools::{TaskType, ToolDefinition};

const PREAMBLE_FULL: &str = "\
You are a coding assistant embedded in a desktop editor. You complete the \
user's task by thinking step by step and calling tools when an action is \
needed. Call a tool by emitting a fenced JSON block:

```json
{\"tool\":\"<name>\",\"params\":{\"<key>\":\"<value>\"}}
```

Rules:
- Use tools for every real-world action; never claim to have done \
something without the corresponding tool call.
- One step at a time: gather information before writing files.
- After browser state changes, take a fresh snapshot before using element refs.
- When the task is complete, answer in plain text without tool calls.";

const PREAMBLE_COMPACT: &str = "\
You are a coding assistant. To act, emit exactly:
```json
{\"tool\":\"<name>\",\"params\":{...}}
```
Act only through tools; answer in plain text when done.";

const PREAMBLE_CHAT: &str = "\
You are a helpful coding assistant. Answer the user's question directly \
and concisely. Do not call tools.";

/// Stable per-request preamble.  Cache-friendly: identical across all
/// iterations of one request.
pub fn preamble(task: TaskType, style: PromptStyle) -> &'static str {
    match (task, style) {
        (TaskType::Chat, _) => PREAMBLE_CHAT,
        (_, PromptStyle::Compact) => PREAMBLE_COMPACT,
        (_, PromptStyle::Full) => PREAMBLE_FULL,
    }
}

/// Render the disclosed tool set for the prompt.
///
/// `GrammarOnly` returns a one-line hint; the grammar itself carries the
/// schemas, so spelling them out in text would only burn budget.
pub fn tool_prompt(defs: &[ToolDefinition], style: ToolPromptStyle) -> String {
    if defs.is_empty() {
        return String::new();
    }
    match style {
        ToolPromptStyle::GrammarOnly => format!(
            "You have {} tools available; the call format is enforced for you.",
            defs.len()
        ),
        ToolPromptStyle::Compact => {
            let lines: Vec<String> = defs.iter().map(|d| format!("- {}", d.compact_hint())).collect();
            format!("Available tools:\n{}", lines.join("\n"))
        }
        ToolPromptStyle::Full => {
            let blocks: Vec<String> = defs
                .iter()
                .map(|d| {
                    format!(
                        "### {}\n{}\nParameters: {}",
                        d.name,
                        d.description,
                        d.json_schema()
                    )
                })
                .collect();
            format!("## Available tools\n\n{}", blocks.join("\n\n"))
        }
    }
}

/// User-turn marker for a seamless continuation after a maxTokens stop.
pub const CONTINUATION_MARKER: &str = "[continue where you left off]";

/// Directive injected after two consecutive failures of the same tool.
pub fn repeat_failure_directive(tool: &str) -> String {
    format!(
        "STOP: do not call {tool} again this turn; it has failed twice with \
         the same outcome. Choose a different approach."
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

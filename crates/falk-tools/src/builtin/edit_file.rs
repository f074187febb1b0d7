// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::schema::{ParamKind, ParamSpec, ToolCategory, ToolDefinition};
use crate::tool::{ErrorKind, ParamMap, Tool, ToolResult};

/// Exact-match text replacement in an existing file.
///
/// `oldText` must occur exactly once; an ambiguous or absent match is an
/// error so the model adds context instead of corrupting the file.  With a
/// unique match, `edit_file(A→B)` then `edit_file(B→A)` restores the file
/// byte-equal.
pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "edit_file",
            "Replace one occurrence of oldText with newText in a file. \
             oldText must match exactly once; include surrounding lines to \
             disambiguate repeated snippets.",
            ToolCategory::Filesystem,
            [
                ("filePath", ParamSpec::required(ParamKind::String, "File to edit")),
                ("oldText", ParamSpec::required(ParamKind::String, "Exact text to replace")),
                ("newText", ParamSpec::required(ParamKind::String, "Replacement text")),
            ],
        )
    }

    async fn execute(&self, params: &ParamMap) -> ToolResult {
        let path = params.get("filePath").and_then(|v| v.as_str()).unwrap_or_default();
        let old_text = params.get("oldText").and_then(|v| v.as_str()).unwrap_or_default();
        let new_text = params.get("newText").and_then(|v| v.as_str()).unwrap_or_default();

        debug!(path = %path, "edit_file tool");

        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => {
                return ToolResult::err(ErrorKind::ToolExecution, format!("read error: {e}"))
            }
        };

        let matches = contents.matches(old_text).count();
        if old_text.is_empty() || matches == 0 {
            return ToolResult::err(
                ErrorKind::ToolExecution,
                format!("oldText not found in {path}; re-read the file and retry"),
            );
        }
        if matches > 1 {
            return ToolResult::err(
                ErrorKind::ToolExecution,
                format!(
                    "oldText matches {matches} locations in {path}; \
                     add surrounding lines to make it unique"
                ),
            );
        }

        let updated = contents.replacen(old_text, new_text, 1);
        match tokio::fs::write(path, &updated).await {
            Ok(()) => ToolResult::ok(json!({
                "filePath": path,
                "output": format!("replaced 1 occurrence in {path}"),
            })),
            Err(e) => ToolResult::err(ErrorKind::ToolExecution, format!("write error: {e}")),
        }
    }
}

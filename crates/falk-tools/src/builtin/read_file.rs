// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::json;

use crate::schema::{ParamKind, ParamSpec, ToolCategory, ToolDefinition};
use crate::tool::{ErrorKind, OutputCategory, ParamMap, Tool, ToolResult};

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "read_file",
            "Read a text file. Optional offset/limit select a line window \
             for large files.",
            ToolCategory::Filesystem,
            [
                ("filePath", ParamSpec::required(ParamKind::String, "File to read")),
                ("offset", ParamSpec::optional(ParamKind::Integer, "1-based first line")),
                ("limit", ParamSpec::optional(ParamKind::Integer, "Max lines to return")),
            ],
        )
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::FileContent
    }

    async fn execute(&self, params: &ParamMap) -> ToolResult {
        let path = params.get("filePath").and_then(|v| v.as_str()).unwrap_or_default();
        let offset = params.get("offset").and_then(|v| v.as_u64()).unwrap_or(1).max(1) as usize;
        let limit = params.get("limit").and_then(|v| v.as_u64()).map(|l| l as usize);

        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => {
                return ToolResult::err(ErrorKind::ToolExecution, format!("read error: {e}"))
            }
        };

        let total_lines = contents.lines().count();
        let window: String = match limit {
            None if offset == 1 => contents.clone(),
            _ => contents
                .lines()
                .skip(offset - 1)
                .take(limit.unwrap_or(usize::MAX))
                .collect::<Vec<_>>()
                .join("\n"),
        };

        ToolResult::ok(json!({
            "filePath": path,
            "totalLines": total_lines,
            "content": window,
        }))
    }
}

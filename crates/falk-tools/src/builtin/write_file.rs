// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::schema::{ParamKind, ParamSpec, ToolCategory, ToolDefinition};
use crate::tool::{ErrorKind, ParamMap, Tool, ToolResult};

/// Writes a file, creating parent directories as needed.
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "write_file",
            "Write content to a file, overwriting any existing content. \
             Creates parent directories automatically. \
             Prefer edit_file for changing existing files.",
            ToolCategory::Filesystem,
            [
                ("filePath", ParamSpec::required(ParamKind::String, "Target file path")),
                ("content", ParamSpec::required(ParamKind::String, "Full file content")),
            ],
        )
    }

    async fn execute(&self, params: &ParamMap) -> ToolResult {
        let path = params.get("filePath").and_then(|v| v.as_str()).unwrap_or_default();
        let content = params.get("content").and_then(|v| v.as_str()).unwrap_or_default();

        debug!(path = %path, bytes = content.len(), "write_file tool");

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
        }
        match tokio::fs::write(path, content).await {
            Ok(()) => ToolResult::ok(json!({
                "filePath": path,
                "bytes": content.len(),
                "output": format!("wrote {} bytes to {path}", content.len()),
            })),
            Err(e) => ToolResult::err(ErrorKind::ToolExecution, format!("write error: {e}")),
        }
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::schema::{ParamKind, ParamSpec, ToolCategory, ToolDefinition};
use crate::tool::{ErrorKind, ParamMap, Tool, ToolResult};

pub struct DeleteFileTool;

#[async_trait]
impl Tool for DeleteFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "delete_file",
            "Delete a single file. Directories are not removed.",
            ToolCategory::Filesystem,
            [("filePath", ParamSpec::required(ParamKind::String, "File to delete"))],
        )
    }

    async fn execute(&self, params: &ParamMap) -> ToolResult {
        let path = params.get("filePath").and_then(|v| v.as_str()).unwrap_or_default();
        debug!(path = %path, "delete_file tool");
        match tokio::fs::remove_file(path).await {
            Ok(()) => ToolResult::ok(json!({
                "filePath": path,
                "output": format!("deleted {path}"),
            })),
            Err(e) => ToolResult::err(ErrorKind::ToolExecution, format!("delete error: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn deletes_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.txt");
        std::fs::write(&path, "x").unwrap();

        let out = DeleteFileTool
            .execute(json!({"filePath": path.to_str().unwrap()}).as_object().unwrap())
            .await;
        assert!(out.is_ok());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_file_is_error() {
        let out = DeleteFileTool
            .execute(json!({"filePath": "/no/such/file"}).as_object().unwrap())
            .await;
        assert!(!out.is_ok());
    }
}

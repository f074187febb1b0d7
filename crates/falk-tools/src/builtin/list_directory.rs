// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::json;
use walkdir::WalkDir;

use crate::schema::{ParamKind, ParamSpec, ToolCategory, ToolDefinition};
use crate::tool::{ErrorKind, OutputCategory, ParamMap, Tool, ToolResult};

/// Entries beyond this are dropped with a note; directory dumps must never
/// dominate the prompt.
const MAX_ENTRIES: usize = 500;

pub struct ListDirectoryTool;

#[async_trait]
impl Tool for ListDirectoryTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "list_directory",
            "List directory entries. depth > 1 recurses; hidden files and \
             common build/dependency directories are skipped.",
            ToolCategory::Filesystem,
            [
                ("dirPath", ParamSpec::required(ParamKind::String, "Directory to list")),
                ("depth", ParamSpec::optional(ParamKind::Integer, "Recursion depth (default 1)")),
            ],
        )
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::MatchList
    }

    async fn execute(&self, params: &ParamMap) -> ToolResult {
        let path = params.get("dirPath").and_then(|v| v.as_str()).unwrap_or_default();
        let depth = params.get("depth").and_then(|v| v.as_u64()).unwrap_or(1).max(1) as usize;

        if !std::path::Path::new(path).is_dir() {
            return ToolResult::err(
                ErrorKind::ToolExecution,
                format!("{path} is not a directory"),
            );
        }

        let mut entries = Vec::new();
        let mut truncated = false;
        // depth 0 is the listed root itself; only entries below it are
        // subject to the noise filter (the root may be a dot-directory).
        for entry in WalkDir::new(path)
            .min_depth(1)
            .max_depth(depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0 || !is_noise(e.file_name().to_string_lossy().as_ref())
            })
        {
            let Ok(entry) = entry else { continue };
            if entries.len() >= MAX_ENTRIES {
                truncated = true;
                break;
            }
            let rel = entry
                .path()
                .strip_prefix(path)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();
            let suffix = if entry.file_type().is_dir() { "/" } else { "" };
            entries.push(format!("{rel}{suffix}"));
        }

        ToolResult::ok(json!({
            "dirPath": path,
            "count": entries.len(),
            "truncated": truncated,
            "output": entries.join("\n"),
        }))
    }
}

fn is_noise(name: &str) -> bool {
    name.starts_with('.')
        || matches!(name, "node_modules" | "target" | "dist" | "build" | "__pycache__")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn params(v: serde_json::Value) -> ParamMap {
        v.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn lists_files_and_marks_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let out = ListDirectoryTool
            .execute(&params(json!({"dirPath": dir.path().to_str().unwrap()})))
            .await;
        let listing = out.payload().unwrap()["output"].as_str().unwrap().to_string();
        assert!(listing.contains("a.txt"));
        assert!(listing.contains("sub/"));
    }

    #[tokio::test]
    async fn depth_one_does_not_recurse() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/deep.txt"), "").unwrap();

        let out = ListDirectoryTool
            .execute(&params(json!({"dirPath": dir.path().to_str().unwrap()})))
            .await;
        let listing = out.payload().unwrap()["output"].as_str().unwrap().to_string();
        assert!(!listing.contains("deep.txt"));
    }

    #[tokio::test]
    async fn hidden_and_build_dirs_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::create_dir(dir.path().join("node_modules")).unwrap();
        std::fs::write(dir.path().join("kept.rs"), "").unwrap();

        let out = ListDirectoryTool
            .execute(&params(json!({"dirPath": dir.path().to_str().unwrap()})))
            .await;
        let listing = out.payload().unwrap()["output"].as_str().unwrap().to_string();
        assert!(listing.contains("kept.rs"));
        assert!(!listing.contains(".git"));
        assert!(!listing.contains("node_modules"));
    }

    #[tokio::test]
    async fn non_directory_is_error() {
        let out = ListDirectoryTool
            .execute(&params(json!({"dirPath": "/no/such/dir"})))
            .await;
        assert!(!out.is_ok());
    }
}

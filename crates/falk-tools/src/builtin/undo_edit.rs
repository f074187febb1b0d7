// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use crate::schema::{ParamKind, ParamSpec, ToolCategory, ToolDefinition};
use crate::tool::{ErrorKind, ParamMap, Tool, ToolResult};
use crate::undo::UndoLedger;

/// Revert the most recent file mutation recorded in the undo ledger.
pub struct UndoEditTool {
    ledger: Arc<Mutex<UndoLedger>>,
}

impl UndoEditTool {
    pub fn new(ledger: Arc<Mutex<UndoLedger>>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Tool for UndoEditTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "undo_edit",
            "Revert the most recent file write, edit or delete.",
            ToolCategory::Filesystem,
            [],
        )
    }

    async fn execute(&self, _params: &ParamMap) -> ToolResult {
        let result = self.ledger.lock().unwrap().undo_last();
        match result {
            Ok(path) => ToolResult::ok(json!({
                "output": format!("reverted last change to {}", path.display()),
            })),
            Err(e) => ToolResult::err(ErrorKind::ToolExecution, e.to_string()),
        }
    }
}

/// Rewind one file to the state it had before this request first touched it.
pub struct RestoreCheckpointTool {
    ledger: Arc<Mutex<UndoLedger>>,
}

impl RestoreCheckpointTool {
    pub fn new(ledger: Arc<Mutex<UndoLedger>>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Tool for RestoreCheckpointTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "restore_checkpoint",
            "Restore a file to its state before the first change made in \
             this request.",
            ToolCategory::Filesystem,
            [("filePath", ParamSpec::required(ParamKind::String, "File to restore"))],
        )
    }

    async fn execute(&self, params: &ParamMap) -> ToolResult {
        let path = params.get("filePath").and_then(|v| v.as_str()).unwrap_or_default();
        let result = self
            .ledger
            .lock()
            .unwrap()
            .restore_file(std::path::Path::new(path));
        match result {
            Ok(()) => ToolResult::ok(json!({
                "output": format!("restored {path} to its pre-request state"),
            })),
            Err(e) => ToolResult::err(ErrorKind::ToolExecution, e.to_string()),
        }
    }
}

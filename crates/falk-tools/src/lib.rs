// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
pub mod normalize;
pub mod parser;
pub mod pipeline;
pub mod policy;
pub mod registry;
pub mod sanitize;
pub mod schema;
pub mod tool;
pub mod undo;

pub use parser::{contains_malformed_markup, parse_response, ParseOutcome};
pub use pipeline::{plan, PlannedAction, PlannedCall};
pub use policy::{PolicyDecision, ToolPolicy};
pub use registry::{ListFilter, PermissionGate, ToolRegistry};
pub use schema::{ParamKind, ParamSpec, TaskType, ToolCategory, ToolDefinition};
pub use tool::{ErrorKind, OutputCategory, ParamMap, Tool, ToolCall, ToolResult};
pub use undo::{UndoEntry, UndoLedger};

// Built-in tool exports
pub use builtin::browser::{
    register_browser_tools, BrowserClickTool, BrowserGetContentTool, BrowserNavigateTool,
    BrowserPort, BrowserSnapshotTool, BrowserTypeTool, FakeBrowser, PageInfo,
};
pub use builtin::delete_file::DeleteFileTool;
pub use builtin::edit_file::EditFileTool;
pub use builtin::fetch_webpage::FetchWebpageTool;
pub use builtin::http_request::HttpRequestTool;
pub use builtin::list_directory::ListDirectoryTool;
pub use builtin::read_file::ReadFileTool;
pub use builtin::run_command::RunCommandTool;
pub use builtin::undo_edit::{RestoreCheckpointTool, UndoEditTool};
pub use builtin::web_search::{SearchHit, SearchPort, WebSearchTool};
pub use builtin::write_file::WriteFileTool;

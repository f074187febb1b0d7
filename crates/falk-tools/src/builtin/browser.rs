// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Browser tools backed by a host-supplied driver port.
//!
//! Concrete automation (CDP, WebDriver, whatever the host ships) lives
//! behind [`BrowserPort`]; the engine only knows the operations, their
//! schemas, and that element refs go stale after a state change.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::schema::{ParamKind, ParamSpec, ToolCategory, ToolDefinition};
use crate::tool::{ErrorKind, OutputCategory, ParamMap, Tool, ToolResult};

/// Result of a navigation: what the page says it is.
#[derive(Debug, Clone)]
pub struct PageInfo {
    pub url: String,
    pub title: String,
}

/// Port to the host's browser driver.
///
/// `snapshot` returns a ref-annotated accessibility outline (`[ref=N]`
/// markers on interactive elements); `get_content` returns readable page
/// text.  Screenshot bytes are returned as a data URL so the scheduler can
/// route them through a vision model when the active engine lacks vision.
#[async_trait]
pub trait BrowserPort: Send + Sync {
    async fn navigate(&self, url: &str) -> anyhow::Result<PageInfo>;
    async fn click(&self, element_ref: &str) -> anyhow::Result<()>;
    async fn type_text(&self, element_ref: &str, text: &str) -> anyhow::Result<()>;
    async fn snapshot(&self) -> anyhow::Result<String>;
    async fn get_content(&self) -> anyhow::Result<String>;
    async fn screenshot(&self) -> anyhow::Result<String>;
}

pub struct BrowserNavigateTool {
    port: Arc<dyn BrowserPort>,
}

impl BrowserNavigateTool {
    pub fn new(port: Arc<dyn BrowserPort>) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Tool for BrowserNavigateTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "browser_navigate",
            "Open a URL in the browser and return the resulting page title.",
            ToolCategory::Browser,
            [("url", ParamSpec::required(ParamKind::String, "Destination URL"))],
        )
    }

    async fn execute(&self, params: &ParamMap) -> ToolResult {
        let url = params.get("url").and_then(|v| v.as_str()).unwrap_or_default();
        debug!(url = %url, "browser_navigate tool");
        match self.port.navigate(url).await {
            Ok(info) => ToolResult::ok(json!({ "url": info.url, "title": info.title })),
            Err(e) => ToolResult::err(ErrorKind::ToolExecution, format!("browser error: {e}")),
        }
    }
}

pub struct BrowserClickTool {
    port: Arc<dyn BrowserPort>,
}

impl BrowserClickTool {
    pub fn new(port: Arc<dyn BrowserPort>) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Tool for BrowserClickTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "browser_click",
            "Click the element with the given snapshot ref.",
            ToolCategory::Browser,
            [("ref", ParamSpec::required(ParamKind::String, "Element ref from browser_snapshot"))],
        )
    }

    async fn execute(&self, params: &ParamMap) -> ToolResult {
        let element_ref = params.get("ref").and_then(|v| v.as_str()).unwrap_or_default();
        match self.port.click(element_ref).await {
            Ok(()) => ToolResult::ok(json!({ "output": format!("clicked element {element_ref}") })),
            Err(e) => ToolResult::err(ErrorKind::ToolExecution, format!("browser error: {e}")),
        }
    }
}

pub struct BrowserTypeTool {
    port: Arc<dyn BrowserPort>,
}

impl BrowserTypeTool {
    pub fn new(port: Arc<dyn BrowserPort>) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Tool for BrowserTypeTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "browser_type",
            "Type text into the element with the given snapshot ref.",
            ToolCategory::Browser,
            [
                ("ref", ParamSpec::required(ParamKind::String, "Element ref from browser_snapshot")),
                ("text", ParamSpec::required(ParamKind::String, "Text to type")),
            ],
        )
    }

    async fn execute(&self, params: &ParamMap) -> ToolResult {
        let element_ref = params.get("ref").and_then(|v| v.as_str()).unwrap_or_default();
        let text = params.get("text").and_then(|v| v.as_str()).unwrap_or_default();
        match self.port.type_text(element_ref, text).await {
            Ok(()) => {
                ToolResult::ok(json!({ "output": format!("typed into element {element_ref}") }))
            }
            Err(e) => ToolResult::err(ErrorKind::ToolExecution, format!("browser error: {e}")),
        }
    }
}

pub struct BrowserSnapshotTool {
    port: Arc<dyn BrowserPort>,
}

impl BrowserSnapshotTool {
    pub fn new(port: Arc<dyn BrowserPort>) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Tool for BrowserSnapshotTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "browser_snapshot",
            "Capture a ref-annotated outline of the current page. Use the \
             [ref=N] markers with browser_click / browser_type.",
            ToolCategory::Browser,
            [],
        )
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::FileContent
    }

    async fn execute(&self, _params: &ParamMap) -> ToolResult {
        match self.port.snapshot().await {
            Ok(outline) => ToolResult::ok(json!({ "content": outline })),
            Err(e) => ToolResult::err(ErrorKind::ToolExecution, format!("browser error: {e}")),
        }
    }
}

pub struct BrowserGetContentTool {
    port: Arc<dyn BrowserPort>,
}

impl BrowserGetContentTool {
    pub fn new(port: Arc<dyn BrowserPort>) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Tool for BrowserGetContentTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "browser_get_content",
            "Return the readable text content of the current page.",
            ToolCategory::Browser,
            [],
        )
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::FileContent
    }

    async fn execute(&self, _params: &ParamMap) -> ToolResult {
        match self.port.get_content().await {
            Ok(text) => ToolResult::ok(json!({ "text": text })),
            Err(e) => ToolResult::err(ErrorKind::ToolExecution, format!("browser error: {e}")),
        }
    }
}

/// Register the whole browser family against one shared port.
pub fn register_browser_tools(
    registry: &mut crate::registry::ToolRegistry,
    port: Arc<dyn BrowserPort>,
) {
    registry.register(BrowserNavigateTool::new(Arc::clone(&port)));
    registry.register(BrowserClickTool::new(Arc::clone(&port)));
    registry.register(BrowserTypeTool::new(Arc::clone(&port)));
    registry.register(BrowserSnapshotTool::new(Arc::clone(&port)));
    registry.register(BrowserGetContentTool::new(port));
}

/// Scriptable in-memory page.  Lives outside `#[cfg(test)]` so scenario
/// tests in the core crate can drive the full browser family without a
/// real driver.
pub struct FakeBrowser {
    pub title: String,
    pub content: String,
}

#[async_trait]
impl BrowserPort for FakeBrowser {
    async fn navigate(&self, url: &str) -> anyhow::Result<PageInfo> {
        Ok(PageInfo { url: url.to_string(), title: self.title.clone() })
    }
    async fn click(&self, element_ref: &str) -> anyhow::Result<()> {
        anyhow::ensure!(!element_ref.is_empty(), "empty ref");
        Ok(())
    }
    async fn type_text(&self, element_ref: &str, _text: &str) -> anyhow::Result<()> {
        anyhow::ensure!(!element_ref.is_empty(), "empty ref");
        Ok(())
    }
    async fn snapshot(&self) -> anyhow::Result<String> {
        Ok(format!("- heading \"{}\"\n- link [ref=1]\n- button [ref=2]", self.title))
    }
    async fn get_content(&self) -> anyhow::Result<String> {
        Ok(self.content.clone())
    }
    async fn screenshot(&self) -> anyhow::Result<String> {
        Ok("data:image/png;base64,AAAA".into())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn fake() -> Arc<dyn BrowserPort> {
        Arc::new(FakeBrowser {
            title: "Example Domain".into(),
            content: "Example Domain. This domain is for use in examples.".into(),
        })
    }

    #[tokio::test]
    async fn navigate_returns_title_and_url() {
        let tool = BrowserNavigateTool::new(fake());
        let out = tool
            .execute(json!({"url": "https://example.com"}).as_object().unwrap())
            .await;
        let p = out.payload().unwrap();
        assert_eq!(p["title"], "Example Domain");
        assert_eq!(p["url"], "https://example.com");
    }

    #[tokio::test]
    async fn snapshot_contains_refs() {
        let tool = BrowserSnapshotTool::new(fake());
        let out = tool.execute(&ParamMap::new()).await;
        assert!(out.payload().unwrap()["content"]
            .as_str()
            .unwrap()
            .contains("[ref=1]"));
    }

    #[tokio::test]
    async fn click_with_empty_ref_is_error() {
        let tool = BrowserClickTool::new(fake());
        let out = tool.execute(json!({"ref": ""}).as_object().unwrap()).await;
        assert!(!out.is_ok());
    }

    #[tokio::test]
    async fn get_content_returns_page_text() {
        let tool = BrowserGetContentTool::new(fake());
        let out = tool.execute(&ParamMap::new()).await;
        assert!(out.payload().unwrap()["text"]
            .as_str()
            .unwrap()
            .contains("Example Domain"));
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::schema::{ParamKind, ParamSpec, ToolCategory, ToolDefinition};
use crate::tool::{ErrorKind, OutputCategory, ParamMap, Tool, ToolResult};

/// One search hit as delivered by the host's search backend.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Port to the host's web-search backend (API key handling, engine choice
/// and result ranking are the host's concern).
#[async_trait]
pub trait SearchPort: Send + Sync {
    async fn search(&self, query: &str) -> anyhow::Result<Vec<SearchHit>>;
}

pub struct WebSearchTool {
    port: Arc<dyn SearchPort>,
}

impl WebSearchTool {
    pub fn new(port: Arc<dyn SearchPort>) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "web_search",
            "Search the web and return ranked results with titles, URLs and \
             snippets.",
            ToolCategory::Web,
            [("query", ParamSpec::required(ParamKind::String, "Search query"))],
        )
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::MatchList
    }

    async fn execute(&self, params: &ParamMap) -> ToolResult {
        let query = params.get("query").and_then(|v| v.as_str()).unwrap_or_default();
        debug!(query = %query, "web_search tool");

        match self.port.search(query).await {
            Ok(hits) => {
                let rendered: Vec<String> = hits
                    .iter()
                    .map(|h| format!("{} — {}\n  {}", h.title, h.url, h.snippet))
                    .collect();
                ToolResult::ok(json!({
                    "query": query,
                    "count": hits.len(),
                    "output": rendered.join("\n"),
                }))
            }
            Err(e) => ToolResult::err(ErrorKind::ToolExecution, format!("search error: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct FixedSearch(Vec<SearchHit>);

    #[async_trait]
    impl SearchPort for FixedSearch {
        async fn search(&self, _query: &str) -> anyhow::Result<Vec<SearchHit>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn renders_hits_with_titles_and_urls() {
        let tool = WebSearchTool::new(Arc::new(FixedSearch(vec![SearchHit {
            title: "Rust Book".into(),
            url: "https://doc.rust-lang.org/book".into(),
            snippet: "The Rust Programming Language".into(),
        }])));
        let out = tool
            .execute(json!({"query": "rust book"}).as_object().unwrap())
            .await;
        let p = out.payload().unwrap();
        assert_eq!(p["count"], 1);
        assert!(p["output"].as_str().unwrap().contains("doc.rust-lang.org"));
    }

    #[tokio::test]
    async fn empty_result_set_is_ok_with_zero_count() {
        let tool = WebSearchTool::new(Arc::new(FixedSearch(vec![])));
        let out = tool.execute(json!({"query": "x"}).as_object().unwrap()).await;
        assert_eq!(out.payload().unwrap()["count"], 0);
    }
}

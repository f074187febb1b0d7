// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::schema::{ParamKind, ParamSpec, ToolCategory, ToolDefinition};
use crate::tool::{ErrorKind, ParamMap, Tool, ToolResult};

const DEFAULT_MAX_CHARS: usize = 50_000;

/// Fetch a page and convert the HTML to readable text.  The lighter-weight
/// alternative the engine steers the model toward when a domain blocks
/// browser automation.
pub struct FetchWebpageTool;

#[async_trait]
impl Tool for FetchWebpageTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "fetch_webpage",
            "Fetch a URL and convert the HTML to plain readable text. \
             Read-only; no authentication, no private addresses.",
            ToolCategory::Web,
            [
                ("url", ParamSpec::required(ParamKind::String, "Page URL (http/https)")),
                ("max_chars", ParamSpec::optional(ParamKind::Integer, "Output cap (default 50000)")),
            ],
        )
    }

    async fn execute(&self, params: &ParamMap) -> ToolResult {
        let url = params.get("url").and_then(|v| v.as_str()).unwrap_or_default();
        let max_chars = params
            .get("max_chars")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_MAX_CHARS as u64) as usize;

        debug!(url = %url, "fetch_webpage tool");

        match fetch_as_text(url, max_chars).await {
            Ok((title, text)) => ToolResult::ok(json!({
                "url": url,
                "title": title,
                "text": text,
            })),
            Err(e) => ToolResult::err(ErrorKind::ToolExecution, format!("fetch error: {e}")),
        }
    }
}

async fn fetch_as_text(url: &str, max_chars: usize) -> anyhow::Result<(String, String)> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .user_agent("Mozilla/5.0 (compatible; falk-agent)")
        .build()?;
    let resp = client.get(url).send().await?.error_for_status()?;
    let html = resp.text().await?;

    let title = extract_title(&html).unwrap_or_default();
    let mut text = html2text::from_read(html.as_bytes(), 100);
    if text.len() > max_chars {
        let cut = text
            .char_indices()
            .take_while(|(i, _)| *i <= max_chars)
            .last()
            .map(|(i, _)| i)
            .unwrap_or(0);
        text.truncate(cut);
        text.push_str("\n…[content truncated]");
    }
    Ok((title, text))
}

fn extract_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let start = lower.find("<title")?;
    let open_end = html[start..].find('>')? + start + 1;
    let close = lower[open_end..].find("</title>")? + open_end;
    Some(html[open_end..close].trim().to_string())
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::schema::{ParamKind, ParamSpec, ToolCategory, ToolDefinition};
use crate::tool::{ErrorKind, ParamMap, Tool, ToolResult};

const DEFAULT_MAX_CHARS: usize = 50_000;

/// Raw HTTP request tool.  Private-address blocking happens in the
/// executor before this handler runs.
pub struct HttpRequestTool;

#[async_trait]
impl Tool for HttpRequestTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "http_request",
            "Send an HTTP request and return status, headers and body text. \
             Public hosts only; private and link-local addresses are blocked.",
            ToolCategory::Web,
            [
                ("url", ParamSpec::required(ParamKind::String, "Request URL (http/https)")),
                ("method", ParamSpec::optional(ParamKind::String, "GET (default), POST, PUT, DELETE")),
                ("headers", ParamSpec::optional(ParamKind::Object, "Extra request headers")),
                ("body", ParamSpec::optional(ParamKind::String, "Request body")),
            ],
        )
    }

    async fn execute(&self, params: &ParamMap) -> ToolResult {
        let url = params.get("url").and_then(|v| v.as_str()).unwrap_or_default();
        let method = params
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_ascii_uppercase();

        debug!(url = %url, method = %method, "http_request tool");

        let client = match reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                return ToolResult::err(ErrorKind::ToolExecution, format!("client error: {e}"))
            }
        };

        let mut req = match method.as_str() {
            "GET" => client.get(url),
            "POST" => client.post(url),
            "PUT" => client.put(url),
            "DELETE" => client.delete(url),
            other => {
                return ToolResult::err(
                    ErrorKind::SchemaViolation,
                    format!("unsupported method '{other}'"),
                )
            }
        };
        if let Some(Value::Object(headers)) = params.get("headers") {
            for (k, v) in headers {
                if let Some(v) = v.as_str() {
                    req = req.header(k, v);
                }
            }
        }
        if let Some(body) = params.get("body").and_then(|v| v.as_str()) {
            req = req.body(body.to_string());
        }

        match req.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let mut text = resp.text().await.unwrap_or_default();
                if text.len() > DEFAULT_MAX_CHARS {
                    let cut = text
                        .char_indices()
                        .map(|(i, _)| i)
                        .take_while(|i| *i <= DEFAULT_MAX_CHARS)
                        .last()
                        .unwrap_or(0);
                    text.truncate(cut);
                    text.push_str("\n…[body truncated]");
                }
                ToolResult::ok(json!({ "status": status, "text": text }))
            }
            Err(e) => ToolResult::err(ErrorKind::ToolExecution, format!("request error: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tool::Tool;

    #[tokio::test]
    async fn unsupported_method_is_schema_violation() {
        let out = HttpRequestTool
            .execute(
                json!({"url": "https://example.com", "method": "BREW"})
                    .as_object()
                    .unwrap(),
            )
            .await;
        assert_eq!(out.error().unwrap().0, ErrorKind::SchemaViolation);
    }

    #[tokio::test]
    async fn connection_failure_is_tool_error() {
        // Nothing listens on port 1; the refusal is immediate.  (The SSRF
        // block lives in the executor, so calling the handler directly with
        // a loopback address is fine here.)
        let out = HttpRequestTool
            .execute(json!({"url": "http://127.0.0.1:1/"}).as_object().unwrap())
            .await;
        assert_eq!(out.error().unwrap().0, ErrorKind::ToolExecution);
    }
}

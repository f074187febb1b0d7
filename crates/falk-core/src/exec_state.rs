// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Ground-truth record of tools actually executed in a request.
//!
//! The summarizer ledger records what the conversation *says* happened;
//! this structure records what *did* happen, and is what hallucination
//! detection, domain throttling, and the post-loop completion guarantee
//! trust.  Append-only within a request.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use falk_tools::{ParamMap, ToolResult};

/// Attempts on one hostname before further navigation is refused.
const MAX_DOMAIN_ATTEMPTS: u32 = 4;
/// Bot-detection failures on one hostname before it is blocked.
const MAX_BOT_FAILURES: u32 = 3;

static BOT_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(captcha|challenge|cloudflare|blocked|access denied|are you a robot)\b")
        .expect("bot-detection pattern must compile")
});

#[derive(Debug, Clone)]
pub struct UrlVisit {
    pub url: String,
    pub domain: String,
    pub iteration: u32,
    pub success: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DomainStats {
    pub attempts: u32,
    pub failures: u32,
    pub last_iteration: u32,
}

#[derive(Debug, Default)]
pub struct ExecutionState {
    pub urls_visited: Vec<UrlVisit>,
    pub files_written: Vec<(PathBuf, u32)>,
    pub files_edited: Vec<(PathBuf, u32)>,
    pub searches: Vec<(String, u32)>,
    /// (source, excerpt, iteration) for every successful gather call.
    pub extractions: Vec<(String, String, u32)>,
    pub domains_blocked: HashSet<String>,
    pub domain_attempts: HashMap<String, DomainStats>,
    total_calls: u64,
    browser_calls: u64,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one executed call.  Files enter `files_written` /
    /// `files_edited` only when the result is ok; navigation attempts are
    /// recorded regardless so throttling sees failures too.
    pub fn record(&mut self, tool: &str, params: &ParamMap, result: &ToolResult, iteration: u32) {
        self.total_calls += 1;
        if tool.starts_with("browser_") {
            self.browser_calls += 1;
        }
        let ok = result.is_ok();
        // The executor resolves paths against the project root; successful
        // mutations report the resolved path back in the payload, which is
        // the form the completion guarantee needs.
        let written_path = result
            .payload()
            .and_then(|p| p.get("filePath"))
            .and_then(Value::as_str)
            .or_else(|| str_param(params, "filePath"))
            .map(PathBuf::from);
        match tool {
            "browser_navigate" => self.record_navigation(params, result, iteration),
            "write_file" if ok => {
                if let Some(p) = written_path {
                    self.files_written.push((p, iteration));
                }
            }
            "edit_file" if ok => {
                if let Some(p) = written_path {
                    self.files_edited.push((p, iteration));
                }
            }
            "web_search" => {
                if let Some(q) = str_param(params, "query") {
                    self.searches.push((q.to_string(), iteration));
                }
                if ok {
                    self.record_extraction(tool, result, iteration);
                }
            }
            "fetch_webpage" | "http_request" | "browser_get_content" | "browser_evaluate" => {
                if ok {
                    self.record_extraction(tool, result, iteration);
                }
            }
            _ => {}
        }
    }

    fn record_navigation(&mut self, params: &ParamMap, result: &ToolResult, iteration: u32) {
        let Some(url) = str_param(params, "url") else {
            return;
        };
        let domain = domain_of(url);
        let ok = result.is_ok();
        self.urls_visited.push(UrlVisit {
            url: url.to_string(),
            domain: domain.clone(),
            iteration,
            success: ok,
        });

        let stats = self.domain_attempts.entry(domain.clone()).or_default();
        stats.attempts += 1;
        stats.last_iteration = iteration;

        let bot_detected = match result {
            ToolResult::Ok { payload } => payload
                .get("title")
                .and_then(Value::as_str)
                .map(|t| BOT_KEYWORDS.is_match(t))
                .unwrap_or(false),
            ToolResult::Err { message, .. } => BOT_KEYWORDS.is_match(message),
        };
        if !ok || bot_detected {
            stats.failures += 1;
        }

        if stats.attempts >= MAX_DOMAIN_ATTEMPTS || stats.failures >= MAX_BOT_FAILURES {
            info!(domain = %domain, attempts = stats.attempts, failures = stats.failures,
                  "throttling domain for the rest of the request");
            self.domains_blocked.insert(domain);
        }
    }

    fn record_extraction(&mut self, tool: &str, result: &ToolResult, iteration: u32) {
        let Some(payload) = result.payload() else {
            return;
        };
        for key in ["text", "output", "content"] {
            if let Some(s) = payload.get(key).and_then(Value::as_str) {
                let mut excerpt = s.to_string();
                if excerpt.len() > 2000 {
                    let cut = excerpt
                        .char_indices()
                        .take_while(|(i, _)| *i <= 2000)
                        .last()
                        .map(|(i, _)| i)
                        .unwrap_or(0);
                    excerpt.truncate(cut);
                }
                let source = payload
                    .get("url")
                    .and_then(Value::as_str)
                    .unwrap_or(tool)
                    .to_string();
                self.extractions.push((source, excerpt, iteration));
                return;
            }
        }
    }

    /// Whether navigation to this URL must be refused.
    pub fn blocked_domain(&self, url: &str) -> Option<String> {
        let domain = domain_of(url);
        self.domains_blocked.contains(&domain).then_some(domain)
    }

    pub fn any_tool_calls(&self) -> bool {
        self.total_calls > 0
    }

    pub fn any_browser_calls(&self) -> bool {
        self.browser_calls > 0
    }

    pub fn mutating_call_recorded(&self) -> bool {
        !self.files_written.is_empty() || !self.files_edited.is_empty()
    }

    /// Most recent gathered excerpts, newest last, for write-deferral
    /// messages and the completion guarantee.
    pub fn gathered_excerpts(&self, n: usize) -> Vec<(String, String)> {
        self.extractions
            .iter()
            .rev()
            .take(n)
            .rev()
            .map(|(source, excerpt, _)| (source.clone(), excerpt.clone()))
            .collect()
    }

    /// Hallucination check: URLs the assistant claims to have visited whose
    /// domains never appear in the ground truth.  Returned as warning lines
    /// for the next prompt.
    pub fn unverified_url_claims(&self, response_text: &str) -> Vec<String> {
        static CLAIMED_URL: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?i)\b(?:visited|went to|navigated to|opened|checked|browsed)\b[^.\n]{0,40}?(https?://\S+|\b[\w-]+\.(?:com|org|net|io|dev)\b)")
                .expect("claimed-url pattern must compile")
        });
        let visited: HashSet<&str> =
            self.urls_visited.iter().map(|v| v.domain.as_str()).collect();
        let mut warnings = Vec::new();
        for caps in CLAIMED_URL.captures_iter(response_text) {
            let claimed = caps[1].trim_end_matches(['.', ',', ')']);
            let domain = domain_of(claimed);
            if !visited.contains(domain.as_str()) {
                warnings.push(format!(
                    "Verification warning: you claim to have visited {claimed}, but no \
                     navigation to {domain} was recorded. Do not fabricate visits."
                ));
            }
        }
        warnings
    }
}

fn str_param<'a>(params: &'a ParamMap, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

/// Hostname (lowercased, `www.`-stripped) of a URL or bare domain string.
pub fn domain_of(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url) {
        if let Some(host) = parsed.host_str() {
            return host.trim_start_matches("www.").to_lowercase();
        }
    }
    url.trim_start_matches("www.")
        .split('/')
        .next()
        .unwrap_or(url)
        .to_lowercase()
}

// ─── Completion guarantee ─────────────────────────────────────────────────────

/// Post-loop file guarantee: when the user asked for a file of gathered
/// data and the loop ended without writing one (or wrote one sharing no
/// identifiers with the gathered data), synthesize it from the ground
/// truth.  Runs at most once per request, after the loop exits.
///
/// Returns the path written, or `None` when nothing needed fixing.
pub fn completion_guarantee(
    user_message: &str,
    state: &ExecutionState,
    project_root: &Path,
) -> Option<PathBuf> {
    let wanted = requested_file_name(user_message)?;
    if state.extractions.is_empty() {
        return None;
    }

    let target = project_root.join(&wanted);
    let gathered: Vec<String> = state
        .extractions
        .iter()
        .map(|(source, excerpt, _)| format!("## {source}\n\n{excerpt}"))
        .collect();
    let synthesized = gathered.join("\n\n");

    if let Some((written, _)) = state.files_written.last() {
        // A file was written; keep it unless its contents are unrelated to
        // anything that was actually gathered.
        let contents = std::fs::read_to_string(written).unwrap_or_default();
        if shares_identifiers(&contents, &synthesized) {
            return None;
        }
        debug!(path = %written.display(), "written file shares nothing with gathered data; overwriting");
        std::fs::write(written, &synthesized).ok()?;
        return Some(written.clone());
    }

    debug!(path = %target.display(), "synthesizing requested file from gathered data");
    if let Some(parent) = target.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    std::fs::write(&target, &synthesized).ok()?;
    Some(target)
}

/// The output file the user asked for, when the request names one.
fn requested_file_name(message: &str) -> Option<String> {
    static FILE_REQUEST: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\b(?:save|write|create|export|put)\b[^.\n]{0,60}?\b([\w][\w./-]*\.(?:txt|md|csv|json))\b")
            .expect("file-request pattern must compile")
    });
    FILE_REQUEST
        .captures(message)
        .map(|caps| caps[1].to_string())
}

/// Do the two texts share at least one substantial identifier?
fn shares_identifiers(a: &str, b: &str) -> bool {
    let words = |s: &str| -> HashSet<String> {
        s.split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() >= 5)
            .map(str::to_lowercase)
            .collect()
    };
    !words(a).is_disjoint(&words(b))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Failure classification for generations that produced no tool calls.
//!
//! Pure over its inputs: the scheduler feeds it the response pair and a
//! digest of execution state, and acts on the verdict (nudge text injected
//! into the next prompt, rollback, or stop).

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use falk_tools::TaskType;

/// Recognized failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    EmptyResponse,
    Refusal,
    Repetition,
    MissedBrowserIntent,
    ClaimWithoutAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Inject a corrective directive into the next prompt.
    Nudge,
    /// End the request.
    Stop,
}

#[derive(Debug, Clone)]
pub struct Failure {
    pub kind: FailureKind,
    pub severity: Severity,
    /// Directive to inject when severity is `Nudge`.
    pub nudge: String,
}

/// Everything the classifier may inspect.  All fields are plain data so
/// the function stays pure and unit-testable.
#[derive(Debug, Clone)]
pub struct ClassifierInput<'a> {
    pub response_text: &'a str,
    pub previous_response_text: Option<&'a str>,
    pub task_type: TaskType,
    pub iteration: u32,
    pub is_browser_task: bool,
    pub nudges_remaining: u32,
    /// Any tool call has executed so far in this request.
    pub any_tool_calls: bool,
    /// A mutating (file-writing) call has succeeded so far.
    pub mutating_call_recorded: bool,
    /// A browser call has executed so far.
    pub browser_call_recorded: bool,
    pub user_message: &'a str,
    pub repetition_threshold: f32,
}

static REFUSAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(i can't|i cannot|i'm not able to|i am not able to|i don't have access|i am unable to|i'm unable to|i won't be able to)\b",
    )
    .expect("refusal pattern must compile")
});

static COMPLETION_CLAIM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(done|i (have )?created|i (have )?saved|i (have )?written|i wrote|successfully (created|saved|wrote)|the file (now )?contains)\b")
        .expect("completion pattern must compile")
});

static NAV_INTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(https?://\S+|\bwww\.\S+|\b(go to|open|visit|navigate to|browse)\b)")
        .expect("nav pattern must compile")
});

/// Classify a zero-tool-call response.  `None` means a legitimate end of
/// turn (natural stop).
pub fn classify(input: &ClassifierInput) -> Option<Failure> {
    let tools_expected = input.task_type != TaskType::Chat;
    let trimmed: String = input
        .response_text
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    // Near-empty output where action was expected.
    if tools_expected && trimmed.len() < 20 {
        return Some(Failure {
            kind: FailureKind::EmptyResponse,
            severity: degrade(input.nudges_remaining),
            nudge: "Your last response was empty. Continue the task with your next \
                    tool call."
                .to_string(),
        });
    }

    // Refusal while tools are clearly required.
    if tools_expected && REFUSAL.is_match(input.response_text) && !input.mutating_call_recorded {
        return Some(Failure {
            kind: FailureKind::Refusal,
            severity: degrade(input.nudges_remaining),
            nudge: "You have the tools required for this task; proceed using them."
                .to_string(),
        });
    }

    // Verbatim-ish repetition of the previous response.
    if let Some(prev) = input.previous_response_text {
        if !prev.is_empty()
            && jaccard(input.response_text, prev) >= input.repetition_threshold
        {
            return Some(Failure {
                kind: FailureKind::Repetition,
                severity: Severity::Stop,
                nudge: String::new(),
            });
        }
    }

    // The user asked for navigation and nothing browser-shaped happened.
    if input.is_browser_task
        && !input.browser_call_recorded
        && NAV_INTENT.is_match(input.user_message)
    {
        return Some(Failure {
            kind: FailureKind::MissedBrowserIntent,
            severity: degrade(input.nudges_remaining),
            nudge: "The task requires the browser; start with browser_navigate."
                .to_string(),
        });
    }

    // Completion language with no mutating call behind it.
    if tools_expected
        && COMPLETION_CLAIM.is_match(input.response_text)
        && !input.mutating_call_recorded
        && !input.any_tool_calls
    {
        return Some(Failure {
            kind: FailureKind::ClaimWithoutAction,
            severity: degrade(input.nudges_remaining),
            nudge: "No file was actually written yet. Perform the action with a tool \
                    call before declaring completion."
                .to_string(),
        });
    }

    None
}

fn degrade(nudges_remaining: u32) -> Severity {
    if nudges_remaining > 0 {
        Severity::Nudge
    } else {
        Severity::Stop
    }
}

/// Jaccard similarity over lowercased word sets.
pub fn jaccard(a: &str, b: &str) -> f32 {
    let words = |s: &str| -> HashSet<String> {
        s.split_whitespace()
            .map(|w| w.to_lowercase())
            .collect()
    };
    let wa = words(a);
    let wb = words(b);
    if wa.is_empty() && wb.is_empty() {
        return 1.0;
    }
    let intersection = wa.intersection(&wb).count() as f32;
    let union = wa.union(&wb).count() as f32;
    intersection / union
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

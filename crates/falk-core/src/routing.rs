// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Request-entry routing: task classification, media-generation intent,
//! and the auto-mode provider signals.

use std::sync::LazyLock;

use regex::Regex;

use falk_tools::TaskType;

static URL_OR_NAV: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(https?://\S+|\bwww\.\S+|\b(go to|open|visit|navigate to|browse)\b\s+\S+\.\w{2,})")
        .expect("nav pattern must compile")
});

static CODE_INTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(refactor|implement|fix|debug|compile|function|class|struct|module|unit test|bug|rename|variable|file named|\.rs\b|\.py\b|\.ts\b|\.js\b|\.txt\b|\.md\b|create .*file|write .*file|edit)\b")
        .expect("code pattern must compile")
});

static REASONING_INTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(prove|derive|step by step|reason about|analyze deeply|think through)\b")
        .expect("reasoning pattern must compile")
});

static GREETING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(hi|hello|hey|thanks|thank you|good (morning|evening|afternoon)|how are you)\b[\s!.?]*$")
        .expect("greeting pattern must compile")
});

/// Media-generation verbs + subjects.
static MEDIA_INTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(generate|draw|create|make|render)\b[^.\n]{0,40}\b(image|picture|photo|logo|illustration|icon|wallpaper|video|animation)\b")
        .expect("media pattern must compile")
});

/// Phrases that look like media requests but are really code edits; these
/// veto the media route to avoid false positives.
static MEDIA_BLOCKLIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(image tag|img tag|favicon|css|html|component|element|upload|resize|compress|src attribute|markdown|readme|placeholder)\b")
        .expect("media blocklist must compile")
});

/// Classify the request into the task routing classes.
pub fn detect_task_type(message: &str, has_images: bool) -> TaskType {
    if GREETING.is_match(message) {
        return TaskType::Chat;
    }
    if URL_OR_NAV.is_match(message) {
        return TaskType::Browser;
    }
    if has_images || CODE_INTENT.is_match(message) {
        return TaskType::Code;
    }
    // Short interrogatives with no action verbs stay conversational.
    let word_count = message.split_whitespace().count();
    if word_count < 12 && message.trim_end().ends_with('?') {
        return TaskType::Chat;
    }
    TaskType::General
}

/// Detect image/video generation intent, with a blocklist of code-editing
/// phrases to avoid hijacking ordinary front-end work.
pub fn detect_media_intent(message: &str) -> bool {
    MEDIA_INTENT.is_match(message) && !MEDIA_BLOCKLIST.is_match(message)
}

/// Signals for auto-mode provider/model selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteSignals {
    pub has_images: bool,
    pub browser_intent: bool,
    pub code_intent: bool,
    pub reasoning_intent: bool,
}

pub fn route_signals(message: &str, has_images: bool) -> RouteSignals {
    RouteSignals {
        has_images,
        browser_intent: URL_OR_NAV.is_match(message),
        code_intent: CODE_INTENT.is_match(message),
        reasoning_intent: REASONING_INTENT.is_match(message),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Task classification ───────────────────────────────────────────────────

    #[test]
    fn greeting_routes_to_chat() {
        assert_eq!(detect_task_type("hi", false), TaskType::Chat);
        assert_eq!(detect_task_type("Hello!", false), TaskType::Chat);
        assert_eq!(detect_task_type("thanks", false), TaskType::Chat);
    }

    #[test]
    fn url_routes_to_browser() {
        assert_eq!(
            detect_task_type("go to https://example.com and tell me the title", false),
            TaskType::Browser
        );
        assert_eq!(detect_task_type("open news.ycombinator.com", false), TaskType::Browser);
    }

    #[test]
    fn code_words_route_to_code() {
        assert_eq!(
            detect_task_type("create hello.txt with the text World", false),
            TaskType::Code
        );
        assert_eq!(
            detect_task_type("refactor the parser to use an explicit state machine", false),
            TaskType::Code
        );
    }

    #[test]
    fn short_question_routes_to_chat() {
        assert_eq!(detect_task_type("what is a borrow checker?", false), TaskType::Chat);
    }

    #[test]
    fn everything_else_routes_to_general() {
        assert_eq!(
            detect_task_type(
                "research the three most popular static site generators and compare them",
                false
            ),
            TaskType::General
        );
    }

    #[test]
    fn attached_images_imply_code_task() {
        assert_eq!(detect_task_type("what does this show", true), TaskType::Code);
    }

    // ── Media intent ──────────────────────────────────────────────────────────

    #[test]
    fn media_generation_detected() {
        assert!(detect_media_intent("generate an image of a lighthouse at dusk"));
        assert!(detect_media_intent("draw a logo for my coffee shop"));
        assert!(detect_media_intent("create a short video animation of rain"));
    }

    #[test]
    fn code_edit_phrases_veto_media_route() {
        assert!(!detect_media_intent("create an image tag for the hero picture"));
        assert!(!detect_media_intent("generate a favicon-sized image placeholder in html"));
    }

    #[test]
    fn plain_requests_are_not_media() {
        assert!(!detect_media_intent("create hello.txt with the text World"));
    }

    // ── Auto-mode signals ─────────────────────────────────────────────────────

    #[test]
    fn signals_reflect_message_content() {
        let s = route_signals("go to https://example.com and fix the bug", false);
        assert!(s.browser_intent);
        assert!(s.code_intent);
        assert!(!s.reasoning_intent);
        assert!(!s.has_images);
    }

    #[test]
    fn reasoning_signal_detected() {
        let s = route_signals("prove this invariant step by step", false);
        assert!(s.reasoning_intent);
    }
}

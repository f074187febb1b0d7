// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Errors surfaced by a model engine.
///
/// The scheduler matches on these variants to pick a recovery path, so every
/// engine implementation must map its transport-level failures onto this
/// taxonomy rather than inventing its own.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The prompt exceeded the loaded context window.  Carries whatever
    /// partial response was already generated so the scheduler can decide
    /// whether rotation preserves it.
    #[error("context overflow: prompt exceeds the model window")]
    ContextOverflow { partial_text: String },

    /// The provider rejected the call for rate reasons.  The scheduler backs
    /// off by `retry_after_ms` and retries once before surfacing.
    #[error("rate limited; retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    /// Generation was cancelled cooperatively (`user` or `supersede`).
    #[error("generation cancelled: {reason}")]
    Cancelled { reason: String },

    /// The engine's session or context was lost.  The scheduler attempts one
    /// recreation; a second failure is terminal.
    #[error("model session lost: {0}")]
    FatalSession(String),

    /// Anything else: transport failures, malformed provider responses.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Partial text recovered from an overflowing generation, if any.
    pub fn partial_text(&self) -> Option<&str> {
        match self {
            EngineError::ContextOverflow { partial_text } if !partial_text.is_empty() => {
                Some(partial_text)
            }
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled { .. })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_exposes_partial_text() {
        let e = EngineError::ContextOverflow { partial_text: "half an answer".into() };
        assert_eq!(e.partial_text(), Some("half an answer"));
    }

    #[test]
    fn overflow_with_empty_partial_exposes_none() {
        let e = EngineError::ContextOverflow { partial_text: String::new() };
        assert_eq!(e.partial_text(), None);
    }

    #[test]
    fn cancelled_predicate() {
        assert!(EngineError::Cancelled { reason: "user".into() }.is_cancelled());
        assert!(!EngineError::FatalSession("gone".into()).is_cancelled());
    }

    #[test]
    fn display_mentions_retry_delay() {
        let e = EngineError::RateLimited { retry_after_ms: 1500 };
        assert!(e.to_string().contains("1500"));
    }
}

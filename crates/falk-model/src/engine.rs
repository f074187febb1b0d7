// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::{CompletionRequest, EngineError, ResponseEvent};

pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<ResponseEvent, EngineError>> + Send>>;

/// Shared cancellation flag handed to the streaming side of an engine.
///
/// `cancel_generation` raises it; the stream producer checks it before
/// emitting each event and suppresses everything after it is set, which
/// bounds the post-cancellation event count to at most the one event already
/// in flight.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Uniform interface over local and cloud inference.
///
/// The scheduler sees exactly one backend difference: `pacing_hint_ms`, the
/// provider-recommended inter-call delay near its RPM ceiling.  Everything
/// else (streaming, cancellation, grammar constraining, vision) is expressed
/// through this trait and capability probes.
#[async_trait]
pub trait ModelEngine: Send + Sync {
    /// Human-readable backend name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    ///
    /// When `req.options.functions` is `Some` and [`supports_grammar`] is
    /// true, the stream emits [`ResponseEvent::FunctionCall`] records and
    /// never malformed call text.
    ///
    /// [`supports_grammar`]: ModelEngine::supports_grammar
    async fn generate(&self, req: CompletionRequest) -> Result<ResponseStream, EngineError>;

    /// Cooperatively cancel the in-flight generation.
    ///
    /// Asynchronous and idempotent: returns immediately, the stream
    /// terminates at its next event boundary, and subsequent callbacks are
    /// suppressed.  `reason` is "user" or "supersede".
    fn cancel_generation(&self, reason: &str);

    /// Whether this engine can enforce a tool-call grammar during decoding.
    fn supports_grammar(&self) -> bool {
        false
    }

    /// Whether this engine accepts image input.
    fn supports_images(&self) -> bool {
        false
    }

    /// Recommended inter-call delay in ms when close to the provider's
    /// request-rate ceiling.  0 means no pacing needed.
    fn pacing_hint_ms(&self) -> u64 {
        0
    }

    /// Context window actually loaded by the hardware, when known.
    /// The budget manager clamps the profile's `effective_ctx` to this.
    fn hardware_ctx(&self) -> Option<usize> {
        None
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_starts_clear() {
        let f = CancelFlag::new();
        assert!(!f.is_raised());
    }

    #[test]
    fn cancel_flag_raise_is_visible_through_clones() {
        let f = CancelFlag::new();
        let g = f.clone();
        f.raise();
        assert!(g.is_raised());
    }

    #[test]
    fn cancel_flag_raise_is_idempotent() {
        let f = CancelFlag::new();
        f.raise();
        f.raise();
        assert!(f.is_raised());
        f.clear();
        assert!(!f.is_raised());
    }
}

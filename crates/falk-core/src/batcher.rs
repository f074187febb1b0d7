// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Outbound token batching for the IPC boundary.
//!
//! Raw model streams produce events far faster than a renderer wants
//! them; the batcher coalesces deltas while preserving a "streamed" feel.
//! One batcher lives per iteration and is disposed at every iteration
//! boundary and on cancellation.

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::events::EngineEvent;

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub flush_interval_ms: u64,
    /// Bound on buffered characters; oldest excess is dropped before newer
    /// tokens when the downstream renderer cannot keep up.
    pub max_buffer_chars: usize,
    /// Minimum buffered characters before a timed flush fires.
    pub chars_per_flush: usize,
    pub flush_on_newline: bool,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 50,
            max_buffer_chars: 4096,
            chars_per_flush: 48,
            flush_on_newline: true,
        }
    }
}

impl BatcherConfig {
    /// Deliberately relaxed pacing for the bundled-provider path
    /// (~15–20 tokens/second for UX polish).
    pub fn bundled_pace() -> Self {
        Self {
            flush_interval_ms: 100,
            max_buffer_chars: 4096,
            chars_per_flush: 8,
            flush_on_newline: true,
        }
    }
}

/// Coalesces [`EngineEvent::Token`] traffic.
pub struct TokenBatcher {
    cfg: BatcherConfig,
    tx: mpsc::Sender<EngineEvent>,
    buf: String,
    last_flush: Instant,
}

impl TokenBatcher {
    pub fn new(cfg: BatcherConfig, tx: mpsc::Sender<EngineEvent>) -> Self {
        Self { cfg, tx, buf: String::new(), last_flush: Instant::now() }
    }

    /// Append a chunk, flushing when a batching condition is met.
    pub async fn push(&mut self, chunk: &str) {
        self.buf.push_str(chunk);

        // Backpressure: drop the oldest overflow, keep the newest tokens.
        if self.buf.len() > self.cfg.max_buffer_chars {
            let excess = self.buf.len() - self.cfg.max_buffer_chars;
            let cut = self
                .buf
                .char_indices()
                .find(|(i, _)| *i >= excess)
                .map(|(i, _)| i)
                .unwrap_or(0);
            self.buf.drain(..cut);
        }

        let newline_hit = self.cfg.flush_on_newline && chunk.contains('\n');
        let interval_hit = self.last_flush.elapsed().as_millis() as u64
            >= self.cfg.flush_interval_ms
            && self.buf.len() >= self.cfg.chars_per_flush;
        if newline_hit || interval_hit {
            self.flush().await;
        }
    }

    /// Emit whatever is buffered.
    pub async fn flush(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let chunk = std::mem::take(&mut self.buf);
        let _ = self.tx.send(EngineEvent::Token(chunk)).await;
        self.last_flush = Instant::now();
    }

    /// Flush the remainder and consume the batcher.  Called at iteration
    /// boundaries and on cancellation.
    pub async fn dispose(mut self) {
        self.flush().await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

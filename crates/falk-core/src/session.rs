// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use falk_model::Message;

use crate::ledger::Ledger;

/// In-memory conversation history for one request, with running token
/// accounting.
#[derive(Debug, Clone, Default)]
pub struct ChatHistory {
    pub messages: Vec<Message>,
    token_count: usize,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Recalculate the token count from scratch (call after pruning).
    pub fn recalculate(&mut self) {
        self.token_count = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate();
    }
}

/// Immutable snapshot taken before each generation.
///
/// On ROLLBACK, restoring the checkpoint makes the model's observable
/// history byte-equal to the pre-generation state; the model never learns
/// the discarded attempt existed.  Discarded on COMMIT.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    messages: Vec<Message>,
    ledger: Ledger,
}

impl Checkpoint {
    pub fn take(history: &ChatHistory, ledger: &Ledger) -> Self {
        Self { messages: history.messages.clone(), ledger: ledger.clone() }
    }

    pub fn restore(self, history: &mut ChatHistory, ledger: &mut Ledger) {
        history.replace(self.messages);
        *ledger = self.ledger;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bounded undo ledger for mutating file operations.
//!
//! The executor records an entry before every successful `write_file` /
//! `edit_file` / `delete_file`: either the file's prior contents (update)
//! or an is-new marker (create).  `undo_edit` pops the most recent entry;
//! `restore_checkpoint` rewinds one path to its oldest recorded state.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::Context;

/// One reversible file mutation.
#[derive(Debug, Clone)]
pub struct UndoEntry {
    pub path: PathBuf,
    /// `Some(contents)` for an update, `None` when the call created the file.
    pub prior: Option<String>,
}

impl UndoEntry {
    pub fn is_new(&self) -> bool {
        self.prior.is_none()
    }
}

/// FIFO-bounded stack of undo entries.
#[derive(Debug)]
pub struct UndoLedger {
    entries: VecDeque<UndoEntry>,
    capacity: usize,
}

impl UndoLedger {
    pub fn new(capacity: usize) -> Self {
        Self { entries: VecDeque::new(), capacity: capacity.max(1) }
    }

    /// Record a mutation.  Oldest entries are evicted beyond capacity.
    pub fn record(&mut self, path: PathBuf, prior: Option<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(UndoEntry { path, prior });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&UndoEntry> {
        self.entries.back()
    }

    /// Revert the most recent mutation: restore prior contents, or delete
    /// the file when the mutation created it.
    pub fn undo_last(&mut self) -> anyhow::Result<PathBuf> {
        let entry = self
            .entries
            .pop_back()
            .context("undo ledger is empty")?;
        apply(&entry)?;
        Ok(entry.path)
    }

    /// Rewind `path` to its oldest recorded state and drop every entry for
    /// it.  The oldest entry is the state the file had before this request
    /// first touched it.
    pub fn restore_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let oldest = self
            .entries
            .iter()
            .find(|e| e.path == path)
            .cloned()
            .with_context(|| format!("no undo entries for {}", path.display()))?;
        apply(&oldest)?;
        self.entries.retain(|e| e.path != path);
        Ok(())
    }
}

fn apply(entry: &UndoEntry) -> anyhow::Result<()> {
    match &entry.prior {
        Some(contents) => std::fs::write(&entry.path, contents)
            .with_context(|| format!("restoring {}", entry.path.display())),
        None => match std::fs::remove_file(&entry.path) {
            Ok(()) => Ok(()),
            // Already gone; the undo target state is "absent".
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", entry.path.display())),
        },
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Free-tier daily quota for bundled-provider requests.
//!
//! A small JSON counter file tracks messages per UTC day.  Exceeding the
//! limit yields the sentinel error the host turns into an upgrade prompt.

use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use falk_config::QuotaConfig;

/// Sentinel error string signalling a free-tier upgrade prompt.
pub const QUOTA_SENTINEL: &str = "__QUOTA_EXCEEDED__";

#[derive(Debug, Default, Serialize, Deserialize)]
struct QuotaFile {
    /// UTC day the counter belongs to, `YYYY-MM-DD`.
    day: String,
    count: u32,
}

/// Per-day message counter persisted to disk.
#[derive(Debug)]
pub struct QuotaCounter {
    path: PathBuf,
    limit: u32,
}

impl QuotaCounter {
    pub fn new(cfg: &QuotaConfig) -> Self {
        let path = cfg.counter_file.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("falk/quota.json")
        });
        Self { path, limit: cfg.daily_limit }
    }

    /// Count one message.  Returns the remaining allowance, or the quota
    /// sentinel as an error when the day's budget is spent.
    pub fn check_and_increment(&self) -> anyhow::Result<u32> {
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let mut state = self.load().unwrap_or_default();
        if state.day != today {
            state = QuotaFile { day: today, count: 0 };
        }
        if state.count >= self.limit {
            anyhow::bail!("{QUOTA_SENTINEL}");
        }
        state.count += 1;
        self.store(&state)?;
        debug!(count = state.count, limit = self.limit, "quota message counted");
        Ok(self.limit - state.count)
    }

    fn load(&self) -> Option<QuotaFile> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn store(&self, state: &QuotaFile) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let text = serde_json::to_string(state)?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(limit: u32) -> (tempfile::TempDir, QuotaCounter) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = QuotaConfig {
            daily_limit: limit,
            counter_file: Some(dir.path().join("quota.json")),
        };
        let c = QuotaCounter::new(&cfg);
        (dir, c)
    }

    #[test]
    fn counts_down_remaining_allowance() {
        let (_dir, c) = counter(3);
        assert_eq!(c.check_and_increment().unwrap(), 2);
        assert_eq!(c.check_and_increment().unwrap(), 1);
        assert_eq!(c.check_and_increment().unwrap(), 0);
    }

    #[test]
    fn exceeding_limit_yields_sentinel() {
        let (_dir, c) = counter(1);
        c.check_and_increment().unwrap();
        let err = c.check_and_increment().unwrap_err();
        assert_eq!(err.to_string(), QUOTA_SENTINEL);
    }

    #[test]
    fn counter_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = QuotaConfig {
            daily_limit: 2,
            counter_file: Some(dir.path().join("quota.json")),
        };
        QuotaCounter::new(&cfg).check_and_increment().unwrap();
        QuotaCounter::new(&cfg).check_and_increment().unwrap();
        assert!(QuotaCounter::new(&cfg).check_and_increment().is_err());
    }

    #[test]
    fn stale_day_resets_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.json");
        std::fs::write(&path, r#"{"day":"2020-01-01","count":99}"#).unwrap();
        let cfg = QuotaConfig { daily_limit: 5, counter_file: Some(path) };
        assert_eq!(QuotaCounter::new(&cfg).check_and_increment().unwrap(), 4);
    }

    #[test]
    fn corrupt_counter_file_resets_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.json");
        std::fs::write(&path, "not json {{{").unwrap();
        let cfg = QuotaConfig { daily_limit: 5, counter_file: Some(path) };
        assert!(QuotaCounter::new(&cfg).check_and_increment().is_ok());
    }
}

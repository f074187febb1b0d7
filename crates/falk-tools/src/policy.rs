// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;

use falk_config::ToolsConfig;

/// Outcome of the command-pattern policy for one shell command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Run without consulting the permission gate.
    Auto,
    /// Consult the permission gate.
    Ask,
    /// Never run; return a permission error.
    Deny,
}

/// Policy engine that maps a command string to an approval decision.
/// Composes with the destructive-tool permission gate: deny wins, then
/// auto, else the gate is consulted.
#[derive(Debug)]
pub struct ToolPolicy {
    auto_patterns: Vec<Regex>,
    deny_patterns: Vec<Regex>,
}

impl ToolPolicy {
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        let compile = |patterns: &[String]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| glob_to_regex(p)).collect()
        };
        Self {
            auto_patterns: compile(&cfg.auto_approve_patterns),
            deny_patterns: compile(&cfg.deny_patterns),
        }
    }

    pub fn decide(&self, command: &str) -> PolicyDecision {
        for re in &self.deny_patterns {
            if re.is_match(command) {
                return PolicyDecision::Deny;
            }
        }
        for re in &self.auto_patterns {
            if re.is_match(command) {
                return PolicyDecision::Auto;
            }
        }
        PolicyDecision::Ask
    }
}

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use falk_config::ToolsConfig;

    fn policy_with(auto: &[&str], deny: &[&str]) -> ToolPolicy {
        ToolPolicy::from_config(&ToolsConfig {
            auto_approve_patterns: auto.iter().map(|s| s.to_string()).collect(),
            deny_patterns: deny.iter().map(|s| s.to_string()).collect(),
            ..ToolsConfig::default()
        })
    }

    #[test]
    fn deny_beats_auto_for_same_pattern() {
        let p = policy_with(&["rm *"], &["rm *"]);
        assert_eq!(p.decide("rm /tmp/foo"), PolicyDecision::Deny);
    }

    #[test]
    fn deny_does_not_match_different_prefix() {
        let p = policy_with(&[], &["rm -rf /*"]);
        assert_ne!(p.decide("git status"), PolicyDecision::Deny);
    }

    #[test]
    fn auto_approve_wildcard_prefix() {
        let p = policy_with(&["cat *"], &[]);
        assert_eq!(p.decide("cat /etc/hosts"), PolicyDecision::Auto);
    }

    #[test]
    fn question_mark_matches_exactly_one_char() {
        let p = policy_with(&["ls ?"], &[]);
        assert_eq!(p.decide("ls -"), PolicyDecision::Auto);
        assert_ne!(p.decide("ls --"), PolicyDecision::Auto);
    }

    #[test]
    fn unknown_command_results_in_ask() {
        let p = policy_with(&["cat *"], &["rm -rf /*"]);
        assert_eq!(p.decide("git commit -m test"), PolicyDecision::Ask);
    }

    #[test]
    fn default_config_auto_approves_listing() {
        let p = ToolPolicy::from_config(&ToolsConfig::default());
        assert_eq!(p.decide("ls /tmp"), PolicyDecision::Auto);
        assert_eq!(p.decide("git status"), PolicyDecision::Auto);
    }

    #[test]
    fn default_config_asks_for_build_command() {
        let p = ToolPolicy::from_config(&ToolsConfig::default());
        assert_eq!(p.decide("cargo build"), PolicyDecision::Ask);
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context budget arithmetic and progressive compaction.
//!
//! The budget manager decides how many tokens each part of the prompt may
//! spend, and degrades the conversation in four phases as utilization
//! climbs; the last phase hands control to the scheduler for a full
//! context rotation.

use falk_config::{AgentConfig, ModelProfile};
use falk_model::{est_tokens, Message, Role};
use falk_tools::OutputCategory;

use crate::session::ChatHistory;

/// Tokens reserved for wrapper markup the estimator cannot see (role
/// headers, fences, stop sequences).
const FIXED_OVERHEAD: usize = 256;

/// Floor for the prompt budget regardless of how small the window is.
const MIN_PROMPT_BUDGET: usize = 256;

/// Character budget for one compressed tool-result line in phase 1.
const COMPRESSED_RESULT_CHARS: usize = 120;

/// Static budget split for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetPlan {
    pub total_ctx: usize,
    pub sys_reserve: usize,
    pub resp_budget: usize,
    pub prompt_budget: usize,
}

/// Compute the budget split from the model profile and the measured static
/// prompt parts.
pub fn compute_budget(
    profile: &ModelProfile,
    hardware_ctx: Option<usize>,
    preamble: &str,
    tool_prompt: &str,
) -> BudgetPlan {
    let total_ctx = match hardware_ctx {
        Some(hw) => hw.min(profile.effective_ctx),
        None => profile.effective_ctx,
    };
    let sys_reserve = est_tokens(preamble) + est_tokens(tool_prompt) + FIXED_OVERHEAD;
    let resp_budget = ((total_ctx as f32 * profile.response_reserve_pct) as usize)
        .min(profile.max_response_tokens);
    let prompt_budget = total_ctx
        .saturating_sub(sys_reserve)
        .saturating_sub(resp_budget)
        .max(MIN_PROMPT_BUDGET);
    BudgetPlan { total_ctx, sys_reserve, resp_budget, prompt_budget }
}

/// Pack dynamic prompt sections into a budget.
///
/// Sections are provided in priority order; each is added only when it
/// still fits.  Returns the packed text and the labels that were dropped.
pub fn pack_sections(
    sections: &[(&str, &str)],
    budget_tokens: usize,
) -> (String, Vec<String>) {
    let mut out = String::new();
    let mut dropped = Vec::new();
    let mut used = 0usize;
    for (label, text) in sections {
        if text.is_empty() {
            continue;
        }
        let cost = est_tokens(text) + 2;
        if used + cost > budget_tokens {
            dropped.push(label.to_string());
            continue;
        }
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(text);
        used += cost;
    }
    (out, dropped)
}

// ─── Progressive compaction ───────────────────────────────────────────────────

/// The four escalation phases, keyed on live context utilization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionPhase {
    None,
    /// u > 0.60: compress previous iterations' tool results.
    CompressResults,
    /// u > 0.75: prune oldest turns beyond the recent window.
    PruneTurns,
    /// u > 0.85: drop all but the last two turns, keep the ledger.
    Aggressive,
    /// u > 0.92: signal a full context rotation.
    Rotate,
}

pub fn phase_for(utilization: f32, cfg: &AgentConfig) -> CompactionPhase {
    if utilization > cfg.rotate_at {
        CompactionPhase::Rotate
    } else if utilization > cfg.aggressive_at {
        CompactionPhase::Aggressive
    } else if utilization > cfg.prune_turns_at {
        CompactionPhase::PruneTurns
    } else if utilization > cfg.compact_results_at {
        CompactionPhase::CompressResults
    } else {
        CompactionPhase::None
    }
}

/// Phase 1: compress tool-result blocks in every user message except the
/// most recent one.  Each `### tool [STATUS]` section keeps its header and
/// a short snippet; the current iteration's results stay untouched.
pub fn compress_old_results(history: &mut ChatHistory) {
    let last_user = history
        .messages
        .iter()
        .rposition(|m| m.role == Role::User);
    for (i, msg) in history.messages.iter_mut().enumerate() {
        if msg.role != Role::User || Some(i) == last_user {
            continue;
        }
        if msg.content.contains("## Tool Execution Results") {
            msg.content = compress_result_block(&msg.content);
        }
    }
    history.recalculate();
}

fn compress_result_block(text: &str) -> String {
    let mut out = Vec::new();
    let mut section_chars = 0usize;
    for line in text.lines() {
        if line.starts_with("##") {
            out.push(line.to_string());
            section_chars = 0;
            continue;
        }
        if section_chars < COMPRESSED_RESULT_CHARS && !line.is_empty() {
            let take = (COMPRESSED_RESULT_CHARS - section_chars).min(line.len());
            let cut = line
                .char_indices()
                .take_while(|(i, _)| *i <= take)
                .last()
                .map(|(i, _)| i)
                .unwrap_or(0);
            out.push(line[..cut].to_string());
            section_chars += cut;
            if cut < line.len() {
                out.push("…".to_string());
                section_chars = COMPRESSED_RESULT_CHARS;
            }
        }
    }
    out.join("\n")
}

/// Phase 2: drop the oldest user/assistant turns beyond the last `keep`.
/// The leading user message (the task itself) is always preserved.
pub fn prune_old_turns(history: &mut ChatHistory, keep: usize) {
    if history.messages.len() <= keep + 1 {
        return;
    }
    let first = history.messages.first().cloned();
    let tail_start = history.messages.len() - keep;
    let mut kept: Vec<Message> = Vec::with_capacity(keep + 1);
    if let Some(first) = first {
        kept.push(first);
    }
    kept.extend(history.messages[tail_start..].iter().cloned());
    history.replace(kept);
}

/// Phase 3: keep only the ledger summary and the last two turns.
pub fn aggressive_prune(history: &mut ChatHistory, ledger_summary: &str) {
    let tail: Vec<Message> = history
        .messages
        .iter()
        .rev()
        .take(2)
        .rev()
        .cloned()
        .collect();
    let mut kept = vec![Message::user(ledger_summary)];
    kept.extend(tail);
    history.replace(kept);
}

// ─── Content-aware truncation ─────────────────────────────────────────────────

/// Deterministic, content-aware tool-result truncation.
///
/// Returns `content` unchanged when it fits within `cap_tokens`.  Otherwise
/// applies a category-specific extraction strategy that preserves the most
/// useful portion of the output.  Every truncated result ends with an
/// explicit notice so the model knows more content exists.
pub fn smart_truncate(content: &str, category: OutputCategory, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    let cap_chars = (cap_tokens * 7) / 2;
    if content.len() <= cap_chars {
        return content.to_string();
    }
    let omitted_bytes = content.len().saturating_sub(cap_chars);
    match category {
        OutputCategory::HeadTail => head_tail_lines(
            content,
            cap_chars,
            60,
            40,
            &format!("[... {{lines}} lines / {omitted_bytes} bytes omitted ...]"),
        ),
        OutputCategory::MatchList => head_lines(
            content,
            cap_chars,
            &format!(
                "[... {{lines}} more matches omitted ({omitted_bytes} bytes); \
                 use a more specific pattern to see them ...]"
            ),
        ),
        OutputCategory::FileContent => head_tail_lines(
            content,
            cap_chars,
            usize::MAX,
            usize::MAX,
            &format!(
                "[... {{lines}} lines omitted ({omitted_bytes} bytes); \
                 use read_file with offset/limit to see more ...]"
            ),
        ),
        OutputCategory::Generic => {
            let cut = content[..cap_chars]
                .rfind('\n')
                .map(|p| p + 1)
                .unwrap_or(cap_chars);
            format!(
                "{}\n[... {omitted_bytes} bytes omitted; \
                 content truncated to fit context budget ...]",
                &content[..cut]
            )
        }
    }
}

/// Keep only the leading lines that fit within `cap_chars`.
fn head_lines(content: &str, cap_chars: usize, notice_template: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let mut kept = String::with_capacity(cap_chars);
    let mut kept_count = 0usize;
    for line in &lines {
        let needed = if kept.is_empty() { line.len() } else { line.len() + 1 };
        if kept.len() + needed > cap_chars {
            break;
        }
        if !kept.is_empty() {
            kept.push('\n');
        }
        kept.push_str(line);
        kept_count += 1;
    }
    let omitted = lines.len().saturating_sub(kept_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{kept}\n{notice}")
}

/// Keep `max_head` leading lines and `max_tail` trailing lines, inserting a
/// notice between them.  Pass `usize::MAX` to split evenly by character
/// budget.
fn head_tail_lines(
    content: &str,
    cap_chars: usize,
    max_head: usize,
    max_tail: usize,
    notice_template: &str,
) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let half_cap = cap_chars / 2;

    let mut head = String::with_capacity(half_cap);
    let mut head_count = 0usize;
    for line in lines.iter().take(max_head) {
        let needed = if head.is_empty() { line.len() } else { line.len() + 1 };
        if head.len() + needed > half_cap {
            break;
        }
        if !head.is_empty() {
            head.push('\n');
        }
        head.push_str(line);
        head_count += 1;
    }

    let mut tail_lines: Vec<&str> = Vec::new();
    let mut tail_chars = 0usize;
    for line in lines.iter().rev().take(max_tail) {
        let needed = if tail_lines.is_empty() { line.len() } else { line.len() + 1 };
        if tail_chars + needed > half_cap {
            break;
        }
        tail_chars += needed;
        tail_lines.push(line);
    }
    tail_lines.reverse();
    let tail_count = tail_lines.len();
    let tail = tail_lines.join("\n");

    let omitted = lines.len().saturating_sub(head_count + tail_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{head}\n{notice}\n{tail}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use falk_config::{AgentConfig, ModelProfile};
    use falk_model::Message;

    use super::*;

    // ── Budget arithmetic ─────────────────────────────────────────────────────

    fn profile(ctx: usize) -> ModelProfile {
        ModelProfile { effective_ctx: ctx, ..ModelProfile::default() }
    }

    #[test]
    fn budget_reserves_response_and_system() {
        let plan = compute_budget(&profile(32_768), None, "preamble text", "tool prompt");
        assert_eq!(plan.total_ctx, 32_768);
        assert!(plan.resp_budget <= 4096);
        assert!(plan.prompt_budget > 0);
        assert!(
            plan.sys_reserve + plan.resp_budget + plan.prompt_budget <= plan.total_ctx,
            "budget parts must never exceed the window"
        );
    }

    #[test]
    fn hardware_ctx_clamps_profile() {
        let plan = compute_budget(&profile(131_072), Some(8192), "p", "t");
        assert_eq!(plan.total_ctx, 8192);
    }

    #[test]
    fn response_budget_capped_by_max_response_tokens() {
        let mut p = profile(100_000);
        p.response_reserve_pct = 0.5;
        p.max_response_tokens = 2048;
        let plan = compute_budget(&p, None, "", "");
        assert_eq!(plan.resp_budget, 2048);
    }

    #[test]
    fn prompt_budget_never_below_floor() {
        let plan = compute_budget(&profile(512), None, &"x".repeat(10_000), "");
        assert_eq!(plan.prompt_budget, 256);
    }

    // ── Section packing ───────────────────────────────────────────────────────

    #[test]
    fn sections_pack_in_priority_order() {
        let (text, dropped) = pack_sections(
            &[("corrections", "always use tabs"), ("rag", &"y".repeat(7000))],
            100,
        );
        assert!(text.contains("always use tabs"));
        assert_eq!(dropped, vec!["rag"]);
    }

    #[test]
    fn lower_priority_section_still_packs_when_it_fits() {
        let (text, dropped) =
            pack_sections(&[("big", &"x".repeat(7000)), ("small", "tiny note")], 100);
        assert!(text.contains("tiny note"));
        assert_eq!(dropped, vec!["big"]);
    }

    #[test]
    fn empty_sections_are_skipped_silently() {
        let (text, dropped) = pack_sections(&[("empty", ""), ("real", "content")], 100);
        assert_eq!(text, "content");
        assert!(dropped.is_empty());
    }

    // ── Phase thresholds ──────────────────────────────────────────────────────

    #[test]
    fn phases_escalate_with_utilization() {
        let cfg = AgentConfig::default();
        assert_eq!(phase_for(0.30, &cfg), CompactionPhase::None);
        assert_eq!(phase_for(0.61, &cfg), CompactionPhase::CompressResults);
        assert_eq!(phase_for(0.76, &cfg), CompactionPhase::PruneTurns);
        assert_eq!(phase_for(0.86, &cfg), CompactionPhase::Aggressive);
        assert_eq!(phase_for(0.93, &cfg), CompactionPhase::Rotate);
    }

    #[test]
    fn phase_boundary_is_exclusive() {
        let cfg = AgentConfig::default();
        assert_eq!(phase_for(0.60, &cfg), CompactionPhase::None);
        assert_eq!(phase_for(0.75, &cfg), CompactionPhase::CompressResults);
    }

    // ── Phase 1: result compression ───────────────────────────────────────────

    fn result_message(body_len: usize) -> String {
        format!(
            "## Tool Execution Results\n\n### read_file [OK]\n{}",
            "z".repeat(body_len)
        )
    }

    #[test]
    fn old_result_blocks_are_compressed() {
        let mut h = ChatHistory::new();
        h.push(Message::user("task"));
        h.push(Message::user(result_message(5000)));
        h.push(Message::assistant("working"));
        h.push(Message::user(result_message(5000)));

        let before = h.token_count();
        compress_old_results(&mut h);

        // The older result block shrank; the latest one is untouched.
        assert!(h.messages[1].content.len() < 400);
        assert!(h.messages[3].content.len() > 4000);
        assert!(h.token_count() < before);
        assert!(h.messages[1].content.contains("### read_file [OK]"));
    }

    #[test]
    fn non_result_messages_left_alone() {
        let mut h = ChatHistory::new();
        let long = "a ".repeat(3000);
        h.push(Message::user(&long));
        h.push(Message::user(result_message(10)));
        compress_old_results(&mut h);
        assert_eq!(h.messages[0].content, long);
    }

    // ── Phase 2: turn pruning ─────────────────────────────────────────────────

    #[test]
    fn prune_keeps_first_message_and_recent_tail() {
        let mut h = ChatHistory::new();
        h.push(Message::user("the original task"));
        for i in 0..10 {
            h.push(Message::assistant(format!("turn {i}")));
        }
        prune_old_turns(&mut h, 6);
        assert_eq!(h.len(), 7);
        assert_eq!(h.messages[0].content, "the original task");
        assert_eq!(h.messages.last().unwrap().content, "turn 9");
    }

    #[test]
    fn prune_noop_when_short() {
        let mut h = ChatHistory::new();
        h.push(Message::user("a"));
        h.push(Message::assistant("b"));
        prune_old_turns(&mut h, 6);
        assert_eq!(h.len(), 2);
    }

    // ── Phase 3: aggressive ───────────────────────────────────────────────────

    #[test]
    fn aggressive_keeps_summary_plus_last_two() {
        let mut h = ChatHistory::new();
        for i in 0..8 {
            h.push(Message::user(format!("m{i}")));
        }
        aggressive_prune(&mut h, "LEDGER SUMMARY");
        assert_eq!(h.len(), 3);
        assert_eq!(h.messages[0].content, "LEDGER SUMMARY");
        assert_eq!(h.messages[2].content, "m7");
    }

    // ── smart_truncate ────────────────────────────────────────────────────────

    fn make_lines(n: usize) -> String {
        (0..n).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n")
    }

    #[test]
    fn truncate_passthrough_under_cap() {
        let s = "short output";
        assert_eq!(smart_truncate(s, OutputCategory::HeadTail, 100), s);
    }

    #[test]
    fn zero_cap_disables_truncation() {
        let s = "a".repeat(10_000);
        assert_eq!(smart_truncate(&s, OutputCategory::Generic, 0), s);
    }

    #[test]
    fn headtail_keeps_both_ends() {
        let content = make_lines(400);
        let out = smart_truncate(&content, OutputCategory::HeadTail, 60);
        assert!(out.contains("line 0"));
        assert!(out.contains("line 399"));
        assert!(out.contains("omitted"));
    }

    #[test]
    fn matchlist_keeps_leading_only() {
        let content = make_lines(400);
        let out = smart_truncate(&content, OutputCategory::MatchList, 60);
        assert!(out.contains("line 0"));
        assert!(!out.contains("line 399"));
    }

    #[test]
    fn filecontent_drops_middle() {
        let content = make_lines(1000);
        let out = smart_truncate(&content, OutputCategory::FileContent, 60);
        assert!(out.contains("line 0"));
        assert!(out.contains("line 999"));
        assert!(!out.contains("\nline 500\n"));
    }

    #[test]
    fn generic_cuts_at_line_boundary() {
        let content = format!("{}\n{}", "a".repeat(10), "b".repeat(2000));
        let out = smart_truncate(&content, OutputCategory::Generic, 10);
        assert!(!out.contains("bbb"));
        assert!(out.contains("omitted"));
    }
}

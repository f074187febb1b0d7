// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agentic loop: generate → parse → execute → update state → continue.
//!
//! One [`Agent`] drives one request at a time.  All mutable per-request
//! state lives in an owned [`RequestState`]; pause/cancel/supersede arrive
//! through shared [`ControlFlags`] checked at every suspension point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use falk_config::Config;
use falk_model::{
    est_tokens, CompletionRequest, EngineError, FunctionCallRecord, GenerationOptions, Message,
    ModelEngine, PromptAssembly, StopReason, ToolSchema, Usage,
};
use falk_tools::{
    normalize, parse_response, pipeline, BrowserPort, ListFilter, ParamMap, PermissionGate,
    TaskType, ToolCall, ToolDefinition, ToolRegistry, ToolResult,
};

use crate::batcher::{BatcherConfig, TokenBatcher};
use crate::budget::{self, BudgetPlan, CompactionPhase};
use crate::classify::{self, ClassifierInput, FailureKind, Severity};
use crate::controller::ControlFlags;
use crate::events::{EngineEvent, PlanStepView, Reply, RequestOutcome, TokenStats, ToolResultEvent};
use crate::exec_state::{self, ExecutionState};
use crate::ledger::Ledger;
use crate::prompts;
use crate::render::render_results_block;
use crate::request::InboundRequest;
use crate::routing;
use crate::session::{ChatHistory, Checkpoint};

/// Identical trailing call signatures that trigger the stuck detector.
const STUCK_TRIPLE: usize = 3;
/// A cycle of length 2–4 repeating this often in the recent window stops
/// the loop.
const CYCLE_REPEATS: usize = 3;
/// Same-tool consecutive failures before the stop directive is injected.
const REPEAT_FAILURE_LIMIT: u32 = 2;

/// Everything mutable that belongs to one request.
struct RequestState {
    id: u64,
    task_type: TaskType,
    history: ChatHistory,
    ledger: Ledger,
    exec: ExecutionState,
    /// 1-based index of the iteration currently running.
    iteration: u32,
    /// Generations committed so far (rollbacks and continuations excluded).
    completed_iterations: u32,
    max_iterations: u32,
    rollback_retries: u32,
    nudges_remaining: u32,
    continuations: u32,
    grammar_empty_streak: u32,
    /// Set after consecutive empty grammar responses; falls back to text
    /// parsing for the rest of the request.
    grammar_degraded: bool,
    /// Set by the refusal-rollback path: next generation runs grammar-on
    /// with the full tool set.
    force_grammar_full: bool,
    temperature_delta: f32,
    reserve_halved: bool,
    overflow_rotated: bool,
    rate_limit_retried: bool,
    session_recreated: bool,
    /// Dynamic context for the next generation's user turn.
    pending_user_turn: String,
    prev_response: Option<String>,
    final_text: String,
    stats: TokenStats,
    started: Instant,
    call_signatures: Vec<String>,
    consecutive_failures: HashMap<String, u32>,
    tool_events: Vec<ToolResultEvent>,
}

/// What one loop step decided.
enum StepVerdict {
    Continue,
    Finished(RequestOutcome),
}

/// The agentic loop scheduler.
pub struct Agent {
    engine: Arc<dyn ModelEngine>,
    vision_engine: Option<Arc<dyn ModelEngine>>,
    browser: Option<Arc<dyn BrowserPort>>,
    registry: Arc<ToolRegistry>,
    config: Arc<Config>,
    flags: Arc<ControlFlags>,
    gate: Option<PermissionGate>,
    batcher_config: BatcherConfig,
    session_tokens_start: u64,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<dyn ModelEngine>,
        vision_engine: Option<Arc<dyn ModelEngine>>,
        browser: Option<Arc<dyn BrowserPort>>,
        registry: Arc<ToolRegistry>,
        config: Arc<Config>,
        flags: Arc<ControlFlags>,
        gate: Option<PermissionGate>,
        batcher_config: BatcherConfig,
        session_tokens_start: u64,
    ) -> Self {
        Self {
            engine,
            vision_engine,
            browser,
            registry,
            config,
            flags,
            gate,
            batcher_config,
            session_tokens_start,
        }
    }

    /// Drive one request to completion, streaming events through `tx`.
    pub async fn run(
        &self,
        request: InboundRequest,
        request_id: u64,
        tx: mpsc::Sender<EngineEvent>,
    ) -> Reply {
        let task_type = routing::detect_task_type(&request.message, !request.images.is_empty());
        info!(request_id, ?task_type, "starting agentic loop");

        let mut state = self.init_state(&request, request_id, task_type);
        let wall_clock = Duration::from_secs(self.config.agent.wall_clock_minutes * 60);

        let outcome = loop {
            // Suspension point: stale/cancel check before each iteration body.
            if self.is_stale(state.id) {
                break RequestOutcome::Cancelled;
            }
            self.wait_while_paused(&tx).await;
            if self.is_stale(state.id) {
                break RequestOutcome::Cancelled;
            }

            if state.started.elapsed() >= wall_clock {
                warn!(request_id, "wall-clock deadline reached");
                break RequestOutcome::WallClock;
            }
            if state.completed_iterations >= state.max_iterations {
                break RequestOutcome::MaxIterationsReached;
            }

            match self.one_iteration(&request, &mut state, &tx).await {
                StepVerdict::Continue => continue,
                StepVerdict::Finished(outcome) => break outcome,
            }
        };

        if outcome == RequestOutcome::Cancelled {
            let _ = tx.send(EngineEvent::Interrupted).await;
        }

        self.post_loop(&request, &mut state, outcome);
        self.reply(state, outcome)
    }

    fn init_state(
        &self,
        request: &InboundRequest,
        request_id: u64,
        task_type: TaskType,
    ) -> RequestState {
        let mut history = ChatHistory::new();
        for msg in &request.conversation_history {
            history.push(msg.clone());
        }
        history.push(Message::user(&request.message));

        let mut ledger = Ledger::new(&request.message);
        ledger.record_user_context(&request.message);

        let stats = TokenStats { session: self.session_tokens_start, ..Default::default() };

        RequestState {
            id: request_id,
            task_type,
            history,
            ledger,
            exec: ExecutionState::new(),
            iteration: 1,
            completed_iterations: 0,
            max_iterations: request.max_iterations.unwrap_or(self.config.agent.max_iterations),
            rollback_retries: 0,
            nudges_remaining: self.config.agent.nudge_budget,
            continuations: 0,
            grammar_empty_streak: 0,
            grammar_degraded: false,
            force_grammar_full: false,
            temperature_delta: 0.0,
            reserve_halved: false,
            overflow_rotated: false,
            rate_limit_retried: false,
            session_recreated: false,
            pending_user_turn: self.first_turn_context(request),
            prev_response: None,
            final_text: String::new(),
            stats,
            started: Instant::now(),
            call_signatures: Vec::new(),
            consecutive_failures: HashMap::new(),
            tool_events: Vec::new(),
        }
    }

    /// One full pass of the per-iteration procedure.
    async fn one_iteration(
        &self,
        request: &InboundRequest,
        state: &mut RequestState,
        tx: &mpsc::Sender<EngineEvent>,
    ) -> StepVerdict {
        let disclosed = self.disclose_tools(state);
        let preamble = prompts::preamble(state.task_type, self.config.model.profile.prompt_style);
        let tool_text =
            prompts::tool_prompt(&disclosed, self.config.model.profile.tool_prompt_style);
        let plan = self.budget_plan(state, preamble, &tool_text);

        // Pre-generation compaction check (runs every iteration; phases act
        // only above their thresholds).
        let used = state.history.token_count() + plan.sys_reserve;
        let _ = tx
            .send(EngineEvent::ContextUsage { used, total: plan.total_ctx })
            .await;
        let utilization = used as f32 / plan.total_ctx.max(1) as f32;
        match budget::phase_for(utilization, &self.config.agent) {
            CompactionPhase::None => {}
            CompactionPhase::CompressResults => {
                debug!("compaction phase 1: compressing old tool results");
                budget::compress_old_results(&mut state.history);
            }
            CompactionPhase::PruneTurns => {
                budget::compress_old_results(&mut state.history);
                budget::prune_old_turns(&mut state.history, self.config.agent.keep_recent_turns);
            }
            CompactionPhase::Aggressive => {
                let summary = state.ledger.generate_summary(plan.prompt_budget / 2);
                budget::aggressive_prune(&mut state.history, &summary);
            }
            CompactionPhase::Rotate => self.rotate(state, &plan),
        }

        // Inter-iteration pacing for rate-limited backends.
        let pace = self.engine.pacing_hint_ms();
        if pace > 0 && state.completed_iterations > 0 {
            tokio::time::sleep(Duration::from_millis(pace)).await;
        }

        // Checkpoint before generation; restored on rollback, dropped on
        // commit.
        let checkpoint = Checkpoint::take(&state.history, &state.ledger);

        let grammar_on = self.grammar_enabled(state);
        let functions = grammar_on.then(|| schemas_of(&disclosed));

        let _ = tx
            .send(EngineEvent::IterationBegin { iteration: state.iteration })
            .await;

        let completion = self.build_completion(request, state, preamble, &tool_text, &plan, functions);
        let generation = match self.stream_generation(completion, state, tx).await {
            Ok(g) => g,
            Err(e) => return self.handle_engine_error(e, state, &plan).await,
        };

        state.stats.absorb(generation.usage);
        let _ = tx
            .send(EngineEvent::TokenStats {
                session: state.stats.session,
                request: state.stats.request,
                last: state.stats.last,
            })
            .await;

        // Post-generation stale check.
        if self.is_stale(state.id) {
            return StepVerdict::Finished(RequestOutcome::Cancelled);
        }

        // Parse: native records bypass text parsing but share the rest of
        // the pipeline.
        let (raw_calls, display_text, parse_issues) = if !generation.calls.is_empty() {
            (from_native(&generation.calls), generation.text.clone(), Vec::new())
        } else {
            let parsed = parse_response(&generation.text);
            (parsed.calls, parsed.display_text, parsed.issues)
        };
        for issue in &parse_issues {
            debug!(issue = %issue, "parser issue");
        }
        if display_text != generation.text {
            // Tool-call JSON leaked into the visible stream; replace it.
            let _ = tx.send(EngineEvent::ReplaceLast(display_text.clone())).await;
        }

        let registry = Arc::clone(&self.registry);
        let (calls, repair_issues) = normalize::repair_calls(raw_calls, &generation.text, &|name| {
            registry.definition(name)
        });
        for issue in &repair_issues {
            debug!(issue = %issue, "repair issue");
        }

        // Empty grammar responses indicate the native boundary is stuck;
        // degrade to text parsing rather than hang.
        if grammar_on && calls.is_empty() && display_text.trim().is_empty() {
            state.grammar_empty_streak += 1;
            if state.grammar_empty_streak >= 1 {
                warn!("empty grammar response; degrading to text parsing");
                state.grammar_degraded = true;
            }
        } else {
            state.grammar_empty_streak = 0;
        }

        if calls.is_empty() {
            return self
                .evaluate_textual_response(state, &generation, display_text, checkpoint, tx)
                .await;
        }

        // COMMIT: the response carries tool calls.
        state.rollback_retries = 0;
        state.force_grammar_full = false;
        if !display_text.trim().is_empty() {
            state.history.push(Message::assistant(display_text.trim()));
            state.ledger.record_plan(&display_text);
        }
        let warnings = state.exec.unverified_url_claims(&display_text);
        state.prev_response = Some(display_text);
        state.completed_iterations += 1;

        let verdict = self.execute_batch(state, calls, warnings, &plan, tx).await;
        let _ = tx
            .send(EngineEvent::Progress {
                iteration: state.completed_iterations,
                max_iterations: state.max_iterations,
            })
            .await;
        let plan_view: Vec<PlanStepView> = state
            .ledger
            .plan
            .iter()
            .map(|s| PlanStepView { description: s.description.clone(), completed: s.completed })
            .collect();
        if !plan_view.is_empty() {
            let _ = tx.send(EngineEvent::TodoUpdate(plan_view)).await;
        }
        state.iteration += 1;
        verdict
    }

    /// Zero tool calls: distinguish a legitimate answer from a failure
    /// mode, and handle seamless continuation after a token-budget stop.
    async fn evaluate_textual_response(
        &self,
        state: &mut RequestState,
        generation: &GenerationOutcome,
        display_text: String,
        checkpoint: Checkpoint,
        tx: &mpsc::Sender<EngineEvent>,
    ) -> StepVerdict {
        // Token budget ran out mid-answer: continue seamlessly in the same
        // bubble, without a checkpoint, counted separately from iterations.
        if generation.stop == StopReason::MaxTokens
            && state.continuations < self.config.agent.continuation_cap
        {
            state.continuations += 1;
            state.final_text.push_str(&display_text);
            state.history.push(Message::assistant(&display_text));
            state.pending_user_turn = prompts::CONTINUATION_MARKER.to_string();
            debug!(continuations = state.continuations, "seamless continuation");
            return StepVerdict::Continue;
        }

        // Continuation segments classify as one combined response; judging a
        // short tail in isolation would misread it as empty.
        let combined_response = if state.final_text.is_empty() {
            display_text.clone()
        } else {
            format!("{}{}", state.final_text, display_text)
        };
        let input = ClassifierInput {
            response_text: &combined_response,
            previous_response_text: state.prev_response.as_deref(),
            task_type: state.task_type,
            iteration: state.iteration,
            is_browser_task: state.task_type == TaskType::Browser,
            nudges_remaining: state.nudges_remaining,
            any_tool_calls: state.exec.any_tool_calls(),
            mutating_call_recorded: state.exec.mutating_call_recorded(),
            browser_call_recorded: state.exec.any_browser_calls(),
            user_message: &state.ledger.goal,
            repetition_threshold: self.config.agent.repetition_threshold,
        };

        match classify::classify(&input) {
            None => {
                // Natural completion.
                state.final_text.push_str(&display_text);
                state.history.push(Message::assistant(&display_text));
                state.completed_iterations += 1;
                StepVerdict::Finished(RequestOutcome::Natural)
            }
            Some(failure) if failure.kind == FailureKind::Refusal => {
                self.rollback_or_commit(state, failure.nudge, display_text, checkpoint, tx)
                    .await
            }
            Some(failure) if failure.severity == Severity::Stop => {
                let note = match failure.kind {
                    FailureKind::Repetition => "\n[stopped: repetitive responses detected]",
                    _ => "\n[stopped: the model did not make progress]",
                };
                state.final_text.push_str(&display_text);
                state.final_text.push_str(note);
                state.history.push(Message::assistant(&display_text));
                state.completed_iterations += 1;
                StepVerdict::Finished(RequestOutcome::Natural)
            }
            Some(failure) => {
                // Nudge: commit the flawed turn, steer the next one.
                info!(kind = ?failure.kind, "classifier nudge");
                state.nudges_remaining = state.nudges_remaining.saturating_sub(1);
                if !display_text.trim().is_empty() {
                    state.history.push(Message::assistant(display_text.trim()));
                }
                state.prev_response = Some(display_text);
                state.pending_user_turn = failure.nudge;
                state.completed_iterations += 1;
                state.iteration += 1;
                StepVerdict::Continue
            }
        }
    }

    /// Refusal path: retry from the checkpoint while budget remains, with
    /// an adjusted strategy; otherwise commit the flawed response and let
    /// the nudge machinery handle it.
    async fn rollback_or_commit(
        &self,
        state: &mut RequestState,
        nudge: String,
        display_text: String,
        checkpoint: Checkpoint,
        tx: &mpsc::Sender<EngineEvent>,
    ) -> StepVerdict {
        let budget = self.config.model.profile.tier.rollback_budget();
        if state.rollback_retries >= budget {
            // Budget exhausted: COMMIT the flawed response; the classifier
            // nudge steers the next turn instead.
            warn!("rollback budget exhausted; committing flawed response");
            state.nudges_remaining = state.nudges_remaining.saturating_sub(1);
            state.history.push(Message::assistant(display_text.trim()));
            state.prev_response = Some(display_text);
            state.pending_user_turn = nudge;
            state.completed_iterations += 1;
            state.iteration += 1;
            return StepVerdict::Continue;
        }

        info!(retry = state.rollback_retries + 1, "rolling back flawed generation");
        checkpoint.restore(&mut state.history, &mut state.ledger);
        let _ = tx.send(EngineEvent::StreamReset).await;

        state.rollback_retries += 1;
        state.nudges_remaining = state.nudges_remaining.saturating_sub(1);
        if state.iteration == 1 {
            state.temperature_delta -= 0.2;
        }
        if state.rollback_retries >= 3 {
            state.force_grammar_full = true;
        } else {
            // A grammar-constrained retry with the full tool set is the
            // strongest lever against refusal loops.
            state.force_grammar_full = self.engine.supports_grammar();
        }
        // Re-enter generation without advancing the iteration counter; the
        // model never observes the discarded attempt.
        StepVerdict::Continue
    }

    /// Execute one iteration's planned calls serially, in model order.
    async fn execute_batch(
        &self,
        state: &mut RequestState,
        calls: Vec<ToolCall>,
        warnings: Vec<String>,
        plan: &BudgetPlan,
        tx: &mpsc::Sender<EngineEvent>,
    ) -> StepVerdict {
        let defer_writes = self.config.agent.write_deferral
            && self.config.model.profile.tier != falk_config::ModelTier::Small;
        let (planned, mut notes) = pipeline::plan(calls, defer_writes);

        let mut entries: Vec<(ToolCall, ToolResult)> = Vec::new();
        let mut gathered: Vec<(String, String)> = Vec::new();
        let mut deferred: Vec<ToolCall> = Vec::new();
        let mut browser_state_changed = false;

        for item in planned {
            // Suspension point between tools: a superseding request stops
            // further execution; completed results are discarded with it.
            if self.is_stale(state.id) {
                return StepVerdict::Finished(RequestOutcome::Cancelled);
            }
            match item.action {
                pipeline::PlannedAction::SkipBrowserCap => {
                    entries.push((item.call, pipeline::browser_cap_result()));
                }
                pipeline::PlannedAction::DeferWrite => deferred.push(item.call),
                pipeline::PlannedAction::Run => {
                    let call = item.call;
                    let result = self.run_one_tool(state, &call, tx).await;

                    if result.is_ok()
                        && pipeline::BROWSER_STATE_CHANGING.contains(&call.name.as_str())
                    {
                        browser_state_changed = true;
                    }
                    if result.is_ok() && pipeline::GATHER_TOOLS.contains(&call.name.as_str()) {
                        if let Some((_, excerpt)) = state.exec.gathered_excerpts(1).pop() {
                            gathered.push((call.name.clone(), excerpt));
                        }
                    }
                    self.track_repeat_failures(state, &call.name, &result, &mut notes);
                    entries.push((call, result));
                }
            }
        }

        for call in deferred {
            let result = pipeline::deferred_result(&gathered);
            state.ledger.record_tool_call(&call.name, &call.params, &result, state.iteration);
            entries.push((call, result));
        }

        // Element refs go stale after a state change; refresh the outline
        // for the next turn automatically.
        if browser_state_changed {
            if let Some(snapshot) = self.auto_snapshot(state, tx).await {
                entries.push(snapshot);
            }
            if let Some(vision) = self.route_screenshot_through_vision(state).await {
                entries.push(vision);
            }
        }

        // Stuck detection over executed signatures.
        if self.config.agent.stuck_detection {
            for (call, _) in &entries {
                state.call_signatures.push(call.signature());
            }
            let window = self.config.agent.stuck_window;
            if let Some(reason) = stuck_reason(&state.call_signatures, window) {
                warn!(reason = %reason, "stuck pattern detected; stopping");
                state
                    .final_text
                    .push_str(&format!("\n[stopped: detected repetitive pattern ({reason})]"));
                return StepVerdict::Finished(RequestOutcome::Natural);
            }
        }

        // Feed results back as the next prompt's structured block.
        let mut block = render_results_block(&entries, &self.registry, plan.total_ctx);
        for note in &notes {
            block.push_str(&format!("\nNote: {note}"));
        }
        for warning in &warnings {
            block.push_str(&format!("\n{warning}"));
        }
        state.history.push(Message::user(block));

        state.tool_events.extend(entries.iter().map(|(call, result)| ToolResultEvent {
            tool: call.name.clone(),
            ok: result.is_ok(),
            summary: summarize_result(result),
        }));
        let _ = tx
            .send(EngineEvent::ToolResults(
                entries
                    .iter()
                    .map(|(call, result)| ToolResultEvent {
                        tool: call.name.clone(),
                        ok: result.is_ok(),
                        summary: summarize_result(result),
                    })
                    .collect(),
            ))
            .await;

        StepVerdict::Continue
    }

    /// Dispatch one call through the registry, with the domain throttle
    /// short-circuit and state/ledger recording.
    async fn run_one_tool(
        &self,
        state: &mut RequestState,
        call: &ToolCall,
        tx: &mpsc::Sender<EngineEvent>,
    ) -> ToolResult {
        let result = if call.name == "browser_navigate" {
            let url = call.str_param("url").unwrap_or_default();
            match state.exec.blocked_domain(url) {
                Some(domain) => pipeline::domain_blocked_result(&domain),
                None => self.dispatch(call, tx).await,
            }
        } else {
            self.dispatch(call, tx).await
        };

        state.exec.record(&call.name, &call.params, &result, state.iteration);
        state
            .ledger
            .record_tool_call(&call.name, &call.params, &result, state.iteration);
        result
    }

    async fn dispatch(&self, call: &ToolCall, tx: &mpsc::Sender<EngineEvent>) -> ToolResult {
        let _ = tx
            .send(EngineEvent::ToolExecuting {
                tool: call.name.clone(),
                params: serde_json::Value::Object(call.params.clone()),
            })
            .await;
        self.registry.execute(call, self.gate.as_ref()).await
    }

    fn track_repeat_failures(
        &self,
        state: &mut RequestState,
        tool: &str,
        result: &ToolResult,
        notes: &mut Vec<String>,
    ) {
        if result.is_ok() {
            state.consecutive_failures.remove(tool);
            return;
        }
        let count = state
            .consecutive_failures
            .entry(tool.to_string())
            .and_modify(|c| *c += 1)
            .or_insert(1);
        if *count >= REPEAT_FAILURE_LIMIT {
            notes.push(prompts::repeat_failure_directive(tool));
        }
    }

    /// Take a fresh ref-annotated snapshot after a page-state change.
    async fn auto_snapshot(
        &self,
        state: &mut RequestState,
        tx: &mpsc::Sender<EngineEvent>,
    ) -> Option<(ToolCall, ToolResult)> {
        self.registry.get("browser_snapshot")?;
        let call = ToolCall::new("browser_snapshot", ParamMap::new());
        let result = self.dispatch(&call, tx).await;
        state.exec.record(&call.name, &call.params, &result, state.iteration);
        state
            .ledger
            .record_tool_call(&call.name, &call.params, &result, state.iteration);
        Some((call, result))
    }

    /// When the active model cannot see, describe the page through the
    /// vision engine and feed the description back as a synthetic result.
    async fn route_screenshot_through_vision(
        &self,
        state: &mut RequestState,
    ) -> Option<(ToolCall, ToolResult)> {
        if !self.config.agent.auto_vision_routing || self.engine.supports_images() {
            return None;
        }
        let vision = self.vision_engine.as_ref()?;
        let browser = self.browser.as_ref()?;
        let screenshot = match browser.screenshot().await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "screenshot for vision routing failed");
                return None;
            }
        };

        let req = CompletionRequest {
            assembly: PromptAssembly {
                system_context: "Describe the visible page for a coding agent: layout, key \
                                 text, interactive elements."
                    .into(),
                user_turn: "Describe this screenshot.".into(),
            },
            history: Vec::new(),
            options: GenerationOptions {
                stream: true,
                images: vec![screenshot],
                max_tokens: Some(512),
                ..Default::default()
            },
        };
        let mut stream = match vision.generate(req).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "vision engine call failed");
                return None;
            }
        };
        let mut description = String::new();
        while let Some(event) = stream.next().await {
            match event {
                Ok(falk_model::ResponseEvent::TextDelta(t)) => description.push_str(&t),
                Ok(falk_model::ResponseEvent::Done(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "vision stream error");
                    break;
                }
            }
        }
        if description.is_empty() {
            return None;
        }
        state.ledger.add_finding(format!("page description: {}", first_line(&description)));
        let call = ToolCall::new("vision_describe", ParamMap::new());
        let result = ToolResult::ok(serde_json::json!({ "text": description }));
        Some((call, result))
    }

    // ── Generation plumbing ───────────────────────────────────────────────────

    fn budget_plan(&self, state: &RequestState, preamble: &str, tool_text: &str) -> BudgetPlan {
        let mut profile = self.config.model.profile.clone();
        if state.reserve_halved {
            // First-turn overflow recovery: rotation cannot help an empty
            // ledger, so sacrifice response headroom instead.
            profile.response_reserve_pct /= 2.0;
        }
        budget::compute_budget(&profile, self.engine.hardware_ctx(), preamble, tool_text)
    }

    fn grammar_enabled(&self, state: &RequestState) -> bool {
        if !self.engine.supports_grammar() || state.grammar_degraded {
            return false;
        }
        if state.force_grammar_full {
            return true;
        }
        match self.config.model.profile.tier.grammar_iterations() {
            None => true,
            Some(n) => state.iteration <= n,
        }
    }

    /// Progressive tool disclosure: the task type picks the categories,
    /// recently-used tools sort first, and the tier caps the count.  The
    /// refusal-retry path discloses everything.
    fn disclose_tools(&self, state: &RequestState) -> Vec<ToolDefinition> {
        if state.force_grammar_full {
            return self.registry.list(&ListFilter::All);
        }
        let mut defs = self.registry.list(&ListFilter::Task(state.task_type));
        let recent: Vec<&str> = state
            .ledger
            .completed_steps
            .iter()
            .rev()
            .take(8)
            .map(|s| s.tool.as_str())
            .collect();
        defs.sort_by_key(|d| !recent.contains(&d.name.as_str()));
        defs.truncate(self.config.model.profile.tier.tool_disclosure_limit());
        defs
    }

    fn first_turn_context(&self, request: &InboundRequest) -> String {
        let mut sections: Vec<(&str, String)> = Vec::new();
        if let Some(query) = &request.web_search {
            sections.push(("web_search", format!("[The user asked to search the web for: {query}]")));
        }
        if let Some(file) = &request.current_file {
            sections.push((
                "open_file",
                format!("Currently open file {}:\n```\n{}\n```", file.path, file.content),
            ));
        }
        if let Some(selection) = &request.selected_code {
            sections.push(("selection", format!("Selected code:\n```\n{selection}\n```")));
        }
        let owned: Vec<(&str, &str)> =
            sections.iter().map(|(label, text)| (*label, text.as_str())).collect();
        let cap = (self.config.model.profile.effective_ctx as f32
            * self.config.agent.dynamic_cap_pct) as usize;
        let (packed, dropped) = budget::pack_sections(&owned, cap);
        for label in dropped {
            debug!(section = %label, "dynamic context section dropped for budget");
        }
        packed
    }

    fn build_completion(
        &self,
        request: &InboundRequest,
        state: &mut RequestState,
        preamble: &str,
        tool_text: &str,
        plan: &BudgetPlan,
        functions: Option<Vec<ToolSchema>>,
    ) -> CompletionRequest {
        let system_context = if tool_text.is_empty() {
            preamble.to_string()
        } else {
            format!("{preamble}\n\n{tool_text}")
        };

        // The dynamic user turn carries the per-iteration steering content;
        // tool results already live in the history.
        let user_turn = std::mem::take(&mut state.pending_user_turn);

        // Trim the history against the prompt budget before shipping.
        let mut history = state.history.messages.clone();
        let mut history_tokens: usize = history.iter().map(|m| m.approx_tokens()).sum();
        while history_tokens + est_tokens(&user_turn) > plan.prompt_budget && history.len() > 2 {
            let removed = history.remove(1); // keep the leading task message
            history_tokens -= removed.approx_tokens();
        }

        let params = request.params.clone().unwrap_or_default();
        let model_cfg = &self.config.model;
        let temperature = params
            .temperature
            .or(model_cfg.temperature)
            .map(|t| (t + state.temperature_delta).max(0.0));

        CompletionRequest {
            assembly: PromptAssembly { system_context, user_turn },
            history,
            options: GenerationOptions {
                max_tokens: Some(params.max_tokens.unwrap_or(plan.resp_budget)),
                temperature,
                top_p: params.top_p.or(model_cfg.top_p),
                top_k: params.top_k.or(model_cfg.top_k),
                repeat_penalty: params.repeat_penalty.or(model_cfg.repeat_penalty),
                seed: params.seed.or(model_cfg.seed),
                stream: true,
                images: request.images.clone(),
                functions,
                no_fallback: false,
            },
        }
    }

    /// Drain one generation stream, batching visible tokens.
    async fn stream_generation(
        &self,
        req: CompletionRequest,
        state: &RequestState,
        tx: &mpsc::Sender<EngineEvent>,
    ) -> Result<GenerationOutcome, EngineError> {
        let mut stream = self.engine.generate(req).await?;
        let mut batcher = TokenBatcher::new(self.batcher_config.clone(), tx.clone());
        let mut outcome = GenerationOutcome::default();

        while let Some(event) = stream.next().await {
            if self.is_stale(state.id) {
                batcher.dispose().await;
                return Err(EngineError::Cancelled { reason: "supersede".into() });
            }
            match event? {
                falk_model::ResponseEvent::TextDelta(delta) => {
                    outcome.text.push_str(&delta);
                    batcher.push(&delta).await;
                }
                falk_model::ResponseEvent::ThinkingDelta(delta) => {
                    let _ = tx.send(EngineEvent::ThinkingToken(delta)).await;
                }
                falk_model::ResponseEvent::FunctionCall(record) => {
                    outcome.calls.push(record);
                }
                falk_model::ResponseEvent::Usage { input_tokens, output_tokens } => {
                    outcome.usage = Usage { input_tokens, output_tokens };
                }
                falk_model::ResponseEvent::Done(stop) => {
                    outcome.stop = stop;
                    break;
                }
            }
        }
        // Batchers never outlive an iteration boundary.
        batcher.dispose().await;

        if !outcome.calls.is_empty() {
            outcome.stop = StopReason::Tools;
        }
        Ok(outcome)
    }

    /// Map an engine error to a retry or a terminal outcome.
    async fn handle_engine_error(
        &self,
        error: EngineError,
        state: &mut RequestState,
        plan: &BudgetPlan,
    ) -> StepVerdict {
        match error {
            EngineError::ContextOverflow { partial_text } => {
                if !partial_text.is_empty() {
                    state.final_text.push_str(&partial_text);
                }
                if state.ledger.completed_steps.is_empty() && !state.reserve_halved {
                    // First turn: rotation has nothing to summarize; halve
                    // the response reserve and retry once.
                    warn!("context overflow on first turn; halving response reserve");
                    state.reserve_halved = true;
                    StepVerdict::Continue
                } else if !state.overflow_rotated {
                    warn!("context overflow; rotating");
                    state.overflow_rotated = true;
                    self.rotate(state, plan);
                    StepVerdict::Continue
                } else {
                    state.final_text.push_str(
                        "\n[The task context no longer fits the model's window; \
                         please start a new request with a narrower scope.]",
                    );
                    StepVerdict::Finished(RequestOutcome::ContextExhausted)
                }
            }
            EngineError::RateLimited { retry_after_ms } => {
                if state.rate_limit_retried {
                    StepVerdict::Finished(RequestOutcome::TerminalFailure)
                } else {
                    state.rate_limit_retried = true;
                    tokio::time::sleep(Duration::from_millis(retry_after_ms)).await;
                    StepVerdict::Continue
                }
            }
            EngineError::Cancelled { .. } => StepVerdict::Finished(RequestOutcome::Cancelled),
            EngineError::FatalSession(reason) => {
                if state.session_recreated {
                    warn!(reason = %reason, "model session lost twice; terminal");
                    StepVerdict::Finished(RequestOutcome::TerminalFailure)
                } else {
                    warn!(reason = %reason, "model session lost; recreating once");
                    state.session_recreated = true;
                    StepVerdict::Continue
                }
            }
            EngineError::Other(e) => {
                warn!(error = %e, "engine failure");
                state.final_text.push_str(&format!("\n[model backend error: {e}]"));
                StepVerdict::Finished(RequestOutcome::TerminalFailure)
            }
        }
    }

    /// Context rotation: drop the raw conversation, re-seed from the
    /// ledger summary.  The KV cache is gone after this; the summary is
    /// what lets the model resume.
    fn rotate(&self, state: &mut RequestState, plan: &BudgetPlan) {
        info!(rotation = state.ledger.rotations + 1, "rotating context");
        state.ledger.mark_rotation();
        let summary = state.ledger.generate_summary(plan.prompt_budget / 2);
        state.history.replace(vec![Message::user(summary)]);
    }

    fn post_loop(&self, request: &InboundRequest, state: &mut RequestState, outcome: RequestOutcome) {
        if outcome == RequestOutcome::Cancelled {
            return;
        }
        if self.config.agent.completion_guarantee {
            if let Some(path) = exec_state::completion_guarantee(
                &request.message,
                &state.exec,
                self.registry.project_root(),
            ) {
                info!(path = %path.display(), "completion guarantee wrote the requested file");
                state
                    .final_text
                    .push_str(&format!("\n[Gathered data was saved to {}]", path.display()));
            }
        }
    }

    fn reply(&self, state: RequestState, outcome: RequestOutcome) -> Reply {
        let success = matches!(
            outcome,
            RequestOutcome::Natural | RequestOutcome::MaxIterationsReached
        );
        let error = match outcome {
            RequestOutcome::Cancelled => Some("request cancelled".to_string()),
            RequestOutcome::WallClock => Some("wall-clock deadline exceeded".to_string()),
            RequestOutcome::TerminalFailure => Some("the model backend failed".to_string()),
            RequestOutcome::ContextExhausted => Some("context window exhausted".to_string()),
            _ => None,
        };
        Reply {
            success,
            text: state.final_text.trim().to_string(),
            model: self.engine.model_name().to_string(),
            tokens_used: state.stats.request as u32,
            tool_results: state.tool_events,
            iterations: state.completed_iterations,
            outcome,
            error,
        }
    }

    // ── Flags ─────────────────────────────────────────────────────────────────

    fn is_stale(&self, my_id: u64) -> bool {
        self.flags.is_cancelled() || self.flags.current_request_id() != my_id
    }

    async fn wait_while_paused(&self, tx: &mpsc::Sender<EngineEvent>) {
        if !self.flags.is_paused() {
            return;
        }
        let _ = tx.send(EngineEvent::Paused(true)).await;
        self.flags.wait_while_paused().await;
        let _ = tx.send(EngineEvent::Paused(false)).await;
    }
}

#[derive(Debug, Default)]
struct GenerationOutcome {
    text: String,
    calls: Vec<FunctionCallRecord>,
    stop: StopReason,
    usage: Usage,
}

fn schemas_of(defs: &[ToolDefinition]) -> Vec<ToolSchema> {
    defs.iter()
        .map(|d| ToolSchema {
            name: d.name.clone(),
            description: d.description.clone(),
            parameters: d.json_schema(),
        })
        .collect()
}

fn from_native(records: &[FunctionCallRecord]) -> Vec<ToolCall> {
    records
        .iter()
        .map(|r| {
            let params = r
                .params
                .as_object()
                .cloned()
                .unwrap_or_default();
            ToolCall::new(r.function_name.clone(), params)
        })
        .collect()
}

fn summarize_result(result: &ToolResult) -> String {
    match result {
        ToolResult::Ok { payload } => {
            for key in ["title", "output", "text", "content"] {
                if let Some(s) = payload.get(key).and_then(|v| v.as_str()) {
                    return first_line(s);
                }
            }
            "ok".to_string()
        }
        ToolResult::Err { message, .. } => first_line(message),
    }
}

fn first_line(s: &str) -> String {
    let mut line = s.lines().next().unwrap_or("").to_string();
    if line.len() > 120 {
        // Cut on a char boundary; titles and messages are not always ASCII.
        let cut = line
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|i| *i <= 117)
            .last()
            .unwrap_or(0);
        line.truncate(cut);
        line.push('…');
    }
    line
}

/// Stuck detection: an identical trailing triple, or a short cycle
/// repeating through the recent window.
fn stuck_reason(signatures: &[String], window: usize) -> Option<String> {
    if signatures.len() >= STUCK_TRIPLE {
        let tail = &signatures[signatures.len() - STUCK_TRIPLE..];
        if tail.iter().all(|s| s == &tail[0]) {
            return Some("the same call repeated three times".to_string());
        }
    }

    let recent: Vec<&String> = signatures.iter().rev().take(window).collect();
    for period in 2..=4usize {
        if recent.len() < period * CYCLE_REPEATS {
            continue;
        }
        let cycles_match = (0..period * (CYCLE_REPEATS - 1))
            .all(|i| recent[i] == recent[i + period]);
        if cycles_match {
            return Some(format!("a cycle of {period} calls repeated"));
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sigs(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn triple_repeat_is_stuck() {
        let s = sigs(&["a", "b", "c", "c", "c"]);
        assert!(stuck_reason(&s, 20).is_some());
    }

    #[test]
    fn two_repeats_are_not_stuck() {
        let s = sigs(&["a", "c", "c"]);
        assert!(stuck_reason(&s, 20).is_none());
    }

    #[test]
    fn alternating_cycle_is_stuck() {
        // a b a b a b, period 2 repeated 3 times
        let s = sigs(&["x", "a", "b", "a", "b", "a", "b"]);
        assert!(stuck_reason(&s, 20).is_some());
    }

    #[test]
    fn progressing_calls_are_not_stuck() {
        let s = sigs(&["a", "b", "c", "d", "e", "f", "g"]);
        assert!(stuck_reason(&s, 20).is_none());
    }

    #[test]
    fn three_step_cycle_detected() {
        let s = sigs(&["a", "b", "c", "a", "b", "c", "a", "b", "c"]);
        assert!(stuck_reason(&s, 20).is_some());
    }

    #[test]
    fn native_records_become_tool_calls() {
        let records = vec![FunctionCallRecord {
            function_name: "write_file".into(),
            params: serde_json::json!({"filePath": "a.txt", "content": "x"}),
        }];
        let calls = from_native(&records);
        assert_eq!(calls[0].name, "write_file");
        assert_eq!(calls[0].params.get("filePath").unwrap(), "a.txt");
    }

    #[test]
    fn first_line_truncates_long_lines() {
        let line = first_line(&"y".repeat(300));
        assert!(line.len() <= 120);
        assert!(line.ends_with('…'));
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end scenarios for the agentic loop.
///
/// Every scenario runs against `ScriptedEngine` and a tempdir-rooted tool
/// registry, so the suite is deterministic and needs no network or real
/// model.
#[cfg(test)]
mod scenario_tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::mpsc;

    use falk_config::{Config, ToolPromptStyle};
    use falk_model::{
        fenced_call_script, native_call_script, text_script, ResponseEvent, ScriptedEngine,
        StopReason,
    };
    use falk_tools::{
        register_browser_tools, BrowserPort, DeleteFileTool, EditFileTool, FakeBrowser,
        ListDirectoryTool, ReadFileTool, SearchHit, SearchPort, ToolRegistry, UndoEditTool,
        WebSearchTool, WriteFileTool,
    };

    use crate::{
        EngineEvent, InboundRequest, MediaPort, Reply, RequestOutcome, SessionController,
        QUOTA_SENTINEL,
    };

    // ── Harness ───────────────────────────────────────────────────────────────

    struct FixedSearch;

    #[async_trait::async_trait]
    impl SearchPort for FixedSearch {
        async fn search(&self, query: &str) -> anyhow::Result<Vec<SearchHit>> {
            Ok(vec![SearchHit {
                title: format!("Result for {query}"),
                url: "https://results.example.com/1".into(),
                snippet: "Rust 1.80 introduces LazyLock in the standard library".into(),
            }])
        }
    }

    fn registry_in(root: &std::path::Path) -> ToolRegistry {
        let mut reg = ToolRegistry::new(root.to_path_buf(), Default::default());
        reg.register(WriteFileTool);
        reg.register(EditFileTool);
        reg.register(ReadFileTool);
        reg.register(ListDirectoryTool);
        reg.register(DeleteFileTool);
        reg.register(WebSearchTool::new(Arc::new(FixedSearch)));
        let undo = reg.undo_ledger();
        reg.register(UndoEditTool::new(undo));
        let browser: Arc<dyn BrowserPort> = Arc::new(FakeBrowser {
            title: "Example Domain".into(),
            content: "Example Domain. This domain is for use in illustrative examples.".into(),
        });
        register_browser_tools(&mut reg, Arc::clone(&browser));
        reg
    }

    struct Harness {
        _dir: tempfile::TempDir,
        root: std::path::PathBuf,
        engine: Arc<ScriptedEngine>,
        controller: SessionController,
    }

    fn harness(engine: ScriptedEngine, config: Config) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let engine = Arc::new(engine);
        let registry = Arc::new(registry_in(&root));
        let controller =
            SessionController::new(Arc::clone(&engine) as _, registry, Arc::new(config));
        Harness { _dir: dir, root, engine, controller }
    }

    fn quota_free_config() -> Config {
        let mut config = Config::default();
        config.quota.counter_file =
            Some(std::env::temp_dir().join(format!("falk-test-quota-{}.json", uuid::Uuid::new_v4())));
        config
    }

    async fn run(h: &Harness, request: InboundRequest) -> (Reply, Vec<EngineEvent>) {
        let (tx, mut rx) = mpsc::channel(1024);
        let reply = h.controller.handle(request, tx).await;
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        (reply, events)
    }

    fn streamed_text(events: &[EngineEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Token(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    // ── S1: greeting, no tools ────────────────────────────────────────────────

    #[tokio::test]
    async fn s1_greeting_answers_in_one_generation() {
        let engine = ScriptedEngine::always_text("Hello! How can I help you today?");
        let h = harness(engine, quota_free_config());

        let (reply, events) = run(&h, InboundRequest::text("hi")).await;

        assert!(reply.success);
        assert_eq!(reply.iterations, 1);
        assert!(!reply.text.is_empty());
        assert!(reply.tool_results.is_empty());
        assert_eq!(reply.outcome, RequestOutcome::Natural);
        assert_eq!(h.engine.requests.lock().unwrap().len(), 1, "exactly one generation");
        assert!(streamed_text(&events).contains("Hello"));
    }

    // ── S2: simple file write ─────────────────────────────────────────────────

    #[tokio::test]
    async fn s2_file_write_creates_file_and_undo_entry() {
        let engine = ScriptedEngine::new(vec![
            fenced_call_script(
                "write_file",
                &json!({"filePath": "hello.txt", "content": "World"}),
            ),
            text_script("I created hello.txt with the requested content."),
        ]);
        let h = harness(engine, quota_free_config());

        let (reply, events) =
            run(&h, InboundRequest::text("create hello.txt with the text World")).await;

        assert!(reply.success, "{:?}", reply.error);
        assert_eq!(std::fs::read_to_string(h.root.join("hello.txt")).unwrap(), "World");
        assert!(reply.text.contains("created hello.txt"));
        assert!(reply
            .tool_results
            .iter()
            .any(|t| t.tool == "write_file" && t.ok));
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::ToolExecuting { tool, .. } if tool == "write_file")));
    }

    #[tokio::test]
    async fn s2_undo_ledger_records_creation() {
        let engine = ScriptedEngine::new(vec![
            fenced_call_script(
                "write_file",
                &json!({"filePath": "hello.txt", "content": "World"}),
            ),
            text_script("Done creating the file."),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(registry_in(dir.path()));
        let undo = registry.undo_ledger();
        let controller = SessionController::new(
            Arc::new(engine) as _,
            Arc::clone(&registry),
            Arc::new(quota_free_config()),
        );

        let (tx, _rx) = mpsc::channel(1024);
        let reply = controller
            .handle(InboundRequest::text("create hello.txt with the text World"), tx)
            .await;

        assert!(reply.success);
        let ledger = undo.lock().unwrap();
        assert_eq!(ledger.len(), 1);
        assert!(ledger.last().unwrap().is_new(), "creation must record is_new");
    }

    // ── S3: navigate + extract ────────────────────────────────────────────────

    #[tokio::test]
    async fn s3_navigate_snapshots_and_reports_title() {
        let engine = ScriptedEngine::new(vec![
            fenced_call_script("browser_navigate", &json!({"url": "https://example.com"})),
            text_script("The page title is \"Example Domain\"."),
        ]);
        let h = harness(engine, quota_free_config());

        let (reply, _events) = run(
            &h,
            InboundRequest::text("go to https://example.com and tell me the page title"),
        )
        .await;

        assert!(reply.success);
        assert!(reply.text.contains("Example Domain"));
        let tools: Vec<&str> = reply.tool_results.iter().map(|t| t.tool.as_str()).collect();
        assert!(tools.contains(&"browser_navigate"));
        assert!(
            tools.contains(&"browser_snapshot"),
            "auto-snapshot must fire after a state change: {tools:?}"
        );
        // The snapshot lands in the next prompt so the model can read refs.
        let requests = h.engine.requests.lock().unwrap();
        let followup = &requests[1];
        let history_text: String = followup
            .history
            .iter()
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n");
        assert!(history_text.contains("[ref=1]"));
        assert!(history_text.contains("Example Domain — https://example.com"));
    }

    // ── S4: rollback on refusal ───────────────────────────────────────────────

    #[tokio::test]
    async fn s4_refusal_rolls_back_and_retries_with_grammar() {
        let engine = ScriptedEngine::new(vec![
            text_script("I'm sorry, I can't do that."),
            native_call_script(
                "write_file",
                json!({"filePath": "hello.txt", "content": "World"}),
            ),
            text_script("I created hello.txt for you."),
        ])
        .with_grammar();
        let h = harness(engine, quota_free_config());

        let (reply, _events) =
            run(&h, InboundRequest::text("create hello.txt with the text World")).await;

        assert!(reply.success);
        assert!(std::fs::read_to_string(h.root.join("hello.txt")).is_ok());
        assert!(!reply.text.to_lowercase().contains("sorry"), "refusal must be rolled back");

        // The retry generation observes the pre-refusal history: no trace of
        // the refusal text in any later request.
        let requests = h.engine.requests.lock().unwrap();
        assert!(requests.len() >= 3);
        for req in requests.iter().skip(1) {
            for msg in &req.history {
                assert!(
                    !msg.content.contains("I'm sorry"),
                    "model must never observe its own rollback"
                );
            }
        }
        // The retry ran grammar-on with a function set.
        assert!(requests[1].options.functions.is_some());
    }

    // ── S5: stuck-loop break ──────────────────────────────────────────────────

    #[tokio::test]
    async fn s5_identical_calls_three_times_stop_the_loop() {
        let list_call = fenced_call_script("list_directory", &json!({"dirPath": "."}));
        let engine = ScriptedEngine::new(vec![
            list_call.clone(),
            list_call.clone(),
            list_call,
            text_script("still listing..."),
        ]);
        let h = harness(engine, quota_free_config());

        let (reply, _events) =
            run(&h, InboundRequest::text("inspect the project directory structure carefully")).await;

        assert_eq!(reply.iterations, 3, "loop must stop at the third identical call");
        assert!(reply.text.contains("repetitive pattern"));
        assert!(reply.success);
    }

    // ── S6: context rotation mid-task ─────────────────────────────────────────

    #[tokio::test]
    async fn s6_small_context_rotates_and_reinjects_goal() {
        let goal = "read notes.txt repeatedly and then summarize what it contains";

        // Distinct offsets per read so the stuck detector (rightly) sees
        // progress rather than the same call repeated.
        let mut scripts = Vec::new();
        for i in 0..10u64 {
            scripts.push(fenced_call_script(
                "read_file",
                &json!({"filePath": "notes.txt", "offset": i + 1}),
            ));
        }
        scripts.push(text_script("The notes describe the falk engine internals."));
        let engine = ScriptedEngine::new(scripts);

        let mut config = quota_free_config();
        config.model.profile.effective_ctx = 1200;
        config.model.profile.tool_prompt_style = ToolPromptStyle::Compact;
        let h = harness(engine, config);
        std::fs::write(h.root.join("notes.txt"), "engine internals\n".repeat(110)).unwrap();

        let (reply, _events) = run(&h, InboundRequest::text(goal)).await;

        assert!(reply.success, "{:?}", reply.error);
        assert_eq!(reply.iterations, 11, "all tool iterations plus the final answer");

        // At least one later prompt was re-seeded from the ledger summary,
        // carrying the goal verbatim.
        let requests = h.engine.requests.lock().unwrap();
        let rotated = requests.iter().any(|req| {
            req.history
                .first()
                .map(|m| m.content.contains("# Task Ledger") && m.content.contains(goal))
                .unwrap_or(false)
        });
        assert!(rotated, "rotation must re-inject the ledger summary");
    }

    // ── Boundary behaviors ────────────────────────────────────────────────────

    #[tokio::test]
    async fn duplicate_calls_in_one_response_execute_once() {
        let body = json!([
            {"tool": "write_file", "params": {"filePath": "once.txt", "content": "A"}},
            {"tool": "write_file", "params": {"filePath": "once.txt", "content": "A"}}
        ]);
        let engine = ScriptedEngine::new(vec![
            vec![
                ResponseEvent::TextDelta(format!("```tool_call\n{body}\n```")),
                ResponseEvent::Done(StopReason::Natural),
            ],
            text_script("I wrote once.txt a single time as requested."),
        ]);
        let h = harness(engine, quota_free_config());

        let (reply, _events) = run(&h, InboundRequest::text("create once.txt")).await;

        assert!(reply.success);
        let writes = reply
            .tool_results
            .iter()
            .filter(|t| t.tool == "write_file")
            .count();
        assert_eq!(writes, 1, "intra-iteration dedup must collapse the duplicate");
    }

    #[tokio::test]
    async fn max_iterations_one_with_tools_stops_after_one_batch() {
        let engine = ScriptedEngine::new(vec![
            fenced_call_script("write_file", &json!({"filePath": "a.txt", "content": "1"})),
            fenced_call_script("write_file", &json!({"filePath": "b.txt", "content": "2"})),
        ]);
        let h = harness(engine, quota_free_config());

        let mut request = InboundRequest::text("create a.txt and then b.txt");
        request.max_iterations = Some(1);
        let (reply, _events) = run(&h, request).await;

        assert_eq!(reply.outcome, RequestOutcome::MaxIterationsReached);
        assert_eq!(reply.iterations, 1);
        assert!(h.root.join("a.txt").exists());
        assert!(!h.root.join("b.txt").exists(), "second iteration must not run");
    }

    #[tokio::test]
    async fn write_deferred_while_same_batch_gathers() {
        let body = json!([
            {"tool": "web_search", "params": {"query": "rust lazylock"}},
            {"tool": "write_file", "params": {"filePath": "notes.md", "content": "made-up facts"}}
        ]);
        let engine = ScriptedEngine::new(vec![
            vec![
                ResponseEvent::TextDelta(format!("```tool_call\n{body}\n```")),
                ResponseEvent::Done(StopReason::Natural),
            ],
            text_script("I'll write the file next turn with the real data."),
        ]);
        // Disable the post-loop completion guarantee so the assertion sees
        // the deferral in isolation (the guarantee would otherwise finish
        // the job itself).
        let mut config = quota_free_config();
        config.agent.completion_guarantee = false;
        let h = harness(engine, config);

        let (reply, _events) =
            run(&h, InboundRequest::text("research lazylock and write notes.md")).await;

        assert!(reply.success);
        assert!(!h.root.join("notes.md").exists(), "the write must be deferred");
        let deferred = reply
            .tool_results
            .iter()
            .find(|t| t.tool == "write_file")
            .expect("deferred write reported");
        assert!(!deferred.ok);
        assert!(deferred.summary.contains("postponed"));

        // The deferral message carries the actually gathered data.
        let requests = h.engine.requests.lock().unwrap();
        let followup_text: String = requests[1]
            .history
            .iter()
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n");
        assert!(followup_text.contains("LazyLock"), "gathered data must reach the model");
    }

    #[tokio::test]
    async fn browser_state_change_cap_skips_third_action() {
        let body = json!([
            {"tool": "browser_navigate", "params": {"url": "https://example.com"}},
            {"tool": "browser_click", "params": {"ref": "1"}},
            {"tool": "browser_click", "params": {"ref": "2"}}
        ]);
        let engine = ScriptedEngine::new(vec![
            vec![
                ResponseEvent::TextDelta(format!("```tool_call\n{body}\n```")),
                ResponseEvent::Done(StopReason::Natural),
            ],
            text_script("Continuing with fresh refs."),
        ]);
        let h = harness(engine, quota_free_config());

        let (reply, _events) =
            run(&h, InboundRequest::text("go to https://example.com and click through")).await;

        let skipped = reply
            .tool_results
            .iter()
            .filter(|t| t.tool == "browser_click" && !t.ok)
            .count();
        assert_eq!(skipped, 1, "third state change must be skipped");
    }

    #[tokio::test]
    async fn seamless_continuation_after_max_tokens() {
        let engine = ScriptedEngine::new(vec![
            vec![
                ResponseEvent::TextDelta("The answer begins here".into()),
                ResponseEvent::Done(StopReason::MaxTokens),
            ],
            text_script(" and ends here."),
        ]);
        let h = harness(engine, quota_free_config());

        let (reply, _events) = run(
            &h,
            InboundRequest::text("explain the architecture of this project in detail"),
        )
        .await;

        assert!(reply.success);
        assert!(reply.text.contains("begins here"));
        assert!(reply.text.contains("ends here"));

        // The continuation turn used the marker, not a fresh user question.
        let requests = h.engine.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].assembly.user_turn.contains("continue where you left off"));
    }

    #[tokio::test]
    async fn permission_gate_denial_reaches_the_model() {
        let engine = ScriptedEngine::new(vec![
            fenced_call_script("write_file", &json!({"filePath": "x.txt", "content": "y"})),
            text_script("The write was not permitted."),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(registry_in(dir.path()));
        let controller = SessionController::new(
            Arc::new(engine) as _,
            registry,
            Arc::new(quota_free_config()),
        )
        .with_permission_gate(Arc::new(|_, _| false));

        let (tx, _rx) = mpsc::channel(1024);
        let reply = controller
            .handle(InboundRequest::text("create x.txt"), tx)
            .await;

        assert!(!dir.path().join("x.txt").exists());
        let denied = reply
            .tool_results
            .iter()
            .find(|t| t.tool == "write_file")
            .unwrap();
        assert!(!denied.ok);
        assert!(denied.summary.contains("denied"));
    }

    // ── Routing & quota ───────────────────────────────────────────────────────

    struct FixedMedia;

    #[async_trait::async_trait]
    impl MediaPort for FixedMedia {
        async fn generate_media(&self, _prompt: &str) -> anyhow::Result<String> {
            Ok("/tmp/generated.png".into())
        }
    }

    #[tokio::test]
    async fn media_intent_routes_without_touching_the_model() {
        let engine = Arc::new(ScriptedEngine::always_text("should not run"));
        let dir = tempfile::tempdir().unwrap();
        let controller = SessionController::new(
            Arc::clone(&engine) as _,
            Arc::new(registry_in(dir.path())),
            Arc::new(quota_free_config()),
        )
        .with_media_port(Arc::new(FixedMedia));

        let (tx, _rx) = mpsc::channel(64);
        let reply = controller
            .handle(
                InboundRequest::text("generate an image of a lighthouse at dusk"),
                tx,
            )
            .await;

        assert!(reply.success);
        assert!(reply.text.contains("/tmp/generated.png"));
        assert_eq!(reply.iterations, 0);
        assert!(engine.requests.lock().unwrap().is_empty(), "model must not be invoked");
    }

    #[tokio::test]
    async fn bundled_provider_quota_exhaustion_returns_sentinel() {
        let mut config = quota_free_config();
        config.model.bundled = true;
        config.quota.daily_limit = 1;

        let engine = Arc::new(ScriptedEngine::new(vec![
            text_script("first answer"),
            text_script("second answer"),
        ]));
        let dir = tempfile::tempdir().unwrap();
        let controller = SessionController::new(
            Arc::clone(&engine) as _,
            Arc::new(registry_in(dir.path())),
            Arc::new(config),
        );

        let (tx, _rx) = mpsc::channel(64);
        let first = controller.handle(InboundRequest::text("hello there"), tx).await;
        assert!(first.success);

        let (tx2, _rx2) = mpsc::channel(64);
        let second = controller.handle(InboundRequest::text("hello again"), tx2).await;
        assert!(!second.success);
        assert_eq!(second.error.as_deref(), Some(QUOTA_SENTINEL));
    }

    // ── Error recovery ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn context_overflow_on_first_turn_halves_reserve_and_retries() {
        let engine = ScriptedEngine::new(vec![]);
        engine.push_error(|| falk_model::EngineError::ContextOverflow {
            partial_text: String::new(),
        });
        engine.push_script(text_script(
            "The retry recovered fine; the workspace summary fits the reduced budget.",
        ));
        let h = harness(engine, quota_free_config());

        let (reply, _events) = run(
            &h,
            InboundRequest::text("summarize everything in this huge workspace"),
        )
        .await;

        assert!(reply.success, "{:?}", reply.error);
        assert!(reply.text.contains("recovered fine"));
        assert_eq!(h.engine.requests.lock().unwrap().len(), 2, "one retry after overflow");
    }

    #[tokio::test]
    async fn nudge_recovers_claim_without_action() {
        let engine = ScriptedEngine::new(vec![
            text_script("Done! I created report.txt with all the findings."),
            fenced_call_script("write_file", &json!({"filePath": "report.txt", "content": "findings"})),
            text_script("Now report.txt really exists."),
        ]);
        let h = harness(engine, quota_free_config());

        let (reply, _events) =
            run(&h, InboundRequest::text("create report.txt with the findings")).await;

        assert!(reply.success);
        assert!(h.root.join("report.txt").exists(), "nudge must lead to the real write");

        // The nudge text reached the model on the second generation.
        let requests = h.engine.requests.lock().unwrap();
        assert!(requests[1].assembly.user_turn.contains("tool call"));
    }
}

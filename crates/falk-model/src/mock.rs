// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{future, stream, StreamExt};

use crate::{
    CancelFlag, CompletionRequest, EngineError, FunctionCallRecord, ModelEngine, ResponseEvent,
    ResponseStream, StopReason,
};

/// Deterministic mock engine for tests.  Echoes the current user turn back
/// as the assistant response.
#[derive(Default)]
pub struct EchoEngine {
    cancel: CancelFlag,
}

#[async_trait]
impl ModelEngine for EchoEngine {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-echo"
    }

    async fn generate(&self, req: CompletionRequest) -> Result<ResponseStream, EngineError> {
        let reply = if req.assembly.user_turn.is_empty() {
            "[no input]".to_string()
        } else {
            req.assembly.user_turn.clone()
        };
        let events = vec![
            Ok(ResponseEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(ResponseEvent::Usage { input_tokens: 10, output_tokens: 10 }),
            Ok(ResponseEvent::Done(StopReason::Natural)),
        ];
        Ok(suppress_after_cancel(events, self.cancel.clone()))
    }

    fn cancel_generation(&self, _reason: &str) {
        self.cancel.raise();
    }
}

/// A pre-scripted engine.  Each call to `generate` pops the next response
/// script from the front of the queue.  This lets tests specify exact event
/// sequences, native function calls included, without network access.
pub struct ScriptedEngine {
    scripts: Arc<Mutex<Vec<Script>>>,
    cancel: CancelFlag,
    grammar: bool,
    vision: bool,
    pacing_ms: u64,
    hardware_ctx: Option<usize>,
    /// The last `CompletionRequest` seen by this engine.
    /// Written on each `generate()` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
    /// Every request seen, in order.  Tests use this to count generations.
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

enum Script {
    Events(Vec<ResponseEvent>),
    Fail(fn() -> EngineError),
}

impl ScriptedEngine {
    /// Build an engine from a list of response scripts.
    /// The outer `Vec` is the ordered list of calls; the inner `Vec` is the
    /// sequence of [`ResponseEvent`]s emitted for that call.
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into_iter().map(Script::Events).collect())),
            cancel: CancelFlag::new(),
            grammar: false,
            vision: false,
            pacing_ms: 0,
            hardware_ctx: None,
            last_request: Arc::new(Mutex::new(None)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Declare grammar-constraining capability.
    pub fn with_grammar(mut self) -> Self {
        self.grammar = true;
        self
    }

    /// Declare image-input capability.
    pub fn with_vision(mut self) -> Self {
        self.vision = true;
        self
    }

    pub fn with_pacing_ms(mut self, ms: u64) -> Self {
        self.pacing_ms = ms;
        self
    }

    /// Clamp the reported hardware context window (smaller than the profile's
    /// `effective_ctx` in rotation tests).
    pub fn with_hardware_ctx(mut self, ctx: usize) -> Self {
        self.hardware_ctx = Some(ctx);
        self
    }

    /// Queue an error for the next `generate` call instead of a script.
    pub fn push_error(&self, make: fn() -> EngineError) {
        self.scripts.lock().unwrap().push(Script::Fail(make));
    }

    /// Queue another event script after anything already queued.
    pub fn push_script(&self, events: Vec<ResponseEvent>) {
        self.scripts.lock().unwrap().push(Script::Events(events));
    }

    /// Convenience: engine that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![text_script(reply)])
    }

    /// Convenience: engine that emits a native tool call, then a text reply
    /// on the following generation.
    pub fn tool_then_text(
        tool_name: impl Into<String>,
        params: serde_json::Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            native_call_script(tool_name, params),
            text_script(final_text),
        ])
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }
}

/// A script that streams `reply` as one delta and stops naturally.
pub fn text_script(reply: impl Into<String>) -> Vec<ResponseEvent> {
    vec![
        ResponseEvent::TextDelta(reply.into()),
        ResponseEvent::Usage { input_tokens: 5, output_tokens: 5 },
        ResponseEvent::Done(StopReason::Natural),
    ]
}

/// A script that emits one native function call (grammar path).
pub fn native_call_script(
    tool_name: impl Into<String>,
    params: serde_json::Value,
) -> Vec<ResponseEvent> {
    vec![
        ResponseEvent::FunctionCall(FunctionCallRecord {
            function_name: tool_name.into(),
            params,
        }),
        ResponseEvent::Usage { input_tokens: 5, output_tokens: 5 },
        ResponseEvent::Done(StopReason::Tools),
    ]
}

/// A script that emits a fenced tool-call JSON block as plain text: the
/// non-grammar wire format the parser must extract.
pub fn fenced_call_script(tool_name: &str, params: &serde_json::Value) -> Vec<ResponseEvent> {
    let body = serde_json::json!({ "tool": tool_name, "params": params });
    vec![
        ResponseEvent::TextDelta(format!("```json\n{body}\n```")),
        ResponseEvent::Usage { input_tokens: 5, output_tokens: 5 },
        ResponseEvent::Done(StopReason::Natural),
    ]
}

#[async_trait]
impl ModelEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    fn supports_grammar(&self) -> bool {
        self.grammar
    }

    fn supports_images(&self) -> bool {
        self.vision
    }

    fn pacing_hint_ms(&self) -> u64 {
        self.pacing_ms
    }

    fn hardware_ctx(&self) -> Option<usize> {
        self.hardware_ctx
    }

    async fn generate(&self, req: CompletionRequest) -> Result<ResponseStream, EngineError> {
        *self.last_request.lock().unwrap() = Some(req.clone());
        self.requests.lock().unwrap().push(req);

        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                Script::Events(vec![
                    ResponseEvent::TextDelta("[no more scripts]".into()),
                    ResponseEvent::Done(StopReason::Natural),
                ])
            } else {
                scripts.remove(0)
            }
        };

        match script {
            Script::Fail(make) => Err(make()),
            Script::Events(events) => {
                let wrapped: Vec<Result<ResponseEvent, EngineError>> =
                    events.into_iter().map(Ok).collect();
                Ok(suppress_after_cancel(wrapped, self.cancel.clone()))
            }
        }
    }

    fn cancel_generation(&self, _reason: &str) {
        self.cancel.raise();
    }
}

/// Wrap a materialized event list in a stream that stops yielding once the
/// cancel flag is raised.  The check runs before each event, so at most the
/// event already being polled slips through after cancellation.
fn suppress_after_cancel(
    events: Vec<Result<ResponseEvent, EngineError>>,
    cancel: CancelFlag,
) -> ResponseStream {
    Box::pin(
        stream::iter(events).take_while(move |_| future::ready(!cancel.is_raised())),
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::{Message, PromptAssembly};

    fn req(user: &str) -> CompletionRequest {
        CompletionRequest {
            assembly: PromptAssembly {
                system_context: "system".into(),
                user_turn: user.into(),
            },
            history: vec![Message::user(user)],
            options: Default::default(),
        }
    }

    async fn drain(mut s: ResponseStream) -> Vec<ResponseEvent> {
        let mut out = Vec::new();
        while let Some(ev) = s.next().await {
            out.push(ev.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn echo_replies_with_user_turn() {
        let e = EchoEngine::default();
        let events = drain(e.generate(req("hi")).await.unwrap()).await;
        assert!(matches!(&events[0], ResponseEvent::TextDelta(t) if t.contains("MOCK: hi")));
        assert!(matches!(events.last(), Some(ResponseEvent::Done(StopReason::Natural))));
    }

    #[tokio::test]
    async fn scripted_single_text_reply() {
        let e = ScriptedEngine::always_text("hello world");
        let events = drain(e.generate(req("x")).await.unwrap()).await;
        assert!(matches!(&events[0], ResponseEvent::TextDelta(t) if t == "hello world"));
    }

    #[tokio::test]
    async fn scripted_tool_then_text_two_rounds() {
        let e = ScriptedEngine::tool_then_text(
            "run_command",
            serde_json::json!({"command": "ls"}),
            "done",
        );

        let events = drain(e.generate(req("r1")).await.unwrap()).await;
        assert!(events.iter().any(|ev| matches!(
            ev,
            ResponseEvent::FunctionCall(fc) if fc.function_name == "run_command"
        )));
        assert!(matches!(events.last(), Some(ResponseEvent::Done(StopReason::Tools))));

        let events2 = drain(e.generate(req("r2")).await.unwrap()).await;
        assert!(events2
            .iter()
            .any(|ev| matches!(ev, ResponseEvent::TextDelta(t) if t == "done")));
    }

    #[tokio::test]
    async fn scripted_fallback_when_scripts_exhausted() {
        let e = ScriptedEngine::new(vec![]);
        let events = drain(e.generate(req("x")).await.unwrap()).await;
        assert!(events
            .iter()
            .any(|ev| matches!(ev, ResponseEvent::TextDelta(t) if t.contains("no more scripts"))));
    }

    #[tokio::test]
    async fn scripted_records_last_request() {
        let e = ScriptedEngine::always_text("ok");
        let _ = e.generate(req("inspect me")).await.unwrap();
        let last = e.last_request.lock().unwrap();
        assert_eq!(last.as_ref().unwrap().assembly.user_turn, "inspect me");
    }

    #[tokio::test]
    async fn scripted_error_script_propagates() {
        let e = ScriptedEngine::new(vec![]);
        e.push_error(|| EngineError::ContextOverflow { partial_text: "partial".into() });
        let err = e.generate(req("x")).await.err().unwrap();
        assert_eq!(err.partial_text(), Some("partial"));
    }

    #[tokio::test]
    async fn cancellation_suppresses_remaining_events() {
        let e = ScriptedEngine::new(vec![vec![
            ResponseEvent::TextDelta("one".into()),
            ResponseEvent::TextDelta("two".into()),
            ResponseEvent::TextDelta("three".into()),
            ResponseEvent::Done(StopReason::Natural),
        ]]);
        let mut stream = e.generate(req("x")).await.unwrap();
        let first = stream.next().await;
        assert!(first.is_some());
        e.cancel_generation("user");
        // After cancellation the stream ends without yielding the remaining
        // deltas; at most one event could already have been in flight.
        let mut extra = 0;
        while stream.next().await.is_some() {
            extra += 1;
        }
        assert!(extra <= 1, "got {extra} events after cancellation");
    }

    #[tokio::test]
    async fn fenced_script_produces_parseable_block() {
        let script = fenced_call_script("write_file", &serde_json::json!({"filePath": "a"}));
        match &script[0] {
            ResponseEvent::TextDelta(t) => {
                assert!(t.starts_with("```json"));
                assert!(t.contains("\"tool\":\"write_file\""));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

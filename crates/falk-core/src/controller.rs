// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-session request lifecycle: identity, supersession, pause/resume,
//! media routing, the free-tier quota, and construction of the loop
//! driver.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use falk_config::Config;
use falk_model::ModelEngine;
use falk_tools::{BrowserPort, PermissionGate, ToolRegistry};

use crate::agent::Agent;
use crate::batcher::BatcherConfig;
use crate::events::{EngineEvent, Reply, RequestOutcome};
use crate::quota::{QuotaCounter, QUOTA_SENTINEL};
use crate::request::InboundRequest;
use crate::routing;

/// Shared control state between the controller and the loop driver.
///
/// The request id is strictly monotone; a loop whose id no longer equals
/// the active id exits at its next check-in.  Pause gates the *next* loop
/// step, never the in-flight generation.
#[derive(Debug, Default)]
pub struct ControlFlags {
    active_request_id: AtomicU64,
    cancelled: AtomicBool,
    paused: AtomicBool,
    resume: Notify,
}

impl ControlFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_request_id(&self) -> u64 {
        self.active_request_id.load(Ordering::SeqCst)
    }

    /// Allocate the next request id, superseding the previous request.
    pub fn next_request_id(&self) -> u64 {
        self.active_request_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // A paused loop must wake to observe the cancellation.
        self.resume.notify_waiters();
    }

    pub fn clear_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resume.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Block cooperatively until resumed (or woken by cancellation).
    pub async fn wait_while_paused(&self) {
        loop {
            // Register interest before re-checking the flag; `notify_waiters`
            // stores no permit, so checking first would lose a wakeup that
            // lands between the check and the await.
            let notified = self.resume.notified();
            if !self.is_paused() || self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Port to the host's image/video generation provider.
#[async_trait]
pub trait MediaPort: Send + Sync {
    /// Generate media for the prompt; returns a host-resolvable reference
    /// (file path or URL).
    async fn generate_media(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Owns request identity and the IPC boundary for one window session.
pub struct SessionController {
    session_id: String,
    engine: Arc<dyn ModelEngine>,
    vision_engine: Option<Arc<dyn ModelEngine>>,
    media: Option<Arc<dyn MediaPort>>,
    browser: Option<Arc<dyn BrowserPort>>,
    registry: Arc<ToolRegistry>,
    config: Arc<Config>,
    flags: Arc<ControlFlags>,
    gate: Option<PermissionGate>,
    quota: QuotaCounter,
    session_tokens: AtomicU64,
}

impl SessionController {
    pub fn new(
        engine: Arc<dyn ModelEngine>,
        registry: Arc<ToolRegistry>,
        config: Arc<Config>,
    ) -> Self {
        let quota = QuotaCounter::new(&config.quota);
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            engine,
            vision_engine: None,
            media: None,
            browser: None,
            registry,
            config,
            flags: Arc::new(ControlFlags::new()),
            gate: None,
            quota,
            session_tokens: AtomicU64::new(0),
        }
    }

    pub fn with_vision_engine(mut self, engine: Arc<dyn ModelEngine>) -> Self {
        self.vision_engine = Some(engine);
        self
    }

    pub fn with_media_port(mut self, media: Arc<dyn MediaPort>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_browser_port(mut self, browser: Arc<dyn BrowserPort>) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn with_permission_gate(mut self, gate: PermissionGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn flags(&self) -> Arc<ControlFlags> {
        Arc::clone(&self.flags)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Pause the active request at its next loop check-in.  The current
    /// generation finishes; this is the user's live-takeover point.
    pub fn pause(&self) {
        self.flags.pause();
    }

    pub fn resume(&self) {
        self.flags.resume();
    }

    /// Two-phase cancellation: flag first, then interrupt the in-flight
    /// stream.
    pub fn cancel(&self, reason: &str) {
        self.flags.cancel();
        self.engine.cancel_generation(reason);
    }

    /// Handle one inbound request end-to-end.
    ///
    /// Supersession protocol: allocate the next id, cancel whatever was
    /// running, yield so its loop can observe staleness, then clear the
    /// cancellation flag for the new request.
    pub async fn handle(
        &self,
        request: InboundRequest,
        tx: mpsc::Sender<EngineEvent>,
    ) -> Reply {
        let request_id = self.flags.next_request_id();
        self.flags.cancel();
        self.engine.cancel_generation("supersede");
        tokio::task::yield_now().await;
        self.flags.clear_cancel();
        debug!(session = %self.session_id, request_id, "request accepted");

        // Media-generation intent routes straight to the media port.
        if self.config.routing.media_routing && routing::detect_media_intent(&request.message) {
            if let Some(media) = &self.media {
                return self.handle_media(&request, media.as_ref()).await;
            }
        }

        // Free-tier bookkeeping for the bundled provider path.
        let batcher_config = if self.config.model.bundled {
            if let Err(e) = self.quota.check_and_increment() {
                info!("free-tier quota exhausted");
                return Reply::failure(
                    self.engine.model_name(),
                    RequestOutcome::TerminalFailure,
                    e.to_string(),
                );
            }
            BatcherConfig::bundled_pace()
        } else {
            BatcherConfig::default()
        };

        if self.config.routing.auto_mode && request.auto_mode {
            let signals = routing::route_signals(&request.message, !request.images.is_empty());
            debug!(?signals, "auto-mode signals");
        }

        let agent = Agent::new(
            Arc::clone(&self.engine),
            self.vision_engine.clone(),
            self.browser.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.config),
            Arc::clone(&self.flags),
            self.gate.clone(),
            batcher_config,
            self.session_tokens.load(Ordering::SeqCst),
        );
        let reply = agent.run(request, request_id, tx).await;
        self.session_tokens
            .fetch_add(reply.tokens_used as u64, Ordering::SeqCst);
        reply
    }

    async fn handle_media(&self, request: &InboundRequest, media: &dyn MediaPort) -> Reply {
        info!("routing request to the media provider");
        match media.generate_media(&request.message).await {
            Ok(reference) => Reply {
                success: true,
                text: format!("Generated media: {reference}"),
                model: self.engine.model_name().to_string(),
                tokens_used: 0,
                tool_results: Vec::new(),
                iterations: 0,
                outcome: RequestOutcome::Natural,
                error: None,
            },
            Err(e) => Reply::failure(
                self.engine.model_name(),
                RequestOutcome::TerminalFailure,
                format!("media generation failed: {e}"),
            ),
        }
    }

    /// Expose the quota sentinel for hosts that match on it.
    pub fn quota_sentinel() -> &'static str {
        QUOTA_SENTINEL
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_strictly_monotone() {
        let flags = ControlFlags::new();
        let a = flags.next_request_id();
        let b = flags.next_request_id();
        let c = flags.next_request_id();
        assert!(a < b && b < c);
        assert_eq!(flags.current_request_id(), c);
    }

    #[test]
    fn cancel_and_clear_round_trip() {
        let flags = ControlFlags::new();
        assert!(!flags.is_cancelled());
        flags.cancel();
        assert!(flags.is_cancelled());
        flags.clear_cancel();
        assert!(!flags.is_cancelled());
    }

    #[tokio::test]
    async fn pause_blocks_until_resume() {
        let flags = Arc::new(ControlFlags::new());
        flags.pause();

        let waiter = Arc::clone(&flags);
        let handle = tokio::spawn(async move {
            waiter.wait_while_paused().await;
            true
        });

        // Give the waiter a chance to block, then release it.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        flags.resume();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn cancel_wakes_paused_waiters() {
        let flags = Arc::new(ControlFlags::new());
        flags.pause();

        let waiter = Arc::clone(&flags);
        let handle = tokio::spawn(async move {
            waiter.wait_while_paused().await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        flags.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn quota_sentinel_matches_wire_constant() {
        assert_eq!(SessionController::quota_sentinel(), "__QUOTA_EXCEEDED__");
    }
}

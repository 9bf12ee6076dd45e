// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The `Toolset` capability and its single-flight `Start` wrapper.
//!
//! A toolset is a polymorphic source of [`Tool`]s: local in-process tools,
//! a remote tool-server client, an A2A remote-agent client, or any other
//! synthetic grouping. The driver only ever talks to the [`Toolset`] trait
//! object — it never knows which variant backs a given toolset.
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::elicitation::{ElicitationHandler, OAuthHandler};
use crate::tool::Tool;

#[derive(Debug, Error, Clone)]
pub enum ToolsetError {
    #[error("toolset '{name}' failed to start: {reason}")]
    StartFailed { name: String, reason: String },
    #[error("toolset '{name}' failed to enumerate tools: {reason}")]
    ListFailed { name: String, reason: String },
    #[error("toolset '{name}' failed to stop: {reason}")]
    StopFailed { name: String, reason: String },
    #[error("oauth authorization for '{toolset}' failed: {reason}")]
    AuthFailed { toolset: String, reason: String },
}

/// A named group of [`Tool`]s with a shared lifecycle.
///
/// Implementations are free to mint their tools lazily inside `start` (e.g.
/// after an auth handshake) or eagerly; either way, `tools` is only ever
/// called once `start` has succeeded (enforced by [`StartableToolset`]).
#[async_trait]
pub trait Toolset: Send + Sync {
    fn name(&self) -> &str;

    /// Optional text appended to the agent's system prompt describing how
    /// to use this toolset's tools.
    fn instructions(&self) -> Option<String> {
        None
    }

    /// Bring the toolset up (open connections, perform a handshake, spawn a
    /// subprocess, ...). Called at most once per successful start; a caller
    /// observing an error here is free to call `start` again later.
    async fn start(&self) -> Result<(), ToolsetError>;

    /// The tools this toolset currently provides. Only meaningful after a
    /// successful `start`.
    async fn tools(&self) -> Result<Vec<Arc<dyn Tool>>, ToolsetError>;

    /// Tear the toolset down. Idempotent: called at most once per
    /// successful start by [`StartableToolset::stop`], but implementations
    /// should not assume external callers respect that.
    async fn stop(&self) -> Result<(), ToolsetError> {
        Ok(())
    }

    /// Install the handler used to elicit structured input from the
    /// session's operator mid-invocation. Toolsets that never elicit may
    /// ignore this.
    fn set_elicitation_handler(&self, _handler: Arc<dyn ElicitationHandler>) {}

    /// Install the handler driving this toolset's OAuth grant flow, if it
    /// has one.
    fn set_oauth_success_handler(&self, _handler: Arc<dyn OAuthHandler>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartState {
    NotStarted,
    Started,
}

/// Wraps a [`Toolset`] so concurrent callers share one in-flight `Start`
/// attempt instead of racing independent ones.
///
/// The mutex is held for the full duration of the inner `start()` call, so a
/// second caller arriving while a start is in progress simply waits on the
/// lock rather than kicking off its own attempt; once it acquires the lock
/// it observes `Started` and returns immediately. A failed attempt leaves
/// the state at `NotStarted`, so the very next caller re-runs `start()` —
/// matching "a previous attempt failed, the flag remains cleared so the
/// next caller retries".
pub struct StartableToolset {
    inner: Arc<dyn Toolset>,
    state: Mutex<StartState>,
}

impl StartableToolset {
    pub fn new(inner: Arc<dyn Toolset>) -> Self {
        Self { inner, state: Mutex::new(StartState::NotStarted) }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn instructions(&self) -> Option<String> {
        self.inner.instructions()
    }

    /// Ensure the inner toolset has started, then return success. Safe to
    /// call concurrently and repeatedly.
    pub async fn ensure_started(&self) -> Result<(), ToolsetError> {
        let mut state = self.state.lock().await;
        if *state == StartState::Started {
            return Ok(());
        }
        self.inner.start().await?;
        *state = StartState::Started;
        Ok(())
    }

    /// `tools(ctx)`: ensures started, then enumerates. A list failure after
    /// a successful start does not un-start the toolset — the caller
    /// records it as a per-agent warning and treats this toolset as
    /// contributing no tools for the turn (see the driver's tool
    /// enumeration step).
    pub async fn tools(&self) -> Result<Vec<Arc<dyn Tool>>, ToolsetError> {
        self.ensure_started().await?;
        self.inner.tools().await
    }

    /// Idempotent stop: a toolset that never started, or was already
    /// stopped, returns `Ok(())` without calling the inner `stop` again.
    pub async fn stop(&self) -> Result<(), ToolsetError> {
        let mut state = self.state.lock().await;
        if *state != StartState::Started {
            return Ok(());
        }
        self.inner.stop().await?;
        *state = StartState::NotStarted;
        Ok(())
    }

    pub fn set_elicitation_handler(&self, handler: Arc<dyn ElicitationHandler>) {
        self.inner.set_elicitation_handler(handler);
    }

    pub fn set_oauth_success_handler(&self, handler: Arc<dyn OAuthHandler>) {
        self.inner.set_oauth_success_handler(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc as StdArc;

    struct CountingToolset {
        name: String,
        start_calls: StdArc<AtomicU32>,
        fail_first: StdArc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl Toolset for CountingToolset {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&self) -> Result<(), ToolsetError> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.swap(false, Ordering::SeqCst) {
                return Err(ToolsetError::StartFailed {
                    name: self.name.clone(),
                    reason: "injected failure".into(),
                });
            }
            Ok(())
        }

        async fn tools(&self) -> Result<Vec<Arc<dyn Tool>>, ToolsetError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn start_is_invoked_at_most_once_after_success() {
        let calls = StdArc::new(AtomicU32::new(0));
        let ts = StartableToolset::new(Arc::new(CountingToolset {
            name: "t".into(),
            start_calls: calls.clone(),
            fail_first: StdArc::new(std::sync::atomic::AtomicBool::new(false)),
        }));
        ts.ensure_started().await.unwrap();
        ts.ensure_started().await.unwrap();
        ts.ensure_started().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_start_is_retried_on_next_call() {
        let calls = StdArc::new(AtomicU32::new(0));
        let ts = StartableToolset::new(Arc::new(CountingToolset {
            name: "t".into(),
            start_calls: calls.clone(),
            fail_first: StdArc::new(std::sync::atomic::AtomicBool::new(true)),
        }));
        assert!(ts.ensure_started().await.is_err());
        assert!(ts.ensure_started().await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_starts_single_flight() {
        let calls = StdArc::new(AtomicU32::new(0));
        let ts = StdArc::new(StartableToolset::new(Arc::new(CountingToolset {
            name: "t".into(),
            start_calls: calls.clone(),
            fail_first: StdArc::new(std::sync::atomic::AtomicBool::new(false)),
        })));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ts = ts.clone();
            handles.push(tokio::spawn(async move { ts.ensure_started().await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent_when_never_started() {
        let calls = StdArc::new(AtomicU32::new(0));
        let ts = StartableToolset::new(Arc::new(CountingToolset {
            name: "t".into(),
            start_calls: calls,
            fail_first: StdArc::new(std::sync::atomic::AtomicBool::new(false)),
        }));
        ts.stop().await.unwrap();
        ts.stop().await.unwrap();
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Fallback chain wrapping an ordered list of [`ModelProvider`]s.
//!
//! A single agent's effective provider is a chain: primary₁, primary₂, …
//! (alloys, selected by random round-robin per turn among configured
//! primaries when there is more than one), then fallback₁, fallback₂, …
//! [`FallbackChain`] implements [`ModelProvider`] itself so the driver can
//! treat "one model" and "a chain with fallbacks" identically.
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tracing::warn;

use crate::catalog::InputModality;
use crate::provider::ResponseStream;
use crate::{CompletionRequest, ModelCatalogEntry, ModelProvider, ResponseEvent};

#[derive(Debug, Error)]
pub enum FallbackChainError {
    #[error("fallback chain is empty")]
    Empty,
    #[error("every target in the fallback chain failed; last error: {0}")]
    Exhausted(#[source] anyhow::Error),
}

/// Whether an error observed mid-stream should be retried against the same
/// target, or should advance the chain immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    Retryable,
    NonRetryable,
}

/// Classify an error surfaced either as `Err(_)` from `complete()` or as a
/// [`ResponseEvent::Error`] observed mid-stream.
///
/// Retryable: network / 5xx / timeout / 429. Non-retryable: other 4xx,
/// context-limit exceeded, authentication. Classification is heuristic
/// (string matching) since [`ModelProvider`] surfaces plain `anyhow::Error`;
/// real vendor drivers are expected to downcast to a richer error type and
/// override this via [`FallbackChain::with_classifier`].
fn classify_default(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    let non_retryable_markers = [
        "context_length_exceeded",
        "context window",
        "exceed_context_size",
        "unauthorized",
        "invalid_api_key",
        "authentication",
        "forbidden",
        "400 ",
        "401 ",
        "403 ",
        "404 ",
    ];
    if non_retryable_markers.iter().any(|m| lower.contains(m)) {
        return ErrorClass::NonRetryable;
    }
    let retryable_markers = ["timeout", "timed out", "connection", "429", "500 ", "502 ", "503 ", "504 ", "rate limit"];
    if retryable_markers.iter().any(|m| lower.contains(m)) {
        return ErrorClass::Retryable;
    }
    // Unknown shape: default to retryable so a transient hiccup isn't fatal.
    ErrorClass::Retryable
}

struct StickyState {
    /// Index into `targets` of the fallback currently considered sticky, if any.
    index: Option<usize>,
    until: Option<Instant>,
}

/// An ordered provider chain with automatic fallback and retry.
///
/// `targets[0..primary_count]` are primaries (round-robin candidates when
/// more than one); the rest are fallbacks tried in order.
pub struct FallbackChain {
    targets: Vec<Box<dyn ModelProvider>>,
    primary_count: usize,
    retries: u32,
    cooldown: Duration,
    base_backoff: Duration,
    sticky: Mutex<StickyState>,
    rr_counter: AtomicUsize,
    attempt_counter: AtomicU64,
}

impl FallbackChain {
    /// `primaries` must be non-empty; `fallbacks` may be empty.
    pub fn new(primaries: Vec<Box<dyn ModelProvider>>, fallbacks: Vec<Box<dyn ModelProvider>>) -> Self {
        let primary_count = primaries.len();
        let mut targets = primaries;
        targets.extend(fallbacks);
        Self {
            targets,
            primary_count,
            retries: 3,
            cooldown: Duration::from_secs(5 * 60),
            base_backoff: Duration::from_millis(250),
            sticky: Mutex::new(StickyState { index: None, until: None }),
            rr_counter: AtomicUsize::new(0),
            attempt_counter: AtomicU64::new(0),
        }
    }

    /// Override `fallback_retries` (default 3).
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Override `fallback_cooldown` (default 5 minutes).
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Order of targets to try this turn: sticky fallback first if one is
    /// active, else round-robin among primaries followed by fallbacks in
    /// declared order.
    fn attempt_order(&self) -> Vec<usize> {
        let mut sticky = self.sticky.lock().unwrap();
        if let (Some(idx), Some(until)) = (sticky.index, sticky.until) {
            if Instant::now() < until {
                let mut order: Vec<usize> = vec![idx];
                order.extend((0..self.targets.len()).filter(|&i| i != idx));
                return order;
            }
            // Cooldown expired: reset to primary chain.
            sticky.index = None;
            sticky.until = None;
        }
        drop(sticky);

        let mut order = Vec::with_capacity(self.targets.len());
        if self.primary_count > 1 {
            let start = self.rr_counter.fetch_add(1, Ordering::Relaxed) % self.primary_count;
            order.extend((0..self.primary_count).map(|i| (start + i) % self.primary_count));
        } else if self.primary_count == 1 {
            order.push(0);
        }
        order.extend(self.primary_count..self.targets.len());
        order
    }

    fn mark_sticky(&self, index: usize) {
        // Only fallbacks (index >= primary_count) become sticky; a primary
        // succeeding is the expected default path.
        if index < self.primary_count {
            return;
        }
        let mut sticky = self.sticky.lock().unwrap();
        sticky.index = Some(index);
        sticky.until = Some(Instant::now() + self.cooldown);
    }

    async fn complete_via(&self, index: usize, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        self.targets[index].complete(req).await
    }
}

#[async_trait]
impl ModelProvider for FallbackChain {
    fn name(&self) -> &str {
        self.targets.first().map(|t| t.name()).unwrap_or("fallback-chain")
    }

    fn model_name(&self) -> &str {
        self.targets.first().map(|t| t.model_name()).unwrap_or("unknown")
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        if self.targets.is_empty() {
            return Err(FallbackChainError::Empty.into());
        }
        let order = self.attempt_order();
        let mut last_err: Option<anyhow::Error> = None;

        for &index in &order {
            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                self.attempt_counter.fetch_add(1, Ordering::Relaxed);
                match self.complete_via(index, req.clone()).await {
                    Ok(stream) => {
                        // Peek the first event to catch providers that surface
                        // the failure as a ResponseEvent::Error rather than Err.
                        let mut stream = stream.peekable();
                        if let Some(Ok(ResponseEvent::Error(msg))) = Pin::new(&mut stream).peek().await {
                            let class = classify_default(msg);
                            let err = anyhow::anyhow!("{msg}");
                            if class == ErrorClass::Retryable && attempt <= self.retries {
                                warn!(target = self.targets[index].name(), attempt, "retryable stream error, retrying");
                                tokio::time::sleep(self.base_backoff * 2u32.saturating_pow(attempt - 1)).await;
                                last_err = Some(err);
                                continue;
                            }
                            last_err = Some(err);
                            break;
                        }
                        self.mark_sticky(index);
                        return Ok(Box::pin(stream));
                    }
                    Err(e) => {
                        let class = classify_default(&e.to_string());
                        if class == ErrorClass::Retryable && attempt <= self.retries {
                            warn!(target = self.targets[index].name(), attempt, error = %e, "retryable error, retrying");
                            tokio::time::sleep(self.base_backoff * 2u32.saturating_pow(attempt - 1)).await;
                            last_err = Some(e);
                            continue;
                        }
                        last_err = Some(e);
                        break;
                    }
                }
            }
        }

        Err(FallbackChainError::Exhausted(last_err.unwrap_or_else(|| anyhow::anyhow!("no targets attempted"))).into())
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelCatalogEntry>> {
        match self.targets.first() {
            Some(t) => t.list_models().await,
            None => Ok(Vec::new()),
        }
    }

    fn input_modalities(&self) -> Vec<InputModality> {
        self.targets.first().map(|t| t.input_modalities()).unwrap_or_else(|| vec![InputModality::Text])
    }
}

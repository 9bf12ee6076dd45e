// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Elicitation: a mid-turn round-trip where a toolset asks the driving
//! session a structured question (or requests an interactive OAuth grant)
//! and execution pauses until the human answers.
//!
//! This is distinct from tool-call *approval* (see [`crate::policy`]): an
//! elicitation is initiated by the tool implementation itself, mid-execution,
//! rather than by the dispatcher deciding whether to run the call at all.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::toolset::ToolsetError;

/// A structured question raised by a tool while it is executing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElicitationRequest {
    /// Correlates the request with the eventual [`ElicitationResponse`]; also
    /// the id surfaced on [`flow_core::AgentEvent::ElicitationRequest`].
    pub id: String,
    pub prompt: String,
    /// Multiple-choice options; empty means free-form text is expected.
    #[serde(default)]
    pub options: Vec<String>,
}

/// The human's answer to an [`ElicitationRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ElicitationResponse {
    /// One of `options`, or free-form text when the request had none.
    Accept(String),
    /// The human explicitly declined to answer; the tool should proceed
    /// with a safe default or report that it could not complete.
    Decline,
    /// The surrounding turn was cancelled before an answer arrived.
    Cancel,
}

/// Driver-side handle a toolset uses to elicit input from the operator.
///
/// Implementations route the request to whatever surface is presenting the
/// session (TUI, HTTP long-poll, CLI prompt); the session manager is
/// responsible for pairing a pending elicitation with its eventual
/// `ResumeElicitation` call (see the session manager component).
#[async_trait]
pub trait ElicitationHandler: Send + Sync {
    async fn elicit(&self, request: ElicitationRequest) -> ElicitationResponse;
}

/// Handles the interactive OAuth grant flow a toolset's `Start` may require
/// (e.g. a toolset that wraps a third-party API needing a browser-based
/// consent screen before it can mint tools).
///
/// Kept separate from [`ElicitationHandler`] because an OAuth grant is a
/// one-shot authorization for the toolset as a whole, not a per-call
/// question; the driver surfaces it via `AgentEvent::Authorization`.
#[async_trait]
pub trait OAuthHandler: Send + Sync {
    /// Drive the authorization flow for `toolset_name` to completion (or
    /// return an error if the user denies/aborts it).
    async fn authorize(&self, toolset_name: &str) -> Result<(), ToolsetError>;
}

/// An [`ElicitationHandler`] that always declines; used where a toolset
/// advertises elicitation support but the embedding host has no interactive
/// surface attached (headless automation runs).
pub struct NoopElicitationHandler;

#[async_trait]
impl ElicitationHandler for NoopElicitationHandler {
    async fn elicit(&self, _request: ElicitationRequest) -> ElicitationResponse {
        ElicitationResponse::Decline
    }
}

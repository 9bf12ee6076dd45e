// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The driver's event taxonomy.
//!
//! Every event a running turn can emit is a variant of [`AgentEvent`].
//! Streaming/tool-dispatch events (`AgentChoice`, `ToolCall`, …) are realized
//! concretely below with the field shapes the driver actually produces;
//! team/toolset-lifecycle events (`AgentInfo`, `ToolsetInfo`, …) are emitted
//! once per run by the session manager and team-aware driver.

use flow_config::AgentMode;
use flow_tools::{events::TodoItem, ToolCall};

/// Which compaction strategy (if any) a [`AgentEvent::SessionCompaction`]
/// event resulted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategyUsed {
    /// Rolling LLM summarization using the structured (section-headed) format.
    Structured,
    /// Rolling LLM summarization using the narrative (prose) format.
    Narrative,
    /// Old messages dropped without a model call (compaction prompt itself
    /// would have overflowed the budget, or the summarization call failed).
    Emergency,
}

/// Events emitted by the driver while running a single turn or a whole
/// session.  Consumers (a session manager's subscribers, tests) receive these
/// over a bounded channel; see `flow_core::manager::SessionManager`.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A user message was pushed onto the session transcript.
    UserMessage(String),
    /// The model stream for this turn has started.
    StreamStarted,
    /// The model stream for this turn has ended (normally or aborted); the
    /// finalized assistant message (if any) has already been pushed to the
    /// transcript by the time this is sent.
    StreamStopped,
    /// A text chunk streamed from the model (realizes spec `AgentChoice`).
    TextDelta(String),
    /// A complete text response from the model, after streaming finishes.
    TextComplete(String),
    /// A reasoning/thinking chunk from the model (realizes spec
    /// `AgentChoiceReasoning`).
    ThinkingDelta(String),
    /// A complete thinking/reasoning block, accumulated from `ThinkingDelta`.
    ThinkingComplete(String),
    /// A streaming fragment of a not-yet-complete tool call (realizes spec
    /// `PartialToolCall`).
    PartialToolCall {
        index: u32,
        id: String,
        name: String,
        arguments_fragment: String,
    },
    /// The model has requested a complete tool call (realizes spec `ToolCall`).
    ToolCallStarted(ToolCall),
    /// A tool call requires explicit user approval before it can run
    /// (realizes spec `ToolCallConfirmation`).
    ToolCallConfirmation { call_id: String, tool_name: String },
    /// A tool call finished (realizes spec `ToolCallResponse`).
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// Context was compacted; statistics for the UI (realizes spec
    /// `SessionCompaction`).
    ContextCompacted {
        tokens_before: usize,
        tokens_after: usize,
        strategy: CompactionStrategyUsed,
        turn: u32,
    },
    /// Current token usage update for this turn.
    TokenUsage {
        input: u32,
        output: u32,
        cache_read: u32,
        cache_write: u32,
        cache_read_total: u64,
        cache_write_total: u64,
        max_tokens: usize,
    },
    /// The agent has finished processing the current user turn.
    TurnComplete,
    /// The current turn was cancelled; any text streamed before cancellation
    /// is returned so the caller can decide whether to keep it.
    Aborted { partial_text: String },
    /// A recoverable error occurred (realizes spec `Error`).
    Error(String),
    /// A non-fatal warning attached to the session (realizes spec `Warning`),
    /// e.g. a toolset that failed to start.
    Warning(String),
    /// A generated/updated title for the session (realizes spec `SessionTitle`).
    SessionTitle(String),
    /// A generated summary of the session so far (realizes spec `SessionSummary`).
    SessionSummary(String),
    /// A toolset requested structured input from the user (realizes spec
    /// `ElicitationRequest`); the session is paused until a response is
    /// injected via the session manager.
    ElicitationRequest { id: String, prompt: String },
    /// An OAuth flow for a toolset completed successfully (realizes spec
    /// `Authorization`).
    Authorization { toolset: String },
    /// The per-run tool-call budget was exhausted; the driver halted after
    /// giving the model one final tool-free turn to summarise progress.
    MaxIterationsReached { max_iterations: u32 },
    /// An agent in the team became active for this run.
    AgentInfo { name: String, description: String },
    /// The team this session is running under.
    TeamInfo { name: String, root_agent: String },
    /// Control handed off from one agent to another within the team.
    AgentSwitching { from: String, to: String },
    /// A toolset finished starting (or failed to) and is now available (or
    /// permanently absent) for this run.
    ToolsetInfo {
        name: String,
        started: bool,
        instructions: Option<String>,
    },
    /// The todo list was updated.
    TodoUpdate(Vec<TodoItem>),
    /// The agent mode was changed.
    ModeChanged(AgentMode),
}

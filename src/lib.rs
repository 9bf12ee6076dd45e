// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Concurrent runtime core for a multi-agent orchestration system.
//!
//! This crate wires together the building blocks exposed by its
//! collaborator crates — `flow-core` (session/transcript state and the
//! agent turn loop), `flow-tools` (tool dispatch and approval), `flow-model`
//! (provider fallback and routing), `flow-team` (agent/team topology) — into
//! the two pieces that only make sense once all of them are known at once:
//!
//! - [`driver::TeamDriver`] resolves a named team member into a fully-built
//!   [`flow_core::Agent`], synthesizing the `transfer_task` and `handoff`
//!   tools from the team's declared edges.
//! - [`manager::SessionManager`] multiplexes many concurrent sessions behind
//!   one actor, fanning out events to bounded per-subscriber channels and
//!   pairing tool-approval/elicitation decisions back to the run that raised
//!   them.
//!
//! Parsing a team's configuration into [`flow_team::Team`] and
//! [`flow_config::Config`] records is outside this crate's scope; callers
//! hand in already-built records.

pub mod driver;
pub mod handoff;
pub mod manager;
pub mod transfer_task;

pub use driver::{TeamDriver, MAX_DELEGATION_DEPTH};
pub use handoff::HandoffTool;
pub use manager::{
    SessionId, SessionInfo, SessionManager, SessionManagerHandle, SessionRunState,
    SUBSCRIBER_CHANNEL_DEPTH,
};
pub use transfer_task::TransferTaskTool;

// Re-exported so embedding binaries can build the collaborator types this
// crate's public functions accept/return without adding direct path
// dependencies on every crate in the workspace.
pub use flow_core::{Agent, AgentEvent, AgentRuntimeContext, ToolDecision};
pub use flow_team::Team;

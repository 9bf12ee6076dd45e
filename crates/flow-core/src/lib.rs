// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod compact;
mod events;
mod prompts;
mod runtime_context;
mod session;

pub use agent::{Agent, HandoffResolver, HandoffTarget, ToolDecision, ToolsetStatus};
pub use compact::{
    compact_session, compact_session_with_strategy, emergency_compact, smart_truncate,
};
pub use events::{AgentEvent, CompactionStrategyUsed};
pub use prompts::{system_prompt, SubAgentSummary};
pub use runtime_context::AgentRuntimeContext;
pub use session::{PendingApproval, PendingElicitation, Session, SessionSnapshot};

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `handoff`: transfer full control of the session to a peer agent.
//!
//! Unlike `transfer_task`, a handoff does not spawn a nested agent and fold
//! a result back — it reconfigures the *same* running agent in place (model,
//! tools, instruction) so the next turn is driven entirely by the peer. The
//! actual reconfiguration happens in `flow_core::Agent` via the
//! `HandoffResolver` wired in at construction; this tool only validates that
//! the requested target is one of the agent's declared peers.

use async_trait::async_trait;
use serde_json::{json, Value};

use flow_config::AgentMode;
use flow_tools::{ApprovalPolicy, Tool, ToolCall, ToolOutput};

pub struct HandoffTool {
    /// Names of peer agents this agent may transfer control to, in
    /// declaration order.
    targets: Vec<String>,
}

impl HandoffTool {
    pub fn new(targets: Vec<String>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl Tool for HandoffTool {
    fn name(&self) -> &str {
        "handoff"
    }

    fn description(&self) -> &str {
        "Transfer full control of this conversation to a peer agent better suited to \
         continue it. The peer sees the full transcript so far and takes over entirely \
         — you will not be consulted again this session unless the peer hands back."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "target": {
                    "type": "string",
                    "enum": self.targets,
                    "description": "Name of the peer agent to transfer control to"
                },
                "reason": {
                    "type": "string",
                    "description": "Brief reason for the handoff, for the transcript"
                }
            },
            "required": ["target"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let target = match call.args.get("target").and_then(|v| v.as_str()) {
            Some(t) => t,
            None => return ToolOutput::err(&call.id, "missing 'target'"),
        };
        if !self.targets.iter().any(|t| t == target) {
            return ToolOutput::err(
                &call.id,
                format!("'{target}' is not a declared handoff peer of this agent"),
            );
        }
        ToolOutput::ok(&call.id, format!("control transferred to '{target}'"))
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `transfer_task`: delegate a focused sub-task to one of this agent's
//! declared sub-agents and fold its final text back into the parent turn.
//!
//! Depth-limited nested-agent spawn: each delegation resolves the
//! sub-agent's full runtime bundle (model, tools, instruction) from the
//! team record rather than a hardcoded tool list.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use flow_config::AgentMode;
use flow_core::AgentEvent;
use flow_tools::{ApprovalPolicy, Tool, ToolCall, ToolOutput};

use crate::driver::{TeamDriver, MAX_DELEGATION_DEPTH};

pub struct TransferTaskTool {
    driver: Arc<TeamDriver>,
    depth: Arc<AtomicUsize>,
    /// Names of sub-agents this tool may delegate to, in declaration order.
    targets: Vec<String>,
}

impl TransferTaskTool {
    pub fn new(driver: Arc<TeamDriver>, depth: Arc<AtomicUsize>, targets: Vec<String>) -> Self {
        Self { driver, depth, targets }
    }
}

#[async_trait]
impl Tool for TransferTaskTool {
    fn name(&self) -> &str {
        "transfer_task"
    }

    fn description(&self) -> &str {
        "Delegate a focused sub-task to one of your sub-agents and receive its final \
         text response. Use this to hand off work that belongs to a specialist's \
         domain rather than attempting it yourself."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent": {
                    "type": "string",
                    "enum": self.targets,
                    "description": "Name of the sub-agent to delegate to"
                },
                "task": {
                    "type": "string",
                    "description": "The focused task description for the sub-agent"
                }
            },
            "required": ["agent", "task"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let agent_name = match call.args.get("agent").and_then(|v| v.as_str()) {
            Some(a) => a.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'agent'"),
        };
        let task = match call.args.get("task").and_then(|v| v.as_str()) {
            Some(t) => t.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'task'"),
        };
        if !self.targets.iter().any(|t| t == &agent_name) {
            return ToolOutput::err(
                &call.id,
                format!("'{agent_name}' is not one of this agent's sub-agents"),
            );
        }

        let depth = self.depth.load(Ordering::Relaxed);
        if depth >= MAX_DELEGATION_DEPTH {
            return ToolOutput::err(
                &call.id,
                format!("maximum delegation depth ({MAX_DELEGATION_DEPTH}) reached"),
            );
        }

        let mut sub_agent = match self.driver.build_agent(&agent_name).await {
            Ok(a) => a,
            Err(e) => return ToolOutput::err(&call.id, format!("failed to build sub-agent: {e}")),
        };

        self.depth.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
        let submit_result = sub_agent.submit(&task, tx).await;
        self.depth.fetch_sub(1, Ordering::Relaxed);

        let mut output = String::new();
        while let Ok(event) = rx.try_recv() {
            if let AgentEvent::TextDelta(delta) = event {
                output.push_str(&delta);
            }
        }

        match submit_result {
            Ok(()) if output.is_empty() => {
                ToolOutput::ok(&call.id, "(sub-agent produced no text output)")
            }
            Ok(()) => ToolOutput::ok(&call.id, output),
            Err(e) => ToolOutput::err(&call.id, format!("sub-agent error: {e}")),
        }
    }
}

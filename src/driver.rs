// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Wires a [`flow_team::Team`] record to the turn-loop driver: resolves a
//! named member into a fully-built [`Agent`], synthesizing the
//! `transfer_task` and `handoff` tools from the team's edges so the model
//! itself drives delegation and control transfer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use flow_config::{AgentConfig, AgentMode};
use flow_core::{
    Agent, AgentRuntimeContext, HandoffResolver, HandoffTarget, SubAgentSummary, ToolsetStatus,
};
use flow_team::{Agent as TeamAgent, Team};
use flow_tools::{events::ToolEvent, ToolRegistry};

use crate::handoff::HandoffTool;
use crate::transfer_task::TransferTaskTool;

/// Maximum nesting depth for `transfer_task` sub-agent spawns within one
/// session. Prevents a misbehaving instruction from recursing forever.
pub const MAX_DELEGATION_DEPTH: usize = 3;

/// Builds fully-wired [`Agent`] instances for named members of a team.
///
/// One driver is shared by every agent instance spawned for a session
/// (including `transfer_task` sub-agents and `handoff` targets), so the
/// delegation depth counter in `depth` is session-wide rather than
/// per-agent.
pub struct TeamDriver {
    team: Arc<Team>,
    base_config: Arc<AgentConfig>,
    runtime: AgentRuntimeContext,
    depth: Arc<AtomicUsize>,
}

impl TeamDriver {
    pub fn new(team: Arc<Team>, base_config: Arc<AgentConfig>, runtime: AgentRuntimeContext) -> Arc<Self> {
        Arc::new(Self {
            team,
            base_config,
            runtime,
            depth: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn team(&self) -> &Team {
        &self.team
    }

    /// Build the team's root agent, ready to drive a fresh session.
    pub async fn build_root_agent(self: &Arc<Self>) -> anyhow::Result<Agent> {
        let root = self.team.root_agent();
        self.build_agent_for(&root).await
    }

    /// Build the [`Agent`] for `name`, or an error if the team has no such
    /// member.
    pub async fn build_agent(self: &Arc<Self>, name: &str) -> anyhow::Result<Agent> {
        let record = self
            .team
            .agent(name)
            .ok_or_else(|| anyhow::anyhow!("team has no agent named '{name}'"))?;
        self.build_agent_for(&record).await
    }

    async fn build_agent_for(self: &Arc<Self>, record: &Arc<TeamAgent>) -> anyhow::Result<Agent> {
        let mut registry = ToolRegistry::new();
        let mut toolset_statuses: Vec<ToolsetStatus> = Vec::with_capacity(record.toolsets.len());
        for toolset in &record.toolsets {
            match toolset.tools().await {
                Ok(tools) => {
                    for tool in tools {
                        registry.register_arc(tool);
                    }
                    toolset_statuses.push(ToolsetStatus {
                        name: toolset.name().to_string(),
                        started: true,
                        instructions: toolset.instructions(),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        agent = %record.name,
                        toolset = toolset.name(),
                        error = %e,
                        "toolset failed to start; its tools are unavailable this run"
                    );
                    toolset_statuses.push(ToolsetStatus {
                        name: toolset.name().to_string(),
                        started: false,
                        instructions: None,
                    });
                }
            }
        }
        let toolset_statuses: Arc<[ToolsetStatus]> = toolset_statuses.into();
        for tool in &record.additional_tools {
            registry.register_arc(tool.clone());
        }

        if !record.sub_agents.is_empty() {
            registry.register(TransferTaskTool::new(
                self.clone(),
                self.depth.clone(),
                record.sub_agents.clone(),
            ));
        }
        if !record.handoffs.is_empty() {
            registry.register(HandoffTool::new(record.handoffs.clone()));
        }

        let sub_agents: Arc<[SubAgentSummary]> = self.sub_agent_summaries(&record.sub_agents);
        let toolset_instructions: Arc<[String]> = record
            .toolsets
            .iter()
            .filter_map(|t| t.instructions())
            .collect::<Vec<_>>()
            .into();

        let mut config = (*self.base_config).clone();
        if record.max_iterations > 0 {
            config.max_tool_rounds = record.max_iterations;
        }
        config.system_prompt = Some(record.instruction.clone());
        config.history_window = record.history_window;
        let config = Arc::new(config);

        let mode_lock = Arc::new(Mutex::new(AgentMode::Agent));
        let (_todo_tx, tool_event_rx) = mpsc::channel::<ToolEvent>(64);
        let max_context_tokens = record
            .models
            .catalog_context_window()
            .map(|w| w as usize)
            .unwrap_or(128_000);

        let team = Some((self.team.id.clone(), self.team.root_agent().name.clone()));

        let mut agent = Agent::new(
            record.models.clone(),
            Arc::new(registry),
            config,
            self.runtime.clone(),
            mode_lock,
            tool_event_rx,
            max_context_tokens,
        )
        .with_team_context(
            record.name.clone(),
            record.description.clone(),
            sub_agents,
            toolset_instructions,
            toolset_statuses,
            team,
        );

        if !record.handoffs.is_empty() {
            let resolver: Arc<dyn HandoffResolver> = TeamHandoffResolver::new(self.clone());
            agent = agent.with_handoff(resolver);
        }

        Ok(agent)
    }

    fn sub_agent_summaries(&self, names: &[String]) -> Arc<[SubAgentSummary]> {
        names
            .iter()
            .filter_map(|n| self.team.agent(n))
            .map(|a| SubAgentSummary {
                name: a.name.clone(),
                description: a.description.clone(),
            })
            .collect::<Vec<_>>()
            .into()
    }
}

/// Resolves a `handoff` target name to the peer agent's runtime bundle by
/// rebuilding it through the same [`TeamDriver`] used for the rest of the
/// session.
struct TeamHandoffResolver {
    driver: Arc<TeamDriver>,
}

impl TeamHandoffResolver {
    fn new(driver: Arc<TeamDriver>) -> Arc<Self> {
        Arc::new(Self { driver })
    }
}

#[async_trait]
impl HandoffResolver for TeamHandoffResolver {
    async fn resolve(&self, target: &str) -> Option<HandoffTarget> {
        let record = self.driver.team.agent(target)?;
        let built = self.driver.build_agent_for(&record).await.ok()?;
        let mut toolset_statuses = Vec::with_capacity(record.toolsets.len());
        for toolset in &record.toolsets {
            toolset_statuses.push(ToolsetStatus {
                name: toolset.name().to_string(),
                started: toolset.tools().await.is_ok(),
                instructions: toolset.instructions(),
            });
        }
        let mut config = (*self.driver.base_config).clone();
        if record.max_iterations > 0 {
            config.max_tool_rounds = record.max_iterations;
        }
        config.system_prompt = Some(record.instruction.clone());
        config.history_window = record.history_window;
        Some(HandoffTarget {
            description: record.description.clone(),
            model: record.models.clone(),
            tools: built.tools().clone(),
            config: Arc::new(config),
            sub_agents: self.driver.sub_agent_summaries(&record.sub_agents),
            toolset_instructions: record
                .toolsets
                .iter()
                .filter_map(|t| t.instructions())
                .collect::<Vec<_>>()
                .into(),
            toolset_statuses: toolset_statuses.into(),
        })
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent and team records.
//!
//! An [`Agent`] is an immutable bundle of everything a turn-loop driver
//! needs to run one participant: its instruction text, its resolved model
//! chain, its toolsets, and its edges to other agents (sub-agents it can
//! delegate to, handoff peers it can transfer control to). A [`Team`] is the
//! arena holding every agent reachable from one root, with edges validated
//! to form a DAG at construction time rather than trusted at call time.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

use flow_model::FallbackChain;
use flow_tools::{StartableToolset, Tool};

/// Hook commands run around tool dispatch, keyed by the point they fire at.
/// The core only carries the shape; invoking a hook's shell command is a
/// host-side concern.
#[derive(Debug, Clone, Default)]
pub struct AgentHooks {
    pub pre_tool_use: Vec<String>,
    pub post_tool_use: Vec<String>,
}

/// Everything needed to construct an [`Agent`] except its resolved
/// parent edges, which [`Team::new`] computes from every spec's
/// `sub_agents` list.
pub struct AgentSpec {
    pub name: String,
    pub description: String,
    pub welcome: Option<String>,
    pub instruction: String,
    pub models: Arc<FallbackChain>,
    /// Toolsets in declared order; the driver enumerates tools in this
    /// order when building the schema list sent to the model.
    pub toolsets: Vec<Arc<StartableToolset>>,
    /// Tools bolted on directly (not behind a toolset), e.g. `transfer_task`
    /// synthesized once sub-agents are known.
    pub additional_tools: Vec<Arc<dyn Tool>>,
    /// Down edges: names of agents this one may delegate sub-tasks to.
    pub sub_agents: Vec<String>,
    /// Peer edges: names of agents this one may transfer full control to.
    pub handoffs: Vec<String>,
    pub add_date: bool,
    pub add_environment_info: bool,
    pub max_iterations: u32,
    /// Most-recent-N window of the transcript actually sent to the model;
    /// 0 means "no cap beyond the context-budget compaction threshold".
    pub history_window: usize,
    pub commands: HashMap<String, String>,
    pub hooks: AgentHooks,
}

/// Immutable agent record. Lives for the lifetime of its [`Team`].
pub struct Agent {
    pub name: String,
    pub description: String,
    pub welcome: Option<String>,
    pub instruction: String,
    pub models: Arc<FallbackChain>,
    pub toolsets: Vec<Arc<StartableToolset>>,
    pub additional_tools: Vec<Arc<dyn Tool>>,
    pub sub_agents: Vec<String>,
    /// Up edges, populated by [`Team::new`] from every other spec's
    /// `sub_agents` list — never set directly on the spec.
    pub parents: Vec<String>,
    pub handoffs: Vec<String>,
    pub add_date: bool,
    pub add_environment_info: bool,
    pub max_iterations: u32,
    pub history_window: usize,
    pub commands: HashMap<String, String>,
    pub hooks: AgentHooks,
}

#[derive(Debug, Error)]
pub enum TeamError {
    #[error("duplicate agent name '{0}'")]
    DuplicateName(String),
    #[error("no agent named '{0}' to use as team root")]
    UnknownRoot(String),
    #[error("agent '{agent}' lists unknown sub-agent '{target}'")]
    UnknownSubAgent { agent: String, target: String },
    #[error("agent '{agent}' lists unknown handoff target '{target}'")]
    UnknownHandoff { agent: String, target: String },
    #[error("cycle detected in sub-agent graph: {0}")]
    Cycle(String),
    #[error("agent '{0}' is unreachable from the team root")]
    Unreachable(String),
    #[error("stopping toolsets failed for {0} agent(s); first error: {1}")]
    StopToolSets(usize, String),
}

/// An id and a name→[`Agent`] map plus an explicit root agent.
///
/// Parent/sub-agent edges are validated to form a DAG rooted at `root` at
/// construction time; there is no way to obtain a `Team` whose graph
/// contains a cycle or an agent unreachable from its root.
pub struct Team {
    pub id: String,
    agents: HashMap<String, Arc<Agent>>,
    root: String,
}

impl Team {
    pub fn new(
        id: impl Into<String>,
        root: impl Into<String>,
        specs: Vec<AgentSpec>,
    ) -> Result<Self, TeamError> {
        let root = root.into();
        let mut by_name: HashMap<String, AgentSpec> = HashMap::new();
        for spec in specs {
            let name = spec.name.clone();
            if by_name.insert(name.clone(), spec).is_some() {
                return Err(TeamError::DuplicateName(name));
            }
        }
        if !by_name.contains_key(&root) {
            return Err(TeamError::UnknownRoot(root));
        }
        for spec in by_name.values() {
            for target in &spec.sub_agents {
                if !by_name.contains_key(target) {
                    return Err(TeamError::UnknownSubAgent {
                        agent: spec.name.clone(),
                        target: target.clone(),
                    });
                }
            }
            for target in &spec.handoffs {
                if !by_name.contains_key(target) {
                    return Err(TeamError::UnknownHandoff {
                        agent: spec.name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }

        detect_cycle(&by_name, &root)?;
        check_reachable(&by_name, &root)?;

        let mut parents: HashMap<String, Vec<String>> =
            by_name.keys().map(|n| (n.clone(), Vec::new())).collect();
        for spec in by_name.values() {
            for target in &spec.sub_agents {
                let list = parents.get_mut(target).expect("validated above");
                if !list.contains(&spec.name) {
                    list.push(spec.name.clone());
                }
            }
        }

        let agents = by_name
            .into_iter()
            .map(|(name, spec)| {
                let parents = parents.remove(&name).unwrap_or_default();
                (
                    name,
                    Arc::new(Agent {
                        name: spec.name,
                        description: spec.description,
                        welcome: spec.welcome,
                        instruction: spec.instruction,
                        models: spec.models,
                        toolsets: spec.toolsets,
                        additional_tools: spec.additional_tools,
                        sub_agents: spec.sub_agents,
                        parents,
                        handoffs: spec.handoffs,
                        add_date: spec.add_date,
                        add_environment_info: spec.add_environment_info,
                        max_iterations: spec.max_iterations,
                        history_window: spec.history_window,
                        commands: spec.commands,
                        hooks: spec.hooks,
                    }),
                )
            })
            .collect();

        Ok(Self { id: id.into(), agents, root })
    }

    pub fn root_agent(&self) -> Arc<Agent> {
        self.agents[&self.root].clone()
    }

    pub fn agent(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn agent_names(&self) -> Vec<&str> {
        self.agents.keys().map(|s| s.as_str()).collect()
    }

    /// Stop every agent's toolsets. Idempotent — each
    /// [`StartableToolset::stop`] is itself idempotent, so calling this
    /// more than once (e.g. once on cancellation and again on normal
    /// shutdown) is safe. Every toolset is given a chance to stop even if
    /// an earlier one errored; failures are joined into one summary error.
    pub async fn stop_tool_sets(&self) -> Result<(), TeamError> {
        let mut handles = Vec::new();
        for agent in self.agents.values() {
            for toolset in &agent.toolsets {
                let toolset = toolset.clone();
                handles.push(tokio::spawn(async move { toolset.stop().await }));
            }
        }
        let mut failures = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(e.to_string()),
                Err(join_err) => failures.push(join_err.to_string()),
            }
        }
        if let Some(first) = failures.first() {
            return Err(TeamError::StopToolSets(failures.len(), first.clone()));
        }
        Ok(())
    }
}

fn detect_cycle(by_name: &HashMap<String, AgentSpec>, root: &str) -> Result<(), TeamError> {
    fn visit<'a>(
        by_name: &'a HashMap<String, AgentSpec>,
        node: &'a str,
        stack: &mut Vec<&'a str>,
        visiting: &mut HashSet<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<(), TeamError> {
        if done.contains(node) {
            return Ok(());
        }
        if visiting.contains(node) {
            stack.push(node);
            return Err(TeamError::Cycle(stack.join(" -> ")));
        }
        visiting.insert(node);
        stack.push(node);
        if let Some(spec) = by_name.get(node) {
            for child in &spec.sub_agents {
                visit(by_name, child, stack, visiting, done)?;
            }
        }
        stack.pop();
        visiting.remove(node);
        done.insert(node);
        Ok(())
    }

    let mut stack = Vec::new();
    let mut visiting = HashSet::new();
    let mut done = HashSet::new();
    visit(by_name, root, &mut stack, &mut visiting, &mut done)?;
    // Agents unreferenced from the root are still checked for internal
    // cycles so a disconnected cyclic cluster can't slip through.
    for name in by_name.keys() {
        visit(by_name, name, &mut stack, &mut visiting, &mut done)?;
    }
    Ok(())
}

/// A member is reachable if the root can get to it either by delegating
/// (`sub_agents`) or by transferring full control (`handoffs`) — both are
/// edges a running session can actually traverse, so both count towards
/// "this agent is part of the team", even though only `sub_agents` forms
/// the acyclic DAG checked by [`detect_cycle`].
fn check_reachable(by_name: &HashMap<String, AgentSpec>, root: &str) -> Result<(), TeamError> {
    let mut reached = HashSet::new();
    let mut stack = vec![root.to_string()];
    while let Some(name) = stack.pop() {
        if !reached.insert(name.clone()) {
            continue;
        }
        if let Some(spec) = by_name.get(&name) {
            for child in spec.sub_agents.iter().chain(spec.handoffs.iter()) {
                stack.push(child.clone());
            }
        }
    }
    for name in by_name.keys() {
        if !reached.contains(name) {
            return Err(TeamError::Unreachable(name.clone()));
        }
    }
    Ok(())
}

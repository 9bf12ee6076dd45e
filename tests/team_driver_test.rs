// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end coverage of [`flow::TeamDriver`]: tool synthesis, delegation
//! via `transfer_task`, and peer control transfer via `handoff`.
use std::collections::HashMap;
use std::sync::Arc;

use flow::TeamDriver;
use flow_config::AgentConfig;
use flow_core::{AgentEvent, AgentRuntimeContext};
use flow_model::{FallbackChain, ScriptedMockProvider};
use flow_team::{AgentHooks, AgentSpec, Team};
use tokio::sync::mpsc;

fn chain(provider: ScriptedMockProvider) -> Arc<FallbackChain> {
    Arc::new(FallbackChain::new(vec![Box::new(provider)], vec![]))
}

fn spec(name: &str, provider: ScriptedMockProvider) -> AgentSpec {
    AgentSpec {
        name: name.into(),
        description: format!("{name} description"),
        welcome: None,
        instruction: format!("you are {name}"),
        models: chain(provider),
        toolsets: Vec::new(),
        additional_tools: Vec::new(),
        sub_agents: Vec::new(),
        handoffs: Vec::new(),
        add_date: false,
        add_environment_info: false,
        max_iterations: 50,
        history_window: 0,
        commands: HashMap::new(),
        hooks: AgentHooks::default(),
    }
}

async fn collect(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn root_with_sub_agents_gets_transfer_task_tool() {
    let mut root = spec("root", ScriptedMockProvider::always_text("never called"));
    root.sub_agents = vec!["helper".into()];
    let helper = spec("helper", ScriptedMockProvider::always_text("helper reply"));

    let team = Team::new("t1", "root", vec![root, helper]).unwrap();
    let driver = TeamDriver::new(Arc::new(team), Arc::new(AgentConfig::default()), AgentRuntimeContext::default());
    let agent = driver.build_root_agent().await.unwrap();

    assert!(agent.tools().get("transfer_task").is_some());
    assert!(agent.tools().get("handoff").is_none());
}

#[tokio::test]
async fn root_with_handoffs_gets_handoff_tool_only() {
    let mut root = spec("root", ScriptedMockProvider::always_text("never called"));
    root.handoffs = vec!["peer".into()];
    let peer = spec("peer", ScriptedMockProvider::always_text("peer reply"));

    let team = Team::new("t1", "root", vec![root, peer]).unwrap();
    let driver = TeamDriver::new(Arc::new(team), Arc::new(AgentConfig::default()), AgentRuntimeContext::default());
    let agent = driver.build_root_agent().await.unwrap();

    assert!(agent.tools().get("handoff").is_some());
    assert!(agent.tools().get("transfer_task").is_none());
}

#[tokio::test]
async fn transfer_task_delegates_and_folds_sub_agent_text_back() {
    let mut root = spec(
        "root",
        ScriptedMockProvider::tool_then_text(
            "tc1",
            "transfer_task",
            r#"{"agent":"helper","task":"investigate"}"#,
            "delegation complete",
        ),
    );
    root.sub_agents = vec!["helper".into()];
    let helper = spec("helper", ScriptedMockProvider::always_text("helper did the work"));

    let team = Team::new("t1", "root", vec![root, helper]).unwrap();
    let driver = TeamDriver::new(Arc::new(team), Arc::new(AgentConfig::default()), AgentRuntimeContext::default());
    let mut agent = driver.build_root_agent().await.unwrap();
    // Bypass the tool's Ask policy so one submit() drives the whole round-trip.
    agent.session_mut().auto_approve = true;

    let (tx, rx) = mpsc::channel(256);
    agent.submit("please delegate", tx).await.unwrap();
    let events = collect(rx).await;

    let finished = events.iter().find_map(|e| match e {
        AgentEvent::ToolCallFinished { tool_name, output, is_error, .. } if tool_name == "transfer_task" => {
            Some((output.clone(), *is_error))
        }
        _ => None,
    });
    let (output, is_error) = finished.expect("expected a transfer_task ToolCallFinished event");
    assert!(!is_error);
    assert!(output.contains("helper did the work"));

    assert!(events.iter().any(|e| matches!(e, AgentEvent::TurnComplete)));
}

#[tokio::test]
async fn transfer_task_rejects_unknown_sub_agent() {
    let mut root = spec(
        "root",
        ScriptedMockProvider::tool_then_text(
            "tc1",
            "transfer_task",
            r#"{"agent":"nonexistent","task":"investigate"}"#,
            "handled the rejection",
        ),
    );
    root.sub_agents = vec!["helper".into()];
    let helper = spec("helper", ScriptedMockProvider::always_text("unused"));

    let team = Team::new("t1", "root", vec![root, helper]).unwrap();
    let driver = TeamDriver::new(Arc::new(team), Arc::new(AgentConfig::default()), AgentRuntimeContext::default());
    let mut agent = driver.build_root_agent().await.unwrap();
    agent.session_mut().auto_approve = true;

    let (tx, rx) = mpsc::channel(256);
    agent.submit("please delegate", tx).await.unwrap();
    let events = collect(rx).await;

    let finished = events.iter().find_map(|e| match e {
        AgentEvent::ToolCallFinished { tool_name, is_error, .. } if tool_name == "transfer_task" => {
            Some(*is_error)
        }
        _ => None,
    });
    assert_eq!(finished, Some(true), "expected an error result for an undeclared sub-agent");
}

#[tokio::test]
async fn handoff_switches_model_and_system_prompt_mid_session() {
    let mut root = spec(
        "root",
        ScriptedMockProvider::tool_then_text(
            "tc1",
            "handoff",
            r#"{"target":"peer","reason":"specialist needed"}"#,
            "root should never say this",
        ),
    );
    root.handoffs = vec!["peer".into()];
    let peer = spec("peer", ScriptedMockProvider::always_text("peer speaking now"));

    let team = Team::new("t1", "root", vec![root, peer]).unwrap();
    let driver = TeamDriver::new(Arc::new(team), Arc::new(AgentConfig::default()), AgentRuntimeContext::default());
    let mut agent = driver.build_root_agent().await.unwrap();
    agent.session_mut().auto_approve = true;

    let (tx, rx) = mpsc::channel(256);
    agent.submit("please transfer to the specialist", tx).await.unwrap();
    let events = collect(rx).await;

    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::AgentSwitching { from, to } if from == "root" && to == "peer"
    )));

    let final_text = events.iter().rev().find_map(|e| match e {
        AgentEvent::TextComplete(t) => Some(t.clone()),
        _ => None,
    });
    assert_eq!(final_text.as_deref(), Some("peer speaking now"));
    assert_eq!(agent.current_agent_name(), "peer");
}

#[tokio::test]
async fn handoff_to_undeclared_peer_is_rejected_before_any_switch() {
    let mut root = spec(
        "root",
        ScriptedMockProvider::tool_then_text(
            "tc1",
            "handoff",
            r#"{"target":"ghost"}"#,
            "root continues",
        ),
    );
    root.handoffs = vec!["peer".into()];
    let peer = spec("peer", ScriptedMockProvider::always_text("unused"));

    let team = Team::new("t1", "root", vec![root, peer]).unwrap();
    let driver = TeamDriver::new(Arc::new(team), Arc::new(AgentConfig::default()), AgentRuntimeContext::default());
    let mut agent = driver.build_root_agent().await.unwrap();
    agent.session_mut().auto_approve = true;

    let (tx, rx) = mpsc::channel(256);
    agent.submit("please transfer", tx).await.unwrap();
    let events = collect(rx).await;

    assert!(!events.iter().any(|e| matches!(e, AgentEvent::AgentSwitching { .. })));
    assert_eq!(agent.current_agent_name(), "root");
    let finished = events.iter().find_map(|e| match e {
        AgentEvent::ToolCallFinished { tool_name, is_error, .. } if tool_name == "handoff" => Some(*is_error),
        _ => None,
    });
    assert_eq!(finished, Some(true));
}

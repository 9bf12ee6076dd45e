// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end coverage of [`flow::SessionManager`]: reserve/attach/run,
//! tool-approval resume, the max-iterations halt, and slow-subscriber drop.
use std::sync::Arc;

use flow::{AgentEvent, SessionManager, SessionRunState};
use flow_config::{AgentConfig, AgentMode};
use flow_core::{Agent, AgentRuntimeContext, ToolDecision};
use flow_model::{MockProvider, ResponseEvent, ScriptedMockProvider};
use flow_tools::{events::ToolEvent, ApprovalPolicy, Tool, ToolCall, ToolOutput, ToolRegistry};
use tokio::sync::{mpsc, Mutex};

/// Not read-only, `Ask` policy: the thing session_manager tests need paused
/// for explicit operator approval.
struct AskPolicyTool;

#[async_trait::async_trait]
impl Tool for AskPolicyTool {
    fn name(&self) -> &str {
        "dangerous_thing"
    }
    fn description(&self) -> &str {
        "a destructive tool that always requires approval"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }
    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }
    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        ToolOutput::ok(&call.id, "did the dangerous thing")
    }
}

fn agent_with(model: impl flow_model::ModelProvider + 'static, tools: ToolRegistry, config: AgentConfig) -> Agent {
    let mode_lock = Arc::new(Mutex::new(AgentMode::Agent));
    let (_tx, tool_event_rx) = mpsc::channel::<ToolEvent>(64);
    Agent::new(
        Arc::new(model),
        Arc::new(tools),
        Arc::new(config),
        AgentRuntimeContext::default(),
        mode_lock,
        tool_event_rx,
        128_000,
    )
}

async fn spawn_manager() -> flow::SessionManagerHandle {
    let (manager, handle) = SessionManager::new();
    tokio::spawn(manager.run());
    handle
}

/// Polls `get_session` until the run leaves `Running`, or panics after a
/// generous timeout — the background run task is expected to be fast since
/// every model call here is a mock.
async fn wait_until_settled(handle: &flow::SessionManagerHandle, id: flow::SessionId) -> SessionRunState {
    for _ in 0..200 {
        let info = handle.get_session(id).await.unwrap().unwrap();
        if info.state != SessionRunState::Running {
            return info.state;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("session {id} never left Running state");
}

#[tokio::test]
async fn single_turn_echo_via_subscribe() {
    let handle = spawn_manager().await;
    let agent = agent_with(MockProvider, ToolRegistry::default(), AgentConfig::default());
    let id = handle.create_session(agent, AgentMode::Agent).await.unwrap();

    let (tx, mut rx) = mpsc::channel(SUBSCRIBER_DEPTH);
    assert!(handle.subscribe(id, tx).await.unwrap());

    handle.run_session(id, "hello there").await.unwrap();

    let mut saw_user_message = false;
    let mut saw_turn_complete = false;
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::UserMessage(text) => {
                assert_eq!(text, "hello there");
                saw_user_message = true;
            }
            AgentEvent::TurnComplete => {
                saw_turn_complete = true;
                break;
            }
            _ => {}
        }
    }
    assert!(saw_user_message, "expected UserMessage to be broadcast to the subscriber");
    assert!(saw_turn_complete, "expected TurnComplete to be broadcast to the subscriber");

    assert_eq!(wait_until_settled(&handle, id).await, SessionRunState::Completed);
}

#[tokio::test]
async fn rejecting_a_paused_tool_call_records_error_without_running_it() {
    let handle = spawn_manager().await;
    let scripts = vec![
        vec![
            ResponseEvent::ToolCall {
                index: 0,
                id: "call-1".into(),
                name: "dangerous_thing".into(),
                arguments: "{}".into(),
            },
            ResponseEvent::Done,
        ],
        vec![ResponseEvent::TextDelta("acknowledged the rejection".into()), ResponseEvent::Done],
    ];
    let mut tools = ToolRegistry::new();
    tools.register(AskPolicyTool);
    let agent = agent_with(ScriptedMockProvider::new(scripts), tools, AgentConfig::default());
    let id = handle.create_session(agent, AgentMode::Agent).await.unwrap();

    let (tx, mut rx) = mpsc::channel(SUBSCRIBER_DEPTH);
    assert!(handle.subscribe(id, tx).await.unwrap());

    handle.run_session(id, "please do the dangerous thing").await.unwrap();

    let mut saw_confirmation = false;
    while let Some(event) = rx.recv().await {
        if matches!(event, AgentEvent::ToolCallConfirmation { ref tool_name, .. } if tool_name == "dangerous_thing") {
            saw_confirmation = true;
            break;
        }
    }
    assert!(saw_confirmation, "expected a ToolCallConfirmation pause for the Ask-policy tool");

    handle
        .resume_session(id, ToolDecision::Reject { reason: Some("not today".into()) })
        .await
        .unwrap();

    let mut saw_error_result = false;
    let mut saw_turn_complete = false;
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::ToolCallFinished { tool_name, is_error, output, .. } if tool_name == "dangerous_thing" => {
                assert!(is_error);
                assert!(output.contains("not today"));
                saw_error_result = true;
            }
            AgentEvent::TurnComplete => {
                saw_turn_complete = true;
                break;
            }
            _ => {}
        }
    }
    assert!(saw_error_result, "rejected tool call should record an error result, not run the tool");
    assert!(saw_turn_complete);
}

#[tokio::test]
async fn max_iterations_halt_emits_event_and_skips_the_tool() {
    let handle = spawn_manager().await;
    // Every round the model immediately asks to call the tool; with
    // max_tool_rounds = 0 the very first round already exceeds the budget,
    // so the tool must never actually run.
    let scripts: Vec<Vec<ResponseEvent>> = (0..=2)
        .map(|_| {
            vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: "call-1".into(),
                    name: "dangerous_thing".into(),
                    arguments: "{}".into(),
                },
                ResponseEvent::Done,
            ]
        })
        .collect();
    let mut tools = ToolRegistry::new();
    tools.register(AskPolicyTool);
    let config = AgentConfig { max_tool_rounds: 0, ..AgentConfig::default() };
    let agent = agent_with(ScriptedMockProvider::new(scripts), tools, config);
    let id = handle.create_session(agent, AgentMode::Agent).await.unwrap();

    let (tx, mut rx) = mpsc::channel(SUBSCRIBER_DEPTH);
    assert!(handle.subscribe(id, tx).await.unwrap());

    handle.run_session(id, "keep calling the tool").await.unwrap();

    let mut saw_max_iterations = false;
    let mut saw_tool_confirmation = false;
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::MaxIterationsReached { max_iterations } => {
                assert_eq!(max_iterations, 0);
                saw_max_iterations = true;
            }
            AgentEvent::ToolCallConfirmation { .. } | AgentEvent::ToolCallFinished { .. } => {
                saw_tool_confirmation = true;
            }
            AgentEvent::TurnComplete => break,
            _ => {}
        }
    }
    assert!(saw_max_iterations, "expected MaxIterationsReached when the round budget is exhausted on turn 1");
    assert!(!saw_tool_confirmation, "the tool call must never be dispatched once the budget is already exceeded");
}

#[tokio::test]
async fn slow_subscriber_is_dropped_without_affecting_others() {
    let handle = spawn_manager().await;
    let agent = agent_with(MockProvider, ToolRegistry::default(), AgentConfig::default());
    let id = handle.create_session(agent, AgentMode::Agent).await.unwrap();

    // A healthy subscriber with ample capacity.
    let (fast_tx, mut fast_rx) = mpsc::channel(SUBSCRIBER_DEPTH);
    assert!(handle.subscribe(id, fast_tx).await.unwrap());

    // A subscriber with a single slot that never drains — it should be
    // dropped (with a warning) the moment the manager tries to deliver a
    // second event to it, instead of stalling delivery to `fast_rx`.
    let (slow_tx, _slow_rx) = mpsc::channel(1);
    assert!(handle.subscribe(id, slow_tx).await.unwrap());

    handle.run_session(id, "hello there").await.unwrap();

    let mut saw_turn_complete = false;
    while let Some(event) = fast_rx.recv().await {
        if matches!(event, AgentEvent::TurnComplete) {
            saw_turn_complete = true;
            break;
        }
    }
    assert!(saw_turn_complete, "the fast subscriber must still receive the full event stream");
}

const SUBSCRIBER_DEPTH: usize = 256;

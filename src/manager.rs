// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `SessionManager` — the hub that multiplexes many concurrent agent
//! sessions behind a single actor.
//!
//! One command channel feeds a sequential actor loop (an `Agent` is not
//! re-entrant, so commands for the same session must never race each other),
//! and events stream out to subscribers. Rather than a single
//! unbounded-semantics `broadcast::channel` shared by every subscriber, each
//! session here keeps its own list of bounded per-subscriber senders: a
//! subscriber that falls behind is dropped with a warning rather than
//! slowing down — or, on a broadcast channel's lagged-receiver semantics,
//! silently losing events for — every other subscriber.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use flow_config::AgentMode;
use flow_core::{Agent, AgentEvent, SessionSnapshot, ToolDecision};
use flow_tools::elicitation::{ElicitationHandler, ElicitationRequest, ElicitationResponse, OAuthHandler};
use flow_tools::ToolsetError;

pub type SessionId = Uuid;

/// Recommended channel capacity for [`SessionManagerHandle::subscribe`]
/// callers. A subscriber more than this many events behind the session is
/// dropped rather than allowed to stall event delivery to everyone else.
pub const SUBSCRIBER_CHANNEL_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRunState {
    Idle,
    Running,
    WaitingApproval,
    WaitingElicitation,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub title: Option<String>,
    pub mode: AgentMode,
    pub state: SessionRunState,
}

/// Commands accepted by [`SessionManager::run`]'s actor loop.
enum Command {
    ReserveSession {
        mode: AgentMode,
        reply: oneshot::Sender<(SessionId, Arc<dyn ElicitationHandler>, Arc<dyn OAuthHandler>)>,
    },
    AttachAgent {
        id: SessionId,
        agent: Box<Agent>,
        reply: oneshot::Sender<bool>,
    },
    GetSession {
        id: SessionId,
        reply: oneshot::Sender<Option<SessionInfo>>,
    },
    ListSessions {
        reply: oneshot::Sender<Vec<SessionInfo>>,
    },
    DeleteSession {
        id: SessionId,
        reply: oneshot::Sender<bool>,
    },
    RunSession {
        id: SessionId,
        text: String,
    },
    ResumeSession {
        id: SessionId,
        decision: ToolDecision,
    },
    ResumeElicitation {
        id: SessionId,
        request_id: String,
        response: ElicitationResponse,
    },
    ToggleToolApproval {
        id: SessionId,
        tool_name: String,
        approved: bool,
    },
    UpdateSessionTitle {
        id: SessionId,
        title: String,
    },
    Subscribe {
        id: SessionId,
        subscriber: mpsc::Sender<AgentEvent>,
        reply: oneshot::Sender<bool>,
    },
    SnapshotSession {
        id: SessionId,
        reply: oneshot::Sender<Option<SessionSnapshot>>,
    },
}

/// Cheap-to-clone handle to a running [`SessionManager`]. Every transport
/// layer (HTTP long-poll, a local TUI, a test harness) holds one of these.
#[derive(Clone)]
pub struct SessionManagerHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl SessionManagerHandle {
    /// Reserve a session slot and get back the elicitation and OAuth
    /// handlers toolsets must be started with (`Toolset::set_elicitation_handler`,
    /// `Toolset::set_oauth_success_handler`) *before* the `Agent` built from
    /// them is handed to [`Self::attach_agent`].
    ///
    /// Two-phase construction exists because a toolset-raised elicitation or
    /// OAuth grant has to be routed to this session's subscribers, but a
    /// session's subscriber list can only exist once the session itself
    /// does — and the agent (which owns the toolsets) isn't built yet at
    /// that point.
    pub async fn reserve_session(
        &self,
        mode: AgentMode,
    ) -> anyhow::Result<(SessionId, Arc<dyn ElicitationHandler>, Arc<dyn OAuthHandler>)> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ReserveSession { mode, reply }).await?;
        rx.await.map_err(|_| anyhow::anyhow!("session manager dropped the reply"))
    }

    /// Attach a fully-built agent (its toolsets already started with the
    /// handler from [`Self::reserve_session`]) to a reserved session,
    /// making it ready for [`Self::run_session`]. Returns `false` if `id`
    /// was never reserved or already has an agent attached.
    pub async fn attach_agent(&self, id: SessionId, agent: Agent) -> anyhow::Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AttachAgent { id, agent: Box::new(agent), reply }).await?;
        rx.await.map_err(|_| anyhow::anyhow!("session manager dropped the reply"))
    }

    /// Convenience for callers with no elicitation-raising toolsets:
    /// reserve a session and attach `agent` to it in one step.
    pub async fn create_session(&self, agent: Agent, mode: AgentMode) -> anyhow::Result<SessionId> {
        let (id, _handler, _oauth_handler) = self.reserve_session(mode).await?;
        self.attach_agent(id, agent).await?;
        Ok(id)
    }

    pub async fn get_session(&self, id: SessionId) -> anyhow::Result<Option<SessionInfo>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetSession { id, reply }).await?;
        rx.await.map_err(|_| anyhow::anyhow!("session manager dropped the reply"))
    }

    pub async fn list_sessions(&self) -> anyhow::Result<Vec<SessionInfo>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ListSessions { reply }).await?;
        rx.await.map_err(|_| anyhow::anyhow!("session manager dropped the reply"))
    }

    pub async fn delete_session(&self, id: SessionId) -> anyhow::Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::DeleteSession { id, reply }).await?;
        rx.await.map_err(|_| anyhow::anyhow!("session manager dropped the reply"))
    }

    pub async fn run_session(&self, id: SessionId, text: impl Into<String>) -> anyhow::Result<()> {
        self.send(Command::RunSession { id, text: text.into() }).await
    }

    pub async fn resume_session(&self, id: SessionId, decision: ToolDecision) -> anyhow::Result<()> {
        self.send(Command::ResumeSession { id, decision }).await
    }

    pub async fn resume_elicitation(
        &self,
        id: SessionId,
        request_id: impl Into<String>,
        response: ElicitationResponse,
    ) -> anyhow::Result<()> {
        self.send(Command::ResumeElicitation { id, request_id: request_id.into(), response }).await
    }

    pub async fn toggle_tool_approval(
        &self,
        id: SessionId,
        tool_name: impl Into<String>,
        approved: bool,
    ) -> anyhow::Result<()> {
        self.send(Command::ToggleToolApproval { id, tool_name: tool_name.into(), approved }).await
    }

    pub async fn update_session_title(&self, id: SessionId, title: impl Into<String>) -> anyhow::Result<()> {
        self.send(Command::UpdateSessionTitle { id, title: title.into() }).await
    }

    pub async fn snapshot_session(&self, id: SessionId) -> anyhow::Result<Option<SessionSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SnapshotSession { id, reply }).await?;
        rx.await.map_err(|_| anyhow::anyhow!("session manager dropped the reply"))
    }

    /// Subscribe to this session's event stream. Returns `false` (and drops
    /// the sender half immediately) if `id` is unknown. Callers should size
    /// `subscriber` with capacity [`SUBSCRIBER_CHANNEL_DEPTH`] or similar —
    /// a slower channel is dropped sooner if it falls behind.
    pub async fn subscribe(&self, id: SessionId, subscriber: mpsc::Sender<AgentEvent>) -> anyhow::Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe { id, subscriber, reply }).await?;
        rx.await.map_err(|_| anyhow::anyhow!("session manager dropped the reply"))
    }

    async fn send(&self, cmd: Command) -> anyhow::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("session manager has shut down"))
    }
}

struct ManagedSession {
    title: Option<String>,
    mode: AgentMode,
    state: SessionRunState,
    /// `None` between `ReserveSession` and `AttachAgent`; every other
    /// command that needs the agent treats an unset agent as "not found".
    agent: Option<Arc<Mutex<Agent>>>,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<AgentEvent>>>>,
    cancel_tx: Option<oneshot::Sender<()>>,
    pending_elicitations: Arc<Mutex<HashMap<String, oneshot::Sender<ElicitationResponse>>>>,
}

impl ManagedSession {
    fn info(&self, id: SessionId) -> SessionInfo {
        SessionInfo { id, title: self.title.clone(), mode: self.mode, state: self.state }
    }
}

/// Routes an agent's elicitation requests out to session subscribers and
/// correlates the eventual `ResumeElicitation` call back to the right
/// in-flight tool invocation.
struct ManagerElicitationHandler {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<AgentEvent>>>>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<ElicitationResponse>>>>,
}

#[async_trait]
impl ElicitationHandler for ManagerElicitationHandler {
    async fn elicit(&self, request: ElicitationRequest) -> ElicitationResponse {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request.id.clone(), tx);
        broadcast(
            &self.subscribers,
            AgentEvent::ElicitationRequest { id: request.id.clone(), prompt: request.prompt.clone() },
        )
        .await;
        rx.await.unwrap_or(ElicitationResponse::Cancel)
    }
}

/// Default `OAuthHandler`: the actual browser/redirect-listener flow is
/// host-specific and out of scope for the manager, so this handler assumes
/// the grant already succeeded by the time a toolset calls it and only
/// reports the outcome to subscribers as `AgentEvent::Authorization`.
struct ManagerOAuthHandler {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<AgentEvent>>>>,
}

#[async_trait]
impl OAuthHandler for ManagerOAuthHandler {
    async fn authorize(&self, toolset_name: &str) -> Result<(), ToolsetError> {
        broadcast(
            &self.subscribers,
            AgentEvent::Authorization { toolset: toolset_name.to_string() },
        )
        .await;
        Ok(())
    }
}

/// Deliver `event` to every live subscriber, dropping (with a warning) any
/// whose channel is full rather than letting a slow consumer stall the rest.
async fn broadcast(subscribers: &Arc<Mutex<Vec<mpsc::Sender<AgentEvent>>>>, event: AgentEvent) {
    let mut subs = subscribers.lock().await;
    subs.retain(|tx| match tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("dropping slow session subscriber: channel full");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

/// The manager actor. Owns every session and processes commands
/// sequentially so that two commands for the same session can never race.
pub struct SessionManager {
    cmd_rx: mpsc::Receiver<Command>,
    sessions: HashMap<SessionId, ManagedSession>,
    completion_rx: mpsc::Receiver<SessionId>,
    completion_tx: mpsc::Sender<SessionId>,
}

impl SessionManager {
    pub fn new() -> (Self, SessionManagerHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (completion_tx, completion_rx) = mpsc::channel(64);
        let manager = Self { cmd_rx, sessions: HashMap::new(), completion_rx, completion_tx };
        (manager, SessionManagerHandle { cmd_tx })
    }

    pub async fn run(mut self) {
        info!("session manager started");
        loop {
            tokio::select! {
                msg = self.cmd_rx.recv() => {
                    let Some(cmd) = msg else { break };
                    self.handle_command(cmd).await;
                }
                Some(id) = self.completion_rx.recv() => {
                    if let Some(session) = self.sessions.get_mut(&id) {
                        session.state = SessionRunState::Completed;
                        session.cancel_tx = None;
                    }
                }
            }
        }
        info!("session manager stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::ReserveSession { mode, reply } => {
                let id = Uuid::new_v4();
                let subscribers = Arc::new(Mutex::new(Vec::new()));
                let pending_elicitations = Arc::new(Mutex::new(HashMap::new()));
                let handler: Arc<dyn ElicitationHandler> = Arc::new(ManagerElicitationHandler {
                    subscribers: subscribers.clone(),
                    pending: pending_elicitations.clone(),
                });
                let oauth_handler: Arc<dyn OAuthHandler> =
                    Arc::new(ManagerOAuthHandler { subscribers: subscribers.clone() });
                self.sessions.insert(id, ManagedSession {
                    title: None,
                    mode,
                    state: SessionRunState::Idle,
                    agent: None,
                    subscribers,
                    cancel_tx: None,
                    pending_elicitations,
                });
                info!(%id, ?mode, "session reserved");
                let _ = reply.send((id, handler, oauth_handler));
            }
            Command::AttachAgent { id, agent, reply } => {
                match self.sessions.get_mut(&id) {
                    Some(session) if session.agent.is_none() => {
                        session.agent = Some(Arc::new(Mutex::new(*agent)));
                        info!(%id, "agent attached");
                        let _ = reply.send(true);
                    }
                    Some(_) => {
                        warn!(%id, "attach_agent: session already has an agent");
                        let _ = reply.send(false);
                    }
                    None => {
                        warn!(%id, "attach_agent: session not found");
                        let _ = reply.send(false);
                    }
                }
            }
            Command::GetSession { id, reply } => {
                let _ = reply.send(self.sessions.get(&id).map(|s| s.info(id)));
            }
            Command::ListSessions { reply } => {
                let list = self.sessions.iter().map(|(id, s)| s.info(*id)).collect();
                let _ = reply.send(list);
            }
            Command::DeleteSession { id, reply } => {
                if let Some(session) = self.sessions.remove(&id) {
                    if let Some(tx) = session.cancel_tx {
                        let _ = tx.send(());
                    }
                }
                let _ = reply.send(self.sessions.contains_key(&id).then_some(()).is_none());
            }
            Command::RunSession { id, text } => self.handle_run_session(id, text).await,
            Command::ResumeSession { id, decision } => self.handle_resume_session(id, decision).await,
            Command::ResumeElicitation { id, request_id, response } => {
                self.handle_resume_elicitation(id, request_id, response).await;
            }
            Command::ToggleToolApproval { id, tool_name, approved } => {
                match self.sessions.get(&id).and_then(|s| s.agent.clone()) {
                    Some(agent) => {
                        let mut agent = agent.lock().await;
                        if approved {
                            agent.session_mut().approve_tool_for_session(tool_name);
                        } else {
                            agent.session_mut().approved_tools.remove(&tool_name);
                        }
                    }
                    None => warn!(%id, "toggle_tool_approval: session not found or has no agent yet"),
                }
            }
            Command::UpdateSessionTitle { id, title } => {
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.title = Some(title);
                } else {
                    warn!(%id, "update_session_title: session not found");
                }
            }
            Command::SnapshotSession { id, reply } => {
                match self.sessions.get(&id).and_then(|s| s.agent.clone()) {
                    Some(agent) => {
                        let agent = agent.lock().await;
                        let _ = reply.send(Some(agent.session().snapshot()));
                    }
                    None => {
                        let _ = reply.send(None);
                    }
                }
            }
            Command::Subscribe { id, subscriber, reply } => {
                if let Some(session) = self.sessions.get(&id) {
                    session.subscribers.lock().await.push(subscriber);
                    let _ = reply.send(true);
                } else {
                    let _ = reply.send(false);
                }
            }
        }
    }

    async fn handle_run_session(&mut self, id: SessionId, text: String) {
        let Some(session) = self.sessions.get_mut(&id) else {
            warn!(%id, "run_session: session not found");
            return;
        };
        if session.state == SessionRunState::Running {
            warn!(%id, "run_session: session is already running");
            return;
        }
        let Some(agent) = session.agent.clone() else {
            warn!(%id, "run_session: no agent attached yet");
            return;
        };
        session.state = SessionRunState::Running;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        session.cancel_tx = Some(cancel_tx);

        let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(512);
        let subscribers = session.subscribers.clone();
        let completion_tx = self.completion_tx.clone();

        tokio::spawn(async move {
            let mut agent = agent.lock().await;
            let run = agent.submit_with_cancel(&text, event_tx, cancel_rx);
            let drain = bridge_events(event_rx, subscribers);
            let (result, ()) = tokio::join!(run, drain);
            if let Err(e) = result {
                warn!(%id, error = %e, "agent run failed");
            }
            drop(agent);
            let _ = completion_tx.send(id).await;
        });
    }

    async fn handle_resume_session(&mut self, id: SessionId, decision: ToolDecision) {
        let Some(session) = self.sessions.get_mut(&id) else {
            warn!(%id, "resume_session: session not found");
            return;
        };
        let Some(agent) = session.agent.clone() else {
            warn!(%id, "resume_session: no agent attached yet");
            return;
        };
        session.state = SessionRunState::Running;

        let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(512);
        let subscribers = session.subscribers.clone();
        let completion_tx = self.completion_tx.clone();

        tokio::spawn(async move {
            let mut agent = agent.lock().await;
            let run = agent.resume_tool_decision(decision, event_tx);
            let drain = bridge_events(event_rx, subscribers);
            let (result, ()) = tokio::join!(run, drain);
            if let Err(e) = result {
                warn!(%id, error = %e, "agent resume failed");
            }
            drop(agent);
            let _ = completion_tx.send(id).await;
        });
    }

    async fn handle_resume_elicitation(
        &mut self,
        id: SessionId,
        request_id: String,
        response: ElicitationResponse,
    ) {
        let Some(session) = self.sessions.get(&id) else {
            warn!(%id, "resume_elicitation: session not found");
            return;
        };
        if let Some(tx) = session.pending_elicitations.lock().await.remove(&request_id) {
            let _ = tx.send(response);
        } else {
            warn!(%id, %request_id, "resume_elicitation: no pending elicitation found");
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new().0
    }
}

/// Drain an agent run's event channel into every live subscriber.
async fn bridge_events(
    mut event_rx: mpsc::Receiver<AgentEvent>,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<AgentEvent>>>>,
) {
    while let Some(event) = event_rx.recv().await {
        broadcast(&subscribers, event).await;
    }
}

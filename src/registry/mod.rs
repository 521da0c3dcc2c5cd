//! Session Registry (C5): in-process catalog of live executions, keyed by
//! both the server-assigned id and the agent-assigned id once captured.
//!
//! Two maps live under one registry mutex so rebinding an agent id is
//! atomic with respect to concurrent `get`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("agent id already bound: {0}")]
    AgentIdTaken(String),

    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Active,
    Completed,
    Aborted,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted | SessionState::Failed)
    }

    pub fn label(self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Active => "active",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
            SessionState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Claude,
    Cursor,
    Codex,
}

impl AgentKind {
    pub fn label(self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Cursor => "cursor",
            AgentKind::Codex => "codex",
        }
    }
}

#[derive(Clone)]
pub struct Session {
    pub server_id: String,
    pub agent_id: Option<String>,
    pub user_id: String,
    pub container_id: String,
    pub agent: AgentKind,
    pub project_path: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_message_at: DateTime<Utc>,
    pub cancel_token: CancellationToken,
    /// In-container directory staged attachments were copied into, if any.
    /// Set once C4 stages images; consulted so the directory is `rm -rf`'d
    /// on every terminal path instead of accumulating in the container's
    /// small tmpfs across the session's reused container.
    pub attachment_dir: Option<String>,
}

struct Inner {
    by_server_id: HashMap<String, Session>,
    agent_id_to_server_id: HashMap<String, String>,
}

/// Completed sessions linger for `completion_grace` before C8 sweeps them,
/// so a status query arriving just after completion still answers.
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    completion_grace: chrono::Duration,
}

impl SessionRegistry {
    pub fn new(completion_grace: std::time::Duration) -> Self {
        Self {
            inner: Mutex::new(Inner { by_server_id: HashMap::new(), agent_id_to_server_id: HashMap::new() }),
            completion_grace: chrono::Duration::from_std(completion_grace).unwrap_or(chrono::Duration::minutes(30)),
        }
    }

    pub fn register(&self, session: Session) {
        let mut inner = self.inner.lock();
        debug!("registered session {}", session.server_id);
        inner.by_server_id.insert(session.server_id.clone(), session);
    }

    /// Atomically installs the secondary key. The server id stays valid
    /// forever (until GC); pending messages keyed by it still route.
    pub fn bind_agent_id(&self, server_id: &str, agent_id: &str) -> RegistryResult<()> {
        let mut inner = self.inner.lock();

        if inner.agent_id_to_server_id.contains_key(agent_id) {
            return Err(RegistryError::AgentIdTaken(agent_id.to_string()));
        }

        let session = inner
            .by_server_id
            .get_mut(server_id)
            .ok_or_else(|| RegistryError::NotFound(server_id.to_string()))?;
        session.agent_id = Some(agent_id.to_string());

        inner.agent_id_to_server_id.insert(agent_id.to_string(), server_id.to_string());
        Ok(())
    }

    /// Looks a session up by either its server id or its agent id.
    pub fn get(&self, any_id: &str) -> Option<Session> {
        let inner = self.inner.lock();
        if let Some(session) = inner.by_server_id.get(any_id) {
            return Some(session.clone());
        }
        let server_id = inner.agent_id_to_server_id.get(any_id)?;
        inner.by_server_id.get(server_id).cloned()
    }

    pub fn list_for_user(&self, user_id: &str) -> Vec<Session> {
        self.inner
            .lock()
            .by_server_id
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Whether `user_id` has any non-terminal session — consulted by C6 to
    /// decide when `projects_changed` is safe to publish.
    pub fn has_in_flight(&self, user_id: &str) -> bool {
        self.inner
            .lock()
            .by_server_id
            .values()
            .any(|s| s.user_id == user_id && !s.state.is_terminal())
    }

    /// Resolves the session's cancellation token. Idempotent: aborting an
    /// already-terminal or already-cancelled session is a no-op.
    pub fn abort(&self, any_id: &str) -> RegistryResult<()> {
        let session = self.get(any_id).ok_or_else(|| RegistryError::NotFound(any_id.to_string()))?;
        session.cancel_token.cancel();
        Ok(())
    }

    pub fn mark_terminal(&self, any_id: &str, state: SessionState) -> RegistryResult<()> {
        if !state.is_terminal() {
            return Err(RegistryError::InvalidTransition { from: SessionState::Active, to: state });
        }

        let mut inner = self.inner.lock();
        let server_id = resolve_server_id(&inner, any_id).ok_or_else(|| RegistryError::NotFound(any_id.to_string()))?;
        let session = inner
            .by_server_id
            .get_mut(&server_id)
            .ok_or_else(|| RegistryError::NotFound(any_id.to_string()))?;

        if session.state.is_terminal() {
            // Terminal states are final; repeated calls are no-ops.
            return Ok(());
        }

        session.state = state;
        session.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Records the in-container directory staged attachments were copied
    /// into, so it can be cleaned up once the session reaches a terminal
    /// state.
    pub fn set_attachment_dir(&self, server_id: &str, dir: String) {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.by_server_id.get_mut(server_id) {
            session.attachment_dir = Some(dir);
        }
    }

    pub fn touch(&self, any_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(server_id) = resolve_server_id(&inner, any_id) {
            if let Some(session) = inner.by_server_id.get_mut(&server_id) {
                session.last_message_at = Utc::now();
            }
        }
    }

    /// Transitions a pending session into active — the one legal
    /// out-of-pending move besides going straight to a terminal state.
    pub fn activate(&self, server_id: &str) -> RegistryResult<()> {
        let mut inner = self.inner.lock();
        let session = inner
            .by_server_id
            .get_mut(server_id)
            .ok_or_else(|| RegistryError::NotFound(server_id.to_string()))?;

        if session.state != SessionState::Pending {
            return Err(RegistryError::InvalidTransition { from: session.state, to: SessionState::Active });
        }
        session.state = SessionState::Active;
        Ok(())
    }

    /// Removes sessions that reached a terminal state before `older_than`.
    pub fn sweep_terminal(&self, older_than: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock();
        let stale: Vec<String> = inner
            .by_server_id
            .values()
            .filter(|s| s.state.is_terminal() && s.completed_at.map(|t| t < older_than).unwrap_or(false))
            .map(|s| s.server_id.clone())
            .collect();

        for server_id in &stale {
            if let Some(session) = inner.by_server_id.remove(server_id) {
                if let Some(agent_id) = session.agent_id {
                    inner.agent_id_to_server_id.remove(&agent_id);
                }
            }
        }

        stale.len()
    }

    pub fn completion_grace(&self) -> chrono::Duration {
        self.completion_grace
    }
}

fn resolve_server_id(inner: &Inner, any_id: &str) -> Option<String> {
    if inner.by_server_id.contains_key(any_id) {
        return Some(any_id.to_string());
    }
    inner.agent_id_to_server_id.get(any_id).cloned()
}

pub fn new_session(
    server_id: String,
    user_id: String,
    container_id: String,
    agent: AgentKind,
    project_path: String,
) -> Session {
    let now = Utc::now();
    Session {
        server_id,
        agent_id: None,
        user_id,
        container_id,
        agent,
        project_path,
        state: SessionState::Pending,
        started_at: now,
        completed_at: None,
        last_message_at: now,
        cancel_token: CancellationToken::new(),
        attachment_dir: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(std::time::Duration::from_secs(1800))
    }

    #[test]
    fn register_then_get_by_server_id() {
        let reg = registry();
        let s = new_session("s1".into(), "u1".into(), "c1".into(), AgentKind::Claude, "/workspace".into());
        reg.register(s);

        assert!(reg.get("s1").is_some());
    }

    #[test]
    fn bind_agent_id_then_get_by_either_key() {
        let reg = registry();
        let s = new_session("s1".into(), "u1".into(), "c1".into(), AgentKind::Claude, "/workspace".into());
        reg.register(s);
        reg.bind_agent_id("s1", "agent-abc").unwrap();

        assert_eq!(reg.get("agent-abc").unwrap().server_id, "s1");
        assert_eq!(reg.get("s1").unwrap().agent_id.as_deref(), Some("agent-abc"));
    }

    #[test]
    fn duplicate_agent_id_is_rejected() {
        let reg = registry();
        reg.register(new_session("s1".into(), "u1".into(), "c1".into(), AgentKind::Claude, "/w".into()));
        reg.register(new_session("s2".into(), "u1".into(), "c1".into(), AgentKind::Claude, "/w".into()));

        reg.bind_agent_id("s1", "dup").unwrap();
        assert!(matches!(reg.bind_agent_id("s2", "dup"), Err(RegistryError::AgentIdTaken(_))));
    }

    #[test]
    fn mark_terminal_is_idempotent() {
        let reg = registry();
        reg.register(new_session("s1".into(), "u1".into(), "c1".into(), AgentKind::Claude, "/w".into()));
        reg.activate("s1").unwrap();

        reg.mark_terminal("s1", SessionState::Completed).unwrap();
        let completed_at_first = reg.get("s1").unwrap().completed_at;

        reg.mark_terminal("s1", SessionState::Failed).unwrap();
        let session = reg.get("s1").unwrap();
        assert_eq!(session.state, SessionState::Completed);
        assert_eq!(session.completed_at, completed_at_first);
    }

    #[test]
    fn sweep_terminal_removes_both_keys() {
        let reg = registry();
        reg.register(new_session("s1".into(), "u1".into(), "c1".into(), AgentKind::Claude, "/w".into()));
        reg.bind_agent_id("s1", "a1").unwrap();
        reg.mark_terminal("s1", SessionState::Completed).unwrap();

        let swept = reg.sweep_terminal(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(swept, 1);
        assert!(reg.get("s1").is_none());
        assert!(reg.get("a1").is_none());
    }

    #[test]
    fn has_in_flight_false_once_all_terminal() {
        let reg = registry();
        reg.register(new_session("s1".into(), "u1".into(), "c1".into(), AgentKind::Claude, "/w".into()));
        assert!(reg.has_in_flight("u1"));

        reg.mark_terminal("s1", SessionState::Completed).unwrap();
        assert!(!reg.has_in_flight("u1"));
    }
}

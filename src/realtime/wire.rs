//! The duplex channel wire protocol: one frame in, one frame out, both JSON.
//!
//! The envelope is tagged per message kind rather than a flat `{event,
//! args}` pair, since C6's outbound side carries heterogeneous payloads
//! (execution messages, session status, roster snapshots) that don't fit
//! one `args` array cleanly.

use serde::{Deserialize, Serialize};

use crate::executor::ExecutionMessage;
use crate::registry::AgentKind;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Inbound {
    Run {
        agent: AgentKind,
        command: String,
        #[serde(default)]
        options: crate::executor::AgentOptions,
        temp_session_id: String,
    },
    Abort {
        session_id: String,
    },
    Status {
        session_id: Option<String>,
    },
    ListSessions,
    Ping,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    SessionCreated {
        temp_session_id: Option<String>,
        server_id: String,
        agent_id: Option<String>,
    },
    Message {
        server_id: String,
        agent_id: Option<String>,
        payload: ExecutionMessage,
    },
    SessionStatus {
        server_id: String,
        state: String,
    },
    ActiveSessions {
        sessions: Vec<SessionSummary>,
    },
    ServerEvent {
        event: String,
    },
    Error {
        message: String,
    },
    Pong,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub server_id: String,
    pub agent_id: Option<String>,
    pub agent: String,
    pub state: String,
    pub project_path: String,
}

impl Outbound {
    /// The shedding priority used when the outbound queue is full — lower
    /// sheds first. `session_created`, `complete`, and `error` never shed.
    pub fn shed_priority(&self) -> ShedPriority {
        match self {
            Outbound::Message { payload, .. } => match payload {
                ExecutionMessage::Status { .. } | ExecutionMessage::TokenUsage { .. } => ShedPriority::Droppable,
                ExecutionMessage::Complete { .. } | ExecutionMessage::Error { .. } => ShedPriority::Protected,
                _ => ShedPriority::Normal,
            },
            Outbound::SessionCreated { .. } => ShedPriority::Protected,
            _ => ShedPriority::Normal,
        }
    }

    /// Whether two outbound messages are "the same slot" for coalescing —
    /// only consecutive `status` lines for the same session collapse.
    pub fn coalesce_key(&self) -> Option<&str> {
        match self {
            Outbound::Message { server_id, payload: ExecutionMessage::Status { .. }, .. } => Some(server_id.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShedPriority {
    Droppable,
    Normal,
    Protected,
}

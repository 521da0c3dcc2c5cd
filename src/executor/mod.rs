//! Agent Executor (C4): launches an agent CLI inside a user's container for
//! one (user, session, agent) triple, turns its stdout into a normalized
//! message stream, and enforces cancellation/timeouts.
//!
//! The streaming pipeline (line-split stdout, concurrently drained stderr,
//! pattern-matched against fatal phrases) uses small compiled `Regex`es
//! rather than plain substring matching, since C4's fatal-pattern set needs
//! more than exact phrases.

mod agents;
mod pipeline;

pub use agents::{AgentOptions, AgentProfile, ClaudeProfile, CodexProfile, CursorProfile};
pub use pipeline::{run, ExecutorError, ExecutorResult};

use serde::Serialize;

/// One normalized event in a session's output stream. Exactly one terminal
/// variant (`Complete` or `Error`) is emitted per session, then the stream
/// closes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionMessage {
    System { payload: serde_json::Value },
    Assistant { payload: serde_json::Value },
    ToolUse { payload: serde_json::Value },
    ToolResult { payload: serde_json::Value },
    Status { text: String },
    SessionCreated { agent_id: String },
    TokenUsage { input_tokens: u64, output_tokens: u64 },
    Error { reason: String, aborted: bool },
    Complete { exit_code: i64 },
}

impl ExecutionMessage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionMessage::Complete { .. } | ExecutionMessage::Error { .. })
    }
}

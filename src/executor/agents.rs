//! The per-agent capability set C4 is polymorphic over: composing argv and
//! making sense of one line of output differs per CLI; everything else
//! (the streaming pipeline, cancellation) is shared.

use serde::Deserialize;
use serde_json::Value;

use super::ExecutionMessage;

/// Options a `run{...}` command may carry, generalized across all three
/// agents — a given profile ignores whatever doesn't apply to it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentOptions {
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub disallowed_tools: Option<Vec<String>>,
    pub mcp_servers: Option<Vec<String>>,
    pub resume: Option<String>,
    pub images: Option<Vec<String>>,
}

pub trait AgentProfile: Send + Sync {
    /// Composes the argv the executor execs inside the container. `command`
    /// is the user's prompt text; `image_paths` are where attachments were
    /// staged by `copy_in`.
    fn build_argv(&self, command: &str, options: &AgentOptions, image_paths: &[String]) -> Vec<String>;

    /// Interprets one line of stdout. Returning `None` means the line
    /// carried no meaningful event (e.g. a blank line).
    fn parse_line(&self, line: &str) -> Option<ExecutionMessage>;

    /// Pulls an agent-assigned session id out of a parsed line, if present.
    fn extract_session_id(&self, line: &str) -> Option<String>;

    /// Pulls token usage out of a parsed line, if present.
    fn extract_token_usage(&self, line: &str) -> Option<(u64, u64)>;
}

fn push_options(argv: &mut Vec<String>, options: &AgentOptions) {
    if let Some(model) = &options.model {
        argv.push("--model".to_string());
        argv.push(model.clone());
    }
    if let Some(mode) = &options.permission_mode {
        argv.push("--permission-mode".to_string());
        argv.push(mode.clone());
    }
    if let Some(tools) = &options.allowed_tools {
        if !tools.is_empty() {
            argv.push("--allowed-tools".to_string());
            argv.push(tools.join(","));
        }
    }
    if let Some(tools) = &options.disallowed_tools {
        if !tools.is_empty() {
            argv.push("--disallowed-tools".to_string());
            argv.push(tools.join(","));
        }
    }
    if let Some(servers) = &options.mcp_servers {
        if !servers.is_empty() {
            argv.push("--mcp-servers".to_string());
            argv.push(servers.join(","));
        }
    }
}

/// Claude: JSONL over stdout, session id in `system.session_id`, token
/// usage in the terminal `result` message.
pub struct ClaudeProfile;

#[derive(Deserialize)]
struct ClaudeLine {
    #[serde(rename = "type")]
    kind: String,
    session_id: Option<String>,
    usage: Option<ClaudeUsage>,
    #[serde(flatten)]
    rest: Value,
}

#[derive(Deserialize)]
struct ClaudeUsage {
    input_tokens: u64,
    output_tokens: u64,
}

impl AgentProfile for ClaudeProfile {
    fn build_argv(&self, command: &str, options: &AgentOptions, image_paths: &[String]) -> Vec<String> {
        let mut argv = vec!["claude".to_string(), "--print".to_string(), "--output-format".to_string(), "stream-json".to_string()];
        push_options(&mut argv, options);
        if let Some(resume) = &options.resume {
            argv.push("--resume".to_string());
            argv.push(resume.clone());
        }
        for path in image_paths {
            argv.push("--image".to_string());
            argv.push(path.clone());
        }
        argv.push(command.to_string());
        argv
    }

    fn parse_line(&self, line: &str) -> Option<ExecutionMessage> {
        let parsed: ClaudeLine = serde_json::from_str(line).ok()?;
        let message = match parsed.kind.as_str() {
            "system" => ExecutionMessage::System { payload: parsed.rest },
            "assistant" => ExecutionMessage::Assistant { payload: parsed.rest },
            "tool_use" => ExecutionMessage::ToolUse { payload: parsed.rest },
            "tool_result" => ExecutionMessage::ToolResult { payload: parsed.rest },
            // Token usage for "result" lines is already emitted by
            // `extract_token_usage`; map this to status to avoid a duplicate.
            "result" => ExecutionMessage::Status { text: line.to_string() },
            _ => ExecutionMessage::Status { text: line.to_string() },
        };
        Some(message)
    }

    fn extract_session_id(&self, line: &str) -> Option<String> {
        let parsed: ClaudeLine = serde_json::from_str(line).ok()?;
        if parsed.kind == "system" {
            parsed.session_id
        } else {
            None
        }
    }

    fn extract_token_usage(&self, line: &str) -> Option<(u64, u64)> {
        let parsed: ClaudeLine = serde_json::from_str(line).ok()?;
        parsed.usage.map(|u| (u.input_tokens, u.output_tokens))
    }
}

/// Cursor: plain text over stdout; session id reconstructed from its own
/// store database after the run, not captured mid-stream.
pub struct CursorProfile;

impl AgentProfile for CursorProfile {
    fn build_argv(&self, command: &str, options: &AgentOptions, _image_paths: &[String]) -> Vec<String> {
        let mut argv = vec!["cursor-agent".to_string(), "--print".to_string()];
        push_options(&mut argv, options);
        argv.push(command.to_string());
        argv
    }

    fn parse_line(&self, line: &str) -> Option<ExecutionMessage> {
        if line.trim().is_empty() {
            return None;
        }
        Some(ExecutionMessage::Status { text: line.to_string() })
    }

    fn extract_session_id(&self, _line: &str) -> Option<String> {
        None
    }

    fn extract_token_usage(&self, _line: &str) -> Option<(u64, u64)> {
        None
    }
}

/// Codex: JSONL with a `session_meta` header line.
pub struct CodexProfile;

#[derive(Deserialize)]
struct CodexLine {
    #[serde(rename = "type")]
    kind: String,
    session_id: Option<String>,
    #[serde(flatten)]
    rest: Value,
}

impl AgentProfile for CodexProfile {
    fn build_argv(&self, command: &str, options: &AgentOptions, image_paths: &[String]) -> Vec<String> {
        let mut argv = vec!["codex".to_string(), "exec".to_string(), "--json".to_string()];
        push_options(&mut argv, options);
        for path in image_paths {
            argv.push("--image".to_string());
            argv.push(path.clone());
        }
        argv.push(command.to_string());
        argv
    }

    fn parse_line(&self, line: &str) -> Option<ExecutionMessage> {
        let parsed: CodexLine = serde_json::from_str(line).ok()?;
        let message = match parsed.kind.as_str() {
            "session_meta" => ExecutionMessage::System { payload: parsed.rest },
            "agent_message" => ExecutionMessage::Assistant { payload: parsed.rest },
            "tool_call" => ExecutionMessage::ToolUse { payload: parsed.rest },
            "tool_output" => ExecutionMessage::ToolResult { payload: parsed.rest },
            _ => ExecutionMessage::Status { text: line.to_string() },
        };
        Some(message)
    }

    fn extract_session_id(&self, line: &str) -> Option<String> {
        let parsed: CodexLine = serde_json::from_str(line).ok()?;
        if parsed.kind == "session_meta" {
            parsed.session_id
        } else {
            None
        }
    }

    fn extract_token_usage(&self, _line: &str) -> Option<(u64, u64)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_extracts_session_id_from_system_line() {
        let profile = ClaudeProfile;
        let line = r#"{"type":"system","session_id":"abc-123"}"#;
        assert_eq!(profile.extract_session_id(line), Some("abc-123".to_string()));
    }

    #[test]
    fn claude_extracts_token_usage_from_result_line() {
        let profile = ClaudeProfile;
        let line = r#"{"type":"result","usage":{"input_tokens":10,"output_tokens":20}}"#;
        assert_eq!(profile.extract_token_usage(line), Some((10, 20)));
    }

    #[test]
    fn codex_build_argv_includes_json_flag() {
        let profile = CodexProfile;
        let argv = profile.build_argv("hello", &AgentOptions::default(), &[]);
        assert!(argv.contains(&"--json".to_string()));
        assert_eq!(argv.last(), Some(&"hello".to_string()));
    }

    #[test]
    fn cursor_ignores_blank_lines() {
        let profile = CursorProfile;
        assert!(profile.parse_line("   ").is_none());
        assert!(profile.parse_line("hi").is_some());
    }
}

//! The streaming pipeline shared by every agent profile: stage attachments,
//! exec the CLI, line-split stdout, concurrently drain stderr for fatal
//! patterns, and resolve to exactly one terminal message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use regex::RegexSet;
use std::sync::OnceLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::docker::traits::{ContainerRuntime, DockerError};
use crate::registry::SessionRegistry;

use super::agents::AgentOptions;
use super::{AgentProfile, ExecutionMessage};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("docker error: {0}")]
    Docker(#[from] DockerError),

    #[error("invalid_argument: empty command")]
    EmptyCommand,
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Phrases on stderr that are promoted to a terminal `error` message rather
/// than discarded or demoted to `status`.
static FATAL_PATTERNS: OnceLock<RegexSet> = OnceLock::new();

fn fatal_patterns() -> &'static RegexSet {
    FATAL_PATTERNS.get_or_init(|| {
        RegexSet::new([
            r"(?i)permission denied",
            r"(?i)cannot allocate memory",
            r"(?i)out of memory",
            r"(?i)no space left on device",
        ])
        .expect("fatal pattern set compiles")
    })
}

const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Runs `command` for one session against `container_id`. Returns a channel
/// the caller drains for `ExecutionMessage`s; exactly one terminal message
/// is sent before the channel closes.
#[instrument(skip(runtime, profile, registry, cancel_token), fields(server_id = %server_id))]
pub async fn run<R: ContainerRuntime + 'static>(
    runtime: Arc<R>,
    registry: Arc<SessionRegistry>,
    container_id: String,
    server_id: String,
    profile: Arc<dyn AgentProfile>,
    command: String,
    options: AgentOptions,
    cancel_token: CancellationToken,
) -> ExecutorResult<mpsc::Receiver<ExecutionMessage>> {
    if command.trim().is_empty() {
        return Err(ExecutorError::EmptyCommand);
    }

    let (image_paths, attachment_dir) = stage_attachments(&runtime, &container_id, &server_id, &options).await?;
    if let Some(dir) = &attachment_dir {
        registry.set_attachment_dir(&server_id, dir.clone());
    }
    let argv = profile.build_argv(&command, &options, &image_paths);
    let binary_name = argv.first().cloned().unwrap_or_default();

    let handle = runtime.exec(&container_id, &argv, &HashMap::new(), Some("/workspace"), false).await?;

    let (tx, rx) = mpsc::channel(256);

    tokio::spawn(drive(
        runtime,
        registry,
        container_id,
        server_id,
        profile,
        binary_name,
        handle,
        cancel_token,
        attachment_dir,
        tx,
    ));

    Ok(rx)
}

#[allow(clippy::too_many_arguments)]
async fn drive<R: ContainerRuntime + 'static>(
    runtime: Arc<R>,
    registry: Arc<SessionRegistry>,
    container_id: String,
    server_id: String,
    profile: Arc<dyn AgentProfile>,
    binary_name: String,
    mut handle: crate::docker::traits::ExecHandle,
    cancel_token: CancellationToken,
    attachment_dir: Option<String>,
    tx: mpsc::Sender<ExecutionMessage>,
) {
    let mut session_id_captured = false;
    let mut stdout_buf = String::new();

    loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                terminate_gracefully(&runtime, &container_id, &binary_name).await;
                cleanup_attachments(&runtime, &container_id, &attachment_dir).await;
                let _ = tx.send(ExecutionMessage::Error { reason: "aborted".to_string(), aborted: true }).await;
                return;
            }

            chunk = handle.stdout.recv() => {
                match chunk {
                    Some(bytes) => {
                        if process_stdout_chunk(&bytes, &mut stdout_buf, profile.as_ref(), &registry, &server_id, &mut session_id_captured, &tx).await.is_err() {
                            return;
                        }
                    }
                    None => break,
                }
            }

            chunk = handle.stderr.recv() => {
                if let Some(bytes) = chunk {
                    process_stderr_chunk(&bytes, &tx).await;
                }
            }
        }
    }

    // Drain anything left on stderr without blocking further.
    while let Ok(Some(bytes)) = tokio::time::timeout(Duration::from_millis(50), handle.stderr.recv()).await {
        process_stderr_chunk(&bytes, &tx).await;
    }

    if !stdout_buf.is_empty() {
        emit_line(&stdout_buf, profile.as_ref(), &registry, &server_id, &mut session_id_captured, &tx).await;
    }

    let exit_code = handle.wait().await;
    let terminal = match exit_code {
        Ok(0) => ExecutionMessage::Complete { exit_code: 0 },
        Ok(code) => ExecutionMessage::Error { reason: format!("agent exited with code {code}"), aborted: false },
        Err(e) => ExecutionMessage::Error { reason: e.to_string(), aborted: false },
    };
    cleanup_attachments(&runtime, &container_id, &attachment_dir).await;
    let _ = tx.send(terminal).await;
}

/// Removes the directory `stage_attachments` staged, if any. Best-effort:
/// the container may already be gone (e.g. the janitor reaped it), in which
/// case there's nothing left to clean up.
async fn cleanup_attachments<R: ContainerRuntime>(runtime: &R, container_id: &str, dir: &Option<String>) {
    let Some(dir) = dir else { return };
    let argv = vec!["rm".to_string(), "-rf".to_string(), dir.clone()];
    if let Ok(h) = runtime.exec(container_id, &argv, &HashMap::new(), None, false).await {
        let _ = h.wait().await;
    }
}

async fn process_stdout_chunk(
    bytes: &Bytes,
    buf: &mut String,
    profile: &dyn AgentProfile,
    registry: &SessionRegistry,
    server_id: &str,
    session_id_captured: &mut bool,
    tx: &mpsc::Sender<ExecutionMessage>,
) -> Result<(), ()> {
    buf.push_str(&String::from_utf8_lossy(bytes));

    while let Some(pos) = buf.find('\n') {
        let line: String = buf.drain(..=pos).collect();
        let line = line.trim_end_matches(['\n', '\r']).to_string();
        if line.is_empty() {
            continue;
        }
        emit_line(&line, profile, registry, server_id, session_id_captured, tx).await;
        if tx.is_closed() {
            return Err(());
        }
    }

    Ok(())
}

async fn emit_line(
    line: &str,
    profile: &dyn AgentProfile,
    registry: &SessionRegistry,
    server_id: &str,
    session_id_captured: &mut bool,
    tx: &mpsc::Sender<ExecutionMessage>,
) {
    if !*session_id_captured {
        if let Some(agent_id) = profile.extract_session_id(line) {
            if registry.bind_agent_id(server_id, &agent_id).is_ok() {
                *session_id_captured = true;
                let _ = tx.send(ExecutionMessage::SessionCreated { agent_id }).await;
            }
        }
    }

    if let Some((input, output)) = profile.extract_token_usage(line) {
        let _ = tx.send(ExecutionMessage::TokenUsage { input_tokens: input, output_tokens: output }).await;
    }

    if let Some(message) = profile.parse_line(line) {
        let _ = tx.send(message).await;
    }
}

async fn process_stderr_chunk(bytes: &Bytes, tx: &mpsc::Sender<ExecutionMessage>) {
    let text = String::from_utf8_lossy(bytes);
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if fatal_patterns().is_match(line) {
            let _ = tx.send(ExecutionMessage::Error { reason: line.to_string(), aborted: false }).await;
        } else {
            let _ = tx.send(ExecutionMessage::Status { text: line.to_string() }).await;
        }
    }
}

async fn terminate_gracefully<R: ContainerRuntime>(runtime: &R, container_id: &str, binary_name: &str) {
    let sigint = vec!["pkill".to_string(), "-INT".to_string(), "-f".to_string(), binary_name.to_string()];
    if let Ok(h) = runtime.exec(container_id, &sigint, &HashMap::new(), None, false).await {
        let _ = tokio::time::timeout(GRACE_PERIOD, h.wait()).await;
    }

    let sigkill = vec!["pkill".to_string(), "-KILL".to_string(), "-f".to_string(), binary_name.to_string()];
    if let Ok(h) = runtime.exec(container_id, &sigkill, &HashMap::new(), None, false).await {
        let _ = h.wait().await;
    }
}

/// Stages `options.images` into a per-session temp directory inside the
/// container via `copy_in`. The container is per-user and long-lived (reused
/// across sessions up to the pool's idle threshold) with only a small tmpfs
/// mounted at `/tmp`, so the returned directory must be `rm -rf`'d by the
/// caller on every terminal path rather than left to accumulate.
async fn stage_attachments<R: ContainerRuntime>(
    runtime: &R,
    container_id: &str,
    server_id: &str,
    options: &AgentOptions,
) -> ExecutorResult<(Vec<String>, Option<String>)> {
    let Some(images) = &options.images else {
        return Ok((Vec::new(), None));
    };
    if images.is_empty() {
        return Ok((Vec::new(), None));
    }

    let session_dir = format!("/tmp/attachments-{server_id}-{}", Uuid::new_v4());
    let mut builder = tar::Builder::new(Vec::new());
    let mut staged_paths = Vec::new();

    for (i, data_url) in images.iter().enumerate() {
        let bytes = data_url.as_bytes();
        let name = format!("image_{i}.bin");
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, &name, bytes).map_err(DockerError::Io)?;
        staged_paths.push(format!("{session_dir}/{name}"));
    }

    let archive = builder.into_inner().map_err(DockerError::Io)?;
    runtime.copy_in(container_id, &session_dir, archive).await?;

    Ok((staged_paths, Some(session_dir)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_patterns_matches_known_phrases() {
        assert!(fatal_patterns().is_match("bash: permission denied"));
        assert!(fatal_patterns().is_match("fatal: cannot allocate memory"));
        assert!(!fatal_patterns().is_match("just a normal log line"));
    }
}

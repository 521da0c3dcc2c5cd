//! Running an agent CLI inside an already-running container via `docker exec`
//!
//! Grounded on the same attach-then-pump idiom the container's own
//! start/attach path uses (see [`super::lifecycle`]): one task drains the
//! multiplexed output stream into independent stdout/stderr channels, a
//! second task (only when stdin is requested) forwards writes in, and the
//! exit code is resolved once the output stream closes.

use std::collections::HashMap;

use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::traits::{DockerError, DockerResult, ExecHandle};

const CHANNEL_CAPACITY: usize = 256;

pub async fn run_exec(
    docker: &Docker,
    container_id: &str,
    argv: &[String],
    env: &HashMap<String, String>,
    cwd: Option<&str>,
    attach_stdin: bool,
) -> DockerResult<ExecHandle> {
    let env_vec: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();

    let options = CreateExecOptions {
        cmd: Some(argv.to_vec()),
        env: Some(env_vec),
        working_dir: cwd.map(|s| s.to_string()),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        attach_stdin: Some(attach_stdin),
        ..Default::default()
    };

    let created = docker.create_exec(container_id, options).await?;
    let exec_id = created.id;

    let attached = docker
        .start_exec(&exec_id, None)
        .await?;

    let StartExecResults::Attached { mut output, input } = attached else {
        return Err(DockerError::ExecFailed(
            "exec started detached, expected an attached stream".to_string(),
        ));
    };

    let (stdout_tx, stdout_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    let (stderr_tx, stderr_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    let (wait_tx, wait_rx) = oneshot::channel();

    let docker_clone = docker.clone();
    let exec_id_clone = exec_id.clone();

    tokio::spawn(async move {
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(bollard::container::LogOutput::StdOut { message }) => {
                    if stdout_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(bollard::container::LogOutput::StdErr { message }) => {
                    if stderr_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(bollard::container::LogOutput::Console { message }) => {
                    if stdout_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(bollard::container::LogOutput::StdIn { .. }) => {}
                Err(e) => {
                    warn!("exec {} output stream error: {}", exec_id_clone, e);
                    break;
                }
            }
        }

        drop(stdout_tx);
        drop(stderr_tx);

        let exit_code = match docker_clone.inspect_exec(&exec_id_clone).await {
            Ok(details) => Ok(details.exit_code.unwrap_or(-1)),
            Err(e) => Err(DockerError::from(e)),
        };

        debug!("exec {} finished: {:?}", exec_id_clone, exit_code.as_ref().ok());
        let _ = wait_tx.send(exit_code);
    });

    let stdin_tx = if attach_stdin {
        let (tx, mut rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let mut input = input;
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            while let Some(bytes) = rx.recv().await {
                if input.write_all(&bytes).await.is_err() {
                    break;
                }
                let _ = input.flush().await;
            }
        });
        Some(tx)
    } else {
        None
    };

    Ok(ExecHandle::new(stdout_rx, stderr_rx, stdin_tx, wait_rx))
}

/// Sends a signal to a still-running exec's process group by execing a
/// second `kill` inside the container — bollard has no direct "signal an
/// exec" verb, so the engine reaches the process the same way a shell would.
pub async fn signal_exec_process(
    docker: &Docker,
    container_id: &str,
    pid: &str,
    signal: &str,
) -> DockerResult<()> {
    let argv = vec!["kill".to_string(), format!("-{signal}"), pid.to_string()];
    let handle = run_exec(docker, container_id, &argv, &HashMap::new(), None, false).await?;
    let _ = handle.wait().await;
    Ok(())
}

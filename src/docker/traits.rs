//! Container runtime abstraction
//!
//! Every higher layer speaks in these verbs; swapping the runtime out from
//! under the engine (a different daemon, a remote Docker context, a test
//! double) never propagates churn past this trait.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors surfaced by the container runtime.
///
/// `is_transient()` is how C2 decides whether a `container_unavailable`
/// failure gets one automatic retry (see the engine's §7 error taxonomy).
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("container already exists: {0}")]
    ContainerExists(String),

    #[error("container not running: {0}")]
    NotRunning(String),

    #[error("container already running: {0}")]
    AlreadyRunning(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to pull image: {0}")]
    ImagePull(String),

    #[error("exec failed: {0}")]
    ExecFailed(String),

    #[error("{0}")]
    Other(String),
}

pub type DockerResult<T> = Result<T, DockerError>;

impl DockerError {
    /// Whether this failure is worth C2's single automatic retry, or is
    /// permanent and should demote the container record to `failed` outright.
    pub fn is_transient(&self) -> bool {
        match self {
            DockerError::Docker(e) => {
                matches!(
                    e,
                    bollard::errors::Error::DockerResponseServerError { status_code, .. }
                        if *status_code >= 500
                ) || matches!(e, bollard::errors::Error::HyperResponseError { .. })
                    || matches!(e, bollard::errors::Error::RequestTimeoutError)
            }
            DockerError::Timeout => true,
            DockerError::ImagePull(_) => true,
            _ => false,
        }
    }
}

/// Immutable per-tier resource bundle, resolved by the Resource Policy (C3).
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub pids_limit: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 1024 * 1024 * 1024,
            cpu_quota: 50_000,
            cpu_period: 100_000,
            pids_limit: 512,
        }
    }
}

/// Security options attached to a container at create time. Profiles are
/// supplied as data (paths / names); the engine never interprets them.
#[derive(Debug, Clone, Default)]
pub struct SecurityOptions {
    pub seccomp_profile: Option<PathBuf>,
    pub apparmor_profile: Option<String>,
    pub no_new_privileges: bool,
    pub cap_drop: Vec<String>,
}

/// A bind mount from the host into the container.
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Everything C1 needs to create a per-user container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub env: HashMap<String, String>,
    pub mounts: Vec<MountConfig>,
    pub limits: ResourceLimits,
    pub security: SecurityOptions,
    pub network: String,
    pub labels: HashMap<String, String>,
}

/// Runtime state as reported by the daemon, not the engine's own record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Running,
    Paused,
    Exited,
    Missing,
}

#[derive(Debug, Clone)]
pub struct InspectResult {
    pub state: RuntimeState,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub exit_code: Option<i64>,
}

/// One resource-usage sample, as yielded by `stats()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_limit_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

/// A running `exec` inside a container: independently-readable stdout/stderr
/// channels plus a future for the exit code. The streams never block each
/// other because each is drained by its own pump task.
pub struct ExecHandle {
    pub stdout: mpsc::Receiver<Bytes>,
    pub stderr: mpsc::Receiver<Bytes>,
    pub stdin: Option<mpsc::Sender<Bytes>>,
    wait_rx: tokio::sync::oneshot::Receiver<DockerResult<i64>>,
}

impl ExecHandle {
    pub fn new(
        stdout: mpsc::Receiver<Bytes>,
        stderr: mpsc::Receiver<Bytes>,
        stdin: Option<mpsc::Sender<Bytes>>,
        wait_rx: tokio::sync::oneshot::Receiver<DockerResult<i64>>,
    ) -> Self {
        Self { stdout, stderr, stdin, wait_rx }
    }

    /// Resolves once the exec's process exits, yielding its exit code.
    pub async fn wait(self) -> DockerResult<i64> {
        self.wait_rx
            .await
            .unwrap_or_else(|_| Err(DockerError::Other("exec wait channel dropped".into())))
    }
}

/// The ten verbs every higher component speaks. Implementations are
/// thread-safe; every operation is expected to respect an external deadline
/// applied by the caller via cancellation.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ensure_network(&self, name: &str) -> DockerResult<()>;
    async fn ensure_image(&self, image_ref: &str) -> DockerResult<()>;

    async fn create(&self, spec: &ContainerSpec) -> DockerResult<String>;
    async fn start(&self, container_id: &str) -> DockerResult<()>;
    async fn stop(&self, container_id: &str, timeout_secs: i64) -> DockerResult<()>;
    async fn remove(&self, container_id: &str, force: bool) -> DockerResult<()>;

    /// Runs `argv` inside the container as an additional process (the
    /// container's own entrypoint is left untouched). Returns immediately
    /// with live stdout/stderr streams; the process itself keeps running.
    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
        attach_stdin: bool,
    ) -> DockerResult<ExecHandle>;

    /// Untars `tar_stream` into `dest_path` inside the container atomically.
    async fn copy_in(
        &self,
        container_id: &str,
        dest_path: &str,
        tar_stream: Vec<u8>,
    ) -> DockerResult<()>;

    /// A finite stream of resource samples; ends when the container exits.
    /// Restartable: calling it again on a running container yields a fresh
    /// stream starting from the next sample.
    fn stats(&self, container_id: &str) -> mpsc::Receiver<DockerResult<ResourceSample>>;

    async fn inspect(&self, container_id: &str) -> DockerResult<InspectResult>;
}

//! Bollard-backed implementation of [`ContainerRuntime`]

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use tokio::sync::mpsc;
use tracing::debug;

use super::traits::{
    ContainerRuntime, ContainerSpec, DockerError, DockerResult, ExecHandle, InspectResult,
    ResourceSample,
};
use super::{container, exec, lifecycle, stats};

/// Thin wrapper around a single `bollard::Docker` client handle. One gateway
/// per engine process; the Docker daemon itself is the shared mutable
/// resource every component reaches through this type.
pub struct DockerGateway {
    client: Docker,
}

impl DockerGateway {
    /// Connects using the platform-local defaults (unix socket on Linux/macOS,
    /// named pipe on Windows).
    pub fn connect() -> DockerResult<Self> {
        let client = Docker::connect_with_local_defaults()?;
        Ok(Self { client })
    }

    pub(crate) fn docker(&self) -> &Docker {
        &self.client
    }
}

/// Linux capabilities dropped from every engine-managed container. Agent
/// CLIs only ever need to read/write the workspace and talk to the network;
/// none of these are required for that.
pub(crate) fn dropped_capabilities() -> Vec<String> {
    [
        "AUDIT_CONTROL", "AUDIT_WRITE", "BLOCK_SUSPEND", "DAC_READ_SEARCH", "FSETID",
        "IPC_LOCK", "IPC_OWNER", "LEASE", "LINUX_IMMUTABLE", "MAC_ADMIN", "MAC_OVERRIDE",
        "MKNOD", "NET_ADMIN", "NET_BROADCAST", "NET_RAW", "SETFCAP", "SETPCAP", "SYS_ADMIN",
        "SYS_BOOT", "SYS_MODULE", "SYS_NICE", "SYS_PACCT", "SYS_PTRACE", "SYS_RAWIO",
        "SYS_RESOURCE", "SYS_TIME", "SYS_TTY_CONFIG", "SYSLOG", "WAKE_ALARM",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect()
}

#[async_trait]
impl ContainerRuntime for DockerGateway {
    async fn ensure_network(&self, name: &str) -> DockerResult<()> {
        container::ensure_network(&self.client, name).await
    }

    async fn ensure_image(&self, image_ref: &str) -> DockerResult<()> {
        container::ensure_image_exists(&self.client, image_ref).await
    }

    async fn create(&self, spec: &ContainerSpec) -> DockerResult<String> {
        container::create_container(&self.client, spec).await
    }

    async fn start(&self, container_id: &str) -> DockerResult<()> {
        lifecycle::start_container(&self.client, container_id).await
    }

    async fn stop(&self, container_id: &str, timeout_secs: i64) -> DockerResult<()> {
        lifecycle::stop_container(&self.client, container_id, timeout_secs).await
    }

    async fn remove(&self, container_id: &str, force: bool) -> DockerResult<()> {
        debug!("removing container {}", container_id);
        container::destroy_container(&self.client, container_id, force).await
    }

    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
        attach_stdin: bool,
    ) -> DockerResult<ExecHandle> {
        exec::run_exec(&self.client, container_id, argv, env, cwd, attach_stdin).await
    }

    async fn copy_in(
        &self,
        container_id: &str,
        dest_path: &str,
        tar_stream: Vec<u8>,
    ) -> DockerResult<()> {
        container::copy_in(&self.client, container_id, dest_path, tar_stream).await
    }

    fn stats(&self, container_id: &str) -> mpsc::Receiver<DockerResult<ResourceSample>> {
        stats::start_stats_stream(self.client.clone(), container_id.to_string())
    }

    async fn inspect(&self, container_id: &str) -> DockerResult<InspectResult> {
        container::inspect_container(&self.client, container_id).await
    }
}

impl DockerError {
    pub(crate) fn from_bollard_not_found(e: bollard::errors::Error) -> DockerError {
        if let bollard::errors::Error::DockerResponseServerError { status_code, .. } = &e {
            if *status_code == 404 {
                return DockerError::ContainerNotFound(e.to_string());
            }
        }
        DockerError::Docker(e)
    }
}

//! Start/stop/terminate for the container's own (idle) entrypoint process.
//!
//! Agent invocations never touch these — they ride in as `exec`s (see
//! [`super::exec`]) against an already-running container.

use bollard::container::{KillContainerOptions, StopContainerOptions};
use bollard::Docker;
use tracing::{debug, info, warn};

use super::traits::{DockerError, DockerResult};

pub async fn start_container(docker: &Docker, container_id: &str) -> DockerResult<()> {
    match docker.start_container::<String>(container_id, None).await {
        Ok(_) => {
            info!("started container {}", container_id);
            Ok(())
        }
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => {
            // Already running.
            Ok(())
        }
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
            Err(DockerError::ContainerNotFound(container_id.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn stop_container(docker: &Docker, container_id: &str, timeout_secs: i64) -> DockerResult<()> {
    let options = StopContainerOptions { t: timeout_secs };

    match docker.stop_container(container_id, Some(options)).await {
        Ok(_) => {
            debug!("stopped container {}", container_id);
            Ok(())
        }
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
        Err(e) => {
            warn!("graceful stop of {} failed, force-killing: {}", container_id, e);
            terminate_container(docker, container_id, "SIGKILL").await
        }
    }
}

pub async fn terminate_container(docker: &Docker, container_id: &str, signal: &str) -> DockerResult<()> {
    let options = KillContainerOptions { signal };

    match docker.kill_container(container_id, Some(options)).await {
        Ok(_) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 409, .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

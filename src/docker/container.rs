//! Container creation, destruction, and the idempotent ensure_* probes

use std::collections::HashMap;

use bollard::container::{Config, CreateContainerOptions, RemoveContainerOptions};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum, PortMap, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::client::dropped_capabilities;
use super::traits::{ContainerSpec, DockerError, DockerResult, InspectResult, RuntimeState};

/// The container's own entrypoint: every agent invocation rides in as a
/// separate `exec`, so the entrypoint only has to keep the container alive.
const IDLE_ENTRYPOINT: [&str; 3] = ["sleep", "infinity", "--"];

pub async fn ensure_network(docker: &Docker, name: &str) -> DockerResult<()> {
    let networks = docker.list_networks::<String>(None).await?;
    if networks.iter().any(|n| n.name.as_deref() == Some(name)) {
        return Ok(());
    }

    info!("creating docker network {}", name);
    let options = CreateNetworkOptions {
        name: name.to_string(),
        driver: "bridge".to_string(),
        ..Default::default()
    };

    match docker.create_network(options).await {
        Ok(_) => Ok(()),
        // Another creation raced us; the network exists now either way.
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 409, .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub async fn ensure_image_exists(docker: &Docker, image_ref: &str) -> DockerResult<()> {
    if docker.inspect_image(image_ref).await.is_ok() {
        return Ok(());
    }
    pull_image(docker, image_ref).await
}

pub async fn pull_image(docker: &Docker, image_ref: &str) -> DockerResult<()> {
    info!("pulling image {}", image_ref);
    let options = CreateImageOptions {
        from_image: image_ref,
        ..Default::default()
    };

    let mut stream = docker.create_image(Some(options), None, None);
    while let Some(result) = stream.next().await {
        match result {
            Ok(info) => {
                if let Some(status) = info.status {
                    debug!("pull {}: {}", image_ref, status);
                }
            }
            Err(e) => return Err(DockerError::ImagePull(e.to_string())),
        }
    }

    Ok(())
}

pub async fn create_container(docker: &Docker, spec: &ContainerSpec) -> DockerResult<String> {
    let env: Vec<String> = spec
        .env
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();

    let mounts: Vec<Mount> = spec
        .mounts
        .iter()
        .map(|m| Mount {
            source: Some(m.source.clone()),
            target: Some(m.target.clone()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(m.read_only),
            ..Default::default()
        })
        .collect();

    let mut tmpfs = HashMap::new();
    tmpfs.insert("/tmp".to_string(), "size=64m".to_string());

    let mut security_opt = Vec::new();
    if spec.security.no_new_privileges {
        security_opt.push("no-new-privileges".to_string());
    }
    if let Some(profile) = &spec.security.seccomp_profile {
        security_opt.push(format!("seccomp={}", profile.display()));
    }
    if let Some(profile) = &spec.security.apparmor_profile {
        security_opt.push(format!("apparmor={profile}"));
    }

    let cap_drop = if spec.security.cap_drop.is_empty() {
        dropped_capabilities()
    } else {
        spec.security.cap_drop.clone()
    };

    let host_config = HostConfig {
        memory: Some(spec.limits.memory_bytes),
        memory_swap: Some(spec.limits.memory_bytes),
        cpu_quota: if spec.limits.cpu_quota > 0 { Some(spec.limits.cpu_quota) } else { None },
        cpu_period: if spec.limits.cpu_quota > 0 { Some(spec.limits.cpu_period) } else { None },
        pids_limit: Some(spec.limits.pids_limit),
        mounts: Some(mounts),
        tmpfs: Some(tmpfs),
        security_opt: Some(security_opt),
        cap_drop: Some(cap_drop),
        network_mode: Some(spec.network.clone()),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::NO),
            ..Default::default()
        }),
        readonly_rootfs: Some(false),
        port_bindings: Some(PortMap::new()),
        ..Default::default()
    };

    let config = Config {
        image: Some(spec.image.clone()),
        env: Some(env),
        cmd: Some(IDLE_ENTRYPOINT.iter().map(|s| s.to_string()).collect()),
        working_dir: Some("/workspace".to_string()),
        labels: Some(spec.labels.clone()),
        attach_stdout: Some(false),
        attach_stderr: Some(false),
        tty: Some(false),
        host_config: Some(host_config),
        ..Default::default()
    };

    let options = CreateContainerOptions {
        name: spec.name.clone(),
        platform: None,
    };

    match docker.create_container(Some(options), config).await {
        Ok(response) => Ok(response.id),
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 409, .. }) => {
            Err(DockerError::ContainerExists(spec.name.clone()))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn destroy_container(docker: &Docker, container_id: &str, force: bool) -> DockerResult<()> {
    let options = RemoveContainerOptions {
        force,
        v: true,
        ..Default::default()
    };

    match docker.remove_container(container_id, Some(options)).await {
        Ok(_) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
        Err(e) => {
            warn!("failed to remove container {}: {}", container_id, e);
            Err(e.into())
        }
    }
}

pub async fn copy_in(
    docker: &Docker,
    container_id: &str,
    dest_path: &str,
    tar_stream: Vec<u8>,
) -> DockerResult<()> {
    let options = bollard::container::UploadToContainerOptions {
        path: dest_path,
        no_overwrite_dir_non_dir: "false",
    };

    docker
        .upload_to_container(container_id, Some(options), tar_stream.into())
        .await?;

    Ok(())
}

pub async fn inspect_container(docker: &Docker, container_id: &str) -> DockerResult<InspectResult> {
    let details = match docker.inspect_container(container_id, None).await {
        Ok(d) => d,
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
            return Ok(InspectResult {
                state: RuntimeState::Missing,
                started_at: None,
                finished_at: None,
                exit_code: None,
            });
        }
        Err(e) => return Err(e.into()),
    };

    let state = details.state.as_ref();
    let runtime_state = match state {
        Some(s) if s.running.unwrap_or(false) => RuntimeState::Running,
        Some(s) if s.paused.unwrap_or(false) => RuntimeState::Paused,
        Some(_) => RuntimeState::Exited,
        None => RuntimeState::Missing,
    };

    let started_at = state
        .and_then(|s| s.started_at.as_ref())
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&chrono::Utc));

    let finished_at = state
        .and_then(|s| s.finished_at.as_ref())
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&chrono::Utc));

    let exit_code = state.and_then(|s| s.exit_code);

    Ok(InspectResult {
        state: runtime_state,
        started_at,
        finished_at,
        exit_code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_capabilities_excludes_benign_ones() {
        let caps = dropped_capabilities();
        assert!(caps.contains(&"SYS_ADMIN".to_string()));
        assert!(caps.contains(&"NET_RAW".to_string()));
        assert!(!caps.contains(&"CHOWN".to_string()));
    }
}

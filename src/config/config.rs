//! Configuration structures and loading

use std::path::PathBuf;
use anyhow::{Result, Context};
use serde::Deserialize;

/// Root engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// API server configuration
    pub api: ApiConfiguration,

    /// System paths and settings
    pub system: SystemConfiguration,

    /// Docker configuration
    pub docker: DockerConfiguration,

    /// Container pool tuning
    #[serde(default)]
    pub pool: PoolConfiguration,

    /// Session registry tuning
    #[serde(default)]
    pub sessions: SessionConfiguration,

    /// Realtime gateway tuning
    #[serde(default)]
    pub realtime: RealtimeConfiguration,

    /// Janitor sweep intervals
    #[serde(default)]
    pub janitor: JanitorConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let config_path = std::path::Path::new(path);
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config: Configuration = toml::from_str(&content)
            .with_context(|| "Failed to parse configuration")?;

        let base_dir = config_path
            .parent()
            .and_then(|p| if p.as_os_str().is_empty() { None } else { Some(p) })
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        config.system.resolve_paths(&base_dir);

        std::fs::create_dir_all(&config.system.root_directory)?;
        std::fs::create_dir_all(&config.system.data_directory)?;
        std::fs::create_dir_all(&config.system.log_directory)?;

        Ok(config)
    }
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfiguration {
    /// Host to bind to
    #[serde(default = "default_api_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// SSL configuration
    #[serde(default)]
    pub ssl: SslConfiguration,

    /// Secret used to validate channel-connect JWTs
    pub jwt_secret: String,
}

fn default_api_host() -> String {
    "0.0.0.0".into()
}

fn default_api_port() -> u16 {
    8080
}

/// SSL configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SslConfiguration {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
}

/// System paths and settings
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfiguration {
    /// Root directory for all engine state
    #[serde(default = "default_root_directory")]
    pub root_directory: PathBuf,

    /// Directory under which per-user workspace/.claude volumes live
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,

    /// Log directory
    #[serde(default = "default_log_directory")]
    pub log_directory: PathBuf,

    /// Directory the extension syncer (C7) reads bundles from
    #[serde(default = "default_extensions_directory")]
    pub extensions_directory: PathBuf,

    /// Seccomp profile applied to every container
    #[serde(default)]
    pub seccomp_profile: Option<PathBuf>,

    /// AppArmor profile name applied to every container
    #[serde(default)]
    pub apparmor_profile: Option<String>,
}

impl SystemConfiguration {
    pub fn resolve_paths(&mut self, base_dir: &std::path::Path) {
        self.root_directory = Self::resolve_path(&self.root_directory, base_dir);
        self.data_directory = Self::resolve_path(&self.data_directory, base_dir);
        self.log_directory = Self::resolve_path(&self.log_directory, base_dir);
        self.extensions_directory = Self::resolve_path(&self.extensions_directory, base_dir);
    }

    fn resolve_path(path: &std::path::Path, base_dir: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            let resolved = base_dir.join(path);
            resolved.canonicalize().unwrap_or_else(|_| Self::normalize_path(&resolved))
        }
    }

    fn normalize_path(path: &std::path::Path) -> PathBuf {
        let mut components = Vec::new();
        for component in path.components() {
            match component {
                std::path::Component::ParentDir => {
                    components.pop();
                }
                std::path::Component::CurDir => {}
                c => components.push(c),
            }
        }
        components.iter().collect()
    }
}

fn default_root_directory() -> PathBuf {
    PathBuf::from(".warden")
}

fn default_data_directory() -> PathBuf {
    PathBuf::from(".warden/users")
}

fn default_log_directory() -> PathBuf {
    PathBuf::from(".warden/logs")
}

fn default_extensions_directory() -> PathBuf {
    PathBuf::from(".warden/extensions")
}

/// Docker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfiguration {
    /// Image every per-user container is created from
    #[serde(default = "default_image")]
    pub image: String,

    /// Network name C2 ensures and attaches every container to
    #[serde(default = "default_network_name")]
    pub network: String,

    /// Readiness probe timeout (seconds) after `start`
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,

    /// Graceful stop timeout passed to the runtime
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: i64,
}

fn default_image() -> String {
    "warden/agent-runtime:latest".into()
}

fn default_network_name() -> String {
    "warden-engine".into()
}

fn default_readiness_timeout_secs() -> u64 {
    30
}

fn default_stop_timeout_secs() -> i64 {
    10
}

/// Container Pool (C2) tuning
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfiguration {
    /// How long a container may sit with no active session before C8 reaps it
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_secs: u64,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self { idle_threshold_secs: default_idle_threshold_secs() }
    }
}

fn default_idle_threshold_secs() -> u64 {
    2 * 60 * 60
}

/// Session Registry (C5) tuning
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfiguration {
    /// How long a terminal session lingers in the registry before GC
    #[serde(default = "default_completion_grace_secs")]
    pub completion_grace_secs: u64,

    /// Per-run execution timeout; 0 disables
    #[serde(default)]
    pub execution_timeout_secs: u64,
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            completion_grace_secs: default_completion_grace_secs(),
            execution_timeout_secs: 0,
        }
    }
}

fn default_completion_grace_secs() -> u64 {
    30 * 60
}

/// Realtime Gateway (C6) tuning
#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfiguration {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_outbound_queue_bound")]
    pub outbound_queue_bound: usize,
}

impl Default for RealtimeConfiguration {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            outbound_queue_bound: default_outbound_queue_bound(),
        }
    }
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_outbound_queue_bound() -> usize {
    1024
}

/// Janitor (C8) sweep intervals
#[derive(Debug, Clone, Deserialize)]
pub struct JanitorConfiguration {
    #[serde(default = "default_container_sweep_secs")]
    pub container_sweep_secs: u64,

    #[serde(default = "default_session_sweep_secs")]
    pub session_sweep_secs: u64,

    #[serde(default = "default_metrics_prune_secs")]
    pub metrics_prune_secs: u64,

    /// Metrics rows older than this are pruned
    #[serde(default = "default_metrics_retention_secs")]
    pub metrics_retention_secs: u64,
}

impl Default for JanitorConfiguration {
    fn default() -> Self {
        Self {
            container_sweep_secs: default_container_sweep_secs(),
            session_sweep_secs: default_session_sweep_secs(),
            metrics_prune_secs: default_metrics_prune_secs(),
            metrics_retention_secs: default_metrics_retention_secs(),
        }
    }
}

fn default_container_sweep_secs() -> u64 {
    30 * 60
}

fn default_session_sweep_secs() -> u64 {
    5 * 60
}

fn default_metrics_prune_secs() -> u64 {
    60 * 60
}

fn default_metrics_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

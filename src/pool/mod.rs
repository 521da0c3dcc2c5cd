//! Container Pool (C2): maps user -> container, lazily creating, tracking,
//! idle-reaping, and persisting across restarts.
//!
//! Built on a two-tier lock: `DashMap` itself already shards its entries
//! behind per-shard locks, and each value additionally gets an
//! `Arc<Locker>` (from [`crate::system::locker`]) providing per-user mutual
//! exclusion during create — a `Semaphore(1)` wrapper serializing concurrent
//! creation attempts for the same user.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::database::{ContainerRow, ContainerStateRow, ContainerStatusRow, Database, DatabaseError};
use crate::docker::traits::{ContainerRuntime, ContainerSpec, DockerError, MountConfig, RuntimeState};
use crate::extensions::{try_sync, ExtensionSyncer};
use crate::policy::{PolicyError, ResourceOverride, ResourcePolicy, Tier};
use crate::system::{Locker, LockerError};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("docker error: {0}")]
    Docker(#[from] DockerError),

    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("lock error: {0}")]
    Lock(#[from] LockerError),

    #[error("container creation timed out waiting for readiness")]
    ReadinessTimeout,

    #[error("container not found for user {0}")]
    NotFound(String),
}

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Creating,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl ContainerStatus {
    fn is_terminal(&self) -> bool {
        matches!(self, ContainerStatus::Stopped | ContainerStatus::Failed)
    }

    fn to_row(self) -> ContainerStatusRow {
        match self {
            ContainerStatus::Creating => ContainerStatusRow::Creating,
            ContainerStatus::Running => ContainerStatusRow::Running,
            ContainerStatus::Paused => ContainerStatusRow::Paused,
            ContainerStatus::Stopping => ContainerStatusRow::Stopping,
            ContainerStatus::Stopped => ContainerStatusRow::Stopped,
            ContainerStatus::Failed => ContainerStatusRow::Failed,
        }
    }

    fn from_row(row: ContainerStatusRow) -> Self {
        match row {
            ContainerStatusRow::Creating => ContainerStatus::Creating,
            ContainerStatusRow::Running => ContainerStatus::Running,
            ContainerStatusRow::Paused => ContainerStatus::Paused,
            ContainerStatusRow::Stopping => ContainerStatus::Stopping,
            ContainerStatusRow::Stopped => ContainerStatus::Stopped,
            ContainerStatusRow::Failed => ContainerStatus::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub user_id: String,
    pub container_id: String,
    pub container_name: String,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// Handle to a running container, returned by `get_or_create` and passed on
/// to the Agent Executor (C4) for `exec`.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub user_id: String,
    pub container_id: String,
}

/// What the caller knows about the user requesting a container — owned
/// externally (per the data model's User entity); the pool only reads it.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub user_id: String,
    pub tier: Tier,
    pub resource_override: ResourceOverride,
    pub api_base_url: String,
    pub api_token: String,
    pub model: String,
    pub context_window: String,
}

pub struct PoolSettings {
    pub image: String,
    pub network: String,
    pub data_root: PathBuf,
    pub readiness_timeout: std::time::Duration,
    pub stop_timeout_secs: i64,
}

pub struct ContainerPool<R: ContainerRuntime> {
    runtime: Arc<R>,
    db: Arc<Database>,
    policy: Arc<ResourcePolicy>,
    extensions: Arc<ExtensionSyncer>,
    settings: PoolSettings,
    records: DashMap<String, ContainerRecord>,
    user_lockers: DashMap<String, Arc<Locker>>,
}

impl<R: ContainerRuntime> ContainerPool<R> {
    pub fn new(
        runtime: Arc<R>,
        db: Arc<Database>,
        policy: Arc<ResourcePolicy>,
        extensions: Arc<ExtensionSyncer>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            runtime,
            db,
            policy,
            extensions,
            settings,
            records: DashMap::new(),
            user_lockers: DashMap::new(),
        }
    }

    /// The underlying runtime, handed to C4 for `exec` calls against
    /// containers this pool created.
    pub fn runtime(&self) -> Arc<R> {
        self.runtime.clone()
    }

    fn locker_for(&self, user_id: &str) -> Arc<Locker> {
        self.user_lockers
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Locker::new()))
            .clone()
    }

    /// Returns a running container for `user`, creating one if absent.
    /// At most one creation per user runs concurrently; other callers for
    /// the same user wait on the per-user locker rather than racing Docker.
    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn get_or_create(&self, user: &UserContext) -> PoolResult<ContainerHandle> {
        if let Some(record) = self.records.get(&user.user_id) {
            if record.status == ContainerStatus::Running {
                return Ok(ContainerHandle {
                    user_id: user.user_id.clone(),
                    container_id: record.container_id.clone(),
                });
            }
        }

        let locker = self.locker_for(&user.user_id);
        let _guard = locker.acquire().await?;

        // Double-checked: someone may have created it while we waited.
        if let Some(record) = self.records.get(&user.user_id) {
            if record.status == ContainerStatus::Running {
                return Ok(ContainerHandle {
                    user_id: user.user_id.clone(),
                    container_id: record.container_id.clone(),
                });
            }
        }

        match self.create_for_user(user).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                warn!("container creation failed for user {}: {}", user.user_id, e);
                self.records.insert(
                    user.user_id.clone(),
                    ContainerRecord {
                        user_id: user.user_id.clone(),
                        container_id: String::new(),
                        container_name: String::new(),
                        status: ContainerStatus::Failed,
                        created_at: Utc::now(),
                        last_active_at: Utc::now(),
                    },
                );
                Err(e)
            }
        }
    }

    async fn create_for_user(&self, user: &UserContext) -> PoolResult<ContainerHandle> {
        // 1. resolve the resource bundle.
        let bundle = self.policy.resolve(user.tier, &user.resource_override)?;

        // 2. deterministic container name.
        let container_name = format!("warden-user-{}", sanitize(&user.user_id));

        // 3. ensure network + image.
        self.runtime.ensure_network(&self.settings.network).await?;
        self.runtime.ensure_image(&self.settings.image).await?;

        // 4. host-side workspace + claude config directories.
        let user_root = self.settings.data_root.join(format!("user_{}", sanitize(&user.user_id)));
        let workspace_dir = user_root.join("workspace");
        let claude_dir = workspace_dir.join(".claude");
        std::fs::create_dir_all(&claude_dir).map_err(DockerError::Io)?;

        let mut env = HashMap::new();
        env.insert("WARDEN_API_BASE_URL".to_string(), user.api_base_url.clone());
        env.insert("WARDEN_API_TOKEN".to_string(), user.api_token.clone());
        env.insert("WARDEN_MODEL".to_string(), user.model.clone());
        env.insert("WARDEN_CONTEXT_WINDOW".to_string(), user.context_window.clone());

        let mut labels = HashMap::new();
        labels.insert("warden.user_id".to_string(), user.user_id.clone());

        let spec = ContainerSpec {
            image: self.settings.image.clone(),
            name: container_name.clone(),
            env,
            mounts: vec![MountConfig {
                source: workspace_dir.to_string_lossy().to_string(),
                target: "/workspace".to_string(),
                read_only: false,
            }],
            limits: bundle.limits,
            security: bundle.security,
            network: self.settings.network.clone(),
            labels,
        };

        // 5-6. create + start.
        let container_id = self.runtime.create(&spec).await?;
        self.runtime.start(&container_id).await?;

        // 7. readiness probe.
        if let Err(e) = self.wait_until_ready(&container_id).await {
            let _ = self.runtime.remove(&container_id, true).await;
            return Err(e);
        }

        // 8. extension sync (non-fatal).
        if let Some(archive) = try_sync(&self.extensions, &user.user_id) {
            if let Err(e) = self.runtime.copy_in(&container_id, "/workspace/.claude", archive).await {
                warn!("extension copy_in failed for {}: {}", user.user_id, e);
            }
        }

        // 9. persist.
        let now = Utc::now();
        let record = ContainerRecord {
            user_id: user.user_id.clone(),
            container_id: container_id.clone(),
            container_name: container_name.clone(),
            status: ContainerStatus::Running,
            created_at: now,
            last_active_at: now,
        };

        self.db.containers().await.upsert(&ContainerRow {
            user_id: record.user_id.clone(),
            container_id: record.container_id.clone(),
            container_name: record.container_name.clone(),
            status: record.status.to_row(),
            created_at: now.timestamp(),
            last_active: now.timestamp(),
            resource_usage: None,
        })?;

        self.save_state_snapshot(&record).await?;
        self.records.insert(user.user_id.clone(), record);

        info!("created container {} for user {}", container_id, user.user_id);

        Ok(ContainerHandle { user_id: user.user_id.clone(), container_id })
    }

    /// Writes the restart-recovery snapshot for `record`'s user. Separate
    /// from the `user_containers` row itself since this is what a future
    /// boot consults to detect a user whose container row was lost but
    /// whose snapshot survived (or vice versa), not the primary source of
    /// truth — `restore_from_persistence` still drives off `user_containers`.
    async fn save_state_snapshot(&self, record: &ContainerRecord) -> PoolResult<()> {
        let state_data = serde_json::json!({
            "status": record.status,
            "container_id": record.container_id,
            "container_name": record.container_name,
        })
        .to_string();

        self.db.states().await.save(&ContainerStateRow {
            user_id: record.user_id.clone(),
            state_data,
            updated_at: 0,
        })?;
        Ok(())
    }

    async fn wait_until_ready(&self, container_id: &str) -> PoolResult<()> {
        let deadline = tokio::time::Instant::now() + self.settings.readiness_timeout;

        loop {
            let probe = self
                .runtime
                .exec(container_id, &["echo".to_string(), "ready".to_string()], &HashMap::new(), None, false)
                .await;

            if let Ok(handle) = probe {
                if let Ok(0) = handle.wait().await {
                    return Ok(());
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(PoolError::ReadinessTimeout);
            }

            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    /// Touches `last_active_at`; called on every inbound command.
    pub async fn mark_active(&self, user_id: &str) -> PoolResult<()> {
        if let Some(mut record) = self.records.get_mut(user_id) {
            record.last_active_at = Utc::now();
            self.db.containers().await.touch_last_active(&record.container_id)?;
        }
        Ok(())
    }

    pub async fn stop(&self, user_id: &str) -> PoolResult<()> {
        let container_id = {
            let mut record = self.records.get_mut(user_id).ok_or_else(|| PoolError::NotFound(user_id.to_string()))?;
            record.status = ContainerStatus::Stopping;
            record.container_id.clone()
        };

        self.db.containers().await.set_status(&container_id, ContainerStatusRow::Stopping)?;
        self.runtime.stop(&container_id, self.settings.stop_timeout_secs).await?;

        if let Some(mut record) = self.records.get_mut(user_id) {
            record.status = ContainerStatus::Stopped;
        }
        self.db.containers().await.set_status(&container_id, ContainerStatusRow::Stopped)?;

        if let Some(record) = self.records.get(user_id) {
            self.save_state_snapshot(&record).await?;
        }

        Ok(())
    }

    pub async fn remove(&self, user_id: &str) -> PoolResult<()> {
        let container_id = self
            .records
            .get(user_id)
            .map(|r| r.container_id.clone())
            .ok_or_else(|| PoolError::NotFound(user_id.to_string()))?;

        self.runtime.remove(&container_id, true).await?;
        self.records.remove(user_id);
        self.db.containers().await.delete(&container_id)?;
        self.db.states().await.delete(user_id)?;

        Ok(())
    }

    /// On a `NotRunning` exec failure (the container died under us — OOM,
    /// a manual `docker kill`, the daemon restarting the runtime), demotes
    /// the record to failed and forgets it entirely, best-effort removing
    /// the dead container so its deterministic name frees up, so the next
    /// `get_or_create` recreates rather than handing out the same dead
    /// `container_id` forever.
    pub async fn mark_failed_and_forget(&self, user_id: &str) -> PoolResult<()> {
        let container_id = match self.records.get(user_id) {
            Some(record) => record.container_id.clone(),
            None => return Ok(()),
        };

        if let Err(e) = self.runtime.remove(&container_id, true).await {
            warn!("cleanup of dead container {} failed: {}", container_id, e);
        }

        self.records.remove(user_id);
        self.db.containers().await.delete(&container_id)?;
        self.db.states().await.delete(user_id)?;

        Ok(())
    }

    pub fn list_active(&self) -> Vec<ContainerRecord> {
        self.records.iter().filter(|r| !r.status.is_terminal()).map(|r| r.value().clone()).collect()
    }

    /// Records whose `last_active_at` predates `cutoff` — candidates for
    /// the Janitor's idle sweep. The pool doesn't know about live sessions;
    /// the Janitor cross-references these against the Session Registry
    /// before actually reaping.
    pub async fn idle_candidates(&self, cutoff: DateTime<Utc>) -> PoolResult<Vec<ContainerRecord>> {
        let rows = self.db.containers().await.list_idle_since(cutoff.timestamp())?;
        Ok(rows
            .into_iter()
            .map(|row| ContainerRecord {
                user_id: row.user_id,
                container_id: row.container_id,
                container_name: row.container_name,
                status: ContainerStatus::from_row(row.status),
                created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_else(Utc::now),
                last_active_at: DateTime::from_timestamp(row.last_active, 0).unwrap_or_else(Utc::now),
            })
            .collect())
    }

    /// On boot, reconciles persisted records with actual runtime state.
    /// Records pointing at containers the daemon no longer has are purged;
    /// the pool never adopts a running container it didn't persist itself.
    pub async fn restore_from_persistence(&self) -> PoolResult<()> {
        let rows = self.db.containers().await.list_active()?;

        for row in rows {
            match self.runtime.inspect(&row.container_id).await {
                Ok(inspect) if inspect.state != RuntimeState::Missing => {
                    let status = match inspect.state {
                        RuntimeState::Running => ContainerStatus::Running,
                        RuntimeState::Paused => ContainerStatus::Paused,
                        _ => ContainerStatus::Failed,
                    };

                    self.records.insert(
                        row.user_id.clone(),
                        ContainerRecord {
                            user_id: row.user_id,
                            container_id: row.container_id,
                            container_name: row.container_name,
                            status,
                            created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_else(Utc::now),
                            last_active_at: DateTime::from_timestamp(row.last_active, 0).unwrap_or_else(Utc::now),
                        },
                    );
                }
                _ => {
                    warn!("purging stale container record {} for user {}", row.container_id, row.user_id);
                    self.db.containers().await.delete(&row.container_id)?;
                    self.db.states().await.delete(&row.user_id)?;
                }
            }
        }

        // Snapshots whose user no longer has a live record are orphaned —
        // the container row they described was purged above or never
        // existed this boot.
        for snapshot in self.db.states().await.all()? {
            if !self.records.contains_key(&snapshot.user_id) {
                warn!("purging orphaned state snapshot for user {}", snapshot.user_id);
                self.db.states().await.delete(&snapshot.user_id)?;
            }
        }

        Ok(())
    }
}

fn sanitize(user_id: &str) -> String {
    user_id.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' }).collect()
}

//! Janitor (C8): periodic idle-container reaping, completed-session GC, and
//! metrics pruning, each on its own interval.
//!
//! Built on [`crate::cron::Scheduler`], which holds one `JobHandle` per
//! registered job; the three jobs below (idle sweep, session GC, metrics
//! prune) are specific to this engine rather than generic daemon upkeep.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cron::{JobHandle, Scheduler};
use crate::database::Database;
use crate::docker::traits::ContainerRuntime;
use crate::pool::ContainerPool;
use crate::registry::SessionRegistry;

#[derive(Debug, Clone)]
pub struct JanitorSettings {
    pub container_sweep_interval: std::time::Duration,
    pub session_sweep_interval: std::time::Duration,
    pub metrics_prune_interval: std::time::Duration,
    pub idle_threshold: chrono::Duration,
    pub metrics_retention: chrono::Duration,
}

impl JanitorSettings {
    pub fn from_config(janitor: &crate::config::JanitorConfiguration, pool: &crate::config::PoolConfiguration) -> Self {
        Self {
            container_sweep_interval: std::time::Duration::from_secs(janitor.container_sweep_secs),
            session_sweep_interval: std::time::Duration::from_secs(janitor.session_sweep_secs),
            metrics_prune_interval: std::time::Duration::from_secs(janitor.metrics_prune_secs),
            idle_threshold: chrono::Duration::seconds(pool.idle_threshold_secs as i64),
            metrics_retention: chrono::Duration::seconds(janitor.metrics_retention_secs as i64),
        }
    }
}

/// Owns the three periodic passes. Each pass is idempotent and safe to run
/// again after a restart mid-pass; none holds a lock across an `.await`
/// that spans another component's lock.
pub struct Janitor<R: ContainerRuntime> {
    scheduler: Arc<Scheduler>,
    pool: Arc<ContainerPool<R>>,
    registry: Arc<SessionRegistry>,
    db: Arc<Database>,
    settings: JanitorSettings,
    handles: RwLock<Vec<JobHandle>>,
}

impl<R: ContainerRuntime + 'static> Janitor<R> {
    pub fn new(pool: Arc<ContainerPool<R>>, registry: Arc<SessionRegistry>, db: Arc<Database>, settings: JanitorSettings) -> Self {
        Self { scheduler: Arc::new(Scheduler::new()), pool, registry, db, settings, handles: RwLock::new(Vec::new()) }
    }

    pub async fn start(&self) {
        let mut handles = self.handles.write().await;

        let pool = self.pool.clone();
        let registry = self.registry.clone();
        let idle_threshold = self.settings.idle_threshold;
        handles.push(
            self.scheduler
                .schedule("container_sweep", self.settings.container_sweep_interval, move || {
                    let pool = pool.clone();
                    let registry = registry.clone();
                    async move { sweep_idle_containers(&pool, &registry, idle_threshold).await }
                })
                .await,
        );

        let registry = self.registry.clone();
        let completion_grace = self.registry.completion_grace();
        handles.push(
            self.scheduler
                .schedule("session_sweep", self.settings.session_sweep_interval, move || {
                    let registry = registry.clone();
                    async move { sweep_terminal_sessions(&registry, completion_grace) }
                })
                .await,
        );

        let db = self.db.clone();
        let retention = self.settings.metrics_retention;
        handles.push(
            self.scheduler
                .schedule("metrics_prune", self.settings.metrics_prune_interval, move || {
                    let db = db.clone();
                    async move { prune_metrics(&db, retention).await }
                })
                .await,
        );

        info!("janitor started: {} jobs", handles.len());
    }

    pub async fn stop(&self) {
        for handle in self.handles.read().await.iter() {
            handle.cancel();
        }
    }
}

/// Reaps containers idle past the threshold, but only once C5 confirms the
/// owning user has no in-flight session — a container mid-execution is
/// never idle regardless of how long ago `last_active_at` was touched.
async fn sweep_idle_containers<R: ContainerRuntime>(pool: &Arc<ContainerPool<R>>, registry: &Arc<SessionRegistry>, idle_threshold: chrono::Duration) {
    let cutoff = Utc::now() - idle_threshold;

    let candidates = match pool.idle_candidates(cutoff).await {
        Ok(c) => c,
        Err(e) => {
            warn!("idle candidate query failed: {}", e);
            return;
        }
    };

    for candidate in candidates {
        if registry.has_in_flight(&candidate.user_id) {
            continue;
        }

        debug!("reaping idle container for user {}", candidate.user_id);
        if let Err(e) = pool.remove(&candidate.user_id).await {
            warn!("idle reap failed for user {}: {}", candidate.user_id, e);
        }
    }
}

fn sweep_terminal_sessions(registry: &Arc<SessionRegistry>, completion_grace: chrono::Duration) {
    let cutoff = Utc::now() - completion_grace;
    let swept = registry.sweep_terminal(cutoff);
    if swept > 0 {
        debug!("swept {} terminal sessions", swept);
    }
}

async fn prune_metrics(db: &Arc<Database>, retention: chrono::Duration) {
    let cutoff = (Utc::now() - retention).timestamp();
    match db.metrics().await.prune_older_than(cutoff) {
        Ok(pruned) if pruned > 0 => debug!("pruned {} stale metric samples", pruned),
        Ok(_) => {}
        Err(e) => warn!("metrics prune failed: {}", e),
    }
}

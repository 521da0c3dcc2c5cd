//! SQLite-backed persistence for the three tables the engine owns:
//! `user_containers` (C2), `container_metrics` (C2 stats history), and
//! `container_states` (C2 restart-recovery snapshots).
//!
//! There is no external panel to forward activity to and backups are out
//! of scope, so only the schema below is created.

mod containers;
mod metrics;
mod states;

pub use containers::{ContainerRow, ContainerStatusRow};
pub use metrics::MetricSample;
pub use states::ContainerStateRow;

use std::path::Path;

use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Main database wrapper. One connection, guarded by an async mutex — reads
/// and writes alike are short-lived, so a single mutex never becomes a
/// bottleneck relative to the container/session work it gates.
pub struct Database {
    conn: Mutex<Connection>,
    containers: containers::ContainerStore,
    metrics: metrics::MetricsStore,
    states: states::ContainerStateStore,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init_tables(&conn)?;

        info!("database opened at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
            containers: containers::ContainerStore::new(),
            metrics: metrics::MetricsStore::new(),
            states: states::ContainerStateStore::new(),
        })
    }

    pub fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_tables(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            containers: containers::ContainerStore::new(),
            metrics: metrics::MetricsStore::new(),
            states: states::ContainerStateStore::new(),
        })
    }

    fn init_tables(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS user_containers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                container_id TEXT NOT NULL UNIQUE,
                container_name TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER DEFAULT (strftime('%s', 'now')),
                last_active INTEGER DEFAULT (strftime('%s', 'now')),
                resource_usage TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_user_containers_user
                ON user_containers(user_id)
                WHERE status IN ('creating', 'running', 'paused');

            CREATE TABLE IF NOT EXISTS container_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                container_id TEXT NOT NULL,
                cpu_percent REAL NOT NULL,
                memory_used INTEGER NOT NULL,
                memory_limit INTEGER NOT NULL,
                memory_percent REAL NOT NULL,
                disk_used INTEGER NOT NULL DEFAULT 0,
                network_rx INTEGER NOT NULL DEFAULT 0,
                network_tx INTEGER NOT NULL DEFAULT 0,
                recorded_at INTEGER DEFAULT (strftime('%s', 'now'))
            );

            CREATE INDEX IF NOT EXISTS idx_container_metrics_container
                ON container_metrics(container_id, recorded_at);

            CREATE TABLE IF NOT EXISTS container_states (
                user_id TEXT PRIMARY KEY,
                state_data TEXT NOT NULL,
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
            "#,
        )
    }

    pub async fn containers(&self) -> ContainerStoreWithConn<'_> {
        ContainerStoreWithConn { conn: self.conn.lock().await, store: &self.containers }
    }

    pub async fn metrics(&self) -> MetricsStoreWithConn<'_> {
        MetricsStoreWithConn { conn: self.conn.lock().await, store: &self.metrics }
    }

    pub async fn states(&self) -> ContainerStateStoreWithConn<'_> {
        ContainerStateStoreWithConn { conn: self.conn.lock().await, store: &self.states }
    }
}

pub struct ContainerStoreWithConn<'a> {
    conn: tokio::sync::MutexGuard<'a, Connection>,
    store: &'a containers::ContainerStore,
}

impl ContainerStoreWithConn<'_> {
    pub fn upsert(&self, row: &ContainerRow) -> DatabaseResult<()> {
        self.store.upsert(&self.conn, row)
    }

    pub fn get_by_user(&self, user_id: &str) -> DatabaseResult<Option<ContainerRow>> {
        self.store.get_by_user(&self.conn, user_id)
    }

    pub fn set_status(&self, container_id: &str, status: ContainerStatusRow) -> DatabaseResult<()> {
        self.store.set_status(&self.conn, container_id, status)
    }

    pub fn touch_last_active(&self, container_id: &str) -> DatabaseResult<()> {
        self.store.touch_last_active(&self.conn, container_id)
    }

    pub fn delete(&self, container_id: &str) -> DatabaseResult<()> {
        self.store.delete(&self.conn, container_id)
    }

    pub fn list_active(&self) -> DatabaseResult<Vec<ContainerRow>> {
        self.store.list_active(&self.conn)
    }

    pub fn list_idle_since(&self, cutoff_unix: i64) -> DatabaseResult<Vec<ContainerRow>> {
        self.store.list_idle_since(&self.conn, cutoff_unix)
    }
}

pub struct MetricsStoreWithConn<'a> {
    conn: tokio::sync::MutexGuard<'a, Connection>,
    store: &'a metrics::MetricsStore,
}

impl MetricsStoreWithConn<'_> {
    pub fn record(&self, sample: &MetricSample) -> DatabaseResult<()> {
        self.store.record(&self.conn, sample)
    }

    pub fn prune_older_than(&self, cutoff_unix: i64) -> DatabaseResult<usize> {
        self.store.prune_older_than(&self.conn, cutoff_unix)
    }
}

pub struct ContainerStateStoreWithConn<'a> {
    conn: tokio::sync::MutexGuard<'a, Connection>,
    store: &'a states::ContainerStateStore,
}

impl ContainerStateStoreWithConn<'_> {
    pub fn save(&self, row: &ContainerStateRow) -> DatabaseResult<()> {
        self.store.save(&self.conn, row)
    }

    pub fn get(&self, user_id: &str) -> DatabaseResult<Option<ContainerStateRow>> {
        self.store.get(&self.conn, user_id)
    }

    pub fn delete(&self, user_id: &str) -> DatabaseResult<()> {
        self.store.delete(&self.conn, user_id)
    }

    pub fn all(&self) -> DatabaseResult<Vec<ContainerStateRow>> {
        self.store.all(&self.conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrips_a_container_row() {
        let db = Database::open_in_memory().unwrap();

        let row = ContainerRow {
            user_id: "user-1".to_string(),
            container_id: "c-1".to_string(),
            container_name: "warden-user-1".to_string(),
            status: ContainerStatusRow::Running,
            created_at: 1000,
            last_active: 1000,
            resource_usage: None,
        };

        db.containers().await.upsert(&row).unwrap();

        let loaded = db.containers().await.get_by_user("user-1").unwrap();
        assert!(loaded.is_some());
        assert_eq!(loaded.unwrap().container_id, "c-1");
    }
}

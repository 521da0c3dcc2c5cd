//! `container_metrics` table: C2 stats history, pruned periodically by C8.

use rusqlite::Connection;

use super::DatabaseResult;

#[derive(Debug, Clone)]
pub struct MetricSample {
    pub container_id: String,
    pub cpu_percent: f64,
    pub memory_used: i64,
    pub memory_limit: i64,
    pub memory_percent: f64,
    pub disk_used: i64,
    pub network_rx: i64,
    pub network_tx: i64,
}

pub struct MetricsStore;

impl MetricsStore {
    pub fn new() -> Self {
        Self
    }

    pub fn record(&self, conn: &Connection, sample: &MetricSample) -> DatabaseResult<()> {
        conn.execute(
            r#"
            INSERT INTO container_metrics
                (container_id, cpu_percent, memory_used, memory_limit, memory_percent,
                 disk_used, network_rx, network_tx)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            rusqlite::params![
                sample.container_id,
                sample.cpu_percent,
                sample.memory_used,
                sample.memory_limit,
                sample.memory_percent,
                sample.disk_used,
                sample.network_rx,
                sample.network_tx,
            ],
        )?;
        Ok(())
    }

    pub fn prune_older_than(&self, conn: &Connection, cutoff_unix: i64) -> DatabaseResult<usize> {
        let affected = conn.execute(
            "DELETE FROM container_metrics WHERE recorded_at < ?1",
            [cutoff_unix],
        )?;
        Ok(affected)
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE container_metrics (
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
            "#,
        )
        .unwrap();
        conn
    }

    #[test]
    fn record_then_prune() {
        let conn = setup();
        let store = MetricsStore::new();

        let sample = MetricSample {
            container_id: "c-1".to_string(),
            cpu_percent: 12.5,
            memory_used: 100,
            memory_limit: 1000,
            memory_percent: 10.0,
            disk_used: 0,
            network_rx: 0,
            network_tx: 0,
        };

        store.record(&conn, &sample).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM container_metrics", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        // Recorded "now", so pruning anything before the epoch removes nothing.
        let pruned = store.prune_older_than(&conn, 0).unwrap();
        assert_eq!(pruned, 0);

        // A cutoff far in the future removes everything.
        let pruned = store.prune_older_than(&conn, i64::MAX).unwrap();
        assert_eq!(pruned, 1);
    }
}

//! `user_containers` table: C2's persisted view of each user's container.

use rusqlite::{Connection, OptionalExtension};

use super::{DatabaseError, DatabaseResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatusRow {
    Creating,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl ContainerStatusRow {
    fn as_str(&self) -> &'static str {
        match self {
            ContainerStatusRow::Creating => "creating",
            ContainerStatusRow::Running => "running",
            ContainerStatusRow::Paused => "paused",
            ContainerStatusRow::Stopping => "stopping",
            ContainerStatusRow::Stopped => "stopped",
            ContainerStatusRow::Failed => "failed",
        }
    }

    fn parse(s: &str) -> DatabaseResult<Self> {
        match s {
            "creating" => Ok(ContainerStatusRow::Creating),
            "running" => Ok(ContainerStatusRow::Running),
            "paused" => Ok(ContainerStatusRow::Paused),
            "stopping" => Ok(ContainerStatusRow::Stopping),
            "stopped" => Ok(ContainerStatusRow::Stopped),
            "failed" => Ok(ContainerStatusRow::Failed),
            other => Err(DatabaseError::Serialization(format!("unknown container status: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerRow {
    pub user_id: String,
    pub container_id: String,
    pub container_name: String,
    pub status: ContainerStatusRow,
    pub created_at: i64,
    pub last_active: i64,
    pub resource_usage: Option<String>,
}

fn row_to_container(row: &rusqlite::Row) -> rusqlite::Result<ContainerRow> {
    let status_str: String = row.get(3)?;
    Ok(ContainerRow {
        user_id: row.get(0)?,
        container_id: row.get(1)?,
        container_name: row.get(2)?,
        status: ContainerStatusRow::parse(&status_str).unwrap_or(ContainerStatusRow::Failed),
        created_at: row.get(4)?,
        last_active: row.get(5)?,
        resource_usage: row.get(6)?,
    })
}

const SELECT_COLUMNS: &str =
    "user_id, container_id, container_name, status, created_at, last_active, resource_usage";

pub struct ContainerStore;

impl ContainerStore {
    pub fn new() -> Self {
        Self
    }

    pub fn upsert(&self, conn: &Connection, row: &ContainerRow) -> DatabaseResult<()> {
        conn.execute(
            r#"
            INSERT INTO user_containers
                (user_id, container_id, container_name, status, created_at, last_active, resource_usage)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(container_id) DO UPDATE SET
                status = excluded.status,
                last_active = excluded.last_active,
                resource_usage = excluded.resource_usage
            "#,
            rusqlite::params![
                row.user_id,
                row.container_id,
                row.container_name,
                row.status.as_str(),
                row.created_at,
                row.last_active,
                row.resource_usage,
            ],
        )?;
        Ok(())
    }

    pub fn get_by_user(&self, conn: &Connection, user_id: &str) -> DatabaseResult<Option<ContainerRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM user_containers WHERE user_id = ?1 AND status != 'stopped' ORDER BY created_at DESC LIMIT 1"
        ))?;

        Ok(stmt.query_row([user_id], row_to_container).optional()?)
    }

    pub fn set_status(&self, conn: &Connection, container_id: &str, status: ContainerStatusRow) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE user_containers SET status = ?2 WHERE container_id = ?1",
            rusqlite::params![container_id, status.as_str()],
        )?;
        Ok(())
    }

    pub fn touch_last_active(&self, conn: &Connection, container_id: &str) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE user_containers SET last_active = strftime('%s', 'now') WHERE container_id = ?1",
            [container_id],
        )?;
        Ok(())
    }

    pub fn delete(&self, conn: &Connection, container_id: &str) -> DatabaseResult<()> {
        conn.execute("DELETE FROM user_containers WHERE container_id = ?1", [container_id])?;
        Ok(())
    }

    pub fn list_active(&self, conn: &Connection) -> DatabaseResult<Vec<ContainerRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM user_containers WHERE status IN ('creating', 'running', 'paused')"
        ))?;

        let rows = stmt
            .query_map([], row_to_container)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_idle_since(&self, conn: &Connection, cutoff_unix: i64) -> DatabaseResult<Vec<ContainerRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM user_containers WHERE status = 'running' AND last_active < ?1"
        ))?;

        let rows = stmt
            .query_map([cutoff_unix], row_to_container)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl Default for ContainerStore {
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
            CREATE TABLE user_containers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                container_id TEXT NOT NULL UNIQUE,
                container_name TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER DEFAULT (strftime('%s', 'now')),
                last_active INTEGER DEFAULT (strftime('%s', 'now')),
                resource_usage TEXT
            );
            "#,
        )
        .unwrap();
        conn
    }

    fn sample(container_id: &str, last_active: i64) -> ContainerRow {
        ContainerRow {
            user_id: "user-1".to_string(),
            container_id: container_id.to_string(),
            container_name: format!("warden-{container_id}"),
            status: ContainerStatusRow::Running,
            created_at: 0,
            last_active,
            resource_usage: None,
        }
    }

    #[test]
    fn upsert_then_get_by_user() {
        let conn = setup();
        let store = ContainerStore::new();
        store.upsert(&conn, &sample("c-1", 100)).unwrap();

        let loaded = store.get_by_user(&conn, "user-1").unwrap().unwrap();
        assert_eq!(loaded.container_id, "c-1");
    }

    #[test]
    fn list_idle_since_respects_cutoff() {
        let conn = setup();
        let store = ContainerStore::new();
        store.upsert(&conn, &sample("c-1", 50)).unwrap();
        store.upsert(&conn, &sample("c-2", 500)).unwrap();

        let idle = store.list_idle_since(&conn, 100).unwrap();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].container_id, "c-1");
    }

    #[test]
    fn set_status_then_not_returned_as_active() {
        let conn = setup();
        let store = ContainerStore::new();
        store.upsert(&conn, &sample("c-1", 100)).unwrap();
        store.set_status(&conn, "c-1", ContainerStatusRow::Stopped).unwrap();

        assert!(store.get_by_user(&conn, "user-1").unwrap().is_none());
        assert_eq!(store.list_active(&conn).unwrap().len(), 0);
    }
}

//! `container_states` table: serialized state-machine snapshot consulted by
//! C2's `restore_from_persistence` on boot.

use rusqlite::{Connection, OptionalExtension};

use super::DatabaseResult;

#[derive(Debug, Clone)]
pub struct ContainerStateRow {
    pub user_id: String,
    pub state_data: String,
    pub updated_at: i64,
}

pub struct ContainerStateStore;

impl ContainerStateStore {
    pub fn new() -> Self {
        Self
    }

    pub fn save(&self, conn: &Connection, row: &ContainerStateRow) -> DatabaseResult<()> {
        conn.execute(
            r#"
            INSERT INTO container_states (user_id, state_data, updated_at)
            VALUES (?1, ?2, strftime('%s', 'now'))
            ON CONFLICT(user_id) DO UPDATE SET
                state_data = excluded.state_data,
                updated_at = excluded.updated_at
            "#,
            rusqlite::params![row.user_id, row.state_data],
        )?;
        Ok(())
    }

    pub fn get(&self, conn: &Connection, user_id: &str) -> DatabaseResult<Option<ContainerStateRow>> {
        let mut stmt = conn.prepare(
            "SELECT user_id, state_data, updated_at FROM container_states WHERE user_id = ?1",
        )?;

        Ok(stmt
            .query_row([user_id], |row| {
                Ok(ContainerStateRow {
                    user_id: row.get(0)?,
                    state_data: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })
            .optional()?)
    }

    pub fn delete(&self, conn: &Connection, user_id: &str) -> DatabaseResult<()> {
        conn.execute("DELETE FROM container_states WHERE user_id = ?1", [user_id])?;
        Ok(())
    }

    pub fn all(&self, conn: &Connection) -> DatabaseResult<Vec<ContainerStateRow>> {
        let mut stmt = conn.prepare("SELECT user_id, state_data, updated_at FROM container_states")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ContainerStateRow {
                    user_id: row.get(0)?,
                    state_data: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl Default for ContainerStateStore {
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
            CREATE TABLE container_states (
                user_id TEXT PRIMARY KEY,
                state_data TEXT NOT NULL,
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
            "#,
        )
        .unwrap();
        conn
    }

    #[test]
    fn save_then_overwrite() {
        let conn = setup();
        let store = ContainerStateStore::new();

        store
            .save(&conn, &ContainerStateRow { user_id: "u1".into(), state_data: "{}".into(), updated_at: 0 })
            .unwrap();
        store
            .save(&conn, &ContainerStateRow { user_id: "u1".into(), state_data: "{\"x\":1}".into(), updated_at: 0 })
            .unwrap();

        let loaded = store.get(&conn, "u1").unwrap().unwrap();
        assert_eq!(loaded.state_data, "{\"x\":1}");
    }
}

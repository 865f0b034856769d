use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use super::{Claim, StoreError, Task, TaskStore};

const TASK_COLUMNS: &str =
    "task_id, image_data, extracted_json, error, claimed_at, created_at, updated_at";

/// SQLite-backed task store. Queries run on tokio's blocking pool.
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    /// Open or create the tasks table in the given database.
    /// Use `":memory:"` for tests.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        // WAL lets the credentials connection share the file without
        // tripping over in-flight task writes.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                task_id        TEXT PRIMARY KEY,
                image_data     BLOB NOT NULL,
                extracted_json TEXT,
                error          TEXT,
                claimed_at     TEXT,
                created_at     TEXT NOT NULL,
                updated_at     TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    /// Run `f` against the connection on tokio's blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut conn)
        })
        .await?
    }
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        task_id: row.get(0)?,
        image_data: row.get(1)?,
        extracted_json: row.get(2)?,
        error: row.get(3)?,
        claimed_at: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn select_task(conn: &Connection, task_id: &str) -> rusqlite::Result<Option<Task>> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
        [task_id],
        task_from_row,
    )
    .optional()
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, image_data: Vec<u8>) -> Result<String, StoreError> {
        self.with_conn(move |conn| {
            let task_id = Uuid::new_v4().to_string();
            let now = Utc::now();
            conn.execute(
                "INSERT INTO tasks (task_id, image_data, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![task_id, image_data, now],
            )?;
            Ok(task_id)
        })
        .await
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| Ok(select_task(conn, &task_id)?))
            .await
    }

    async fn claim(&self, task_id: &str) -> Result<Claim, StoreError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            // Dropping an uncommitted transaction rolls it back.
            let tx = conn.transaction()?;

            let Some(mut task) = select_task(&tx, &task_id)? else {
                return Ok(Claim::Missing);
            };
            if task.extracted_json.is_some() {
                return Ok(Claim::Finished);
            }
            if task.claimed_at.is_some() {
                return Ok(Claim::InProgress);
            }

            let now = Utc::now();
            tx.execute(
                "UPDATE tasks SET claimed_at = ?1, updated_at = ?1 WHERE task_id = ?2",
                params![now, task_id],
            )?;
            tx.commit()?;

            task.claimed_at = Some(now);
            task.updated_at = now;
            Ok(Claim::Acquired(task))
        })
        .await
    }

    async fn save_result(
        &self,
        task_id: &str,
        result: &Value,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let task_id = task_id.to_string();
        let result = result.clone();
        let error = error.map(str::to_string);
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE tasks SET extracted_json = ?1, error = ?2, updated_at = ?3
                 WHERE task_id = ?4",
                params![result, error, Utc::now(), task_id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(task_id));
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn reclaim_unfinished(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            tx.execute(
                "UPDATE tasks SET claimed_at = NULL, updated_at = ?1
                 WHERE extracted_json IS NULL AND claimed_at IS NOT NULL",
                [Utc::now()],
            )?;

            let ids = {
                let mut stmt = tx.prepare(
                    "SELECT task_id FROM tasks WHERE extracted_json IS NULL
                     ORDER BY created_at ASC, rowid ASC",
                )?;
                stmt.query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?
            };

            tx.commit()?;
            Ok(ids)
        })
        .await
    }
}

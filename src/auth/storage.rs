use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension};

/// Manages API keys in SQLite.
///
/// Shares a database with the task store; pass the same path used for
/// `SqliteTaskStore`.
pub struct AuthStorage {
    conn: Mutex<Connection>,
}

impl AuthStorage {
    /// Open or create a credentials table in the given database path.
    /// Use `":memory:"` for tests.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS credentials (
                provider TEXT PRIMARY KEY,
                api_key  TEXT NOT NULL
            )",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("credentials connection lock poisoned"))
    }

    /// Get the stored key for a provider.
    pub fn get(&self, provider: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let key = conn
            .query_row(
                "SELECT api_key FROM credentials WHERE provider = ?1",
                [provider],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key)
    }

    /// Store the key for a provider (upsert).
    pub fn set(&self, provider: &str, api_key: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO credentials (provider, api_key) VALUES (?1, ?2)
             ON CONFLICT(provider) DO UPDATE SET api_key = excluded.api_key",
            [provider, api_key],
        )?;
        Ok(())
    }

    /// Remove the key for a provider.
    pub fn remove(&self, provider: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM credentials WHERE provider = ?1", [provider])?;
        Ok(())
    }

    /// Get the API key for a provider.
    /// Priority: stored key → environment variable.
    pub fn get_api_key(&self, provider: &str, env_var: &str) -> Result<Option<String>> {
        if let Some(key) = self.get(provider)? {
            return Ok(Some(key));
        }

        if let Ok(key) = std::env::var(env_var)
            && !key.is_empty()
        {
            return Ok(Some(key));
        }

        Ok(None)
    }
}

//! Durable local key/value storage.
//!
//! The browser build of this client kept its session in `localStorage`; this
//! crate is that collaborator for native shells: a small rusqlite-backed
//! string store that survives restarts and is the source of truth re-read at
//! every boot.
//!
//! Change notification mirrors the browser contract: a process's own writes
//! are silent (the writer already knows), and [`LocalStore::notify_external`]
//! is how an embedding shell reports that *another* instance touched the
//! store — the session service re-hydrates in response.

pub mod migrations;

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::broadcast;
use tracing::info;

/// Well-known key holding the serialized session.
pub const SESSION_KEY: &str = "session";

pub struct LocalStore {
    conn: Mutex<Connection>,
    changes_tx: broadcast::Sender<String>,
}

impl LocalStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;

        migrations::run(&conn)?;

        info!("Local store opened at {}", path.display());
        Ok(Self::wrap(conn))
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::run(&conn)?;
        Ok(Self::wrap(conn))
    }

    fn wrap(conn: Connection) -> Self {
        let (changes_tx, _) = broadcast::channel(64);
        Self {
            conn: Mutex::new(conn),
            changes_tx,
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let value = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(value)
        })
    }

    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
                (key, value),
            )?;
            Ok(())
        })
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
            Ok(())
        })
    }

    /// Subscribe to external-change notifications. Yields the changed key.
    pub fn changes(&self) -> broadcast::Receiver<String> {
        self.changes_tx.subscribe()
    }

    /// Report that another instance of the application modified `key`.
    /// Local `put`/`remove` calls do not fire this; the browser `storage`
    /// event behaves the same way — only other tabs hear about a write.
    pub fn notify_external(&self, key: &str) {
        let _ = self.changes_tx.send(key.to_string());
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("store lock poisoned: {}", e))?;
        f(&conn)
    }
}

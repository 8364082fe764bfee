//! SQLite-backed record store
//!
//! Records are kept as JSON documents in a single table keyed by collection.
//! Predicates are evaluated in Rust after loading a collection, which is fine
//! for the handful of records a single host deploys.

use crate::store::{merge_patch, Filter, RecordStore};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Durable [`RecordStore`] with thread-safe access to one connection
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL keeps readers from blocking the writer
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: document table
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: records");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_records_collection ON records(collection);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    /// Load every `(rowid, record)` of a collection that matches `filter`
    fn select(conn: &Connection, collection: &str, filter: &Filter) -> Result<Vec<(i64, Value)>> {
        let mut stmt =
            conn.prepare("SELECT id, body FROM records WHERE collection = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map(params![collection], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut matched = Vec::new();
        for (id, body) in rows {
            let record: Value = serde_json::from_str(&body)
                .with_context(|| format!("Corrupt record {} in {}", id, collection))?;
            if filter.matches(&record) {
                matched.push((id, record));
            }
        }
        Ok(matched)
    }
}

impl RecordStore for SqliteStore {
    fn insert(&self, collection: &str, record: Value) -> Result<()> {
        if !record.is_object() {
            anyhow::bail!("records must be JSON objects");
        }
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO records (collection, body) VALUES (?1, ?2)",
            params![collection, serde_json::to_string(&record)?],
        )
        .context("Failed to insert record")?;
        Ok(())
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>> {
        let conn = self.conn.lock();
        Ok(Self::select(&conn, collection, filter)?
            .into_iter()
            .next()
            .map(|(_, record)| record))
    }

    fn find_many(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>> {
        let conn = self.conn.lock();
        Ok(Self::select(&conn, collection, filter)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    fn update(&self, collection: &str, filter: &Filter, patch: Value) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let matched = Self::select(&tx, collection, filter)?;
        for (id, mut record) in matched.iter().cloned() {
            merge_patch(&mut record, &patch);
            tx.execute(
                "UPDATE records SET body = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![serde_json::to_string(&record)?, id],
            )?;
        }
        tx.commit().context("Failed to update records")?;
        Ok(matched.len())
    }

    fn delete(&self, collection: &str, filter: &Filter) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let matched = Self::select(&tx, collection, filter)?;
        for (id, _) in &matched {
            tx.execute("DELETE FROM records WHERE id = ?1", params![id])?;
        }
        tx.commit().context("Failed to delete records")?;
        Ok(matched.len())
    }
}

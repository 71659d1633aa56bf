//! SQLite-backed ledger store
//!
//! One row per node. Compare-and-swap is a conditional `UPDATE` on the row's
//! version (or `INSERT … ON CONFLICT DO NOTHING` for a node that never
//! existed). Deletes null out `value_json` and bump the version.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{LedgerStore, MutateFn, MutateOutcome, Mutation, StoreError, StorePath};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS ledger_nodes (
    path TEXT PRIMARY KEY,
    value_json TEXT,
    version INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;
"#;

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    max_attempts: usize,
}

fn unavailable(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

impl SqliteStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open ledger db at {}", db_path))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory ledger db")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize ledger schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let nodes: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM ledger_nodes WHERE value_json IS NOT NULL",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);
        info!("📒 Ledger store ready ({} live nodes)", nodes);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_attempts: super::DEFAULT_MAX_ATTEMPTS,
        })
    }

    fn load(conn: &Connection, key: &str) -> Result<(Option<Value>, i64), StoreError> {
        let row: Option<(Option<String>, i64)> = conn
            .prepare_cached("SELECT value_json, version FROM ledger_nodes WHERE path = ?1")
            .and_then(|mut stmt| {
                stmt.query_row(params![key], |row| Ok((row.get(0)?, row.get(1)?)))
                    .optional()
            })
            .map_err(unavailable)?;

        match row {
            None => Ok((None, 0)),
            Some((None, version)) => Ok((None, version)),
            Some((Some(json), version)) => {
                let value = serde_json::from_str(&json).map_err(|e| StoreError::Corrupt {
                    path: key.to_string(),
                    reason: e.to_string(),
                })?;
                Ok((Some(value), version))
            }
        }
    }

    fn upsert(conn: &Connection, key: &str, json: Option<String>) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO ledger_nodes (path, value_json, version, updated_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(path) DO UPDATE SET
                value_json = excluded.value_json,
                version = ledger_nodes.version + 1,
                updated_at = excluded.updated_at",
            params![key, json, Utc::now().timestamp_millis()],
        )
        .map_err(unavailable)?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn read(&self, path: &StorePath) -> Result<Option<Value>, StoreError> {
        let conn = self.conn.lock().await;
        Ok(Self::load(&conn, path.as_str())?.0)
    }

    async fn write(&self, path: &StorePath, value: Value) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        Self::upsert(&conn, path.as_str(), Some(value.to_string()))
    }

    async fn remove(&self, path: &StorePath) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        Self::upsert(&conn, path.as_str(), None)
    }

    async fn list(&self, prefix: &StorePath) -> Result<Vec<(StorePath, Value)>, StoreError> {
        let (lo, hi) = prefix.descendant_range();
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "SELECT path, value_json FROM ledger_nodes
                 WHERE path >= ?1 AND path < ?2 AND value_json IS NOT NULL
                 ORDER BY path ASC",
            )
            .map_err(unavailable)?;

        let rows = stmt
            .query_map(params![lo, hi], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(unavailable)?;

        let mut out = Vec::new();
        for row in rows {
            let (path, json) = row.map_err(unavailable)?;
            let value = serde_json::from_str(&json).map_err(|e| StoreError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            out.push((StorePath::parse(&path)?, value));
        }
        Ok(out)
    }

    async fn mutate(
        &self,
        path: &StorePath,
        f: &MutateFn<'_>,
    ) -> Result<MutateOutcome, StoreError> {
        let key = path.as_str();

        for _ in 0..self.max_attempts {
            let (current, version) = {
                let conn = self.conn.lock().await;
                Self::load(&conn, key)?
            };

            let next = match f(current.as_ref()) {
                Mutation::Abort => return Ok(MutateOutcome::Aborted { current }),
                Mutation::Set(v) => Some(v),
                Mutation::Delete => None,
            };
            let json = next.as_ref().map(|v| v.to_string());
            let now = Utc::now().timestamp_millis();

            let changed = {
                let conn = self.conn.lock().await;
                if version == 0 {
                    conn.execute(
                        "INSERT INTO ledger_nodes (path, value_json, version, updated_at)
                         VALUES (?1, ?2, 1, ?3)
                         ON CONFLICT(path) DO NOTHING",
                        params![key, json, now],
                    )
                } else {
                    conn.execute(
                        "UPDATE ledger_nodes
                         SET value_json = ?2, version = version + 1, updated_at = ?3
                         WHERE path = ?1 AND version = ?4",
                        params![key, json, now, version],
                    )
                }
                .map_err(unavailable)?
            };

            if changed == 1 {
                return Ok(MutateOutcome::Committed {
                    before: current,
                    after: next,
                });
            }

            tokio::task::yield_now().await;
        }

        Err(StoreError::Contention {
            path: key.to_string(),
            attempts: self.max_attempts,
        })
    }
}

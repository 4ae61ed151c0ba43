use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use dbsentinel_core::{LifecycleStatus, NewStatusRecord, StatusRecord};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::store::StateStore;

const SELECT_COLUMNS: &str = "SELECT id, status, last_known_state, error_count, last_error,
     last_reset_at, last_backup_at, last_restore_at, created_at, updated_at
     FROM system_status";

/// SQLite-backed audit log for local operation. Each method opens a fresh
/// connection on the blocking pool.
pub struct SqliteStateStore {
    db_path: PathBuf,
}

impl SqliteStateStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create state directory {}", parent.display()))?;
        }
        let store = Self { db_path };
        store.init_db()?;
        Ok(store)
    }

    fn init_db(&self) -> Result<()> {
        let conn = open(&self.db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS system_status (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL
                    CHECK (status IN ('initialized', 'reset', 'backup', 'restore', 'error')),
                last_known_state TEXT NOT NULL,
                error_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                last_reset_at TEXT,
                last_backup_at TEXT,
                last_restore_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS system_status_created_at ON system_status (created_at);",
        )?;
        Ok(())
    }

    async fn query_records(&self, sql: String, limit: i64) -> Result<Vec<StatusRecord>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([limit], row_to_record)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await?
    }
}

fn open(path: &Path) -> Result<Connection> {
    Connection::open(path).with_context(|| format!("open state db {}", path.display()))
}

#[async_trait::async_trait]
impl StateStore for SqliteStateStore {
    async fn append(&self, record: NewStatusRecord) -> Result<StatusRecord> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open(&db_path)?;
            // IMMEDIATE takes the write lock before reading the running count.
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            let current: i64 = tx.query_row(
                "SELECT COALESCE(MAX(error_count), 0) FROM system_status",
                [],
                |row| row.get(0),
            )?;

            let now = Utc::now();
            let stamps = record.event_timestamps(now);
            let stored = StatusRecord {
                id: Uuid::new_v4(),
                status: record.status,
                error_count: record.next_error_count(current),
                last_known_state: record.last_known_state,
                last_error: record.last_error,
                last_reset_at: stamps.reset_at,
                last_backup_at: stamps.backup_at,
                last_restore_at: stamps.restore_at,
                created_at: now,
                updated_at: now,
            };

            tx.execute(
                "INSERT INTO system_status (id, status, last_known_state, error_count, last_error,
                 last_reset_at, last_backup_at, last_restore_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    stored.id.to_string(),
                    stored.status.as_str(),
                    serde_json::to_string(&stored.last_known_state)?,
                    stored.error_count,
                    stored.last_error.as_ref().map(serde_json::to_string).transpose()?,
                    stored.last_reset_at.map(ts_str),
                    stored.last_backup_at.map(ts_str),
                    stored.last_restore_at.map(ts_str),
                    ts_str(stored.created_at),
                    ts_str(stored.updated_at),
                ],
            )?;
            tx.commit()?;
            Ok(stored)
        })
        .await?
    }

    async fn latest(&self) -> Result<Option<StatusRecord>> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY created_at DESC, rowid DESC LIMIT ?1");
        Ok(self.query_records(sql, 1).await?.into_iter().next())
    }

    async fn latest_backup_time(&self) -> Result<Option<DateTime<Utc>>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            let raw: Option<String> = conn
                .query_row(
                    "SELECT last_backup_at FROM system_status
                     WHERE last_backup_at IS NOT NULL
                     ORDER BY last_backup_at DESC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|s| parse_ts(&s).map_err(anyhow::Error::from))
                .transpose()
        })
        .await?
    }

    async fn history(&self, limit: usize) -> Result<Vec<StatusRecord>> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY created_at DESC, rowid DESC LIMIT ?1");
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.query_records(sql, limit).await
    }
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn ts_str(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<StatusRecord> {
    let id: String = row.get(0)?;
    let status: String = row.get(1)?;
    let state: String = row.get(2)?;
    let last_error: Option<String> = row.get(4)?;
    Ok(StatusRecord {
        id: Uuid::parse_str(&id).map_err(|e| conversion_err(0, e))?,
        status: status
            .parse::<LifecycleStatus>()
            .map_err(|e| conversion_err(1, StatusParseError(e)))?,
        last_known_state: serde_json::from_str(&state).map_err(|e| conversion_err(2, e))?,
        error_count: row.get(3)?,
        last_error: last_error
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| conversion_err(4, e))?,
        last_reset_at: opt_ts(row, 5)?,
        last_backup_at: opt_ts(row, 6)?,
        last_restore_at: opt_ts(row, 7)?,
        created_at: ts(row, 8)?,
        updated_at: ts(row, 9)?,
    })
}

fn ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| conversion_err(idx, e))
}

fn opt_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(&s).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug)]
struct StatusParseError(String);

impl std::fmt::Display for StatusParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for StatusParseError {}

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

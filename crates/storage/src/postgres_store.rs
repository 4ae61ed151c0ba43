use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dbsentinel_core::{ConnectionParams, EntityName, LifecycleStatus, NewStatusRecord, StatusRecord};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::probe::HealthSource;
use crate::store::StateStore;

/// Enum type of the audit table's `status` column unless configured otherwise.
pub const DEFAULT_STATUS_TYPE: &str = "system_status_type";

const RECORD_COLUMNS: &str = "id, status::text AS status, last_known_state, error_count, last_error,
     last_reset_at, last_backup_at, last_restore_at, created_at, updated_at";

/// Builds a pool that connects on first use, so an unreachable database at
/// startup surfaces as a probe failure rather than a fatal error.
pub fn connect_lazy(params: &ConnectionParams, acquire_timeout: Duration) -> PgPool {
    let options = PgConnectOptions::new()
        .host(&params.host)
        .port(params.port)
        .username(&params.user)
        .password(&params.password)
        .database(&params.database);
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(acquire_timeout)
        .connect_lazy_with(options)
}

/// Postgres-backed audit log living next to the monitored data.
///
/// Only the columns of the `system_status` table are relied on: `id`,
/// `status` (an enum named by `status_type`), the JSON payloads, the
/// running error count and the timestamps.
#[derive(Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
    status_type: EntityName,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool, status_type: EntityName) -> Self {
        Self { pool, status_type }
    }

    /// Creates the status enum and audit table when they are missing.
    /// Existing objects are left as is.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(&create_type_sql(&self.status_type))
            .execute(&self.pool)
            .await
            .with_context(|| format!("create {} type", self.status_type))?;

        sqlx::query(&create_table_sql(&self.status_type))
            .execute(&self.pool)
            .await
            .context("create system_status table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS system_status_created_at_idx
             ON system_status (created_at DESC)",
        )
        .execute(&self.pool)
        .await
        .context("create system_status index")?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl StateStore for PostgresStateStore {
    async fn append(&self, record: NewStatusRecord) -> Result<StatusRecord> {
        let mut tx = self.pool.begin().await.context("begin audit transaction")?;

        // Serializes appenders so the running error count stays monotonic.
        sqlx::query("LOCK TABLE system_status IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .context("lock system_status")?;

        let row = sqlx::query(&insert_sql(&self.status_type))
            .bind(Uuid::new_v4())
            .bind(record.status.as_str())
            .bind(&record.last_known_state)
            .bind(&record.last_error)
            .bind(record.backup_at)
            .fetch_one(&mut *tx)
            .await
            .context("insert status record")?;

        tx.commit().await.context("commit audit transaction")?;
        pg_row_to_record(&row)
    }

    async fn latest(&self) -> Result<Option<StatusRecord>> {
        let row = sqlx::query(&select_sql("LIMIT 1"))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(pg_row_to_record).transpose()
    }

    async fn latest_backup_time(&self) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(last_backup_at) FROM system_status")
                .fetch_one(&self.pool)
                .await?;
        Ok(latest)
    }

    async fn history(&self, limit: usize) -> Result<Vec<StatusRecord>> {
        let rows = sqlx::query(&select_sql("LIMIT $1"))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(pg_row_to_record).collect()
    }
}

fn create_type_sql(status_type: &EntityName) -> String {
    format!(
        "DO $$ BEGIN
             CREATE TYPE {} AS ENUM ('initialized', 'reset', 'backup', 'restore', 'error');
         EXCEPTION WHEN duplicate_object THEN NULL;
         END $$",
        status_type.quoted()
    )
}

fn create_table_sql(status_type: &EntityName) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS system_status (
             id UUID PRIMARY KEY,
             status {} NOT NULL,
             last_known_state JSONB NOT NULL DEFAULT '{{}}'::jsonb,
             error_count BIGINT NOT NULL DEFAULT 0,
             last_error JSONB,
             last_reset_at TIMESTAMPTZ,
             last_backup_at TIMESTAMPTZ,
             last_restore_at TIMESTAMPTZ,
             created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
             updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
         )",
        status_type.quoted()
    )
}

/// The single write path. Error count and event timestamps are derived
/// server-side from the status value.
fn insert_sql(status_type: &EntityName) -> String {
    format!(
        "INSERT INTO system_status (id, status, last_known_state, error_count, last_error,
             last_reset_at, last_backup_at, last_restore_at, created_at, updated_at)
         SELECT $1::uuid, $2::text::{status_type}, $3::jsonb,
             COALESCE(MAX(error_count), 0) + CASE WHEN $2::text = 'error' THEN 1 ELSE 0 END,
             $4::jsonb,
             CASE WHEN $2::text = 'reset' THEN now() END,
             CASE WHEN $2::text = 'backup' THEN COALESCE($5::timestamptz, now())
                  ELSE $5::timestamptz END,
             CASE WHEN $2::text = 'restore' THEN now() END,
             now(), now()
         FROM system_status
         RETURNING {RECORD_COLUMNS}",
        status_type = status_type.quoted()
    )
}

fn select_sql(limit: &str) -> String {
    format!("SELECT {RECORD_COLUMNS} FROM system_status ORDER BY created_at DESC, id DESC {limit}")
}

fn pg_row_to_record(row: &PgRow) -> Result<StatusRecord> {
    let status: String = row.try_get("status")?;
    Ok(StatusRecord {
        id: row.try_get("id")?,
        status: status
            .parse::<LifecycleStatus>()
            .map_err(anyhow::Error::msg)?,
        last_known_state: row.try_get("last_known_state")?,
        error_count: row.try_get("error_count")?,
        last_error: row.try_get("last_error")?,
        last_reset_at: row.try_get("last_reset_at")?,
        last_backup_at: row.try_get("last_backup_at")?,
        last_restore_at: row.try_get("last_restore_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Read surface of the monitored Postgres database.
#[derive(Clone)]
pub struct PostgresHealthSource {
    pool: PgPool,
}

impl PostgresHealthSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl HealthSource for PostgresHealthSource {
    async fn ping(&self) -> Result<()> {
        let _version: String = sqlx::query_scalar("SELECT version()")
            .fetch_one(&self.pool)
            .await
            .context("select version()")?;
        Ok(())
    }

    async fn count_rows(&self, entity: &EntityName) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", entity.quoted());
        let count: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("count rows in {entity}"))?;
        u64::try_from(count).context("negative row count")
    }
}

use anyhow::Result;
use chrono::{DateTime, Utc};
use dbsentinel_core::{NewStatusRecord, StatusRecord};

/// Append-only audit log of lifecycle transitions, implemented by both the
/// SQLite and Postgres backends.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Insert a record and return it with its generated id, error count and
    /// timestamps. Never touches existing rows.
    async fn append(&self, record: NewStatusRecord) -> Result<StatusRecord>;

    /// Most recently created record.
    async fn latest(&self) -> Result<Option<StatusRecord>>;

    /// Most recent non-null backup timestamp across all history.
    async fn latest_backup_time(&self) -> Result<Option<DateTime<Utc>>>;

    /// Up to `limit` records ordered by created_at DESC.
    async fn history(&self, limit: usize) -> Result<Vec<StatusRecord>>;
}

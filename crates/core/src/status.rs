use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::artifact::BackupArtifact;
use crate::snapshot::{HealthStatus, Snapshot};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    Initialized,
    Reset,
    Backup,
    Restore,
    Error,
}

impl LifecycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleStatus::Initialized => "initialized",
            LifecycleStatus::Reset => "reset",
            LifecycleStatus::Backup => "backup",
            LifecycleStatus::Restore => "restore",
            LifecycleStatus::Error => "error",
        }
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(LifecycleStatus::Initialized),
            "reset" => Ok(LifecycleStatus::Reset),
            "backup" => Ok(LifecycleStatus::Backup),
            "restore" => Ok(LifecycleStatus::Restore),
            "error" => Ok(LifecycleStatus::Error),
            other => Err(format!("unknown lifecycle status: {other}")),
        }
    }
}

/// Audit records carry a coarse two-valued status; detail lives in the payload.
impl From<HealthStatus> for LifecycleStatus {
    fn from(status: HealthStatus) -> Self {
        match status {
            HealthStatus::Healthy => LifecycleStatus::Initialized,
            HealthStatus::Warning | HealthStatus::Error => LifecycleStatus::Error,
        }
    }
}

/// A persisted audit entry. Never rewritten once stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusRecord {
    pub id: Uuid,
    pub status: LifecycleStatus,
    pub last_known_state: Value,
    pub error_count: i64,
    pub last_error: Option<Value>,
    pub last_reset_at: Option<DateTime<Utc>>,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub last_restore_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An audit entry waiting to be appended. Id, error count and timestamps are
/// assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStatusRecord {
    pub status: LifecycleStatus,
    pub last_known_state: Value,
    pub last_error: Option<Value>,
    /// Completion time of a backup taken while producing this record.
    pub backup_at: Option<DateTime<Utc>>,
}

/// Event timestamp columns derived from a record's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventTimestamps {
    pub reset_at: Option<DateTime<Utc>>,
    pub backup_at: Option<DateTime<Utc>>,
    pub restore_at: Option<DateTime<Utc>>,
}

impl NewStatusRecord {
    /// The record appended at the end of every monitor tick.
    pub fn from_snapshot(snapshot: &Snapshot, backup: Option<&BackupArtifact>) -> Self {
        let last_error = (!snapshot.is_healthy()).then(|| {
            json!({
                "status": snapshot.status,
                "errors": snapshot.errors,
                "warnings": snapshot.warnings,
            })
        });
        Self {
            status: snapshot.status.into(),
            last_known_state: json!({ "snapshot": snapshot, "backup": backup }),
            last_error,
            backup_at: backup.map(|a| a.created_at),
        }
    }

    pub fn backup(artifact: &BackupArtifact) -> Self {
        Self {
            status: LifecycleStatus::Backup,
            last_known_state: json!({ "backup": artifact }),
            last_error: None,
            backup_at: Some(artifact.created_at),
        }
    }

    pub fn restore(artifact: &Path) -> Self {
        Self {
            status: LifecycleStatus::Restore,
            last_known_state: json!({ "restoredFrom": artifact.display().to_string() }),
            last_error: None,
            backup_at: None,
        }
    }

    pub fn reset(context: Value) -> Self {
        Self {
            status: LifecycleStatus::Reset,
            last_known_state: context,
            last_error: None,
            backup_at: None,
        }
    }

    /// An `error` record for a failed lifecycle operation.
    pub fn failure(operation: &str, message: impl fmt::Display) -> Self {
        let message = message.to_string();
        Self {
            status: LifecycleStatus::Error,
            last_known_state: json!({ "operation": operation }),
            last_error: Some(json!({ "operation": operation, "message": message })),
            backup_at: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == LifecycleStatus::Error
    }

    /// Running error count after appending this record on top of `current`.
    pub fn next_error_count(&self, current: i64) -> i64 {
        if self.is_error() {
            current + 1
        } else {
            current
        }
    }

    pub fn event_timestamps(&self, now: DateTime<Utc>) -> EventTimestamps {
        let at = |status: LifecycleStatus| (self.status == status).then_some(now);
        EventTimestamps {
            reset_at: at(LifecycleStatus::Reset),
            backup_at: self.backup_at.or(at(LifecycleStatus::Backup)),
            restore_at: at(LifecycleStatus::Restore),
        }
    }
}

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health classification of a snapshot. Ordered so that `max` escalates:
/// error outranks warning outranks healthy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Error => "error",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One point-in-time observation of the database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub status: HealthStatus,
    pub observed_at: DateTime<Utc>,
    pub table_counts: BTreeMap<String, u64>,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl Snapshot {
    /// A raw probe result, not yet classified.
    pub fn observed(
        observed_at: DateTime<Utc>,
        table_counts: BTreeMap<String, u64>,
        errors: Vec<String>,
    ) -> Self {
        Self {
            status: HealthStatus::Healthy,
            observed_at,
            table_counts,
            last_backup_at: None,
            warnings: Vec::new(),
            errors,
        }
    }

    /// Stand-in snapshot for a tick where the database could not be reached.
    pub fn unreachable(observed_at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Error,
            observed_at,
            table_counts: BTreeMap::new(),
            last_backup_at: None,
            warnings: Vec::new(),
            errors: vec![reason.into()],
        }
    }

    pub fn escalate(&mut self, status: HealthStatus) {
        self.status = self.status.max(status);
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.escalate(HealthStatus::Error);
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

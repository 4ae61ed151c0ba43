use std::fmt;
use std::fs;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dbsentinel_backup::BackupRunner;
use dbsentinel_core::{
    classify, BackupArtifact, BackupError, EntityName, NewStatusRecord, Snapshot, StatusRecord,
};
use dbsentinel_storage::{HealthProbe, StateStore};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Tunables of the monitoring cycle.
#[derive(Debug, Clone)]
pub struct MonitorPolicy {
    pub critical_entities: Vec<EntityName>,
    pub check_interval: Duration,
    /// Fractional drop in a row count that counts as data loss.
    pub data_loss_threshold: f64,
    /// A backup older than this triggers a new one.
    pub backup_max_age: chrono::Duration,
}

/// Why a tick decided to take a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupTrigger {
    DataLoss,
    NoPriorBackup,
    Stale { last_backup_at: DateTime<Utc> },
}

impl fmt::Display for BackupTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupTrigger::DataLoss => f.write_str("data loss detected"),
            BackupTrigger::NoPriorBackup => f.write_str("no prior backup"),
            BackupTrigger::Stale { last_backup_at } => {
                write!(f, "last backup at {last_backup_at} is stale")
            }
        }
    }
}

/// What one tick observed, did and recorded.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub snapshot: Snapshot,
    pub trigger: Option<BackupTrigger>,
    pub backup: Option<BackupArtifact>,
    /// `None` when the audit write itself failed.
    pub record: Option<StatusRecord>,
}

/// Periodic probe → classify → backup → record cycle.
///
/// Owns the baseline snapshot used for data-loss comparisons; nothing else
/// reads or writes it, and it is replaced at the end of every tick.
pub struct MonitorLoop {
    probe: HealthProbe,
    backup: Arc<dyn BackupRunner>,
    store: Arc<dyn StateStore>,
    policy: MonitorPolicy,
    last_known: Option<Snapshot>,
}

impl MonitorLoop {
    pub fn new(
        probe: HealthProbe,
        backup: Arc<dyn BackupRunner>,
        store: Arc<dyn StateStore>,
        policy: MonitorPolicy,
    ) -> Self {
        Self {
            probe,
            backup,
            store,
            policy,
            last_known: None,
        }
    }

    /// Starts from a known baseline instead of treating the first tick as a first run.
    pub fn with_baseline(mut self, snapshot: Snapshot) -> Self {
        self.last_known = Some(snapshot);
        self
    }

    pub fn last_known_snapshot(&self) -> Option<&Snapshot> {
        self.last_known.as_ref()
    }

    /// Ticks every `check_interval` until `shutdown` flips to true or its
    /// sender goes away. Ticks never overlap, and a tick in progress is
    /// allowed to finish.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.policy.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.policy.check_interval.as_secs(),
            tables = self.policy.critical_entities.len(),
            "monitor loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("monitor loop stopped");
    }

    /// Runs one full cycle. Never fails: every problem ends up in the
    /// snapshot, and exactly one audit record is appended.
    pub async fn tick(&mut self) -> TickReport {
        let last_backup_at = match self.store.latest_backup_time().await {
            Ok(at) => at,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "could not read last backup time");
                None
            }
        };

        let (snapshot, trigger, backup) =
            match self.probe.probe(&self.policy.critical_entities).await {
                Ok(observed) => {
                    let mut snapshot = classify(
                        observed,
                        self.last_known.as_ref(),
                        self.policy.data_loss_threshold,
                    );
                    snapshot.last_backup_at = last_backup_at;
                    let trigger = self.backup_trigger(&snapshot, Utc::now());
                    let backup = match trigger {
                        Some(trigger) => self.take_backup(&mut snapshot, trigger).await,
                        None => None,
                    };
                    (snapshot, trigger, backup)
                }
                Err(e) => {
                    warn!(error = %e, "health probe failed");
                    let mut snapshot = Snapshot::unreachable(Utc::now(), e.to_string());
                    snapshot.last_backup_at = last_backup_at;
                    (snapshot, None, None)
                }
            };

        let record = match self
            .store
            .append(NewStatusRecord::from_snapshot(&snapshot, backup.as_ref()))
            .await
        {
            Ok(record) => Some(record),
            Err(e) => {
                error!(error = %format!("{e:#}"), status = %snapshot.status, "failed to persist status record");
                None
            }
        };

        info!(
            status = %snapshot.status,
            warnings = snapshot.warnings.len(),
            errors = snapshot.errors.len(),
            backup = backup.is_some(),
            "monitor tick complete"
        );

        self.last_known = Some(snapshot.clone());
        TickReport {
            snapshot,
            trigger,
            backup,
            record,
        }
    }

    /// Any one condition suffices: data loss, no backup on record, or a
    /// backup older than the configured maximum age.
    pub fn backup_trigger(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> Option<BackupTrigger> {
        if !snapshot.warnings.is_empty() {
            return Some(BackupTrigger::DataLoss);
        }
        match snapshot.last_backup_at {
            None => Some(BackupTrigger::NoPriorBackup),
            Some(at) if now - at > self.policy.backup_max_age => {
                Some(BackupTrigger::Stale { last_backup_at: at })
            }
            Some(_) => None,
        }
    }

    async fn take_backup(
        &self,
        snapshot: &mut Snapshot,
        trigger: BackupTrigger,
    ) -> Option<BackupArtifact> {
        info!(%trigger, "backup triggered");
        match self.backup.run().await.and_then(verify_artifact) {
            Ok(artifact) => {
                snapshot.last_backup_at = Some(artifact.created_at);
                Some(artifact)
            }
            Err(e) => {
                error!(error = %e, %trigger, "backup failed");
                snapshot.record_error(format!("Backup failed: {e}"));
                None
            }
        }
    }
}

/// An empty artifact is a failed backup and is not kept.
fn verify_artifact(artifact: BackupArtifact) -> Result<BackupArtifact, BackupError> {
    if artifact.is_valid() {
        return Ok(artifact);
    }
    if let Err(e) = fs::remove_file(&artifact.path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(error = %e, path = %artifact.path.display(), "failed to remove empty artifact");
        }
    }
    Err(BackupError::EmptyArtifact(artifact.path))
}

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use dbsentinel_core::{CountError, EntityName, ProbeError, Snapshot};
use futures::future::join_all;
use tracing::{debug, warn};

/// Minimal read surface the probe needs from the monitored database.
#[async_trait::async_trait]
pub trait HealthSource: Send + Sync {
    /// Trivial round trip proving the database answers at all.
    async fn ping(&self) -> Result<()>;

    /// Exact row count of one table.
    async fn count_rows(&self, entity: &EntityName) -> Result<u64>;
}

/// Takes one point-in-time reading of connectivity and critical row counts.
#[derive(Clone)]
pub struct HealthProbe {
    source: Arc<dyn HealthSource>,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(source: Arc<dyn HealthSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    /// Probes the database. Fails only when the connectivity check fails or
    /// the whole probe times out; a table that cannot be counted is reported
    /// in the snapshot's `errors` and left out of `table_counts`.
    pub async fn probe(&self, entities: &[EntityName]) -> Result<Snapshot, ProbeError> {
        match tokio::time::timeout(self.timeout, self.observe(entities)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        }
    }

    async fn observe(&self, entities: &[EntityName]) -> Result<Snapshot, ProbeError> {
        self.source
            .ping()
            .await
            .map_err(|e| ProbeError::Connectivity(format!("{e:#}")))?;

        let counts = join_all(entities.iter().map(|entity| async move {
            (entity, self.source.count_rows(entity).await)
        }))
        .await;

        let mut table_counts = BTreeMap::new();
        let mut errors = Vec::new();
        for (entity, result) in counts {
            match result {
                Ok(count) => {
                    debug!(%entity, count, "counted rows");
                    table_counts.insert(entity.to_string(), count);
                }
                Err(e) => {
                    let err = CountError {
                        entity: entity.to_string(),
                        message: format!("{e:#}"),
                    };
                    warn!(error = %err, "row count failed");
                    errors.push(err.to_string());
                }
            }
        }

        Ok(Snapshot::observed(Utc::now(), table_counts, errors))
    }
}

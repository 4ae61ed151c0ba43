use crate::snapshot::{HealthStatus, Snapshot};

/// Relative drop in a row count beyond which a data-loss warning is raised.
pub const DEFAULT_DATA_LOSS_THRESHOLD: f64 = 0.1;

/// Classifies `current` against the previous tick's snapshot.
///
/// Every entity observed in both snapshots whose count fell by more than
/// `threshold` (a fraction of the previous count) gets one warning. Entities
/// missing from `previous` are not compared. Probe errors force `error`
/// regardless of warnings.
pub fn classify(mut current: Snapshot, previous: Option<&Snapshot>, threshold: f64) -> Snapshot {
    if let Some(previous) = previous {
        for (entity, &cur) in &current.table_counts {
            let Some(&prev) = previous.table_counts.get(entity) else {
                continue;
            };
            if is_significant_loss(prev, cur, threshold) {
                current.warnings.push(data_loss_warning(entity, prev, cur));
            }
        }
    }

    let derived = if !current.errors.is_empty() {
        HealthStatus::Error
    } else if !current.warnings.is_empty() {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    };
    current.escalate(derived);
    current
}

fn is_significant_loss(prev: u64, cur: u64, threshold: f64) -> bool {
    let prev = prev as f64;
    (cur as f64) < prev - prev * threshold
}

pub fn data_loss_warning(entity: &str, prev: u64, cur: u64) -> String {
    format!("Significant data loss detected in {entity}: Previous={prev}, Current={cur}")
}

use std::path::PathBuf;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

const ARTIFACT_PREFIX: &str = "backup-";
const ARTIFACT_SUFFIX: &str = ".sql.zst";

/// A compressed dump on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl BackupArtifact {
    /// An empty artifact never counts as a successful backup.
    pub fn is_valid(&self) -> bool {
        self.size_bytes > 0
    }
}

/// Bounds on the set of artifacts kept in the backup directory. The two
/// rules apply independently.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_count: usize,
    pub max_age_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_count: 5,
            max_age_days: 7,
        }
    }
}

impl RetentionPolicy {
    /// Returns the artifacts this policy removes, newest first.
    ///
    /// Anything past the `max_count` most recent artifacts goes, as does
    /// anything older than `max_age_days` at `now`.
    pub fn expired<'a>(
        &self,
        artifacts: &'a [BackupArtifact],
        now: DateTime<Utc>,
    ) -> Vec<&'a BackupArtifact> {
        let mut ordered: Vec<&BackupArtifact> = artifacts.iter().collect();
        ordered.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.path.cmp(&a.path))
        });

        let max_age = Duration::days(i64::from(self.max_age_days));
        ordered
            .into_iter()
            .enumerate()
            .filter(|(rank, artifact)| *rank >= self.max_count || now - artifact.created_at > max_age)
            .map(|(_, artifact)| artifact)
            .collect()
    }
}

/// File name for an artifact created at `now`. Colons are replaced so the
/// name is filesystem-safe, and names sort lexically in creation order.
pub fn artifact_file_name(now: DateTime<Utc>) -> String {
    let stamp = now
        .to_rfc3339_opts(SecondsFormat::Micros, true)
        .replace(':', "-");
    format!("{ARTIFACT_PREFIX}{stamp}{ARTIFACT_SUFFIX}")
}

pub fn is_artifact_file_name(name: &str) -> bool {
    name.starts_with(ARTIFACT_PREFIX) && name.ends_with(ARTIFACT_SUFFIX)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .expect("rfc3339")
            .with_timezone(&Utc)
    }

    fn artifact(name: &str, created_at: DateTime<Utc>) -> BackupArtifact {
        BackupArtifact {
            path: PathBuf::from(name),
            created_at,
            size_bytes: 10,
            sha256: None,
        }
    }

    #[test]
    fn file_name_is_path_safe_and_sortable() {
        let name = artifact_file_name(at("2026-02-13T01:00:00Z"));
        assert_eq!(name, "backup-2026-02-13T01-00-00.000000Z.sql.zst");
        assert!(!Path::new(&name).has_root());
        assert!(!name.contains(':'));
        assert!(is_artifact_file_name(&name));

        let later = artifact_file_name(at("2026-02-13T01:00:00.5Z"));
        assert!(later > name);
    }

    #[test]
    fn names_within_the_same_millisecond_differ() {
        let first = artifact_file_name(at("2026-02-13T01:00:00.123001Z"));
        let second = artifact_file_name(at("2026-02-13T01:00:00.123002Z"));
        assert_ne!(first, second);
        assert!(second > first);
    }

    #[test]
    fn unrelated_files_are_not_artifacts() {
        assert!(!is_artifact_file_name("notes.txt"));
        assert!(!is_artifact_file_name("backup-2026.sql"));
    }

    #[test]
    fn six_recent_artifacts_with_max_five_drops_the_oldest() {
        let now = at("2026-03-01T12:00:00Z");
        let artifacts: Vec<BackupArtifact> = (0..6)
            .map(|i| artifact(&format!("b{i}"), now - Duration::hours(i)))
            .collect();
        let policy = RetentionPolicy {
            max_count: 5,
            max_age_days: 7,
        };

        let expired = policy.expired(&artifacts, now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].path, PathBuf::from("b5"));
    }

    #[test]
    fn age_and_count_rules_are_a_union() {
        let now = at("2026-03-01T12:00:00Z");
        let artifacts = vec![
            artifact("fresh", now - Duration::hours(1)),
            artifact("old", now - Duration::days(10)),
            artifact("older", now - Duration::days(11)),
        ];
        let policy = RetentionPolicy {
            max_count: 2,
            max_age_days: 7,
        };

        let expired: Vec<_> = policy
            .expired(&artifacts, now)
            .into_iter()
            .map(|a| a.path.clone())
            .collect();
        assert_eq!(expired, vec![PathBuf::from("old"), PathBuf::from("older")]);
    }

    #[test]
    fn empty_artifact_is_invalid() {
        let mut a = artifact("b", Utc::now());
        assert!(a.is_valid());
        a.size_bytes = 0;
        assert!(!a.is_valid());
    }
}

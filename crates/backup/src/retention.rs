//! Retention sweep over the artifacts in a backup directory.

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use dbsentinel_core::{is_artifact_file_name, BackupArtifact, RetentionPolicy};
use tracing::debug;

/// Lists the artifacts in `dir`, dated by modification time. A missing
/// directory has no artifacts.
pub fn list_artifacts(dir: &Path) -> io::Result<Vec<BackupArtifact>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut artifacts = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_str().is_some_and(is_artifact_file_name) {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        artifacts.push(BackupArtifact {
            path: entry.path(),
            created_at: DateTime::<Utc>::from(meta.modified()?),
            size_bytes: meta.len(),
            sha256: None,
        });
    }
    Ok(artifacts)
}

/// Deletes every artifact the policy expires at `now` and returns them.
/// `keep` is never removed, even when the policy expires it.
pub fn sweep(
    dir: &Path,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
    keep: Option<&Path>,
) -> io::Result<Vec<BackupArtifact>> {
    let artifacts = list_artifacts(dir)?;
    let expired: Vec<BackupArtifact> = policy
        .expired(&artifacts, now)
        .into_iter()
        .filter(|artifact| keep != Some(artifact.path.as_path()))
        .cloned()
        .collect();
    for artifact in &expired {
        debug!(artifact = %artifact.path.display(), "removing expired backup");
        match fs::remove_file(&artifact.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(expired)
}

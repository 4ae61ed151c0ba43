use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use dbsentinel_core::{
    artifact_file_name, file_sha256, BackupArtifact, BackupError, ConnectionParams, RetentionPolicy,
};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::command::CommandSpec;
use crate::retention;

pub(crate) const CHUNK_SIZE: usize = 64 * 1024;
pub(crate) const PENDING_CHUNKS: usize = 16;

/// Produces one verified backup artifact.
#[async_trait::async_trait]
pub trait BackupRunner: Send + Sync {
    async fn run(&self) -> Result<BackupArtifact, BackupError>;
}

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub dir: PathBuf,
    pub connection: ConnectionParams,
    pub dump: CommandSpec,
    pub restore: CommandSpec,
    pub retention: RetentionPolicy,
    pub timeout: Duration,
    pub compression_level: i32,
}

impl BackupSettings {
    pub fn new(dir: impl Into<PathBuf>, connection: ConnectionParams) -> Self {
        Self {
            dir: dir.into(),
            connection,
            dump: CommandSpec::pg_dump(),
            restore: CommandSpec::psql(),
            retention: RetentionPolicy::default(),
            timeout: Duration::from_secs(3600),
            compression_level: 3,
        }
    }
}

/// Runs the dump command, compresses its output into a timestamp-named
/// artifact, verifies it and applies the retention policy. Does not write
/// audit records; callers decide how to record the outcome.
#[derive(Debug, Clone)]
pub struct BackupExecutor {
    pub(crate) settings: BackupSettings,
}

impl BackupExecutor {
    pub fn new(settings: BackupSettings) -> Self {
        Self { settings }
    }

    pub async fn backup(&self) -> Result<BackupArtifact, BackupError> {
        let created_at = Utc::now();
        let dir = self.settings.dir.clone();
        let path = dir.join(artifact_file_name(created_at));

        let create_path = path.clone();
        let file = tokio::task::spawn_blocking(move || create_artifact(&dir, &create_path))
            .await
            .map_err(|e| BackupError::Io {
                path: path.clone(),
                source: io::Error::other(e),
            })??;
        info!(artifact = %path.display(), program = %self.settings.dump.program, "starting backup");

        let dumped = match tokio::time::timeout(self.settings.timeout, self.dump_to(&path, file)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                discard(&path);
                return Err(e);
            }
            Err(_) => {
                discard(&path);
                return Err(BackupError::Timeout(self.settings.timeout));
            }
        };

        let meta_path = path.clone();
        let size_bytes = match blocking(move || fs::metadata(&meta_path)).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BackupError::MissingArtifact(path));
            }
            Err(source) => return Err(BackupError::Io { path, source }),
        };
        if dumped == 0 || size_bytes == 0 {
            discard(&path);
            return Err(BackupError::EmptyArtifact(path));
        }

        let hash_path = path.clone();
        let sha256 = blocking(move || file_sha256(&hash_path))
            .await
            .map_err(|source| BackupError::Io {
                path: path.clone(),
                source,
            })?;

        let artifact = BackupArtifact {
            path,
            created_at,
            size_bytes,
            sha256: Some(sha256),
        };
        info!(
            artifact = %artifact.path.display(),
            size_bytes,
            dumped_bytes = dumped,
            "backup completed"
        );

        self.sweep(&artifact.path).await;
        Ok(artifact)
    }

    /// Applies the retention policy to the backup directory, sparing `keep`.
    /// Failures are logged; a sweep never fails the backup that triggered it.
    async fn sweep(&self, keep: &Path) -> Vec<BackupArtifact> {
        let dir = self.settings.dir.clone();
        let policy = self.settings.retention;
        let keep = keep.to_path_buf();
        let swept =
            blocking(move || retention::sweep(&dir, &policy, Utc::now(), Some(keep.as_path()))).await;
        match swept {
            Ok(removed) => {
                if !removed.is_empty() {
                    info!(
                        removed = removed.len(),
                        max_count = policy.max_count,
                        max_age_days = policy.max_age_days,
                        "retention sweep removed old backups"
                    );
                }
                removed
            }
            Err(e) => {
                warn!(error = %e, dir = %self.settings.dir.display(), "retention sweep failed");
                Vec::new()
            }
        }
    }

    /// Streams the dump's stdout through a zstd encoder into `file`.
    /// Returns the number of uncompressed bytes the dump produced.
    async fn dump_to(&self, path: &Path, file: File) -> Result<u64, BackupError> {
        let spec = &self.settings.dump;
        let io_err = |source: io::Error| BackupError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut child = spec
            .build(&self.settings.connection)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|source| BackupError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut captured = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut captured).await;
            }
            captured
        });

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_err(io::Error::other("dump stdout was not captured")))?;

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(PENDING_CHUNKS);
        let level = self.settings.compression_level;
        let writer = tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut encoder = zstd::Encoder::new(file, level)?;
            while let Some(chunk) = rx.blocking_recv() {
                encoder.write_all(&chunk)?;
            }
            encoder.finish()?.sync_all()
        });

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut dumped = 0u64;
        loop {
            let n = stdout.read(&mut buf).await.map_err(io_err)?;
            if n == 0 {
                break;
            }
            // The writer only hangs up after an error, which it reports below.
            if tx.send(buf[..n].to_vec()).await.is_err() {
                break;
            }
            dumped += n as u64;
        }
        drop(tx);
        writer
            .await
            .map_err(|e| io_err(io::Error::other(e)))?
            .map_err(io_err)?;

        let status = child.wait().await.map_err(io_err)?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !spec.is_success(&status) {
            return Err(BackupError::CommandFailed {
                program: spec.program.clone(),
                status: status.to_string(),
                stderr: stderr.trim().to_owned(),
            });
        }
        Ok(dumped)
    }
}

/// Creates the backup directory and a fresh artifact file. An existing file
/// at `path` is an error, never overwritten.
fn create_artifact(dir: &Path, path: &Path) -> Result<File, BackupError> {
    fs::create_dir_all(dir).map_err(|source| BackupError::Prepare {
        path: dir.to_path_buf(),
        source,
    })?;
    File::options()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| BackupError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Runs blocking filesystem work off the async runtime.
async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)
        .and_then(|r| r)
}

#[async_trait::async_trait]
impl BackupRunner for BackupExecutor {
    async fn run(&self) -> Result<BackupArtifact, BackupError> {
        self.backup().await
    }
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(error = %e, path = %path.display(), "failed to remove incomplete artifact");
        }
    }
}

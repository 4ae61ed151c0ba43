use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::process::Stdio;

use dbsentinel_core::RestoreError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::info;

use crate::executor::{BackupExecutor, CHUNK_SIZE, PENDING_CHUNKS};

impl BackupExecutor {
    /// Decompresses `artifact` and feeds it to the restore command's stdin.
    /// Bounded by the same timeout as backups.
    pub async fn restore(&self, artifact: &Path) -> Result<(), RestoreError> {
        if !artifact.is_file() {
            return Err(RestoreError::NotFound(artifact.to_path_buf()));
        }
        info!(artifact = %artifact.display(), program = %self.settings.restore.program, "starting restore");

        match tokio::time::timeout(self.settings.timeout, self.replay(artifact)).await {
            Ok(result) => result?,
            Err(_) => return Err(RestoreError::Timeout(self.settings.timeout)),
        }
        info!(artifact = %artifact.display(), "restore completed");
        Ok(())
    }

    async fn replay(&self, artifact: &Path) -> Result<(), RestoreError> {
        let spec = &self.settings.restore;
        let io_err = |source: io::Error| RestoreError::Io {
            path: artifact.to_path_buf(),
            source,
        };

        let mut child = spec
            .build(&self.settings.connection)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|source| RestoreError::Spawn {
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

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io_err(io::Error::other("restore stdin was not captured")))?;
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(PENDING_CHUNKS);
        let source = artifact.to_path_buf();
        let reader = tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut decoder = zstd::Decoder::new(File::open(&source)?)?;
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = decoder.read(&mut buf)?;
                // A dropped receiver means the feed stopped early; stop decoding.
                if n == 0 || tx.blocking_send(buf[..n].to_vec()).is_err() {
                    return Ok(());
                }
            }
        });

        let mut fed = Ok(());
        while let Some(chunk) = rx.recv().await {
            // A closed pipe means the command exited early; its status says why.
            if let Err(e) = stdin.write_all(&chunk).await {
                if e.kind() != io::ErrorKind::BrokenPipe {
                    fed = Err(e);
                }
                break;
            }
        }
        drop(rx);
        drop(stdin);
        let decoded = reader.await.map_err(io::Error::other).and_then(|r| r);

        let status = child.wait().await.map_err(io_err)?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !spec.is_success(&status) {
            return Err(RestoreError::CommandFailed {
                program: spec.program.clone(),
                status: status.to_string(),
                stderr: stderr.trim().to_owned(),
            });
        }
        fed.and(decoded).map_err(io_err)
    }
}

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The database could not be observed at all.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("database connectivity check failed: {0}")]
    Connectivity(String),
    #[error("health probe did not finish within {0:?}")]
    Timeout(Duration),
}

/// A single table could not be counted. Recorded in the snapshot, never fatal.
#[derive(Debug, Error)]
#[error("Failed to count rows in {entity}: {message}")]
pub struct CountError {
    pub entity: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("failed to prepare backup directory {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to start dump command `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("dump command `{program}` exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("backup artifact {0} was not created")]
    MissingArtifact(PathBuf),
    #[error("backup artifact {0} is empty")]
    EmptyArtifact(PathBuf),
    #[error("backup did not finish within {0:?}")]
    Timeout(Duration),
    #[error("i/o error while writing backup {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("backup artifact {0} does not exist")]
    NotFound(PathBuf),
    #[error("failed to start restore command `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("restore command `{program}` exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("restore did not finish within {0:?}")]
    Timeout(Duration),
    #[error("i/o error while restoring {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

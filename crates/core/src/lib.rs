pub mod anomaly;
pub mod artifact;
pub mod connection;
pub mod entity;
pub mod error;
pub mod hash;
pub mod snapshot;
pub mod status;

pub use anomaly::{classify, data_loss_warning, DEFAULT_DATA_LOSS_THRESHOLD};
pub use artifact::{artifact_file_name, is_artifact_file_name, BackupArtifact, RetentionPolicy};
pub use connection::ConnectionParams;
pub use entity::{EntityName, InvalidEntityName};
pub use error::{BackupError, CountError, ProbeError, RestoreError};
pub use hash::file_sha256;
pub use snapshot::{HealthStatus, Snapshot};
pub use status::{EventTimestamps, LifecycleStatus, NewStatusRecord, StatusRecord};

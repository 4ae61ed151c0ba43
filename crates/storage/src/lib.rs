pub mod postgres_store;
pub mod probe;
pub mod sqlite_store;
pub mod store;

pub use postgres_store::{connect_lazy, PostgresHealthSource, PostgresStateStore, DEFAULT_STATUS_TYPE};
pub use probe::{HealthProbe, HealthSource};
pub use sqlite_store::SqliteStateStore;
pub use store::StateStore;

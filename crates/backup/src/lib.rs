mod command;
mod executor;
mod restore;
pub mod retention;

pub use command::CommandSpec;
pub use executor::{BackupExecutor, BackupRunner, BackupSettings};

pub mod config;
pub mod monitor;
pub mod server;

pub use monitor::{BackupTrigger, MonitorLoop, MonitorPolicy, TickReport};
pub use server::{build_router, AppState};

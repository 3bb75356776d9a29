//! Backup Runner Library
//!
//! Dumps a database and archives a data volume into timestamped backup sets,
//! then prunes sets older than the retention window.

pub mod config;
pub mod daemon;
pub mod fs;
pub mod layout;
pub mod orchestrator;
pub mod retention;
pub mod tasks;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use orchestrator::{run_backup, Orchestrator, RunReport};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;

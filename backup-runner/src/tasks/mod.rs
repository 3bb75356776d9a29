//! Backup tasks. Each task owns the backup set it creates.

pub mod database;
pub mod volume;

pub use database::DatabaseDumpTask;
pub use volume::VolumeArchiveTask;

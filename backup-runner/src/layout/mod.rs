//! Backup root layout and timestamp labels.
//!
//! ```text
//! <root>/database/<YYYY-MM-DD_HH-MM-SS>/<database>.sql.gz
//! <root>/volume/<YYYY-MM-DD_HH-MM-SS>/<source>.tar.gz
//! ```
//!
//! Restore runbooks depend on this naming; do not change it.

use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Duration, Local, NaiveDateTime, Timelike};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;

/// strftime format of a backup set directory name.
///
/// Labels are local wall-clock time. After a DST fall-back the repeated hour
/// collides with labels already written, so each new label is bumped past the
/// newest one and can run up to an hour ahead of the clock until it catches up.
pub const LABEL_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Retries when a concurrent run grabs the same label
const MAX_LABEL_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Database,
    Volume,
}

impl Partition {
    pub const ALL: [Partition; 2] = [Partition::Database, Partition::Volume];

    pub fn dir_name(self) -> &'static str {
        match self {
            Partition::Database => "database",
            Partition::Volume => "volume",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

pub fn format_label(at: &NaiveDateTime) -> String {
    at.format(LABEL_FORMAT).to_string()
}

pub fn parse_label(label: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(label, LABEL_FORMAT).ok()
}

#[derive(Debug, Clone)]
pub struct BackupRoot {
    path: PathBuf,
}

impl BackupRoot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn partition_path(&self, partition: Partition) -> PathBuf {
        self.path.join(partition.dir_name())
    }

    /// Newest well-formed label in a partition, if any.
    pub fn latest_label(&self, partition: Partition) -> Result<Option<NaiveDateTime>> {
        let dir = self.partition_path(partition);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BackupError::io_at(&dir, e)),
        };

        let mut latest = None;
        for entry in entries {
            let entry = entry.map_err(|e| BackupError::io_at(&dir, e))?;
            let name = entry.file_name();
            if let Some(ts) = name.to_str().and_then(parse_label) {
                if latest.map_or(true, |l| ts > l) {
                    latest = Some(ts);
                }
            }
        }
        Ok(latest)
    }

    /// Create a new, empty backup set directory in `partition`.
    ///
    /// The label is `now` unless the partition already holds a label at or
    /// past it, in which case it is one second after the newest existing one.
    pub fn create_set(&self, partition: Partition, now: DateTime<Local>) -> Result<BackupSet> {
        let partition_dir = self.partition_path(partition);
        std::fs::create_dir_all(&partition_dir)
            .map_err(|e| BackupError::io_at(&partition_dir, e))?;

        // Labels have second resolution
        let now = now.naive_local();
        let mut candidate = now.with_nanosecond(0).unwrap_or(now);
        if let Some(latest) = self.latest_label(partition)? {
            if latest >= candidate {
                candidate = latest + Duration::seconds(1);
            }
        }

        for _ in 0..MAX_LABEL_ATTEMPTS {
            let label = format_label(&candidate);
            let dir = partition_dir.join(&label);
            match std::fs::create_dir(&dir) {
                Ok(()) => {
                    return Ok(BackupSet {
                        partition,
                        label,
                        dir,
                    })
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    warn!("Backup set {} already exists, advancing label", dir.display());
                    candidate += Duration::seconds(1);
                }
                Err(e) => return Err(BackupError::io_at(&dir, e)),
            }
        }

        Err(BackupError::io_at(
            &partition_dir,
            std::io::Error::new(ErrorKind::AlreadyExists, "no free backup set label"),
        ))
    }
}

/// One timestamped directory holding a single artifact.
#[derive(Debug, Clone)]
pub struct BackupSet {
    partition: Partition,
    label: String,
    dir: PathBuf,
}

impl BackupSet {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Remove an incomplete set after a failed task.
    pub fn discard(self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            warn!(
                "Failed to remove incomplete {} backup set {}: {}",
                self.partition,
                self.dir.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(s: &str) -> DateTime<Local> {
        let naive = parse_label(s).unwrap();
        Local.from_local_datetime(&naive).earliest().unwrap()
    }

    #[test]
    fn test_label_format() {
        let label = format_label(&at("2024-03-09_04-05-06").naive_local());
        assert_eq!(label, "2024-03-09_04-05-06");
        assert!(parse_label("2024-03-09").is_none());
        assert!(parse_label("latest").is_none());
    }

    #[test]
    fn test_create_set_layout() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = BackupRoot::new(temp_dir.path());

        let set = root.create_set(Partition::Database, at("2024-01-02_03-04-05"))?;
        assert_eq!(set.label(), "2024-01-02_03-04-05");
        assert_eq!(set.dir(), temp_dir.path().join("database/2024-01-02_03-04-05"));
        assert!(set.dir().is_dir());
        assert_eq!(
            set.artifact_path("app.sql.gz"),
            temp_dir.path().join("database/2024-01-02_03-04-05/app.sql.gz")
        );
        Ok(())
    }

    #[test]
    fn test_labels_strictly_increase_within_same_second() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = BackupRoot::new(temp_dir.path());
        let now = at("2024-01-02_03-04-05");

        let labels: Vec<String> = (0..3)
            .map(|_| root.create_set(Partition::Volume, now).map(|s| s.label().to_string()))
            .collect::<Result<_>>()?;

        assert_eq!(
            labels,
            vec!["2024-01-02_03-04-05", "2024-01-02_03-04-06", "2024-01-02_03-04-07"]
        );
        Ok(())
    }

    #[test]
    fn test_clock_going_backwards_keeps_order() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = BackupRoot::new(temp_dir.path());

        root.create_set(Partition::Database, at("2024-05-01_12-00-00"))?;
        let set = root.create_set(Partition::Database, at("2024-05-01_11-00-00"))?;
        assert_eq!(set.label(), "2024-05-01_12-00-01");
        Ok(())
    }

    #[test]
    fn test_partitions_are_independent() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = BackupRoot::new(temp_dir.path());
        let now = at("2024-01-02_03-04-05");

        let db = root.create_set(Partition::Database, now)?;
        let vol = root.create_set(Partition::Volume, now)?;
        assert_eq!(db.label(), vol.label());
        assert_eq!(root.latest_label(Partition::Database)?, parse_label(db.label()));
        Ok(())
    }

    #[test]
    fn test_discard_removes_set() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = BackupRoot::new(temp_dir.path());
        let set = root.create_set(Partition::Database, Local::now())?;
        std::fs::write(set.artifact_path("partial.sql.gz"), b"x")?;

        let dir = set.dir().to_path_buf();
        set.discard();
        assert!(!dir.exists());
        assert!(root.partition_path(Partition::Database).is_dir());
        Ok(())
    }
}

//! Retention pruning.
//!
//! Every second-level directory under the backup root (`<partition>/<label>`)
//! whose modification time is strictly older than the retention threshold is
//! removed. A set exactly at the threshold is kept.
//!
//! A failed removal never stops the scan: it is recorded and the remaining
//! sets are still attempted.

use crate::layout::BackupRoot;
use crate::utils::errors::{BackupError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    max_age: Duration,
}

impl RetentionPolicy {
    pub fn from_days(days: u32) -> Self {
        Self {
            max_age: Duration::from_secs(u64::from(days) * SECS_PER_DAY),
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn is_expired(&self, age: Duration) -> bool {
        age > self.max_age
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from_days(7)
    }
}

/// Outcome of one pruning pass
#[derive(Debug, Default)]
pub struct PruneReport {
    pub removed: Vec<PathBuf>,
    pub kept: usize,
    /// Paths that could not be removed (or listed), with the reason
    pub failed: Vec<(PathBuf, String)>,
}

impl PruneReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Clean reports pass through; any failure becomes `PartialPrune`.
    pub fn into_result(self) -> Result<Self> {
        if self.is_clean() {
            Ok(self)
        } else {
            Err(BackupError::PartialPrune {
                failed: self.failed.len(),
                eligible: self.failed.len() + self.removed.len(),
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetentionPruner {
    root: BackupRoot,
    policy: RetentionPolicy,
}

impl RetentionPruner {
    pub fn new(root: BackupRoot, policy: RetentionPolicy) -> Self {
        Self { root, policy }
    }

    /// Prune against the current wall clock.
    pub async fn run(&self) -> Result<PruneReport> {
        let pruner = self.clone();
        let report = tokio::task::spawn_blocking(move || pruner.prune(SystemTime::now())).await?;

        info!(
            removed = report.removed.len(),
            kept = report.kept,
            failed = report.failed.len(),
            "Retention pass finished"
        );
        report.into_result()
    }

    pub fn prune(&self, now: SystemTime) -> PruneReport {
        self.prune_with(now, |path| std::fs::remove_dir_all(path))
    }

    /// Prune using `remove` to delete each expired set.
    pub fn prune_with<F>(&self, now: SystemTime, mut remove: F) -> PruneReport
    where
        F: FnMut(&Path) -> std::io::Result<()>,
    {
        let mut report = PruneReport::default();

        let partitions = match list_dirs(self.root.path(), &mut report.failed) {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == ErrorKind::NotFound => return report,
            Err(e) => {
                warn!("Cannot list backup root {}: {}", self.root.path().display(), e);
                report.failed.push((self.root.path().to_path_buf(), e.to_string()));
                return report;
            }
        };

        for partition in partitions {
            let sets = match list_dirs(&partition, &mut report.failed) {
                Ok(sets) => sets,
                Err(e) => {
                    warn!("Cannot list partition {}: {}", partition.display(), e);
                    report.failed.push((partition, e.to_string()));
                    continue;
                }
            };

            for set in sets {
                let age = match age_of(&set, now) {
                    Ok(age) => age,
                    Err(e) => {
                        warn!("Cannot read age of {}: {}", set.display(), e);
                        report.failed.push((set, e.to_string()));
                        continue;
                    }
                };

                if !self.policy.is_expired(age) {
                    report.kept += 1;
                    continue;
                }

                match remove(&set) {
                    Ok(()) => {
                        debug!(age_secs = age.as_secs(), "Removed expired backup set {}", set.display());
                        report.removed.push(set);
                    }
                    Err(e) => {
                        warn!("Failed to remove expired backup set {}: {}", set.display(), e);
                        report.failed.push((set, e.to_string()));
                    }
                }
            }
        }

        report
    }
}

/// Subdirectories of `dir`, sorted; files and symlinks are ignored.
///
/// Only a failure to open `dir` is an error. Entries that cannot be read are
/// recorded in `failed` and the rest are still listed.
fn list_dirs(dir: &Path, failed: &mut Vec<(PathBuf, String)>) -> std::io::Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)?.map(|entry| {
        entry.map(|e| {
            let is_dir = e.file_type().map(|t| t.is_dir());
            (e.path(), is_dir)
        })
    });
    Ok(collect_dirs(dir, entries, failed))
}

fn collect_dirs<I>(dir: &Path, entries: I, failed: &mut Vec<(PathBuf, String)>) -> Vec<PathBuf>
where
    I: IntoIterator<Item = std::io::Result<(PathBuf, std::io::Result<bool>)>>,
{
    let mut dirs = Vec::new();
    for entry in entries {
        match entry {
            Ok((path, Ok(true))) => dirs.push(path),
            Ok((_, Ok(false))) => {}
            Ok((path, Err(e))) => {
                warn!("Cannot read file type of {}: {}", path.display(), e);
                failed.push((path, e.to_string()));
            }
            Err(e) => {
                warn!("Cannot read entry in {}: {}", dir.display(), e);
                failed.push((dir.to_path_buf(), e.to_string()));
            }
        }
    }
    dirs.sort();
    dirs
}

/// Age from the directory mtime; a future mtime counts as zero.
fn age_of(dir: &Path, now: SystemTime) -> std::io::Result<Duration> {
    let modified = std::fs::metadata(dir)?.modified()?;
    Ok(now.duration_since(modified).unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(SECS_PER_DAY);

    /// Create `<root>/<partition>/<label>/artifact` with the set dir aged `age`.
    fn make_set(root: &Path, partition: &str, label: &str, now: SystemTime, age: Duration) -> PathBuf {
        let dir = root.join(partition).join(label);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("artifact.gz"), b"x").unwrap();
        File::open(&dir).unwrap().set_modified(now - age).unwrap();
        dir
    }

    fn surviving(root: &Path) -> Vec<String> {
        let mut names = Vec::new();
        for partition in list_dirs(root, &mut Vec::new()).unwrap() {
            for set in list_dirs(&partition, &mut Vec::new()).unwrap() {
                names.push(set.file_name().unwrap().to_string_lossy().to_string());
            }
        }
        names.sort();
        names
    }

    #[test]
    fn test_policy_boundary_is_inclusive_keep() {
        let policy = RetentionPolicy::from_days(7);
        assert!(!policy.is_expired(7 * DAY));
        assert!(policy.is_expired(7 * DAY + Duration::from_secs(1)));
        assert_eq!(RetentionPolicy::default(), policy);
    }

    #[test]
    fn test_prunes_only_sets_past_threshold() {
        let temp_dir = TempDir::new().unwrap();
        let now = SystemTime::now();
        for days in [1u32, 6, 7, 8, 30] {
            make_set(temp_dir.path(), "database", &format!("age-{days:02}"), now, DAY * days);
        }
        make_set(temp_dir.path(), "volume", "age-30", now, DAY * 30);

        let pruner = RetentionPruner::new(BackupRoot::new(temp_dir.path()), RetentionPolicy::from_days(7));
        let report = pruner.prune(now);

        assert!(report.is_clean());
        assert_eq!(report.removed.len(), 3);
        assert_eq!(report.kept, 3);
        assert_eq!(surviving(temp_dir.path()), vec!["age-01", "age-06", "age-07"]);
    }

    #[test]
    fn test_prune_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let now = SystemTime::now();
        make_set(temp_dir.path(), "database", "old", now, DAY * 9);
        make_set(temp_dir.path(), "database", "new", now, DAY);

        let pruner = RetentionPruner::new(BackupRoot::new(temp_dir.path()), RetentionPolicy::default());
        assert_eq!(pruner.prune(now).removed.len(), 1);

        let second = pruner.prune(now);
        assert!(second.removed.is_empty());
        assert!(second.is_clean());
        assert_eq!(second.kept, 1);
    }

    #[test]
    fn test_failed_removal_does_not_stop_others() {
        let temp_dir = TempDir::new().unwrap();
        let now = SystemTime::now();
        let stuck = make_set(temp_dir.path(), "database", "a-stuck", now, DAY * 10);
        make_set(temp_dir.path(), "database", "b-old", now, DAY * 10);
        make_set(temp_dir.path(), "volume", "c-old", now, DAY * 10);

        let pruner = RetentionPruner::new(BackupRoot::new(temp_dir.path()), RetentionPolicy::default());
        let report = pruner.prune_with(now, |path| {
            if path == stuck {
                Err(std::io::Error::new(ErrorKind::PermissionDenied, "busy"))
            } else {
                fs::remove_dir_all(path)
            }
        });

        assert_eq!(report.removed.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, stuck);
        assert_eq!(surviving(temp_dir.path()), vec!["a-stuck"]);

        match report.into_result() {
            Err(BackupError::PartialPrune { failed, eligible }) => {
                assert_eq!((failed, eligible), (1, 3));
            }
            other => panic!("expected PartialPrune, got {other:?}"),
        }
    }

    #[test]
    fn test_ignores_files_and_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let pruner = RetentionPruner::new(
            BackupRoot::new(temp_dir.path().join("missing")),
            RetentionPolicy::default(),
        );
        let report = pruner.prune(SystemTime::now());
        assert!(report.is_clean() && report.removed.is_empty() && report.kept == 0);

        fs::write(temp_dir.path().join(".backup-runner.lock"), b"").unwrap();
        fs::create_dir(temp_dir.path().join("database")).unwrap();
        fs::write(temp_dir.path().join("database/README"), b"notes").unwrap();

        let pruner = RetentionPruner::new(BackupRoot::new(temp_dir.path()), RetentionPolicy::from_days(0));
        let report = pruner.prune(SystemTime::now() + DAY);
        assert!(report.removed.is_empty());
        assert!(temp_dir.path().join("database/README").exists());
    }

    #[test]
    fn test_unreadable_entry_does_not_hide_siblings() {
        let dir = Path::new("/backups/database");
        let entries = vec![
            Ok((dir.join("2024-01-03_00-00-00"), Ok(true))),
            Err(std::io::Error::new(ErrorKind::Other, "stale handle")),
            Ok((dir.join("flaky"), Err(std::io::Error::new(ErrorKind::PermissionDenied, "denied")))),
            Ok((dir.join("README"), Ok(false))),
            Ok((dir.join("2024-01-01_00-00-00"), Ok(true))),
        ];

        let mut failed = Vec::new();
        let dirs = collect_dirs(dir, entries, &mut failed);

        assert_eq!(
            dirs,
            vec![dir.join("2024-01-01_00-00-00"), dir.join("2024-01-03_00-00-00")]
        );
        let failed_paths: Vec<&Path> = failed.iter().map(|(p, _)| p.as_path()).collect();
        assert_eq!(failed_paths, vec![dir, dir.join("flaky").as_path()]);
    }

    #[test]
    fn test_future_mtime_is_kept() {
        let temp_dir = TempDir::new().unwrap();
        let now = SystemTime::now();
        let dir = temp_dir.path().join("volume/skewed");
        fs::create_dir_all(&dir).unwrap();
        File::open(&dir).unwrap().set_modified(now + DAY).unwrap();

        let pruner = RetentionPruner::new(BackupRoot::new(temp_dir.path()), RetentionPolicy::from_days(0));
        let report = pruner.prune(now);
        assert_eq!(report.kept, 1);
        assert!(dir.exists());
    }
}

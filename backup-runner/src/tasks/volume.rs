//! Volume archive task.
//!
//! Archives a live data directory into `volume/<label>/<name>.tar.gz` without
//! stopping the service that owns it.
//!
//! Consistency is best-effort only. The owning service keeps writing while the
//! walk runs, so the archive is not a snapshot of a single instant: files
//! changed mid-walk may appear in either state, and files deleted mid-walk are
//! skipped with a warning. Restore operators should expect the same
//! guarantees as after an unclean shutdown of that service.

use crate::fs::walker::{walk_tree, EntryKind, TreeEntry, WalkEvent, WalkOptions};
use crate::layout::{BackupRoot, Partition};
use crate::utils::errors::{BackupError, Result};
use chrono::Local;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Counts from one archiving pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub files: usize,
    pub dirs: usize,
    pub symlinks: usize,
    /// Entries that disappeared while the walk was running
    pub vanished: usize,
    /// Files whose size changed while they were being read
    pub changed: usize,
}

#[derive(Debug, Clone)]
pub struct VolumeArchiveTask {
    root: BackupRoot,
    source: PathBuf,
    options: WalkOptions,
    timeout: Option<Duration>,
}

impl VolumeArchiveTask {
    pub fn new(root: BackupRoot, source: impl Into<PathBuf>, exclude: Vec<String>) -> Self {
        Self {
            root,
            source: source.into(),
            options: WalkOptions {
                follow_links: false,
                exclude_patterns: exclude,
            },
            timeout: None,
        }
    }

    /// Stop archiving and fail the task if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// `<source dir name>.tar.gz`, or `volume.tar.gz` for a nameless source like `/`
    pub fn artifact_name(&self) -> String {
        let stem = self
            .source
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .unwrap_or("volume");
        format!("{stem}.tar.gz")
    }

    /// Archive into a fresh backup set. On failure the set is removed.
    pub async fn run(&self) -> Result<PathBuf> {
        match std::fs::metadata(&self.source) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(BackupError::io_at(
                    &self.source,
                    std::io::Error::new(ErrorKind::InvalidInput, "source is not a directory"),
                ))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BackupError::SourceMissing(self.source.clone()))
            }
            Err(e) => return Err(BackupError::io_at(&self.source, e)),
        }

        let set = self.root.create_set(Partition::Volume, Local::now())?;
        let artifact = set.artifact_path(&self.artifact_name());

        let source = self.source.clone();
        let options = self.options.clone();
        let target = artifact.clone();
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let mut handle = tokio::task::spawn_blocking(move || {
            write_archive(&source, &options, &target, &worker_cancel)
        });

        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined.map_err(BackupError::from).and_then(|r| r),
                Err(_) => {
                    // The walker checks the token between entries
                    cancel.cancel();
                    let _ = handle.await;
                    Err(BackupError::Timeout(limit))
                }
            },
            None => handle.await.map_err(BackupError::from).and_then(|r| r),
        };

        match result {
            Ok(stats) => {
                if stats.vanished > 0 || stats.changed > 0 {
                    warn!(
                        vanished = stats.vanished,
                        changed = stats.changed,
                        "Source changed during archiving; archive is best-effort"
                    );
                }
                info!(
                    label = %set.label(),
                    files = stats.files,
                    dirs = stats.dirs,
                    "Volume archive written to {}",
                    artifact.display()
                );
                Ok(artifact)
            }
            Err(e) => {
                set.discard();
                Err(e)
            }
        }
    }
}

/// Stream `source` as a gzipped tar into `artifact`.
///
/// Entry names are relative to `source`, so the archive extracts in place with
/// `tar -xzf <artifact> -C <target>`. Stops with `Interrupted` once `cancel`
/// is triggered.
pub fn write_archive(
    source: &Path,
    options: &WalkOptions,
    artifact: &Path,
    cancel: &CancellationToken,
) -> Result<ArchiveStats> {
    let mut writer = ArchiveWriter::create(artifact)?;
    walk_tree(source, options, |event| {
        if cancel.is_cancelled() {
            return Err(std::io::Error::new(ErrorKind::Interrupted, "archiving cancelled"));
        }
        writer.append(event)
    })
    .map_err(|e| BackupError::io_at(source, e))?;
    writer.finish()
}

/// Gzipped tar writer that tolerates a source changing underneath it.
pub struct ArchiveWriter {
    builder: tar::Builder<GzEncoder<BufWriter<File>>>,
    artifact: PathBuf,
    stats: ArchiveStats,
}

impl ArchiveWriter {
    pub fn create(artifact: &Path) -> Result<Self> {
        let file = File::create(artifact).map_err(|e| BackupError::io_at(artifact, e))?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        // Sparse scanning fails outright on a file that grows mid-read
        builder.sparse(false);

        Ok(Self {
            builder,
            artifact: artifact.to_path_buf(),
            stats: ArchiveStats::default(),
        })
    }

    /// Add one walk event. Entries that vanished are counted and skipped.
    pub fn append(&mut self, event: WalkEvent<'_>) -> std::io::Result<()> {
        let entry = match event {
            WalkEvent::Entry(entry) => entry,
            WalkEvent::Vanished(path) => {
                self.skip_vanished(&path);
                return Ok(());
            }
        };

        let appended = match entry.kind {
            EntryKind::File => self.append_live_file(entry),
            EntryKind::Dir | EntryKind::Symlink => self
                .builder
                .append_path_with_name(&entry.path, &entry.relative_path),
        };

        match appended {
            Ok(()) => {
                match entry.kind {
                    EntryKind::File => self.stats.files += 1,
                    EntryKind::Dir => self.stats.dirs += 1,
                    EntryKind::Symlink => self.stats.symlinks += 1,
                }
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.skip_vanished(&entry.path);
                Ok(())
            }
            Err(e) => Err(std::io::Error::new(
                e.kind(),
                format!("{}: {}", entry.path.display(), e),
            )),
        }
    }

    /// Archive a regular file at the size it had when opened. Growth past that
    /// size is cut off and a file that shrank is zero-padded, so the entry
    /// always matches its header.
    fn append_live_file(&mut self, entry: &TreeEntry) -> std::io::Result<()> {
        let file = File::open(&entry.path)?;
        let meta = file.metadata()?;
        let size = meta.len();

        let mut header = tar::Header::new_gnu();
        header.set_metadata_in_mode(&meta, tar::HeaderMode::Complete);
        header.set_size(size);

        let data = (&file).take(size).chain(std::io::repeat(0)).take(size);
        self.builder
            .append_data(&mut header, &entry.relative_path, data)?;

        if file.metadata()?.len() != size {
            warn!(
                "{}: file changed as we read it (archived {} bytes)",
                entry.path.display(),
                size
            );
            self.stats.changed += 1;
        }
        Ok(())
    }

    fn skip_vanished(&mut self, path: &Path) {
        warn!("Skipping {}: removed during archiving", path.display());
        self.stats.vanished += 1;
    }

    /// Write the tar trailer, finish the gzip stream and fsync.
    pub fn finish(self) -> Result<ArchiveStats> {
        let artifact = self.artifact;
        let encoder = self
            .builder
            .into_inner()
            .map_err(|e| BackupError::io_at(&artifact, e))?;
        let writer = encoder.finish().map_err(|e| BackupError::io_at(&artifact, e))?;
        let file = writer
            .into_inner()
            .map_err(|e| BackupError::io_at(&artifact, e.into_error()))?;
        file.sync_all().map_err(|e| BackupError::io_at(&artifact, e))?;

        Ok(self.stats)
    }
}

//! Database dump task.
//!
//! Runs the database's logical dump tool and streams its stdout through a
//! gzip encoder straight into `database/<label>/<database>.sql.gz`. Nothing
//! uncompressed is written to disk.

use crate::layout::{BackupRoot, BackupSet, Partition};
use crate::utils::errors::{BackupError, Result};
use async_compression::tokio::write::GzipEncoder;
use chrono::Local;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Bytes of dump-tool stderr kept for the error message
const STDERR_TAIL: usize = 4096;

#[derive(Debug, Clone)]
pub struct DatabaseDumpTask {
    root: BackupRoot,
    database: String,
    argv: Vec<String>,
    timeout: Option<Duration>,
}

impl DatabaseDumpTask {
    /// `argv` is the fully substituted dump command; `argv[0]` is the tool.
    pub fn new(root: BackupRoot, database: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            root,
            database: database.into(),
            argv,
            timeout: None,
        }
    }

    /// Kill the dump tool and fail the task if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn artifact_name(&self) -> String {
        format!("{}.sql.gz", self.database)
    }

    /// Dump into a fresh backup set. On failure the set is removed.
    pub async fn run(&self) -> Result<PathBuf> {
        let set = self.root.create_set(Partition::Database, Local::now())?;
        let artifact = set.artifact_path(&self.artifact_name());
        self.write_set(set, &artifact).await
    }

    async fn write_set(&self, set: BackupSet, artifact: &Path) -> Result<PathBuf> {
        let result = match self.timeout {
            // Dropping the dump future kills the child
            Some(limit) => tokio::time::timeout(limit, self.dump_into(&set, artifact))
                .await
                .unwrap_or(Err(BackupError::Timeout(limit))),
            None => self.dump_into(&set, artifact).await,
        };

        match result {
            Ok(bytes) => {
                info!(label = %set.label(), bytes, "Database dump written to {}", artifact.display());
                Ok(artifact.to_path_buf())
            }
            Err(e) => {
                set.discard();
                Err(e)
            }
        }
    }

    async fn dump_into(&self, set: &BackupSet, artifact: &Path) -> Result<u64> {
        let (tool, args) = self
            .argv
            .split_first()
            .ok_or_else(|| BackupError::Config("dump command is empty".into()))?;

        debug!(tool = %tool, ?args, dir = %set.dir().display(), "Spawning dump tool");

        let mut child = Command::new(tool)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BackupError::ToolUnavailable {
                tool: tool.clone(),
                source,
            })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackupError::Join("dump tool stdout not captured".into()))?;
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            match stderr {
                Some(stderr) => read_tail(stderr, STDERR_TAIL).await,
                None => String::new(),
            }
        });

        let file = tokio::fs::File::create(artifact)
            .await
            .map_err(|e| BackupError::io_at(artifact, e))?;
        let mut encoder = GzipEncoder::new(BufWriter::new(file));

        let copied = tokio::io::copy(&mut stdout, &mut encoder).await;
        let finished = match copied {
            Ok(bytes) => encoder.shutdown().await.map(|_| bytes),
            Err(e) => Err(e),
        };

        // A write failure (disk full) leaves the tool blocked on a full pipe
        let bytes = match finished {
            Ok(bytes) => bytes,
            Err(e) => {
                drop(stdout);
                if let Err(kill_err) = child.kill().await {
                    warn!("Failed to kill dump tool after write error: {}", kill_err);
                }
                let _ = stderr_task.await;
                return Err(BackupError::io_at(artifact, e));
            }
        };

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(BackupError::ToolFailed {
                tool: tool.clone(),
                status,
                stderr: stderr.trim().to_string(),
            });
        }

        encoder
            .into_inner()
            .into_inner()
            .sync_all()
            .await
            .map_err(|e| BackupError::io_at(artifact, e))?;

        Ok(bytes)
    }
}

/// Read a stream to the end, keeping only its last `limit` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Err(e) => {
                debug!("Stopped reading dump tool stderr: {}", e);
                break;
            }
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > limit {
                    tail.drain(..tail.len() - limit);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

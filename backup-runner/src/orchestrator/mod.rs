//! Backup run orchestration.
//!
//! A run is a fixed, ordered list of steps: database dump, volume archive,
//! retention prune. The first failing step aborts the run, so a failed dump
//! also skips pruning for that cycle.

use crate::config::Config;
use crate::daemon::lock::RunLock;
use crate::layout::BackupRoot;
use crate::retention::{RetentionPolicy, RetentionPruner};
use crate::tasks::{DatabaseDumpTask, VolumeArchiveTask};
use crate::utils::errors::{BackupError, Result};
use std::fmt;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    DatabaseDump,
    VolumeArchive,
    Prune,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepKind::DatabaseDump => "database dump",
            StepKind::VolumeArchive => "volume archive",
            StepKind::Prune => "retention prune",
        })
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    DatabaseDump(DatabaseDumpTask),
    VolumeArchive(VolumeArchiveTask),
    Prune(RetentionPruner),
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self {
            Step::DatabaseDump(_) => StepKind::DatabaseDump,
            Step::VolumeArchive(_) => StepKind::VolumeArchive,
            Step::Prune(_) => StepKind::Prune,
        }
    }

    /// Run the step, returning a one-line detail for the status log.
    async fn execute(&self) -> Result<String> {
        match self {
            Step::DatabaseDump(task) => task.run().await.map(|p| p.display().to_string()),
            Step::VolumeArchive(task) => task.run().await.map(|p| p.display().to_string()),
            Step::Prune(pruner) => pruner
                .run()
                .await
                .map(|r| format!("{} removed, {} kept", r.removed.len(), r.kept)),
        }
    }
}

#[derive(Debug)]
pub struct StepOutcome {
    pub step: StepKind,
    pub result: std::result::Result<String, BackupError>,
}

impl StepOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Outcomes of the steps that ran, in order.
#[derive(Debug)]
pub struct RunReport {
    pub planned: usize,
    pub outcomes: Vec<StepOutcome>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.len() == self.planned && self.outcomes.iter().all(StepOutcome::is_ok)
    }

    /// The step that aborted the run, if any
    pub fn failure(&self) -> Option<&StepOutcome> {
        self.outcomes.iter().find(|o| !o.is_ok())
    }
}

pub struct Orchestrator {
    steps: Vec<Step>,
}

impl Orchestrator {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// The standard three-step pipeline
    pub fn from_config(config: &Config) -> Self {
        let root = BackupRoot::new(&config.backup_root_path);
        let timeout = config.step_timeout();

        Self::new(vec![
            Step::DatabaseDump(
                DatabaseDumpTask::new(
                    root.clone(),
                    config.database_identity.database.clone(),
                    config.dump_argv(),
                )
                .with_timeout(timeout),
            ),
            Step::VolumeArchive(
                VolumeArchiveTask::new(
                    root.clone(),
                    config.volume_source_path.clone(),
                    config.volume.exclude.clone(),
                )
                .with_timeout(timeout),
            ),
            Step::Prune(RetentionPruner::new(
                root,
                RetentionPolicy::from_days(config.retention_days),
            )),
        ])
    }

    pub fn steps(&self) -> impl Iterator<Item = StepKind> + '_ {
        self.steps.iter().map(Step::kind)
    }

    /// Run every step in order, stopping at the first failure.
    pub async fn run(&self) -> RunReport {
        let mut report = RunReport {
            planned: self.steps.len(),
            outcomes: Vec::with_capacity(self.steps.len()),
        };

        for step in &self.steps {
            let kind = step.kind();
            info!("[START] {}", kind);

            let result = step.execute().await;
            let failed = match &result {
                Ok(detail) => {
                    info!("[OK] {}: {}", kind, detail);
                    false
                }
                Err(e) => {
                    error!(class = ?e.class(), "[FAIL] {}: {}", kind, e);
                    true
                }
            };
            report.outcomes.push(StepOutcome { step: kind, result });

            if failed {
                let skipped: Vec<String> = self
                    .steps
                    .iter()
                    .skip(report.outcomes.len())
                    .map(|s| s.kind().to_string())
                    .collect();
                error!(?skipped, "[ABORT] backup run stopped at {}", kind);
                return report;
            }
        }

        info!("[DONE] backup run complete ({} steps)", report.outcomes.len());
        report
    }
}

/// One full run under the backup-root lock.
pub async fn run_backup(config: &Config) -> Result<RunReport> {
    let _lock = if config.run.lock {
        Some(RunLock::acquire(&config.backup_root_path)?)
    } else {
        None
    };

    Ok(Orchestrator::from_config(config).run().await)
}

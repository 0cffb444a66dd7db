use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

use super::prune::{self, ReservedPaths};
use super::task_manager::Task;
use super::{FileEntry, WorklistItem};
use crate::convert::{ConversionExecutor, RuleTable};

/// Executes one task for a pool worker.
/// This trait keeps the pool independent from what a task actually does.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Returns the resulting target entry, or `None` when the task produces
    /// no file (directory maintenance).
    async fn process_task(&self, worker_id: usize, task: &Task) -> Result<Option<FileEntry>>;
}

/// Processor for worklist items: directory maintenance or file conversion.
pub struct SyncTaskProcessor {
    executor: ConversionExecutor,
    rules: Arc<RuleTable>,
    reserved: ReservedPaths,
}

impl SyncTaskProcessor {
    pub fn new(
        executor: ConversionExecutor,
        rules: Arc<RuleTable>,
        reserved: ReservedPaths,
    ) -> Self {
        Self {
            executor,
            rules,
            reserved,
        }
    }
}

#[async_trait]
impl TaskProcessor for SyncTaskProcessor {
    async fn process_task(&self, worker_id: usize, task: &Task) -> Result<Option<FileEntry>> {
        match &task.item {
            WorklistItem::Directory { source, target } => {
                debug!("Worker {} maintaining {}", worker_id, target.display());
                let removed =
                    prune::maintain_directory(&source.path, target, &self.rules, &self.reserved)
                        .await
                        .with_context(|| format!("maintaining {}", target.display()))?;
                if removed > 0 {
                    debug!("Removed {} obsolete entries from {}", removed, target.display());
                }
                Ok(None)
            }
            WorklistItem::File {
                source,
                target,
                rule,
            } => {
                debug!(
                    "Worker {} converting {} ({} {})",
                    worker_id,
                    source.path.display(),
                    rule.encoder.name(),
                    rule.conversion
                );

                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("creating {}", parent.display()))?;
                }

                if let Err(e) = self
                    .executor
                    .exec(rule.encoder, &source.path, target, &rule.conversion)
                    .await
                {
                    error!("Worker {} failed on {}: {}", worker_id, source.path.display(), e);
                    return Err(e.into());
                }

                let converted = FileEntry::stat(target)
                    .await
                    .with_context(|| format!("reading converted file {}", target.display()))?;
                Ok(Some(converted))
            }
        }
    }
}

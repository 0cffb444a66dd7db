use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::progress::{ProgressSnapshot, ProgressState, ProgressTracker};
use super::prune::{self, ReservedPaths};
use super::scanner::DifferentialScanner;
use super::task_manager::{StopHandle, Task, TaskId, TaskManager};
use super::task_processor::{SyncTaskProcessor, TaskProcessor};
use super::{SyncState, Worklist};
use crate::convert::ConversionExecutor;
use crate::error::{Result, SyncError};
use crate::utils::config::SyncConfig;
use crate::utils::disk;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Wipe the target and convert everything
    pub initial: bool,
}

/// Summary of a processed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub total: u64,
    pub completed: u64,
    pub errors: u64,
    pub remaining: u64,
    /// Queued tasks dropped after a stop request
    pub discarded: u64,
    pub elapsed_secs: f64,
    /// Set when at least one conversion failed
    pub error_dir: Option<PathBuf>,
    pub last: ProgressSnapshot,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    NothingToDo,
    Done(RunReport),
    Stopped(RunReport),
}

/// Drives one synchronization run: scan, process, finalize.
///
/// The config is owned here and persisted at most twice per run: once when
/// processing starts (work-in-progress set) and once on clean completion.
pub struct SyncManager {
    config: SyncConfig,
    options: RunOptions,
    state: SyncState,
    stop: StopHandle,
    run_started: Option<DateTime<Utc>>,
}

impl SyncManager {
    pub fn new(config: SyncConfig, options: RunOptions) -> Self {
        Self {
            config,
            options,
            state: SyncState::Idle,
            stop: StopHandle::new(),
            run_started: None,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Handle for interrupting the run from a signal handler or UI.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Initial runs wipe the target. A target that was never synced is
    /// treated as initial unless an earlier run on it was interrupted; that
    /// one resumes by comparing against what is already on the target.
    pub fn is_initial(&self) -> bool {
        self.options.initial || (self.config.last_sync.is_none() && !self.config.work_in_progress)
    }

    pub async fn scan(&mut self) -> Worklist {
        self.state = SyncState::Scanning;
        self.run_started = Some(Utc::now());

        let worklist = DifferentialScanner::new(&self.config, self.is_initial())
            .scan()
            .await;
        if worklist.scan_errors > 0 {
            warn!("{} directories could not be scanned", worklist.scan_errors);
        }

        self.state = if worklist.is_empty() {
            info!("Target is up to date");
            SyncState::NothingToDo
        } else {
            info!(
                "{} directories and {} files to process",
                worklist.directories().count(),
                worklist.files().count()
            );
            SyncState::ConfirmPending
        };
        worklist
    }

    /// Process a confirmed worklist and finalize the run.
    pub async fn process(
        &mut self,
        worklist: Worklist,
        tracker: ProgressTracker,
    ) -> Result<RunOutcome> {
        if worklist.is_empty() {
            self.state = SyncState::NothingToDo;
            return Ok(RunOutcome::NothingToDo);
        }
        let run_started = *self.run_started.get_or_insert_with(Utc::now);
        self.state = SyncState::Processing;

        let error_dir = self.config.error_dir();
        match tokio::fs::remove_dir_all(&error_dir).await {
            Ok(()) => debug!("Cleared {}", error_dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(SyncError::io(format!("clearing {}", error_dir.display()), e)),
        }

        self.config.set_work_in_progress(true);
        self.config.save()?;

        let reserved = ReservedPaths::new(&self.config.target_dir, &self.config.reserved_names());
        if self.is_initial() {
            let target_dir = &self.config.target_dir;
            info!("Initial sync, clearing {}", target_dir.display());
            prune::wipe_target(target_dir, &reserved)
                .await
                .map_err(|e| SyncError::io(format!("clearing {}", target_dir.display()), e))?;
        }

        let device = disk::get_path_stats(&self.config.target_dir);
        if !device.available {
            warn!("Free space of {} is unknown", self.config.target_dir.display());
        }

        let total = worklist.len() as u64;
        let progress_state = ProgressState::new(total, worklist.total_source_bytes(), device.free);

        let (mut pool, results) = TaskManager::new(self.config.workers, self.stop.clone());
        let processor = Arc::new(SyncTaskProcessor::new(
            ConversionExecutor::new(self.config.encoder.clone(), error_dir.clone()),
            Arc::new(self.config.rules.clone()),
            reserved,
        )) as Arc<dyn TaskProcessor>;
        pool.start(processor);
        let progress = tokio::spawn(tracker.run(progress_state, results));

        // Directories first so their maintenance starts before the bulk of conversions.
        let ordered = worklist
            .items()
            .iter()
            .enumerate()
            .filter(|(_, item)| item.is_dir())
            .chain(worklist.items().iter().enumerate().filter(|(_, item)| !item.is_dir()));
        for (index, item) in ordered {
            let task = Task {
                id: TaskId(index),
                item: item.clone(),
            };
            if pool.submit(task).await.is_err() {
                info!("Stop requested, no further tasks are queued");
                break;
            }
        }

        pool.join().await;
        let last = progress
            .await
            .map_err(|e| SyncError::io("progress tracker", io::Error::other(e)))?;
        let discarded = pool.metrics().discarded;

        let report = RunReport {
            total,
            completed: last.completed,
            errors: last.errors,
            remaining: last.remaining(),
            discarded,
            elapsed_secs: last.elapsed_secs,
            error_dir: (last.errors > 0).then(|| error_dir.clone()),
            last,
        };

        if report.remaining > 0 {
            // Work-in-progress stays set and last_sync is left alone so the
            // next run picks up whatever did not finish.
            self.state = SyncState::Stopped;
            info!(
                "Stopped with {} of {} items remaining",
                report.remaining, report.total
            );
            return Ok(RunOutcome::Stopped(report));
        }

        self.state = SyncState::Finalizing;
        self.remove_empty_log().await;
        self.config.set_work_in_progress(false);
        self.config.set_last_sync(run_started);
        self.config.save()?;

        self.state = SyncState::Done;
        info!("Done: {} items, {} errors", report.completed, report.errors);
        Ok(RunOutcome::Done(report))
    }

    async fn remove_empty_log(&self) {
        let log = self.config.log_file();
        match tokio::fs::metadata(&log).await {
            Ok(meta) if meta.len() == 0 => {
                if let Err(e) = tokio::fs::remove_file(&log).await {
                    warn!("Failed to remove {}: {}", log.display(), e);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::progress;
    use crate::utils::config::{write_config, ConfigFile, CONFIG_FILE};
    use crate::convert::RuleSpec;
    use filetime::FileTime;
    use std::path::Path;
    use tempfile::TempDir;

    fn setup(rules: Vec<RuleSpec>) -> (TempDir, TempDir, PathBuf) {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let path = dst.path().join(CONFIG_FILE);
        let file = ConfigFile {
            source_dir: src.path().to_path_buf(),
            rules,
            workers: Some(2),
            ..ConfigFile::default()
        };
        write_config(&path, &file).unwrap();
        (src, dst, path)
    }

    fn age(path: &Path) {
        let past = FileTime::from_unix_time(FileTime::now().unix_seconds() - 3600, 0);
        filetime::set_file_mtime(path, past).unwrap();
    }

    #[tokio::test]
    async fn copy_run_completes_and_persists_markers() {
        let (src, dst, path) = setup(vec![RuleSpec::new("mp3", None, None)]);
        std::fs::create_dir(src.path().join("b")).unwrap();
        std::fs::write(src.path().join("b/c.mp3"), vec![1u8; 500]).unwrap();
        std::fs::write(src.path().join("notes.txt"), b"ignored").unwrap();
        age(&src.path().join("b/c.mp3"));
        age(&src.path().join("b"));

        let config = SyncConfig::load(&path, dst.path()).unwrap();
        let mut manager = SyncManager::new(config, RunOptions::default());
        assert!(manager.is_initial());

        let before = Utc::now();
        let worklist = manager.scan().await;
        assert_eq!(manager.state(), SyncState::ConfirmPending);
        assert_eq!(worklist.directories().count(), 1);
        assert_eq!(worklist.files().count(), 1);

        let (tracker, reader) = progress::channel();
        let outcome = manager.process(worklist, tracker).await.unwrap();
        let report = match outcome {
            RunOutcome::Done(report) => report,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(report.completed, 2);
        assert_eq!(report.errors, 0);
        assert!(report.error_dir.is_none());
        assert_eq!(manager.state(), SyncState::Done);
        assert_eq!(reader.notices().iter().count(), 1);

        assert_eq!(std::fs::read(dst.path().join("b/c.mp3")).unwrap().len(), 500);
        assert!(!dst.path().join("notes.txt").exists());

        let reloaded = SyncConfig::load(&path, dst.path()).unwrap();
        assert!(!reloaded.work_in_progress);
        assert!(reloaded.last_sync.unwrap() >= before);
    }

    #[tokio::test]
    async fn nothing_to_do_leaves_config_untouched() {
        let (src, dst, path) = setup(vec![RuleSpec::new("mp3", None, None)]);
        std::fs::write(src.path().join("readme.txt"), b"x").unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        let config = SyncConfig::load(&path, dst.path()).unwrap();
        let mut manager = SyncManager::new(config, RunOptions::default());
        let worklist = manager.scan().await;
        assert_eq!(manager.state(), SyncState::NothingToDo);

        let (tracker, _reader) = progress::channel();
        let outcome = manager.process(worklist, tracker).await.unwrap();
        assert!(matches!(outcome, RunOutcome::NothingToDo));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn stop_before_processing_keeps_work_in_progress() {
        let (src, dst, path) = setup(vec![RuleSpec::new("mp3", None, None)]);
        for i in 0..5 {
            std::fs::write(src.path().join(format!("{}.mp3", i)), b"x").unwrap();
        }

        let config = SyncConfig::load(&path, dst.path()).unwrap();
        let mut manager = SyncManager::new(config, RunOptions::default());
        let worklist = manager.scan().await;
        manager.stop_handle().stop();

        let (tracker, _reader) = progress::channel();
        let report = match manager.process(worklist, tracker).await.unwrap() {
            RunOutcome::Stopped(report) => report,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(report.completed, 0);
        assert_eq!(report.remaining, 5);
        assert_eq!(manager.state(), SyncState::Stopped);

        let reloaded = SyncConfig::load(&path, dst.path()).unwrap();
        assert!(reloaded.work_in_progress);
        assert!(reloaded.last_sync.is_none());
    }
}

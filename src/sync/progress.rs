//! Live run statistics.
//!
//! A single tracker task folds worker results into [`ProgressState`] and
//! publishes a [`ProgressSnapshot`] behind a lock. Readers only ever see
//! published copies. File completions are also forwarded as
//! [`CompletionNotice`]s; the notice channel closes when the run ends.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

use super::task_manager::TaskResult;

const PUBLISH_INTERVAL: Duration = Duration::from_millis(500);

/// Aggregate owned by the tracker task.
#[derive(Debug, Clone)]
pub struct ProgressState {
    pub total: u64,
    pub completed: u64,
    pub errors: u64,
    pub source_bytes: u64,
    pub target_bytes: u64,
    pub cumulative_duration: Duration,
    pub started: Instant,
    /// Size of every source file in the worklist
    pub total_source_bytes: u64,
    /// Free bytes on the target device, sampled once before processing
    pub device_free: u64,
}

impl ProgressState {
    pub fn new(total: u64, total_source_bytes: u64, device_free: u64) -> Self {
        Self {
            total,
            completed: 0,
            errors: 0,
            source_bytes: 0,
            target_bytes: 0,
            cumulative_duration: Duration::ZERO,
            started: Instant::now(),
            total_source_bytes,
            device_free,
        }
    }

    pub fn apply(&mut self, result: &TaskResult) {
        self.completed += 1;
        if result.error.is_some() {
            self.errors += 1;
        }
        self.source_bytes += result.source.size;
        if let Some(target) = &result.target {
            self.target_bytes += target.size;
        }
        self.cumulative_duration += result.duration;
    }

    pub fn snapshot(&self, now: Instant) -> ProgressSnapshot {
        let elapsed = now.saturating_duration_since(self.started);
        let elapsed_secs = elapsed.as_secs_f64();

        let (remaining_secs, avg_duration_secs) = if self.completed == 0 {
            (0.0, 0.0)
        } else {
            let left = self.total.saturating_sub(self.completed) as f64;
            (
                elapsed_secs * left / self.completed as f64,
                self.cumulative_duration.as_secs_f64() / self.completed as f64,
            )
        };

        let throughput = if elapsed_secs > 0.0 {
            self.completed as f64 / (elapsed_secs / 60.0)
        } else {
            0.0
        };

        let compression = if self.source_bytes == 0 {
            0.0
        } else {
            self.target_bytes as f64 / self.source_bytes as f64
        };
        let estimated_final_size = (compression * self.total_source_bytes as f64) as u64;

        ProgressSnapshot {
            total: self.total,
            completed: self.completed,
            errors: self.errors,
            source_bytes: self.source_bytes,
            target_bytes: self.target_bytes,
            elapsed_secs,
            remaining_secs,
            throughput,
            avg_duration_secs,
            compression,
            estimated_final_size,
            estimated_free_space: self.device_free as i64 - estimated_final_size as i64,
        }
    }
}

/// Published view of the progress state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub completed: u64,
    pub errors: u64,
    pub source_bytes: u64,
    pub target_bytes: u64,
    pub elapsed_secs: f64,
    pub remaining_secs: f64,
    /// Items per minute
    pub throughput: f64,
    pub avg_duration_secs: f64,
    /// Target bytes per source byte
    pub compression: f64,
    pub estimated_final_size: u64,
    /// Can go negative when the target device is too small
    pub estimated_free_space: i64,
}

impl ProgressSnapshot {
    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.completed)
    }
}

/// A finished file task, forwarded for display.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionNotice {
    pub source: PathBuf,
    pub target: Option<PathBuf>,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Writer half, consumed by [`ProgressTracker::run`].
pub struct ProgressTracker {
    snapshot: Arc<RwLock<ProgressSnapshot>>,
    notices: Sender<CompletionNotice>,
}

/// Reader half. Cloning shares the same snapshot and notice stream.
#[derive(Clone)]
pub struct ProgressReader {
    snapshot: Arc<RwLock<ProgressSnapshot>>,
    notices: Receiver<CompletionNotice>,
}

pub fn channel() -> (ProgressTracker, ProgressReader) {
    let snapshot = Arc::new(RwLock::new(ProgressSnapshot::default()));
    let (tx, rx) = crossbeam_channel::unbounded();
    (
        ProgressTracker {
            snapshot: Arc::clone(&snapshot),
            notices: tx,
        },
        ProgressReader {
            snapshot,
            notices: rx,
        },
    )
}

impl ProgressTracker {
    /// Consume results until every worker has dropped its sender.
    ///
    /// Returns the final snapshot. Dropping `self` at the end closes the
    /// notice stream, which tells readers the run is over.
    pub async fn run(
        self,
        mut state: ProgressState,
        mut results: mpsc::UnboundedReceiver<TaskResult>,
    ) -> ProgressSnapshot {
        let mut interval = tokio::time::interval(PUBLISH_INTERVAL);
        self.publish(&state);

        loop {
            tokio::select! {
                result = results.recv() => match result {
                    Some(result) => {
                        state.apply(&result);
                        self.publish(&state);
                        if !result.is_dir {
                            let _ = self.notices.send(CompletionNotice {
                                source: result.source.path.clone(),
                                target: result.target.map(|t| t.path),
                                duration: result.duration,
                                error: result.error,
                            });
                        }
                    }
                    None => break,
                },
                _ = interval.tick() => {
                    self.publish(&state);
                }
            }
        }

        debug!("Progress tracker finished after {} items", state.completed);
        self.publish(&state)
    }

    fn publish(&self, state: &ProgressState) -> ProgressSnapshot {
        let snapshot = state.snapshot(Instant::now());
        *self.snapshot.write() = snapshot.clone();
        snapshot
    }
}

impl ProgressReader {
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot.read().clone()
    }

    pub fn notices(&self) -> &Receiver<CompletionNotice> {
        &self.notices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::task_manager::TaskId;
    use crate::sync::FileEntry;
    use std::time::SystemTime;

    fn entry(path: &str, size: u64, is_dir: bool) -> FileEntry {
        FileEntry {
            path: PathBuf::from(path),
            modified: SystemTime::UNIX_EPOCH,
            size,
            is_dir,
        }
    }

    fn file_result(id: usize, source: u64, target: Option<u64>, secs: u64) -> TaskResult {
        TaskResult {
            task_id: TaskId(id),
            worker_id: 0,
            source: entry(&format!("/src/{}.flac", id), source, false),
            target: target.map(|size| entry(&format!("/dst/{}.mp3", id), size, false)),
            is_dir: false,
            duration: Duration::from_secs(secs),
            error: if target.is_none() {
                Some("encoder exited with 1".to_string())
            } else {
                None
            },
        }
    }

    #[test]
    fn arithmetic_matches_hand_computed_values() {
        let mut state = ProgressState::new(4, 4_000_000, 10_000_000);
        state.apply(&file_result(0, 2_000_000, Some(500_000), 4));
        state.apply(&file_result(1, 1_000_000, Some(250_000), 2));
        state.apply(&TaskResult {
            task_id: TaskId(2),
            worker_id: 1,
            source: entry("/src/album", 0, true),
            target: None,
            is_dir: true,
            duration: Duration::ZERO,
            error: None,
        });

        let snap = state.snapshot(state.started + Duration::from_secs(120));
        assert_eq!(snap.completed, 3);
        assert_eq!(snap.errors, 0);
        assert_eq!(snap.remaining(), 1);
        assert!((snap.elapsed_secs - 120.0).abs() < f64::EPSILON);
        assert!((snap.throughput - 1.5).abs() < 1e-9);
        assert!((snap.avg_duration_secs - 2.0).abs() < 1e-9);
        assert!((snap.compression - 0.25).abs() < 1e-9);
        assert!((snap.remaining_secs - 40.0).abs() < 1e-9);
        assert_eq!(snap.estimated_final_size, 1_000_000);
        assert_eq!(snap.estimated_free_space, 9_000_000);
    }

    #[test]
    fn empty_state_has_zeroed_rates() {
        let state = ProgressState::new(10, 1_000, 0);
        let snap = state.snapshot(state.started);
        assert_eq!(snap.throughput, 0.0);
        assert_eq!(snap.remaining_secs, 0.0);
        assert_eq!(snap.avg_duration_secs, 0.0);
        assert_eq!(snap.compression, 0.0);
        assert_eq!(snap.estimated_free_space, 0);
    }

    #[test]
    fn failures_count_as_errors_without_target_bytes() {
        let mut state = ProgressState::new(2, 2_000, 0);
        state.apply(&file_result(0, 1_000, None, 1));
        state.apply(&file_result(1, 1_000, Some(100), 1));
        let snap = state.snapshot(state.started + Duration::from_secs(60));
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.source_bytes, 2_000);
        assert_eq!(snap.target_bytes, 100);
        assert!((snap.compression - 0.05).abs() < 1e-9);
        assert!(snap.estimated_free_space < 0);
    }

    #[tokio::test]
    async fn forwards_only_file_completions_and_closes_stream() {
        let (tracker, reader) = channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(tracker.run(ProgressState::new(3, 3_000, 0), rx));

        tx.send(file_result(0, 1_000, Some(100), 1)).unwrap();
        tx.send(TaskResult {
            task_id: TaskId(1),
            worker_id: 0,
            source: entry("/src/dir", 0, true),
            target: None,
            is_dir: true,
            duration: Duration::ZERO,
            error: None,
        })
        .unwrap();
        tx.send(file_result(2, 2_000, None, 1)).unwrap();
        drop(tx);

        let last = handle.await.unwrap();
        assert_eq!(last.completed, 3);
        assert_eq!(last.errors, 1);
        assert_eq!(reader.snapshot(), last);

        let notices: Vec<_> = reader.notices().iter().collect();
        assert_eq!(notices.len(), 2);
        assert!(notices[0].error.is_none());
        assert!(notices[1].error.is_some());
        assert!(reader.notices().recv().is_err());
    }
}

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::task_processor::TaskProcessor;
use super::{FileEntry, WorklistItem};
use crate::error::SyncError;

/// Fixed-size pool of workers pulling tasks from one shared queue.
///
/// Results come out of the receiver returned by [`TaskManager::new`] in
/// completion order. It closes once every worker has exited.
pub struct TaskManager {
    num_workers: usize,

    /// Bounded for backpressure; dropped by `close` so workers drain and exit
    work_sender: Option<mpsc::Sender<Task>>,
    work_receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,

    /// Only the workers hold senders once started
    result_sender: Option<mpsc::UnboundedSender<TaskResult>>,

    workers: Vec<WorkerHandle>,
    stop: StopHandle,
    metrics: Arc<Mutex<PoolMetrics>>,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub item: WorklistItem,
}

/// Index of the item in the worklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub usize);

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub worker_id: usize,
    pub source: FileEntry,
    /// Resulting file, absent for directory maintenance and failures
    pub target: Option<FileEntry>,
    pub is_dir: bool,
    pub duration: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    /// Queued tasks dropped after a stop request
    pub discarded: u64,
}

/// Cooperative stop flag shared with whoever may interrupt the run.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let running tasks finish, start nothing new.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct WorkerHandle {
    id: usize,
    handle: tokio::task::JoinHandle<()>,
}

impl TaskManager {
    pub fn new(
        num_workers: usize,
        stop: StopHandle,
    ) -> (Self, mpsc::UnboundedReceiver<TaskResult>) {
        let num_workers = num_workers.max(1);
        let (work_sender, work_receiver) = mpsc::channel(num_workers * 2);
        let (result_sender, result_receiver) = mpsc::unbounded_channel();

        let manager = Self {
            num_workers,
            work_sender: Some(work_sender),
            work_receiver: Arc::new(tokio::sync::Mutex::new(work_receiver)),
            result_sender: Some(result_sender),
            workers: Vec::with_capacity(num_workers),
            stop,
            metrics: Arc::new(Mutex::new(PoolMetrics::default())),
        };
        (manager, result_receiver)
    }

    /// Spawn the workers. Tasks submitted before this wait in the queue.
    pub fn start(&mut self, processor: Arc<dyn TaskProcessor>) {
        let Some(result_sender) = self.result_sender.take() else {
            warn!("Task manager already started");
            return;
        };
        info!("Starting task manager with {} workers", self.num_workers);

        for worker_id in 0..self.num_workers {
            let handle = tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&self.work_receiver),
                result_sender.clone(),
                Arc::clone(&processor),
                self.stop.clone(),
                Arc::clone(&self.metrics),
            ));
            self.workers.push(WorkerHandle { id: worker_id, handle });
        }
    }

    /// Queue a task, waiting only while the queue is full.
    pub async fn submit(&self, task: Task) -> Result<(), SyncError> {
        if self.stop.is_stopped() {
            return Err(SyncError::Stopped);
        }
        let sender = self.work_sender.as_ref().ok_or(SyncError::Stopped)?;
        sender.send(task).await.map_err(|_| SyncError::Stopped)
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stop starting tasks and discard what is still queued.
    pub fn stop(&self) {
        self.stop.stop();
        if let Ok(mut queue) = self.work_receiver.try_lock() {
            let mut discarded = 0;
            while queue.try_recv().is_ok() {
                discarded += 1;
            }
            self.metrics.lock().discarded += discarded;
            debug!("Discarded {} queued tasks", discarded);
        }
    }

    /// No more tasks will be submitted.
    pub fn close(&mut self) {
        self.work_sender.take();
    }

    /// Close the queue and wait for every worker to exit.
    pub async fn join(&mut self) {
        self.close();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.handle.await {
                warn!("Worker {} ended abnormally: {}", worker.id, e);
            }
        }
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.metrics.lock().clone()
    }
}

/// Worker loop - runs in a separate tokio task
async fn worker_loop(
    worker_id: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    result_sender: mpsc::UnboundedSender<TaskResult>,
    processor: Arc<dyn TaskProcessor>,
    stop: StopHandle,
    metrics: Arc<Mutex<PoolMetrics>>,
) {
    debug!("Worker {} started", worker_id);

    loop {
        let task = {
            let mut queue = queue.lock().await;
            queue.recv().await
        };
        let Some(task) = task else {
            break;
        };

        if stop.is_stopped() {
            metrics.lock().discarded += 1;
            continue;
        }

        metrics.lock().started += 1;
        let start = Instant::now();
        let outcome = processor.process_task(worker_id, &task).await;
        let duration = start.elapsed();

        let (target, error) = match outcome {
            Ok(target) => {
                metrics.lock().completed += 1;
                (target, None)
            }
            Err(e) => {
                metrics.lock().failed += 1;
                (None, Some(format!("{:#}", e)))
            }
        };

        let _ = result_sender.send(TaskResult {
            task_id: task.id,
            worker_id,
            source: task.item.source().clone(),
            target,
            is_dir: task.item.is_dir(),
            duration,
            error,
        });
    }

    debug!("Worker {} shutting down", worker_id);
}

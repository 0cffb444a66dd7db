pub mod manager;
pub mod progress;
pub mod prune;
pub mod scanner;
pub mod task_manager;
pub mod task_processor;

pub use manager::{RunOptions, RunOutcome, RunReport, SyncManager};
pub use progress::{ProgressReader, ProgressSnapshot, ProgressTracker};
pub use scanner::DifferentialScanner;
pub use task_manager::{StopHandle, TaskManager};
pub use task_processor::{SyncTaskProcessor, TaskProcessor};

use crate::convert::ConversionRule;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A file or directory as seen when it was captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub modified: SystemTime,
    /// Byte size; always 0 for directories
    pub size: u64,
    pub is_dir: bool,
}

impl FileEntry {
    pub fn from_metadata(path: PathBuf, metadata: &Metadata) -> Self {
        let is_dir = metadata.is_dir();
        Self {
            path,
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size: if is_dir { 0 } else { metadata.len() },
            is_dir,
        }
    }

    /// Stat `path`, following symlinks.
    pub async fn stat(path: &Path) -> std::io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(Self::from_metadata(path.to_path_buf(), &metadata))
    }

    pub fn modified_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.modified)
    }
}

/// One unit of work produced by the scanner.
#[derive(Debug, Clone)]
pub enum WorklistItem {
    /// Make sure the target directory exists and drop entries without a source.
    Directory { source: FileEntry, target: PathBuf },
    /// Convert or copy one file.
    File {
        source: FileEntry,
        target: PathBuf,
        rule: ConversionRule,
    },
}

impl WorklistItem {
    pub fn source(&self) -> &FileEntry {
        match self {
            WorklistItem::Directory { source, .. } | WorklistItem::File { source, .. } => source,
        }
    }

    pub fn target(&self) -> &Path {
        match self {
            WorklistItem::Directory { target, .. } | WorklistItem::File { target, .. } => target,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, WorklistItem::Directory { .. })
    }
}

/// Scanner results. Once processing starts, tasks refer to items by index.
#[derive(Debug, Clone, Default)]
pub struct Worklist {
    items: Vec<WorklistItem>,
    /// Directories that could not be listed during the scan
    pub scan_errors: usize,
}

impl Worklist {
    pub fn push(&mut self, item: WorklistItem) -> usize {
        self.items.push(item);
        self.items.len() - 1
    }

    pub fn items(&self) -> &[WorklistItem] {
        &self.items
    }

    pub fn get(&self, index: usize) -> Option<&WorklistItem> {
        self.items.get(index)
    }

    pub fn directories(&self) -> impl Iterator<Item = &WorklistItem> {
        self.items.iter().filter(|i| i.is_dir())
    }

    pub fn files(&self) -> impl Iterator<Item = &WorklistItem> {
        self.items.iter().filter(|i| !i.is_dir())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of the sizes of all source files.
    pub fn total_source_bytes(&self) -> u64 {
        self.files().map(|i| i.source().size).sum()
    }

    /// Drop every item whose source is one of `roots` or lies below one.
    pub fn remove_under(&mut self, roots: &[PathBuf]) {
        if roots.is_empty() {
            return;
        }
        self.items
            .retain(|item| !roots.iter().any(|root| item.source().path.starts_with(root)));
    }

    /// Order by source path so output and tests are stable.
    pub fn sort(&mut self) {
        self.items.sort_by(|a, b| a.source().path.cmp(&b.source().path));
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Scanning,
    NothingToDo,
    ConfirmPending,
    Processing,
    Finalizing,
    Done,
    Stopped,
}

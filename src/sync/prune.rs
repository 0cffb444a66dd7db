//! Target-side housekeeping: directory maintenance and the initial wipe.

use crate::convert::RuleTable;
use std::collections::HashSet;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Entries of the target root that are never deleted.
#[derive(Debug, Clone)]
pub struct ReservedPaths {
    root: PathBuf,
    names: HashSet<OsString>,
}

impl ReservedPaths {
    pub fn new(root: &Path, names: &[String]) -> Self {
        Self {
            root: root.to_path_buf(),
            names: names.iter().map(OsString::from).collect(),
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.parent() == Some(self.root.as_path())
            && path
                .file_name()
                .map(|n| self.names.contains(n))
                .unwrap_or(false)
    }
}

/// Ensure `target` exists and delete every entry in it that has no
/// counterpart in `source`.
///
/// A file on the target is kept when some source file in the same directory
/// maps to its name under `rules`. Returns the number of removed entries.
pub async fn maintain_directory(
    source: &Path,
    target: &Path,
    rules: &RuleTable,
    reserved: &ReservedPaths,
) -> io::Result<usize> {
    tokio::fs::create_dir_all(target).await?;

    // Read the source first: if it cannot be listed nothing is deleted.
    let mut expected = HashSet::new();
    let mut entries = tokio::fs::read_dir(source).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let is_dir = tokio::fs::metadata(entry.path())
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if is_dir {
            expected.insert(name);
        } else if let Some(rule) = rules.lookup(&name.to_string_lossy()) {
            expected.insert(OsString::from(rule.target_name(&name.to_string_lossy())));
        }
    }

    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(target).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if expected.contains(&entry.file_name()) || reserved.contains(&path) {
            continue;
        }

        let result = match entry.file_type().await {
            Ok(t) if t.is_dir() => tokio::fs::remove_dir_all(&path).await,
            _ => tokio::fs::remove_file(&path).await,
        };
        match result {
            Ok(()) => {
                debug!("Removed obsolete {}", path.display());
                removed += 1;
            }
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }

    Ok(removed)
}

/// Delete everything in the target root except reserved entries.
pub async fn wipe_target(target_dir: &Path, reserved: &ReservedPaths) -> io::Result<usize> {
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(target_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if reserved.contains(&path) {
            continue;
        }
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        removed += 1;
    }
    info!("Cleared {} entries from {}", removed, target_dir.display());
    Ok(removed)
}

//! Differential scan of the source tree against the target tree.
//!
//! Each entry gets a verdict (include it in the worklist or not) and a
//! [`Propagation`] signal for its children. Once a directory is known to have
//! no counterpart on the target, nothing below it can have one either, so its
//! descendants are included without touching the target again.

use super::{FileEntry, Worklist, WorklistItem};
use crate::convert::{ConversionRule, RuleTable};
use crate::utils::config::SyncConfig;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// What a directory hands down to its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Children are included without checking the target
    Valid,
    /// Children are left out
    Invalid,
    /// Children are judged on their own
    Inherit,
}

/// Verdict for one entry.
#[derive(Debug, Clone)]
pub struct Decision {
    pub valid: bool,
    pub propagate: Propagation,
    /// Target counterpart, unset for entries that have no rule
    pub target: Option<PathBuf>,
    pub rule: Option<ConversionRule>,
}

impl Decision {
    fn irrelevant() -> Self {
        Self {
            valid: false,
            propagate: Propagation::Inherit,
            target: None,
            rule: None,
        }
    }
}

struct ScanContext {
    source_dir: PathBuf,
    target_dir: PathBuf,
    excluded: HashSet<PathBuf>,
    rules: RuleTable,
    last_sync: Option<DateTime<Utc>>,
    work_in_progress: bool,
    full: bool,
    check_each: bool,
}

/// A directory waiting to be listed.
struct Pending {
    path: PathBuf,
    inherited: Propagation,
    /// Resolved paths of this directory and every directory above it
    lineage: Vec<PathBuf>,
}

struct Listing {
    items: Vec<WorklistItem>,
    children: Vec<Pending>,
    /// Set when the directory could not be listed completely
    failed: Option<PathBuf>,
}

pub struct DifferentialScanner {
    ctx: Arc<ScanContext>,
    concurrency: usize,
}

impl DifferentialScanner {
    /// Scanner for `config`. With `full` every entry is included and the
    /// source root itself is not evaluated.
    pub fn new(config: &SyncConfig, full: bool) -> Self {
        Self {
            ctx: Arc::new(ScanContext {
                source_dir: config.source_dir.clone(),
                target_dir: config.target_dir.clone(),
                excluded: config.excluded.clone(),
                rules: config.rules.clone(),
                last_sync: config.last_sync,
                work_in_progress: config.work_in_progress,
                full,
                check_each: false,
            }),
            concurrency: config.scan_concurrency.max(1),
        }
    }

    /// Check every entry against the target even below a directory whose
    /// target is missing. Slower; the result is the same.
    pub fn check_each(mut self, yes: bool) -> Self {
        if let Some(ctx) = Arc::get_mut(&mut self.ctx) {
            ctx.check_each = yes;
        }
        self
    }

    pub async fn scan(&self) -> Worklist {
        let ctx = &self.ctx;
        info!(
            "Scanning {} (full: {}, last sync: {})",
            ctx.source_dir.display(),
            ctx.full,
            ctx.last_sync
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string())
        );

        let mut worklist = Worklist::default();
        let mut pending = VecDeque::new();

        let root_inherited = if ctx.full {
            Propagation::Valid
        } else {
            match FileEntry::stat(&ctx.source_dir).await {
                Ok(root) => {
                    let decision = ctx.evaluate(&root, Path::new(""), Propagation::Inherit).await;
                    if decision.valid {
                        if let Some(target) = decision.target {
                            worklist.push(WorklistItem::Directory { source: root, target });
                        }
                    }
                    decision.propagate
                }
                Err(e) => {
                    warn!("Cannot stat source root {}: {}", ctx.source_dir.display(), e);
                    worklist.scan_errors += 1;
                    return worklist;
                }
            }
        };

        let root_real = tokio::fs::canonicalize(&ctx.source_dir)
            .await
            .unwrap_or_else(|_| ctx.source_dir.clone());
        pending.push_back(Pending {
            path: ctx.source_dir.clone(),
            inherited: root_inherited,
            lineage: vec![root_real],
        });

        let mut unlisted = Vec::new();
        let mut running: JoinSet<Listing> = JoinSet::new();
        loop {
            while running.len() < self.concurrency {
                match pending.pop_front() {
                    Some(dir) => {
                        let ctx = Arc::clone(&self.ctx);
                        running.spawn(async move { ctx.list(dir).await });
                    }
                    None => break,
                }
            }

            match running.join_next().await {
                Some(Ok(listing)) => {
                    if let Some(dir) = listing.failed {
                        worklist.scan_errors += 1;
                        unlisted.push(dir);
                    }
                    for item in listing.items {
                        worklist.push(item);
                    }
                    pending.extend(listing.children);
                }
                Some(Err(e)) => {
                    warn!("Directory listing task failed: {}", e);
                    worklist.scan_errors += 1;
                }
                None => break,
            }
        }

        // A directory that could not be listed is left out entirely, itself
        // included, so nothing below it is pruned or converted.
        worklist.remove_under(&unlisted);
        worklist.sort();
        info!(
            "Scan found {} directories and {} files to process ({} errors)",
            worklist.directories().count(),
            worklist.files().count(),
            worklist.scan_errors
        );
        worklist
    }
}

impl ScanContext {
    async fn list(&self, dir: Pending) -> Listing {
        let mut listing = Listing {
            items: Vec::new(),
            children: Vec::new(),
            failed: None,
        };

        let mut entries = match tokio::fs::read_dir(&dir.path).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot list {}: {}", dir.path.display(), e);
                listing.failed = Some(dir.path);
                return listing;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Error while listing {}: {}", dir.path.display(), e);
                    listing.items.clear();
                    listing.children.clear();
                    listing.failed = Some(dir.path.clone());
                    break;
                }
            };

            let path = entry.path();
            let source = match FileEntry::stat(&path).await {
                Ok(source) => source,
                Err(e) => {
                    warn!("Cannot stat {}: {}", path.display(), e);
                    continue;
                }
            };
            let rel = match path.strip_prefix(&self.source_dir) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => {
                    warn!("{} is outside of {}", path.display(), self.source_dir.display());
                    continue;
                }
            };

            // Directories are stat'ed through symlinks, so one that resolves
            // to itself or an ancestor would be walked forever.
            let mut lineage = Vec::new();
            if source.is_dir {
                let real = tokio::fs::canonicalize(&path)
                    .await
                    .unwrap_or_else(|_| path.clone());
                if dir.lineage.contains(&real) {
                    warn!("Skipping {}: loops back to {}", path.display(), real.display());
                    continue;
                }
                lineage = dir.lineage.clone();
                lineage.push(real);
            }

            let decision = self.evaluate(&source, &rel, dir.inherited).await;

            if source.is_dir && decision.propagate != Propagation::Invalid {
                listing.children.push(Pending {
                    path: path.clone(),
                    inherited: decision.propagate,
                    lineage,
                });
            }

            if !decision.valid {
                continue;
            }
            let Some(target) = decision.target else {
                continue;
            };
            let item = match decision.rule {
                Some(rule) => WorklistItem::File {
                    source,
                    target,
                    rule,
                },
                None => WorklistItem::Directory { source, target },
            };
            listing.items.push(item);
        }

        listing
    }

    /// Decide whether `entry` (at `rel` below the source root) needs work.
    pub(crate) async fn evaluate(
        &self,
        entry: &FileEntry,
        rel: &Path,
        inherited: Propagation,
    ) -> Decision {
        let mut rule = None;
        if !entry.is_dir {
            let name = match entry.path.file_name() {
                Some(n) => n.to_string_lossy().into_owned(),
                None => return Decision::irrelevant(),
            };
            match self.rules.lookup(&name) {
                Some(r) => rule = Some(r.clone()),
                None => {
                    debug!("No rule for {}", entry.path.display());
                    return Decision::irrelevant();
                }
            }
        }

        if self.excluded.contains(&entry.path) {
            debug!("Excluded {}", entry.path.display());
            return Decision {
                valid: false,
                propagate: Propagation::Invalid,
                target: None,
                rule: None,
            };
        }

        let target = match &rule {
            Some(r) => {
                let source_name = entry.path.file_name().unwrap_or_default();
                let name = r.target_name(&source_name.to_string_lossy());
                let parent = rel.parent().unwrap_or_else(|| Path::new(""));
                self.target_dir.join(parent).join(name)
            }
            None if rel.as_os_str().is_empty() => self.target_dir.clone(),
            None => self.target_dir.join(rel),
        };

        let decided = |valid: bool, propagate: Propagation, rule: Option<ConversionRule>| Decision {
            valid,
            propagate,
            target: Some(target.clone()),
            rule,
        };

        if inherited == Propagation::Invalid {
            return decided(false, Propagation::Invalid, rule);
        }
        if inherited == Propagation::Valid && !self.check_each {
            return decided(true, Propagation::Valid, rule);
        }

        if self.full {
            return decided(true, Propagation::Valid, rule);
        }

        let existing = match tokio::fs::metadata(&target).await {
            Ok(m) => FileEntry::from_metadata(target.clone(), &m),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return decided(true, Propagation::Valid, rule);
            }
            Err(e) => {
                warn!("Cannot stat target {}: {}", target.display(), e);
                return decided(false, Propagation::Inherit, rule);
            }
        };

        let after_last_sync = match self.last_sync {
            Some(last) => entry.modified_utc() > last,
            None => true,
        };
        let valid = if self.work_in_progress {
            // The previous run stopped early: last_sync is unconfirmed, so
            // files compare against what is actually on the target.
            // Directories keep the wider check since pruning is repeatable.
            entry.modified > existing.modified || (entry.is_dir && after_last_sync)
        } else {
            after_last_sync
        };

        decided(valid, Propagation::Inherit, rule)
    }
}

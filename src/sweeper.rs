#![forbid(unsafe_code)]

//! Background retention: the periodic expiry sweep plus the orphan purge that
//! catches files no history points at any more.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use chrono::Utc;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::history::{HistoryStore, SweepReport};
use crate::storage::{FileRemoval, remove_backing_file};

/// Drives [`HistoryStore::sweep_expired`] on a fixed period until cancelled.
pub struct RetentionSweeper {
    store: Arc<HistoryStore>,
    period: Duration,
}

impl RetentionSweeper {
    pub fn new(store: Arc<HistoryStore>, period: Duration) -> Self {
        Self { store, period }
    }

    /// Runs one sweep immediately and then one per period. Cancellation is
    /// only observed between passes, so a persist that has started always
    /// finishes.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("retention sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                }
            }
        })
    }

    pub async fn run_once(&self) -> Option<SweepReport> {
        match self.store.sweep_expired(Utc::now()).await {
            Ok(report) => {
                if report.entries_removed > 0 || report.users_failed > 0 {
                    info!(
                        users = report.users_scanned,
                        removed = report.entries_removed,
                        deleted = report.files_deleted,
                        failed = report.users_failed,
                        "retention sweep finished"
                    );
                } else {
                    debug!(users = report.users_scanned, "retention sweep found nothing to do");
                }
                Some(report)
            }
            Err(err) => {
                warn!(error = %err, "retention sweep could not list histories");
                None
            }
        }
    }
}

/// Deletes regular files under `downloads_dir` that are not in `referenced`
/// and were last modified more than `older_than` ago. Such files are left
/// behind when the process dies between persisting a history and deleting
/// what it evicted, or when recording a finished download failed.
///
/// Returns the paths that were removed.
pub fn purge_orphans(
    downloads_dir: &Path,
    referenced: &BTreeSet<PathBuf>,
    older_than: Duration,
) -> Vec<PathBuf> {
    let cutoff = SystemTime::now()
        .checked_sub(older_than)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = Vec::new();

    for entry in WalkDir::new(downloads_dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if referenced.contains(path) {
            continue;
        }
        let modified = entry
            .metadata()
            .ok()
            .and_then(|meta| meta.modified().ok());
        if modified.is_some_and(|time| time > cutoff) {
            continue;
        }
        if remove_backing_file(path) == FileRemoval::Deleted {
            removed.push(path.to_path_buf());
        }
    }

    if !removed.is_empty() {
        info!(count = removed.len(), dir = %downloads_dir.display(), "purged orphaned downloads");
    }
    removed
}

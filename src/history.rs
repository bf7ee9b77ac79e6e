#![forbid(unsafe_code)]

//! Per-user download history with bounded length and expiring files.
//!
//! [`UserHistory`] holds the pure list rules (newest first, bounded, unique
//! file paths, expiry). [`HistoryStore`] wraps it with persistence and one
//! lock per user key so different users never wait on each other while every
//! mutation for a single user is serialized, across processes too.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    path::PathBuf,
    str::FromStr,
    sync::Arc,
};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::storage::{FileRemoval, HistoryStorage, remove_backing_file};

/// Key used when a request carries no user identity.
pub const ANONYMOUS_USER: &str = "anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Mp4,
    Mp3,
    Webm,
    Opus,
    Best,
}

impl MediaFormat {
    pub const ALL: [MediaFormat; 5] = [
        MediaFormat::Mp4,
        MediaFormat::Mp3,
        MediaFormat::Webm,
        MediaFormat::Opus,
        MediaFormat::Best,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mp3 => "mp3",
            Self::Webm => "webm",
            Self::Opus => "opus",
            Self::Best => "best",
        }
    }

    pub fn is_audio(self) -> bool {
        matches!(self, Self::Mp3 | Self::Opus)
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaFormat {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|format| format.as_str() == normalized)
            .ok_or_else(|| format!("unsupported format: {value}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub filename: String,
    pub title: String,
    pub format: MediaFormat,
    #[serde(default)]
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub file_path: PathBuf,
}

impl HistoryEntry {
    /// An entry has expired once `now` reaches its expiry instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A finished extraction, handed to [`HistoryStore::record_download`].
#[derive(Debug, Clone)]
pub struct CompletedDownload {
    pub filename: String,
    pub title: String,
    pub format: MediaFormat,
    pub url: String,
    pub file_path: PathBuf,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub max_entries: usize,
    pub retention: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_entries: 20,
            retention: Duration::hours(1),
        }
    }
}

/// Ordered list of one user's downloads, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserHistory {
    entries: Vec<HistoryEntry>,
}

impl UserHistory {
    /// Rebuilds a history from a persisted list, dropping later duplicates of
    /// a file path so the uniqueness invariant holds even for hand-edited
    /// records.
    pub fn from_entries(entries: Vec<HistoryEntry>) -> Self {
        let mut seen = BTreeSet::new();
        let entries = entries
            .into_iter()
            .filter(|entry| seen.insert(entry.file_path.clone()))
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<HistoryEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Puts `entry` at the front and returns the entries pushed past
    /// `max_entries`, oldest last. An existing entry for the same file path is
    /// replaced in place of being duplicated; its file is now owned by the new
    /// entry, so it is not returned for deletion.
    pub fn record(&mut self, entry: HistoryEntry, max_entries: usize) -> Vec<HistoryEntry> {
        self.entries
            .retain(|existing| existing.file_path != entry.file_path);
        self.entries.insert(0, entry);
        let keep = max_entries.max(1);
        if self.entries.len() > keep {
            self.entries.split_off(keep)
        } else {
            Vec::new()
        }
    }

    /// Removes and returns every expired entry, keeping the order of the rest.
    pub fn take_expired(&mut self, now: DateTime<Utc>) -> Vec<HistoryEntry> {
        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| entry.is_expired(now));
        self.entries = live;
        expired
    }
}

/// Totals from one pass of [`HistoryStore::sweep_expired`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub users_scanned: usize,
    pub entries_removed: usize,
    pub files_deleted: usize,
    pub users_failed: usize,
}

type Lanes = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// The history service shared by request handlers and the sweeper.
///
/// Every mutation reloads the record while holding the storage's per-user
/// record lock, so the server and a cron `sweep` can share one history
/// directory. Inside a process, a lane per user keeps tasks from queueing on
/// that lock from blocking threads. Idle lanes are dropped.
pub struct HistoryStore {
    storage: Arc<dyn HistoryStorage>,
    policy: RetentionPolicy,
    lanes: Lanes,
}

/// A held lane. Dropping it releases the lane and removes it from the map
/// when no other task is waiting on it.
struct LaneGuard<'a> {
    lanes: &'a Lanes,
    user: String,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for LaneGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut lanes = self.lanes.lock();
        if lanes
            .get(&self.user)
            .is_some_and(|lane| Arc::strong_count(lane) == 1)
        {
            lanes.remove(&self.user);
        }
    }
}

fn load_history(storage: &dyn HistoryStorage, user: &str) -> Result<UserHistory> {
    Ok(storage
        .load(user)?
        .map(UserHistory::from_entries)
        .unwrap_or_default())
}

impl HistoryStore {
    pub fn new(storage: Arc<dyn HistoryStorage>, policy: RetentionPolicy) -> Self {
        Self {
            storage,
            policy,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    async fn enter_lane(&self, user: &str) -> LaneGuard<'_> {
        let lane = self
            .lanes
            .lock()
            .entry(user.to_string())
            .or_default()
            .clone();
        LaneGuard {
            lanes: &self.lanes,
            user: user.to_string(),
            held: Some(lane.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Runs filesystem work for the store on the blocking pool.
    async fn with_storage<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&dyn HistoryStorage) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || job(storage.as_ref())).await?
    }

    /// Adds a completed download to the front of `user`'s history, evicting
    /// the oldest entry and deleting its file when the bound is exceeded.
    /// Evicted files are deleted only after the new list is persisted.
    pub async fn record_download(
        &self,
        user: &str,
        download: CompletedDownload,
    ) -> Result<HistoryEntry> {
        let _lane = self.enter_lane(user).await;

        let entry = HistoryEntry {
            filename: download.filename,
            title: download.title,
            format: download.format,
            url: download.url,
            created_at: download.completed_at,
            expires_at: download.completed_at + self.policy.retention,
            file_path: download.file_path,
        };

        let owner = user.to_string();
        let recorded = entry.clone();
        let max_entries = self.policy.max_entries;
        self.with_storage(move |storage| {
            let _record = storage.lock_record(&owner)?;
            let mut next = load_history(storage, &owner)?;
            let evicted = next.record(recorded, max_entries);
            storage.save(&owner, next.entries())?;

            for old in &evicted {
                debug!(user = %owner, file = %old.filename, "history full; evicting oldest download");
                remove_backing_file(&old.file_path);
            }
            Ok(())
        })
        .await?;

        info!(user, file = %entry.filename, format = %entry.format, "recorded download");
        Ok(entry)
    }

    /// Current entries for `user`, newest first. Users without a history get
    /// an empty list. Records are replaced by rename, so reads need no lock.
    pub async fn get_history(&self, user: &str) -> Result<Vec<HistoryEntry>> {
        let owner = user.to_string();
        self.with_storage(move |storage| Ok(load_history(storage, &owner)?.into_entries()))
            .await
    }

    /// Looks up one of `user`'s entries by its public file name.
    pub async fn find_entry(&self, user: &str, filename: &str) -> Result<Option<HistoryEntry>> {
        let entries = self.get_history(user).await?;
        Ok(entries.into_iter().find(|entry| entry.filename == filename))
    }

    /// Empties `user`'s history and deletes every backing file. Returns how
    /// many entries were dropped; clearing an empty history returns 0. When
    /// the record cannot be removed nothing is deleted.
    pub async fn clear_history(&self, user: &str) -> Result<usize> {
        let _lane = self.enter_lane(user).await;

        let owner = user.to_string();
        let removed = self
            .with_storage(move |storage| {
                let _record = storage.lock_record(&owner)?;
                let current = load_history(storage, &owner)?;
                storage.remove(&owner)?;
                for entry in current.entries() {
                    remove_backing_file(&entry.file_path);
                }
                Ok(current.len())
            })
            .await?;

        if removed > 0 {
            info!(user, removed, "cleared history");
        }
        Ok(removed)
    }

    /// Every user key that has a persisted record.
    pub async fn known_users(&self) -> Result<Vec<String>> {
        self.with_storage(|storage| storage.users()).await
    }

    /// Every file path referenced by any history.
    pub async fn referenced_files(&self) -> Result<BTreeSet<PathBuf>> {
        let mut files = BTreeSet::new();
        for user in self.known_users().await? {
            for entry in self.get_history(&user).await? {
                files.insert(entry.file_path);
            }
        }
        Ok(files)
    }

    /// Drops every entry that has expired at `now` across all users. Backing
    /// files go first, then the filtered list is persisted when something
    /// changed. A failure for one user is logged and the pass continues.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for user in self.known_users().await? {
            report.users_scanned += 1;
            match self.sweep_user(&user, now).await {
                Ok((removed, deleted)) => {
                    report.entries_removed += removed;
                    report.files_deleted += deleted;
                }
                Err(err) => {
                    report.users_failed += 1;
                    warn!(user = %user, error = %err, "sweep failed for user");
                }
            }
        }
        Ok(report)
    }

    async fn sweep_user(&self, user: &str, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let _lane = self.enter_lane(user).await;

        let owner = user.to_string();
        self.with_storage(move |storage| {
            let _record = storage.lock_record(&owner)?;
            let mut next = load_history(storage, &owner)?;
            let expired = next.take_expired(now);
            if expired.is_empty() {
                return Ok((0, 0));
            }

            let deleted = expired
                .iter()
                .filter(|entry| remove_backing_file(&entry.file_path) == FileRemoval::Deleted)
                .count();
            storage.save(&owner, next.entries())?;
            debug!(user = %owner, removed = expired.len(), "swept expired downloads");
            Ok((expired.len(), deleted))
        })
        .await
    }
}

#![forbid(unsafe_code)]

//! Storage boundary of the history layer.
//!
//! Each user key owns one JSON document holding its entries newest first.
//! Writes go to a temporary file in the same directory which is then renamed
//! over the record, so readers only ever observe a complete document.
//! Writers serialize on an advisory `flock` of a sibling `.lock` file, which
//! also holds across processes sharing the directory.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use nix::fcntl::{Flock, FlockArg};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{HistoryError, Result};
use crate::history::HistoryEntry;

const RECORD_EXTENSION: &str = "json";
const LOCK_EXTENSION: &str = "lock";

/// Exclusive hold on one user's record, released on drop.
pub struct RecordLock {
    _held: Option<Flock<File>>,
}

impl RecordLock {
    /// A lock that guards nothing, for storages without shared state.
    pub fn unlocked() -> Self {
        Self { _held: None }
    }
}

/// Durable per-user history records.
pub trait HistoryStorage: Send + Sync {
    /// Returns `None` when the user has no record yet.
    fn load(&self, user: &str) -> Result<Option<Vec<HistoryEntry>>>;

    fn save(&self, user: &str, entries: &[HistoryEntry]) -> Result<()>;

    /// Drops the record. Removing an absent record succeeds.
    fn remove(&self, user: &str) -> Result<()>;

    /// Every user key that currently has a record.
    fn users(&self) -> Result<Vec<String>>;

    /// Blocks until this caller is the only writer of `user`'s record.
    fn lock_record(&self, _user: &str) -> Result<RecordLock> {
        Ok(RecordLock::unlocked())
    }
}

/// One `<encoded user key>.json` file per user inside a single directory.
///
/// User keys are base64url encoded so arbitrary identities (emails, OAuth
/// subject ids) map onto safe file names and decode back losslessly.
pub struct JsonDirStorage {
    dir: PathBuf,
}

impl JsonDirStorage {
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, user: &str) -> PathBuf {
        self.user_path(user, RECORD_EXTENSION)
    }

    fn user_path(&self, user: &str, extension: &str) -> PathBuf {
        let encoded = URL_SAFE_NO_PAD.encode(user.as_bytes());
        self.dir.join(format!("{encoded}.{extension}"))
    }
}

impl HistoryStorage for JsonDirStorage {
    fn load(&self, user: &str) -> Result<Option<Vec<HistoryEntry>>> {
        let path = self.record_path(user);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(HistoryError::StorageRead {
                    user: user.to_string(),
                    source,
                });
            }
        };
        match serde_json::from_str(&raw) {
            Ok(entries) => Ok(Some(entries)),
            Err(err) => {
                warn!(user, path = %path.display(), error = %err, "discarding unreadable history record");
                Ok(Some(Vec::new()))
            }
        }
    }

    fn save(&self, user: &str, entries: &[HistoryEntry]) -> Result<()> {
        let payload = serde_json::to_vec_pretty(entries).map_err(|source| HistoryError::Encode {
            user: user.to_string(),
            source,
        })?;
        let write_err = |source| HistoryError::StorageWrite {
            user: user.to_string(),
            source,
        };

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(write_err)?;
        tmp.write_all(&payload).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(self.record_path(user))
            .map_err(|err| write_err(err.error))?;
        Ok(())
    }

    fn remove(&self, user: &str) -> Result<()> {
        match fs::remove_file(self.record_path(user)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(HistoryError::StorageWrite {
                user: user.to_string(),
                source,
            }),
        }
    }

    fn users(&self) -> Result<Vec<String>> {
        let listing = |source| HistoryError::Listing {
            path: self.dir.clone(),
            source,
        };
        let mut users = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(listing)? {
            let path = entry.map_err(listing)?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match URL_SAFE_NO_PAD
                .decode(stem)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
            {
                Some(user) => users.push(user),
                None => debug!(path = %path.display(), "skipping foreign file in history dir"),
            }
        }
        users.sort();
        Ok(users)
    }

    fn lock_record(&self, user: &str) -> Result<RecordLock> {
        let lock_err = |source| HistoryError::Lock {
            user: user.to_string(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.user_path(user, LOCK_EXTENSION))
            .map_err(lock_err)?;
        let held = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| lock_err(io::Error::from(errno)))?;
        Ok(RecordLock { _held: Some(held) })
    }
}

/// What happened when a backing file was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRemoval {
    Deleted,
    AlreadyGone,
    Failed,
}

/// Deletes a download's backing file. Never fails: a missing file counts as
/// cleaned and any other error is logged and reported as [`FileRemoval::Failed`].
pub fn remove_backing_file(path: &Path) -> FileRemoval {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "deleted download");
            FileRemoval::Deleted
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "download already gone");
            FileRemoval::AlreadyGone
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to delete download; leaving orphan");
            FileRemoval::Failed
        }
    }
}

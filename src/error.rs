#![forbid(unsafe_code)]

//! Error taxonomy for the history layer.
//!
//! A missing history is never an error, and failed deletions of backing files
//! are logged where they happen. Only storage failures reach callers.

use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("reading history for {user}: {source}")]
    StorageRead {
        user: String,
        #[source]
        source: io::Error,
    },

    #[error("writing history for {user}: {source}")]
    StorageWrite {
        user: String,
        #[source]
        source: io::Error,
    },

    #[error("encoding history for {user}: {source}")]
    Encode {
        user: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("locking history for {user}: {source}")]
    Lock {
        user: String,
        #[source]
        source: io::Error,
    },

    #[error("history task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("listing histories in {}: {source}", path.display())]
    Listing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl HistoryError {
    /// True for failures that happened while persisting a change.
    pub fn is_write_failure(&self) -> bool {
        matches!(
            self,
            Self::StorageWrite { .. } | Self::Encode { .. } | Self::Lock { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, HistoryError>;

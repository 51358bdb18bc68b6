//! Error kinds raised by the event store.
//!
//! Directory creation, permission and write failures are distinct variants so
//! callers and logs can tell them apart. Only [`StoreError::is_transient`]
//! errors are retried by the flush path.
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("permission denied at {path:?}: {source}")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode part {path:?}: {reason}")]
    Encode { path: PathBuf, reason: String },
    #[error("part file {path:?} already exists")]
    PartExists { path: PathBuf },
    #[error("invalid session id {0:?}")]
    InvalidSessionId(String),
    #[error("session {session_id} is already owned by another writer (lock {path:?}, holder pid {holder_pid:?})")]
    SessionLocked {
        session_id: String,
        path: PathBuf,
        holder_pid: Option<u32>,
    },
    #[error("cannot resume session {session_id}: {reason}")]
    Resume { session_id: String, reason: String },
    #[error("lock metadata at {path:?} is corrupt: {source}")]
    LockCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("flush of doc_type {doc_type} failed after {attempts} attempt(s); {records} records re-buffered")]
    FlushFailed {
        doc_type: String,
        attempts: u32,
        records: usize,
        #[source]
        source: Box<StoreError>,
    },
    #[error("sequence invariant violated: got {got}, expected {expected}")]
    SequenceViolation { expected: u64, got: u64 },
    #[error("event store for session {0} is poisoned")]
    Poisoned(String),
    #[error("event store for session {0} is stopped")]
    Stopped(String),
    #[error("{failures} buffer flush(es) failed during shutdown; {abandoned} records abandoned")]
    ShutdownIncomplete { failures: usize, abandoned: usize },
}

impl StoreError {
    pub(crate) fn create_dir(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            StoreError::PermissionDenied { path: path.to_path_buf(), source }
        } else {
            StoreError::CreateDir { path: path.to_path_buf(), source }
        }
    }

    pub(crate) fn write(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            StoreError::PermissionDenied { path: path.to_path_buf(), source }
        } else {
            StoreError::Write { path: path.to_path_buf(), source }
        }
    }

    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::CreateDir { .. } | StoreError::Write { .. })
    }

    /// Programming invariant violations; the store stops itself on these.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            StoreError::SequenceViolation { .. } | StoreError::PartExists { .. } | StoreError::SessionLocked { .. }
        )
    }
}

//! Single-writer ownership of a session's storage area.
//!
//! Ownership is taken once, when the store is constructed, by creating
//! `<root>/_writers/session_id=<id>.lock` with create-new semantics. A second
//! writer for the same session cannot be constructed; the write path itself
//! never locks.
use super::error::StoreError;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const WRITERS_DIR: &str = "_writers";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLockMeta {
    pub session_id: String,
    pub pid: u32,
    pub acquired_unix_ms: u64,
}

#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
    meta: SessionLockMeta,
    released: bool,
}

impl SessionLock {
    pub fn acquire(root: &Path, session_id: &str) -> Result<Self, StoreError> {
        let dir = root.join(WRITERS_DIR);
        fs::create_dir_all(&dir).map_err(|source| StoreError::create_dir(&dir, source))?;
        let path = lock_path(root, session_id);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let holder_pid = read_lock_meta(&path).ok().map(|meta| meta.pid);
                return Err(StoreError::SessionLocked {
                    session_id: session_id.to_string(),
                    path,
                    holder_pid,
                });
            }
            Err(err) => return Err(StoreError::write(&path, err)),
        };

        let meta = SessionLockMeta {
            session_id: session_id.to_string(),
            pid: std::process::id(),
            acquired_unix_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        };
        if let Err(err) = write_meta(&mut file, &path, &meta) {
            let _ = fs::remove_file(&path);
            return Err(err);
        }

        Ok(Self { path, meta, released: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta(&self) -> &SessionLockMeta {
        &self.meta
    }

    pub fn release(mut self) -> Result<(), StoreError> {
        if !self.released {
            self.released = true;
            fs::remove_file(&self.path).map_err(|source| StoreError::write(&self.path, source))?;
        }
        Ok(())
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

pub fn lock_path(root: &Path, session_id: &str) -> PathBuf {
    root.join(WRITERS_DIR).join(format!("session_id={session_id}.lock"))
}

pub fn read_lock_meta(path: &Path) -> Result<SessionLockMeta, StoreError> {
    let bytes = fs::read(path).map_err(|source| StoreError::write(path, source))?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::LockCorrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn write_meta(file: &mut File, path: &Path, meta: &SessionLockMeta) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(meta).map_err(|source| StoreError::LockCorrupt {
        path: path.to_path_buf(),
        source,
    })?;
    file.write_all(&bytes).map_err(|source| StoreError::write(path, source))?;
    file.sync_all().map_err(|source| StoreError::write(path, source))
}

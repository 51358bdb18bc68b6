//! Partition layout and atomic part-file writes.
//!
//! Layout: `<root>/doc_type=<doc_type>/session_id=<session_id>/part-<n>.cols`.
//! A part is written to a hidden temp file in the partition directory,
//! fsynced and then renamed into place, so readers only ever see complete
//! parts.
use super::error::StoreError;
use crate::record::{ColumnBatch, encode_frame};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const PART_EXTENSION: &str = "cols";

pub fn partition_dir(root: &Path, doc_type: &str, session_id: &str) -> PathBuf {
    root.join(format!("doc_type={doc_type}"))
        .join(format!("session_id={session_id}"))
}

pub fn part_file_name(index: u64) -> String {
    format!("part-{index:05}.{PART_EXTENSION}")
}

/// Index encoded in a part file name, if `name` is one.
pub fn parse_part_index(name: &str) -> Option<u64> {
    name.strip_prefix("part-")?
        .strip_suffix(&format!(".{PART_EXTENSION}"))?
        .parse()
        .ok()
}

/// First unused part index in `dir` (0 when the partition does not exist).
pub fn next_part_index(dir: &Path) -> Result<u64, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(StoreError::write(dir, err)),
    };
    let mut next = 0;
    for entry in entries {
        let entry = entry.map_err(|source| StoreError::write(dir, source))?;
        if let Some(index) = entry.file_name().to_str().and_then(parse_part_index) {
            next = next.max(index + 1);
        }
    }
    Ok(next)
}

/// Write `batch` as part `index` of the partition at `dir`.
pub fn write_part(dir: &Path, index: u64, batch: &ColumnBatch) -> Result<PathBuf, StoreError> {
    fs::create_dir_all(dir).map_err(|source| StoreError::create_dir(dir, source))?;
    let name = part_file_name(index);
    let final_path = dir.join(&name);
    if final_path.exists() {
        return Err(StoreError::PartExists { path: final_path });
    }
    let frame = encode_frame(batch).map_err(|err| StoreError::Encode {
        path: final_path.clone(),
        reason: err.to_string(),
    })?;

    let tmp_path = dir.join(format!(".{name}.tmp"));
    let written = (|| -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
        file.write_all(&frame)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &final_path)
    })();
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(StoreError::write(&final_path, err));
    }
    Ok(final_path)
}

//! Read side of the persisted layout, for replay and analysis tooling.
//!
//! Total session order is rebuilt from `(session_id, seq)` alone: parts from
//! every doc type partition are loaded and sorted by `seq`.
use super::part::{PART_EXTENSION, parse_part_index};
use crate::record::{PersistedRecord, read_frame};
use anyhow::{Context, Result, bail};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Part files of one partition, ordered by index.
pub fn list_parts(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut parts = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read partition {dir:?}"))? {
        let entry = entry?;
        if let Some(index) = entry.file_name().to_str().and_then(parse_part_index) {
            parts.push((index, entry.path()));
        }
    }
    parts.sort_by_key(|(index, _)| *index);
    Ok(parts)
}

pub fn read_part(path: &Path) -> Result<Vec<PersistedRecord>> {
    let mut rdr = BufReader::new(File::open(path).with_context(|| format!("open {path:?}"))?);
    read_frame(&mut rdr)
        .and_then(|batch| batch.into_records())
        .with_context(|| format!("decode {path:?}"))
}

fn partition_values(dir: &Path, key: &str) -> Result<Vec<(String, PathBuf)>> {
    let prefix = format!("{key}=");
    let mut out = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(err) => return Err(err).with_context(|| format!("read {dir:?}")),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(value) = entry.file_name().to_str().and_then(|n| n.strip_prefix(prefix.as_str())) {
            out.push((value.to_string(), entry.path()));
        }
    }
    out.sort();
    Ok(out)
}

pub fn doc_types(root: &Path) -> Result<Vec<String>> {
    Ok(partition_values(root, "doc_type")?.into_iter().map(|(d, _)| d).collect())
}

/// Every session id with at least one partition under `root`.
pub fn sessions(root: &Path) -> Result<Vec<String>> {
    let mut out = BTreeSet::new();
    for (_, doc_dir) in partition_values(root, "doc_type")? {
        for (session, _) in partition_values(&doc_dir, "session_id")? {
            out.insert(session);
        }
    }
    Ok(out.into_iter().collect())
}

/// All persisted records of a session in total order.
pub fn load_session(root: &Path, session_id: &str) -> Result<Vec<PersistedRecord>> {
    let mut records = Vec::new();
    for (_, doc_dir) in partition_values(root, "doc_type")? {
        for (session, dir) in partition_values(&doc_dir, "session_id")? {
            if session != session_id {
                continue;
            }
            for (_, path) in list_parts(&dir)? {
                records.extend(read_part(&path)?);
            }
        }
    }
    records.sort_by_key(|r| r.seq);
    Ok(records)
}

/// Highest sequence number persisted for `session_id`, read from the last
/// part of each doc type partition.
pub fn last_seq(root: &Path, session_id: &str) -> Result<Option<u64>> {
    let mut last = None;
    for (_, doc_dir) in partition_values(root, "doc_type")? {
        for (session, dir) in partition_values(&doc_dir, "session_id")? {
            if session != session_id {
                continue;
            }
            if let Some((_, path)) = list_parts(&dir)?.pop() {
                let part_max = read_part(&path)?.iter().map(|r| r.seq).max();
                last = last.max(part_max);
            }
        }
    }
    Ok(last)
}

/// Check that `records` (sorted by seq) form a gapless run starting at 0.
pub fn verify_total_order(records: &[PersistedRecord]) -> Result<()> {
    for (expected, rec) in records.iter().enumerate() {
        let expected = expected as u64;
        if rec.seq != expected {
            bail!(
                "sequence gap in session {}: expected seq {expected}, found {} ({} in doc_type {})",
                rec.session_id,
                rec.seq,
                rec.event_name,
                rec.doc_type
            );
        }
    }
    Ok(())
}

/// Leftover temp files from interrupted writes.
pub fn stray_temp_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let suffix = format!(".{PART_EXTENSION}.tmp");
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_str().is_some_and(|n| n.starts_with('.') && n.ends_with(&suffix)) {
            out.push(entry.path());
        }
    }
    Ok(out)
}

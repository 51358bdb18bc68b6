//! Per-doc-type write buffers and the hybrid size/time flush policy.
//!
//! Sequence numbers are handed out here, when a record enters a buffer, so
//! they are gapless per session regardless of doc type or flush order.
use super::error::StoreError;
use crate::record::PersistedRecord;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub max_records: usize,
    pub max_age: Duration,
}

impl FlushPolicy {
    /// A non-empty buffer is due once it is full or `max_age` has passed since
    /// its last flush, whichever comes first.
    pub fn is_due(&self, len: usize, since_last_flush: Duration) -> bool {
        len > 0 && (len >= self.max_records || since_last_flush >= self.max_age)
    }
}

#[derive(Debug)]
pub struct DocBuffer {
    records: Vec<PersistedRecord>,
    last_flush: Instant,
    /// Resolved from the partition directory on first flush.
    next_part: Option<u64>,
    /// Set after a failed flush; automatic flushes wait until then.
    retry_after: Option<Instant>,
}

impl DocBuffer {
    pub fn new(now: Instant) -> Self {
        Self {
            records: Vec::new(),
            last_flush: now,
            next_part: None,
            retry_after: None,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn next_part(&self) -> Option<u64> {
        self.next_part
    }

    pub fn has_failed(&self) -> bool {
        self.retry_after.is_some()
    }

    pub fn is_due(&self, policy: &FlushPolicy, now: Instant) -> bool {
        if self.retry_after.is_some_and(|at| now < at) {
            return false;
        }
        policy.is_due(self.records.len(), now.saturating_duration_since(self.last_flush))
    }

    /// Sequence range currently buffered.
    pub fn seq_range(&self) -> Option<(u64, u64)> {
        Some((self.records.first()?.seq, self.records.last()?.seq))
    }

    fn push(&mut self, record: PersistedRecord) {
        self.records.push(record);
    }

    pub fn take(&mut self) -> Vec<PersistedRecord> {
        std::mem::take(&mut self.records)
    }

    /// Put records from a failed flush back in front of anything buffered
    /// since.
    pub fn restore(&mut self, mut failed: Vec<PersistedRecord>, retry_after: Instant) {
        failed.append(&mut self.records);
        self.records = failed;
        self.retry_after = Some(retry_after);
    }

    pub fn mark_flushed(&mut self, now: Instant, part: u64) {
        self.last_flush = now;
        self.next_part = Some(part + 1);
        self.retry_after = None;
    }
}

#[derive(Debug, Default)]
pub struct Buffers {
    by_doc_type: BTreeMap<String, DocBuffer>,
    next_seq: u64,
}

impl Buffers {
    /// Empty buffers whose first record will carry `next_seq`.
    pub fn starting_at(next_seq: u64) -> Self {
        Self {
            by_doc_type: BTreeMap::new(),
            next_seq,
        }
    }

    /// Sequence number the next pushed record must carry.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Append a record carrying the next sequence number.
    pub fn push(&mut self, record: PersistedRecord, now: Instant) -> Result<&DocBuffer, StoreError> {
        if record.seq != self.next_seq {
            return Err(StoreError::SequenceViolation {
                expected: self.next_seq,
                got: record.seq,
            });
        }
        let buffer = self
            .by_doc_type
            .entry(record.doc_type.clone())
            .or_insert_with(|| DocBuffer::new(now));
        self.next_seq += 1;
        buffer.push(record);
        Ok(buffer)
    }

    pub fn get_mut(&mut self, doc_type: &str) -> Option<&mut DocBuffer> {
        self.by_doc_type.get_mut(doc_type)
    }

    pub fn get(&self, doc_type: &str) -> Option<&DocBuffer> {
        self.by_doc_type.get(doc_type)
    }

    pub fn due(&self, policy: &FlushPolicy, now: Instant) -> Vec<String> {
        self.by_doc_type
            .iter()
            .filter(|(_, b)| b.is_due(policy, now))
            .map(|(d, _)| d.clone())
            .collect()
    }

    pub fn non_empty(&self) -> Vec<String> {
        self.by_doc_type
            .iter()
            .filter(|(_, b)| !b.is_empty())
            .map(|(d, _)| d.clone())
            .collect()
    }

    pub fn total_len(&self) -> usize {
        self.by_doc_type.values().map(DocBuffer::len).sum()
    }

    pub fn any_failed(&self) -> bool {
        self.by_doc_type.values().any(DocBuffer::has_failed)
    }
}

//! Durable, ordered, partitioned event writer.
//!
//! One [`EventStore`] owns one session's storage area for its whole life (see
//! [`lock`]). It subscribes to a fixed set of selectors, assigns each incoming
//! envelope the next session sequence number, buffers it by doc type and
//! flushes buffers into immutable part files by the hybrid size/time policy.
//!
//! A flush that keeps failing after its retry budget puts its records back in
//! the buffer, marks the store unhealthy and returns the error; other doc
//! types keep flushing.
pub mod buffer;
pub mod error;
pub mod lock;
pub mod part;
pub mod reader;

pub use error::StoreError;

use crate::bus::{EventBus, Liveness, Subscriber, SubscriptionId};
use crate::envelope::{EventEnvelope, Selector};
use crate::record::{ColumnBatch, PersistedRecord};
use buffer::{Buffers, FlushPolicy};
use lock::SessionLock;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
    /// Records per doc type buffer that trigger a flush.
    pub flush_threshold: usize,
    /// Maximum time a non-empty buffer waits between flushes.
    pub flush_interval: Duration,
    /// Write attempts per flush before the flush is reported as failed.
    pub retry_attempts: u32,
    /// Backoff before the first retry; doubled for every further one.
    pub retry_backoff: Duration,
    /// Selectors the store subscribes to when started.
    pub selectors: Vec<Selector>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("captures"),
            flush_threshold: 100,
            flush_interval: Duration::from_secs(5),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(25),
            selectors: vec![
                Selector::Tick,
                Selector::PlayerState,
                Selector::Trades,
                Selector::SessionBoundary,
                Selector::Unrecognized,
            ],
        }
    }
}

impl StoreConfig {
    fn policy(&self) -> FlushPolicy {
        FlushPolicy {
            max_records: self.flush_threshold.max(1),
            max_age: self.flush_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreState {
    Open,
    Poisoned,
    Stopped,
}

struct StoreInner {
    buffers: Buffers,
    lock: Option<SessionLock>,
    state: StoreState,
}

/// Outcome of [`EventStore::close`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    pub flushed_records: usize,
    pub parts_written: u64,
    pub abandoned_records: usize,
}

pub struct EventStore {
    session_id: String,
    config: StoreConfig,
    inner: Mutex<StoreInner>,
    event_count: AtomicU64,
    persisted_count: AtomicU64,
    parts_written: AtomicU64,
    failed_flushes: AtomicU64,
    liveness: Liveness,
}

fn valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '='])
        && !id.chars().any(char::is_control)
}

impl EventStore {
    /// Take write ownership of `session_id` under `config.root`. Fails with
    /// [`StoreError::SessionLocked`] if another store already owns it.
    pub fn open(config: StoreConfig, session_id: impl Into<String>) -> Result<Arc<Self>, StoreError> {
        let session_id = session_id.into();
        if !valid_session_id(&session_id) {
            return Err(StoreError::InvalidSessionId(session_id));
        }
        std::fs::create_dir_all(&config.root).map_err(|source| StoreError::create_dir(&config.root, source))?;
        let lock = SessionLock::acquire(&config.root, &session_id)?;
        let next_seq = match reader::last_seq(&config.root, &session_id) {
            Ok(last) => last.map_or(0, |seq| seq + 1),
            Err(err) => {
                return Err(StoreError::Resume {
                    session_id,
                    reason: format!("{err:#}"),
                });
            }
        };
        info!(
            session_id = %session_id,
            next_seq,
            root = %config.root.display(),
            flush_threshold = config.flush_threshold,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            "event store opened"
        );
        Ok(Arc::new(Self {
            session_id,
            config,
            inner: Mutex::new(StoreInner {
                buffers: Buffers::starting_at(next_seq),
                lock: Some(lock),
                state: StoreState::Open,
            }),
            event_count: AtomicU64::new(0),
            persisted_count: AtomicU64::new(0),
            parts_written: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
            liveness: Liveness::new(),
        }))
    }

    /// Subscribe to the configured selectors.
    pub fn start(self: &Arc<Self>, bus: &EventBus) -> Vec<SubscriptionId> {
        self.config
            .selectors
            .iter()
            .map(|selector| bus.subscribe(*selector, self))
            .collect()
    }

    /// Unsubscribe from `bus`, then [`close`](Self::close).
    pub fn stop(self: &Arc<Self>, bus: &EventBus) -> Result<StopReport, StoreError> {
        bus.unsubscribe_all(self);
        self.close()
    }

    /// Sequence and buffer one envelope, flushing any buffer that became due.
    pub fn record(&self, envelope: &EventEnvelope) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        match inner.state {
            StoreState::Open => {}
            StoreState::Poisoned => return Err(StoreError::Poisoned(self.session_id.clone())),
            StoreState::Stopped => return Err(StoreError::Stopped(self.session_id.clone())),
        }
        let now = Instant::now();
        let record = PersistedRecord {
            ts: envelope.recv_unix_ns(),
            source: envelope.source(),
            doc_type: envelope.doc_type().to_string(),
            session_id: self.session_id.clone(),
            seq: inner.buffers.next_seq(),
            event_name: envelope.event_name().to_string(),
            fields: envelope.payload().clone(),
        };
        let pushed = inner.buffers.push(record, now).map(|_| ());
        if let Err(err) = pushed {
            self.poison(&mut inner, &err);
            return Err(err);
        }
        self.event_count.fetch_add(1, Ordering::Relaxed);
        self.flush_due_locked(&mut inner, now)
    }

    /// Flush every buffer whose size or age makes it due. Called on each
    /// record and periodically by the owner so idle buffers still flush.
    pub fn flush_due(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.state != StoreState::Open {
            return Ok(());
        }
        self.flush_due_locked(&mut inner, Instant::now())
    }

    /// Flush every non-empty buffer regardless of policy. Returns the number
    /// of records written.
    pub fn flush_all(&self) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let pending = inner.buffers.non_empty();
        let (flushed, mut errors) = self.flush_many(&mut inner, pending, Instant::now());
        match errors.is_empty() {
            true => Ok(flushed),
            false => Err(errors.remove(0)),
        }
    }

    /// Flush everything, release session ownership and stop accepting
    /// records. Buffers that still cannot be written are abandoned with a
    /// warning and reported as [`StoreError::ShutdownIncomplete`].
    pub fn close(&self) -> Result<StopReport, StoreError> {
        self.liveness.shutdown();
        let mut inner = self.inner.lock();
        if inner.state == StoreState::Stopped {
            return Ok(StopReport::default());
        }
        let parts_before = self.parts_written.load(Ordering::Relaxed);
        let pending = inner.buffers.non_empty();
        let (flushed_records, errors) = self.flush_many(&mut inner, pending, Instant::now());

        let mut abandoned_records = 0;
        for doc_type in inner.buffers.non_empty() {
            if let Some(buffer) = inner.buffers.get_mut(&doc_type) {
                let range = buffer.seq_range();
                let records = buffer.take();
                abandoned_records += records.len();
                warn!(
                    session_id = %self.session_id,
                    doc_type = %doc_type,
                    records = records.len(),
                    seq_range = ?range,
                    "abandoning unflushed records at shutdown"
                );
            }
        }
        inner.state = StoreState::Stopped;
        if let Some(lock) = inner.lock.take()
            && let Err(err) = lock.release()
        {
            warn!(session_id = %self.session_id, error = %err, "failed to release session lock");
        }

        let report = StopReport {
            flushed_records,
            parts_written: self.parts_written.load(Ordering::Relaxed) - parts_before,
            abandoned_records,
        };
        info!(
            session_id = %self.session_id,
            events = self.event_count(),
            persisted = self.persisted_count(),
            flushed = report.flushed_records,
            abandoned = report.abandoned_records,
            "event store stopped"
        );
        if errors.is_empty() {
            Ok(report)
        } else {
            Err(StoreError::ShutdownIncomplete {
                failures: errors.len(),
                abandoned: abandoned_records,
            })
        }
    }

    fn poison(&self, inner: &mut StoreInner, err: &StoreError) {
        error!(session_id = %self.session_id, error = %err, "event store invariant violated; refusing further records");
        inner.state = StoreState::Poisoned;
        self.liveness.shutdown();
    }

    fn flush_due_locked(&self, inner: &mut StoreInner, now: Instant) -> Result<(), StoreError> {
        let due = inner.buffers.due(&self.config.policy(), now);
        if due.is_empty() {
            return Ok(());
        }
        let (_, mut errors) = self.flush_many(inner, due, now);
        match errors.is_empty() {
            true => Ok(()),
            false => Err(errors.remove(0)),
        }
    }

    /// Flush each listed doc type independently; one failure does not stop
    /// the others.
    fn flush_many(&self, inner: &mut StoreInner, doc_types: Vec<String>, now: Instant) -> (usize, Vec<StoreError>) {
        let mut flushed = 0;
        let mut errors = Vec::new();
        for doc_type in doc_types {
            match self.flush_doc_type(inner, &doc_type, now) {
                Ok(n) => flushed += n,
                Err(err) => {
                    if err.is_invariant_violation() {
                        self.poison(inner, &err);
                    }
                    errors.push(err);
                }
            }
        }
        (flushed, errors)
    }

    fn flush_doc_type(&self, inner: &mut StoreInner, doc_type: &str, now: Instant) -> Result<usize, StoreError> {
        let Some(buffer) = inner.buffers.get_mut(doc_type) else {
            return Ok(0);
        };
        if buffer.is_empty() {
            return Ok(0);
        }
        let dir = self.partition_dir(doc_type);
        let records = buffer.take();
        let batch = ColumnBatch::from_records(&records);
        let attempts = self.config.retry_attempts.max(1);
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 0;

        let last_err = loop {
            attempt += 1;
            let written = match buffer.next_part() {
                Some(index) => Ok(index),
                None => part::next_part_index(&dir),
            }
            .and_then(|index| part::write_part(&dir, index, &batch).map(|path| (index, path)));

            match written {
                Ok((index, path)) => {
                    buffer.mark_flushed(now, index);
                    self.parts_written.fetch_add(1, Ordering::Relaxed);
                    self.persisted_count.fetch_add(records.len() as u64, Ordering::Relaxed);
                    debug!(
                        session_id = %self.session_id,
                        doc_type,
                        records = records.len(),
                        path = %path.display(),
                        "flushed part"
                    );
                    return Ok(records.len());
                }
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!(doc_type, attempt, error = %err, "flush attempt failed; retrying");
                    thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                }
                Err(err) => break err,
            }
        };

        let first_seq = records.first().map(|r| r.seq);
        let last_seq = records.last().map(|r| r.seq);
        let count = records.len();
        buffer.restore(records, now + self.config.flush_interval);
        self.failed_flushes.fetch_add(1, Ordering::Relaxed);
        error!(
            session_id = %self.session_id,
            doc_type,
            records = count,
            first_seq,
            last_seq,
            path = %dir.display(),
            attempts = attempt,
            error = %last_err,
            "flush failed; records re-buffered"
        );
        Err(StoreError::FlushFailed {
            doc_type: doc_type.to_string(),
            attempts: attempt,
            records: count,
            source: Box::new(last_err),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn partition_dir(&self, doc_type: &str) -> PathBuf {
        part::partition_dir(&self.config.root, doc_type, &self.session_id)
    }

    /// Records accepted (sequenced) so far.
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    /// Records durably written so far.
    pub fn persisted_count(&self) -> u64 {
        self.persisted_count.load(Ordering::Relaxed)
    }

    pub fn parts_written(&self) -> u64 {
        self.parts_written.load(Ordering::Relaxed)
    }

    pub fn failed_flush_count(&self) -> u64 {
        self.failed_flushes.load(Ordering::Relaxed)
    }

    pub fn buffered(&self) -> usize {
        self.inner.lock().buffers.total_len()
    }

    pub fn buffered_for(&self, doc_type: &str) -> usize {
        self.inner.lock().buffers.get(doc_type).map_or(0, |b| b.len())
    }

    /// False once the store is poisoned or while any buffer holds records
    /// from a failed flush.
    pub fn is_healthy(&self) -> bool {
        let inner = self.inner.lock();
        inner.state != StoreState::Poisoned && !inner.buffers.any_failed()
    }
}

impl Subscriber for EventStore {
    fn name(&self) -> &str {
        "event-store"
    }

    fn on_event(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        Ok(self.record(envelope)?)
    }

    fn is_alive(&self) -> bool {
        self.liveness.is_alive()
    }
}

impl Drop for EventStore {
    fn drop(&mut self) {
        let stopped = self.inner.get_mut().state == StoreState::Stopped;
        if !stopped && let Err(err) = self.close() {
            warn!(session_id = %self.session_id, error = %err, "event store dropped without a clean stop");
        }
    }
}

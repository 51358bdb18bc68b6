//! Explicit wiring of one bus, one event store and one reconciler.
//!
//! Startup order: open the store (takes session ownership), subscribe store
//! and reconciler, start dispatch. Shutdown runs in reverse: the bus drains
//! its queue into the subscribers first, then the reconciler detaches and the
//! store flushes and releases the session.
use crate::bus::{BusConfig, EventBus};
use crate::reconciler::{GameState, ReconcilerConfig, StateReconciler};
use crate::store::{EventStore, StopReport, StoreConfig, StoreError};
use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{error, info};

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub bus: BusConfig,
    pub store: StoreConfig,
    pub reconciler: ReconcilerConfig,
}

/// Summary returned by [`Pipeline::stop`]. Produced even when a shutdown
/// step fails; the failures are listed in `shutdown_errors`.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub session_id: String,
    pub published: u64,
    pub dropped: u64,
    pub callback_failures: u64,
    pub persisted: u64,
    pub store: StopReport,
    pub snapshot: Arc<GameState>,
    pub shutdown_errors: Vec<String>,
}

impl PipelineReport {
    pub fn is_complete(&self) -> bool {
        self.shutdown_errors.is_empty()
    }

    /// `Err` carrying every shutdown failure, if there was one.
    pub fn ensure_complete(&self) -> Result<()> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(anyhow!("shutdown incomplete: {}", self.shutdown_errors.join("; ")))
        }
    }
}

pub struct Pipeline {
    bus: EventBus,
    store: Arc<EventStore>,
    reconciler: Arc<StateReconciler>,
}

/// Session id derived from the current UTC time, e.g. `20240131T120501Z`.
pub fn default_session_id() -> String {
    let fmt = format_description!("[year][month][day]T[hour][minute][second]Z");
    OffsetDateTime::now_utc()
        .format(&fmt)
        .unwrap_or_else(|_| format!("{}", OffsetDateTime::now_utc().unix_timestamp()))
}

impl Pipeline {
    pub fn open(config: PipelineConfig, session_id: impl Into<String>) -> Result<Self> {
        let session_id = session_id.into();
        let root = config.store.root.clone();
        let store = EventStore::open(config.store, session_id.as_str())
            .with_context(|| format!("open event store for session {session_id} under {root:?}"))?;
        Ok(Self {
            bus: EventBus::new(config.bus),
            store,
            reconciler: Arc::new(StateReconciler::new(config.reconciler)),
        })
    }

    pub fn start(&self) -> Result<()> {
        self.store.start(&self.bus);
        self.reconciler.start(&self.bus);
        self.bus.start().context("start event bus")?;
        info!(
            session_id = self.store.session_id(),
            subscribers = self.bus.subscriber_count(),
            "pipeline started"
        );
        Ok(())
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn reconciler(&self) -> &Arc<StateReconciler> {
        &self.reconciler
    }

    /// Periodic flush of idle buffers; call from the owner's timer.
    pub fn flush_due(&self) -> Result<()> {
        self.store.flush_due().context("periodic flush")
    }

    /// Stop every component, continuing past failures so the store always
    /// gets its final flush and the report is always built.
    pub fn stop(self) -> PipelineReport {
        let mut shutdown_errors = Vec::new();
        if let Err(err) = self.bus.stop() {
            error!(error = %err, "failed to stop event bus");
            shutdown_errors.push(format!("stop event bus: {err}"));
        }
        self.reconciler.stop(&self.bus);
        let store = match self.store.stop(&self.bus) {
            Ok(report) => report,
            Err(err) => {
                error!(session_id = self.store.session_id(), error = %err, "failed to stop event store");
                shutdown_errors.push(format!("stop event store: {err}"));
                StopReport {
                    abandoned_records: match err {
                        StoreError::ShutdownIncomplete { abandoned, .. } => abandoned,
                        _ => 0,
                    },
                    ..StopReport::default()
                }
            }
        };
        let report = PipelineReport {
            session_id: self.store.session_id().to_string(),
            published: self.bus.published_count(),
            dropped: self.bus.dropped_event_count(),
            callback_failures: self.bus.callback_failure_count(),
            persisted: self.store.persisted_count(),
            store,
            snapshot: self.reconciler.current_snapshot(),
            shutdown_errors,
        };
        info!(
            session_id = %report.session_id,
            published = report.published,
            dropped = report.dropped,
            persisted = report.persisted,
            callback_failures = report.callback_failures,
            complete = report.is_complete(),
            "pipeline stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_session_id_is_compact_utc() {
        let id = default_session_id();
        assert_eq!(id.len(), 16);
        assert_eq!(&id[8..9], "T");
        assert!(id.ends_with('Z'));
    }
}

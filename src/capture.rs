//! JSON-lines capture adapter.
//!
//! Reads one envelope per line, `{"event_name": .., "payload": {..},
//! "source": ..}`, and publishes it on the bus. Arrival time is assigned by
//! the bus. Malformed lines are counted and skipped; a full queue drops the
//! event (the bus counts it) and reading continues.
use crate::bus::{EventBus, PublishError};
use crate::envelope::{Payload, Source};
use serde::Deserialize;
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct CaptureLine {
    event_name: String,
    #[serde(default)]
    payload: Payload,
    #[serde(default)]
    source: Option<Source>,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to read capture input at line {line}: {source}")]
    Read {
        line: u64,
        #[source]
        source: io::Error,
    },
    #[error("bus stopped while publishing line {line}")]
    BusStopped { line: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub lines: u64,
    pub published: u64,
    pub malformed: u64,
    pub dropped: u64,
}

pub struct CaptureAdapter {
    bus: EventBus,
    default_source: Source,
    lines: AtomicU64,
    published: AtomicU64,
    malformed: AtomicU64,
    dropped: AtomicU64,
}

impl CaptureAdapter {
    pub fn new(bus: EventBus, default_source: Source) -> Self {
        Self {
            bus,
            default_source,
            lines: AtomicU64::new(0),
            published: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Parse and publish one line. Blank lines are skipped without counting.
    pub fn publish_line(&self, line: &str) -> Result<(), CaptureError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        let n = self.lines.fetch_add(1, Ordering::Relaxed) + 1;
        let parsed: CaptureLine = match serde_json::from_str(trimmed) {
            Ok(parsed) => parsed,
            Err(err) => {
                let malformed = self.malformed.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(line = n, malformed, error = %err, "skipping malformed capture line");
                return Ok(());
            }
        };
        if parsed.event_name.is_empty() {
            self.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(line = n, "skipping capture line with empty event_name");
            return Ok(());
        }
        let source = parsed.source.unwrap_or(self.default_source);
        match self.bus.publish(source, parsed.event_name, parsed.payload) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(PublishError::QueueFull) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(PublishError::Stopped) => Err(CaptureError::BusStopped { line: n }),
        }
    }

    /// Publish every line of `reader` until EOF or `shutdown` is set.
    pub fn run<R: BufRead>(&self, reader: R, shutdown: &AtomicBool) -> Result<CaptureStats, CaptureError> {
        for line in reader.lines() {
            if shutdown.load(Ordering::Relaxed) {
                debug!("capture interrupted by shutdown");
                break;
            }
            let line = line.map_err(|source| CaptureError::Read {
                line: self.lines.load(Ordering::Relaxed) + 1,
                source,
            })?;
            self.publish_line(&line)?;
        }
        let stats = self.stats();
        info!(
            lines = stats.lines,
            published = stats.published,
            malformed = stats.malformed,
            dropped = stats.dropped,
            "capture input finished"
        );
        Ok(stats)
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            lines: self.lines.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, FnSubscriber};
    use crate::envelope::{EventEnvelope, Selector};
    use parking_lot::Mutex;
    use std::io::Cursor;
    use std::sync::Arc;

    #[test]
    fn counts_malformed_lines_and_publishes_the_rest() {
        let bus = EventBus::new(BusConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            FnSubscriber::new("sink", move |env: &EventEnvelope| -> anyhow::Result<()> {
                seen.lock().push((env.event_name().to_string(), env.source()));
                Ok(())
            })
        };
        bus.subscribe(Selector::All, &sink);
        bus.start().unwrap();

        let input = concat!(
            "{\"event_name\":\"gameStateUpdate\",\"payload\":{\"tickCount\":1,\"price\":1.0}}\n",
            "not json\n",
            "\n",
            "{\"payload\":{}}\n",
            "{\"event_name\":\"\"}\n",
            "{\"event_name\":\"playerUpdate\",\"payload\":{\"cash\":2.0},\"source\":\"authenticated_feed\"}\n",
        );
        let adapter = CaptureAdapter::new(bus.clone(), Source::PublicFeed);
        let stats = adapter.run(Cursor::new(input), &AtomicBool::new(false)).unwrap();
        bus.stop().unwrap();

        assert_eq!(stats, CaptureStats { lines: 5, published: 2, malformed: 3, dropped: 0 });
        assert_eq!(
            *seen.lock(),
            vec![
                ("gameStateUpdate".to_string(), Source::PublicFeed),
                ("playerUpdate".to_string(), Source::AuthenticatedFeed),
            ]
        );
    }

    #[test]
    fn stopped_bus_ends_capture() {
        let bus = EventBus::new(BusConfig::default());
        bus.start().unwrap();
        bus.stop().unwrap();
        let adapter = CaptureAdapter::new(bus, Source::Local);
        let err = adapter
            .run(Cursor::new("{\"event_name\":\"gameStarted\"}\n"), &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, CaptureError::BusStopped { line: 1 }));
    }
}

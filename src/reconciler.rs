//! Player/game state reconciliation.
//!
//! The [`StateReconciler`] merges two streams into one snapshot:
//! authoritative updates from the game feed (`gameStateUpdate`,
//! `playerUpdate`) and optimistic updates computed locally (trade actions,
//! `localStateUpdate`).
//!
//! Rules:
//! - an authoritative update overwrites every mapped field it carries and
//!   bumps `authority_version` once; if it lacks a required field or carries
//!   a non-numeric mapped field it is rejected whole;
//! - an optimistic value is a provisional placeholder: it is applied to a
//!   field only until an authoritative value for that field has been seen in
//!   the current session, later optimistic writes to it are ignored;
//! - an authoritative value that differs by more than the drift tolerance
//!   from a still-unconfirmed optimistic value is logged as drift;
//! - a session boundary resets the snapshot except for the cross-session
//!   fields and the `sessions_started` and `authority_version` counters.
//!
//! Each change builds a new [`GameState`] and swaps it in behind an
//! `RwLock<Arc<_>>`, so readers always get a complete snapshot.
use crate::bus::{EventBus, Liveness, Subscriber, SubscriptionId};
use crate::envelope::{EventEnvelope, EventKind, Payload, Selector, now_unix_ns};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Snapshot field addressable by state updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Balance,
    PositionQty,
    AvgEntryPrice,
    CumulativePnl,
    Tick,
    Price,
}

impl Field {
    pub const ALL: [Field; 6] = [
        Field::Balance,
        Field::PositionQty,
        Field::AvgEntryPrice,
        Field::CumulativePnl,
        Field::Tick,
        Field::Price,
    ];

    /// Payload key carrying this field.
    pub fn payload_key(&self) -> &'static str {
        match self {
            Field::Balance => "cash",
            Field::PositionQty => "positionQty",
            Field::AvgEntryPrice => "avgCost",
            Field::CumulativePnl => "cumulativePnL",
            Field::Tick => "tickCount",
            Field::Price => "price",
        }
    }

    /// Numeric value of `value` for this field, if it is a valid one.
    /// Ticks must be non-negative integers; everything else any finite number.
    fn parse(&self, value: &Value) -> Option<f64> {
        let n = value.as_f64().filter(|n| n.is_finite())?;
        match self {
            Field::Tick if n < 0.0 || n.fract() != 0.0 => None,
            _ => Some(n),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.payload_key())
    }
}

/// Fields an authoritative update of `kind` must carry, or `None` if `kind`
/// is not an authoritative state update.
pub fn required_fields(kind: &EventKind) -> Option<&'static [Field]> {
    match kind {
        EventKind::Tick => Some(&[Field::Tick, Field::Price]),
        EventKind::PlayerState => Some(&[Field::Balance]),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GameState {
    pub balance: f64,
    pub position_qty: f64,
    pub avg_entry_price: f64,
    pub cumulative_pnl: f64,
    pub current_tick: u64,
    pub current_price: f64,
    /// Number of authoritative updates accepted; never decreases, not even
    /// across session boundaries.
    pub authority_version: u64,
    /// Unix ns of the last accepted authoritative update.
    pub last_reconciled_unix_ns: Option<u128>,
    /// True once an authoritative update has been accepted in the current
    /// session.
    pub is_authoritative: bool,
    pub sessions_started: u64,
}

impl Default for GameState {
    fn default() -> Self {
        Self {
            balance: 0.0,
            position_qty: 0.0,
            avg_entry_price: 0.0,
            cumulative_pnl: 0.0,
            current_tick: 0,
            current_price: 0.0,
            authority_version: 0,
            last_reconciled_unix_ns: None,
            is_authoritative: false,
            sessions_started: 0,
        }
    }
}

impl GameState {
    pub fn get(&self, field: Field) -> f64 {
        match field {
            Field::Balance => self.balance,
            Field::PositionQty => self.position_qty,
            Field::AvgEntryPrice => self.avg_entry_price,
            Field::CumulativePnl => self.cumulative_pnl,
            Field::Tick => self.current_tick as f64,
            Field::Price => self.current_price,
        }
    }

    fn set(&mut self, field: Field, value: f64) {
        match field {
            Field::Balance => self.balance = value,
            Field::PositionQty => self.position_qty = value,
            Field::AvgEntryPrice => self.avg_entry_price = value,
            Field::CumulativePnl => self.cumulative_pnl = value,
            Field::Tick => self.current_tick = value as u64,
            Field::Price => self.current_price = value,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Absolute difference above which an authoritative overwrite is logged
    /// as drift.
    pub drift_tolerance: f64,
    /// Fields that survive a session boundary.
    pub cross_session_fields: Vec<Field>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            drift_tolerance: 0.01,
            cross_session_fields: vec![Field::Balance, Field::CumulativePnl],
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ReconcileError {
    #[error("{event} update is missing required field {field}")]
    MissingField { event: String, field: Field },
    #[error("{event} update carries non-numeric {field}: {value}")]
    NotNumeric { event: String, field: Field, value: String },
    #[error("{0} is not an authoritative state update")]
    NotAuthoritative(String),
}

/// Result of one optimistic update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimisticOutcome {
    pub applied: Vec<Field>,
    /// Fields already settled by an authoritative value this session.
    pub ignored: Vec<Field>,
    /// Fields whose value failed validation.
    pub invalid: Vec<Field>,
}

/// Per-session bookkeeping, guarded by the writer mutex.
#[derive(Debug, Default)]
struct Tracking {
    /// Fields with an authoritative value this session.
    authoritative: BTreeSet<Field>,
    /// Fields currently holding an optimistic value no authoritative update
    /// has confirmed yet. Drift is only measured against these.
    provisional: BTreeSet<Field>,
}

pub struct StateReconciler {
    config: ReconcilerConfig,
    snapshot: RwLock<Arc<GameState>>,
    tracking: Mutex<Tracking>,
    authoritative_applied: AtomicU64,
    malformed: AtomicU64,
    optimistic_applied: AtomicU64,
    optimistic_ignored: AtomicU64,
    optimistic_invalid: AtomicU64,
    drift_events: AtomicU64,
    liveness: Liveness,
}

impl StateReconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            snapshot: RwLock::new(Arc::new(GameState::default())),
            tracking: Mutex::new(Tracking::default()),
            authoritative_applied: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            optimistic_applied: AtomicU64::new(0),
            optimistic_ignored: AtomicU64::new(0),
            optimistic_invalid: AtomicU64::new(0),
            drift_events: AtomicU64::new(0),
            liveness: Liveness::new(),
        }
    }

    /// Subscribe to authoritative, optimistic and session boundary events.
    pub fn start(self: &Arc<Self>, bus: &EventBus) -> Vec<SubscriptionId> {
        [
            Selector::Tick,
            Selector::PlayerState,
            Selector::Trades,
            Selector::LocalState,
            Selector::SessionBoundary,
        ]
        .into_iter()
        .map(|selector| bus.subscribe(selector, self))
        .collect()
    }

    pub fn stop(self: &Arc<Self>, bus: &EventBus) {
        bus.unsubscribe_all(self);
        self.liveness.shutdown();
    }

    /// Consistent copy of the current state.
    pub fn current_snapshot(&self) -> Arc<GameState> {
        self.snapshot.read().clone()
    }

    pub fn is_authoritative(&self) -> bool {
        self.snapshot.read().is_authoritative
    }

    /// Route one envelope by kind. Unrecognized kinds are ignored.
    pub fn handle(&self, envelope: &EventEnvelope) -> Result<(), ReconcileError> {
        match envelope.kind() {
            EventKind::Tick | EventKind::PlayerState => self
                .apply_authoritative(envelope.kind(), envelope.payload(), envelope.recv_unix_ns())
                .map(|_| ()),
            EventKind::Trade(_) | EventKind::LocalState => {
                self.apply_optimistic(envelope.payload());
                Ok(())
            }
            EventKind::SessionBoundary => {
                self.begin_session();
                Ok(())
            }
            EventKind::Unrecognized(_) => Ok(()),
        }
    }

    /// Apply an authoritative update of `kind` received at `at_unix_ns`.
    /// Returns the new authority version.
    pub fn apply_authoritative(&self, kind: &EventKind, payload: &Payload, at_unix_ns: u128) -> Result<u64, ReconcileError> {
        let event = kind.doc_type();
        let Some(required) = required_fields(kind) else {
            return Err(ReconcileError::NotAuthoritative(event.to_string()));
        };
        let updates = match validate_authoritative(event, required, payload) {
            Ok(updates) => updates,
            Err(err) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "rejected authoritative update");
                return Err(err);
            }
        };

        let mut tracking = self.tracking.lock();
        let mut next = GameState::clone(&self.snapshot.read());
        for (field, value) in updates {
            let current = next.get(field);
            if tracking.provisional.remove(&field) && (current - value).abs() > self.config.drift_tolerance {
                self.drift_events.fetch_add(1, Ordering::Relaxed);
                warn!(
                    field = %field,
                    local = current,
                    authoritative = value,
                    drift = (current - value).abs(),
                    tolerance = self.config.drift_tolerance,
                    "reconciliation drift"
                );
            }
            next.set(field, value);
            tracking.authoritative.insert(field);
        }
        next.authority_version += 1;
        next.last_reconciled_unix_ns = Some(at_unix_ns);
        next.is_authoritative = true;
        let version = next.authority_version;
        *self.snapshot.write() = Arc::new(next);
        self.authoritative_applied.fetch_add(1, Ordering::Relaxed);
        debug!(event, version, "authoritative update applied");
        Ok(version)
    }

    /// Apply an optimistic update field by field.
    pub fn apply_optimistic(&self, payload: &Payload) -> OptimisticOutcome {
        let mut outcome = OptimisticOutcome::default();
        let mut tracking = self.tracking.lock();
        let mut next = GameState::clone(&self.snapshot.read());
        for field in Field::ALL {
            let Some(raw) = payload.get(field.payload_key()).filter(|v| !v.is_null()) else {
                continue;
            };
            let Some(value) = field.parse(raw) else {
                debug!(field = %field, value = %raw, "skipping invalid optimistic field");
                outcome.invalid.push(field);
                continue;
            };
            if tracking.authoritative.contains(&field) {
                outcome.ignored.push(field);
                continue;
            }
            next.set(field, value);
            tracking.provisional.insert(field);
            outcome.applied.push(field);
        }
        if !outcome.applied.is_empty() {
            *self.snapshot.write() = Arc::new(next);
        }
        self.optimistic_applied.fetch_add(outcome.applied.len() as u64, Ordering::Relaxed);
        self.optimistic_ignored.fetch_add(outcome.ignored.len() as u64, Ordering::Relaxed);
        self.optimistic_invalid.fetch_add(outcome.invalid.len() as u64, Ordering::Relaxed);
        outcome
    }

    /// Reset for a new session, keeping cross-session fields.
    pub fn begin_session(&self) {
        let mut tracking = self.tracking.lock();
        let previous = self.current_snapshot();
        let mut next = GameState {
            sessions_started: previous.sessions_started + 1,
            authority_version: previous.authority_version,
            ..GameState::default()
        };
        let mut provisional = BTreeSet::new();
        for field in &self.config.cross_session_fields {
            next.set(*field, previous.get(*field));
            if tracking.provisional.contains(field) {
                provisional.insert(*field);
            }
        }
        *tracking = Tracking {
            authoritative: BTreeSet::new(),
            provisional,
        };
        *self.snapshot.write() = Arc::new(next);
        info!(
            sessions_started = previous.sessions_started + 1,
            balance = previous.balance,
            at_unix_ns = %now_unix_ns(),
            "session boundary; state reset"
        );
    }

    pub fn authoritative_count(&self) -> u64 {
        self.authoritative_applied.load(Ordering::Relaxed)
    }

    /// Authoritative updates rejected as malformed.
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn optimistic_applied_count(&self) -> u64 {
        self.optimistic_applied.load(Ordering::Relaxed)
    }

    pub fn optimistic_ignored_count(&self) -> u64 {
        self.optimistic_ignored.load(Ordering::Relaxed)
    }

    pub fn optimistic_invalid_count(&self) -> u64 {
        self.optimistic_invalid.load(Ordering::Relaxed)
    }

    pub fn drift_count(&self) -> u64 {
        self.drift_events.load(Ordering::Relaxed)
    }
}

impl Default for StateReconciler {
    fn default() -> Self {
        Self::new(ReconcilerConfig::default())
    }
}

fn validate_authoritative(event: &str, required: &[Field], payload: &Payload) -> Result<Vec<(Field, f64)>, ReconcileError> {
    let mut updates = Vec::new();
    for field in Field::ALL {
        match payload.get(field.payload_key()) {
            None | Some(Value::Null) if required.contains(&field) => {
                return Err(ReconcileError::MissingField { event: event.to_string(), field });
            }
            None | Some(Value::Null) => {}
            Some(raw) => match field.parse(raw) {
                Some(value) => updates.push((field, value)),
                None => {
                    return Err(ReconcileError::NotNumeric {
                        event: event.to_string(),
                        field,
                        value: raw.to_string(),
                    });
                }
            },
        }
    }
    Ok(updates)
}

impl Subscriber for StateReconciler {
    fn name(&self) -> &str {
        "state-reconciler"
    }

    fn on_event(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        // Malformed updates are counted and logged by `handle`; they are not
        // subscriber failures.
        let _ = self.handle(envelope);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.liveness.is_alive()
    }
}

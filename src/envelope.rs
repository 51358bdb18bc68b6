//! Event envelopes flowing through the bus.
//!
//! An [`EventEnvelope`] is built once when the capture source hands an event
//! to [`crate::bus::EventBus::publish`] and is shared afterwards as an
//! `Arc<EventEnvelope>`. Fields are private; subscribers only get read access.
//!
//! Routing never looks at raw event names after classification: the name is
//! mapped once to an [`EventKind`] and every selector matches on that.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Opaque structured document carried by an envelope.
pub type Payload = Map<String, Value>;

/// Capture channel that produced an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Unauthenticated broadcast feed.
    PublicFeed,
    /// Per-player authenticated feed.
    AuthenticatedFeed,
    /// Produced inside this process (command surfaces, optimistic updates).
    Local,
    /// Re-published from a persisted session.
    Replay,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::PublicFeed => "public_feed",
            Source::AuthenticatedFeed => "authenticated_feed",
            Source::Local => "local",
            Source::Replay => "replay",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trade/action events issued by command surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeAction {
    Buy,
    Sell,
    SideWager,
    Confirmation,
}

/// Closed set of event categories known to the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Tick/price update from the game feed.
    Tick,
    /// Authoritative player state from the game feed.
    PlayerState,
    Trade(TradeAction),
    /// Locally computed optimistic state.
    LocalState,
    /// A new game/session started.
    SessionBoundary,
    Unrecognized(String),
}

impl EventKind {
    /// Classify a capture-source event name.
    pub fn classify(event_name: &str) -> Self {
        match event_name {
            "gameStateUpdate" => EventKind::Tick,
            "playerUpdate" => EventKind::PlayerState,
            "buyOrder" => EventKind::Trade(TradeAction::Buy),
            "sellOrder" => EventKind::Trade(TradeAction::Sell),
            "sidebetPlaced" => EventKind::Trade(TradeAction::SideWager),
            "tradeConfirmed" => EventKind::Trade(TradeAction::Confirmation),
            "localStateUpdate" => EventKind::LocalState,
            "gameStarted" => EventKind::SessionBoundary,
            other => EventKind::Unrecognized(other.to_string()),
        }
    }

    /// Coarse category used to partition persisted records.
    pub fn doc_type(&self) -> &'static str {
        match self {
            EventKind::Tick => "tick",
            EventKind::PlayerState => "player_state",
            EventKind::Trade(_) => "trade",
            EventKind::LocalState => "local_state",
            EventKind::SessionBoundary => "session",
            EventKind::Unrecognized(_) => "other",
        }
    }
}

/// Selects which envelopes a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Selector {
    Tick,
    PlayerState,
    /// Every [`TradeAction`].
    Trades,
    Trade(TradeAction),
    LocalState,
    SessionBoundary,
    Unrecognized,
    All,
}

impl Selector {
    pub fn matches(&self, kind: &EventKind) -> bool {
        match (self, kind) {
            (Selector::All, _) => true,
            (Selector::Tick, EventKind::Tick) => true,
            (Selector::PlayerState, EventKind::PlayerState) => true,
            (Selector::Trades, EventKind::Trade(_)) => true,
            (Selector::Trade(want), EventKind::Trade(got)) => want == got,
            (Selector::LocalState, EventKind::LocalState) => true,
            (Selector::SessionBoundary, EventKind::SessionBoundary) => true,
            (Selector::Unrecognized, EventKind::Unrecognized(_)) => true,
            _ => false,
        }
    }
}

/// One unit of event data moving through the bus.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    event_name: String,
    kind: EventKind,
    payload: Arc<Payload>,
    source: Source,
    arrival: Instant,
    recv_unix_ns: u128,
    recv_mono_ns: u128,
}

impl EventEnvelope {
    /// Stamp a new envelope. `epoch` is the instant the monotonic offsets are
    /// measured from (the owning bus's creation time).
    pub fn new(source: Source, event_name: impl Into<String>, payload: Payload, epoch: Instant) -> Self {
        let event_name = event_name.into();
        let arrival = Instant::now();
        Self {
            kind: EventKind::classify(&event_name),
            event_name,
            payload: Arc::new(payload),
            source,
            arrival,
            recv_unix_ns: now_unix_ns(),
            recv_mono_ns: arrival.saturating_duration_since(epoch).as_nanos(),
        }
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn doc_type(&self) -> &'static str {
        self.kind.doc_type()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn source(&self) -> Source {
        self.source
    }

    /// Monotonic arrival instant.
    pub fn arrival(&self) -> Instant {
        self.arrival
    }

    /// Wall-clock receive time, Unix nanoseconds.
    pub fn recv_unix_ns(&self) -> u128 {
        self.recv_unix_ns
    }

    /// Monotonic nanoseconds since the bus was created.
    pub fn recv_mono_ns(&self) -> u128 {
        self.recv_mono_ns
    }
}

pub fn now_unix_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_known_and_unknown_names() {
        assert_eq!(EventKind::classify("gameStateUpdate"), EventKind::Tick);
        assert_eq!(EventKind::classify("sidebetPlaced"), EventKind::Trade(TradeAction::SideWager));
        assert_eq!(EventKind::classify("rugPool"), EventKind::Unrecognized("rugPool".into()));
        assert_eq!(EventKind::classify("sellOrder").doc_type(), "trade");
        assert_eq!(EventKind::classify("rugPool").doc_type(), "other");
    }

    #[test]
    fn selectors_match_kinds() {
        let buy = EventKind::Trade(TradeAction::Buy);
        assert!(Selector::Trades.matches(&buy));
        assert!(Selector::Trade(TradeAction::Buy).matches(&buy));
        assert!(!Selector::Trade(TradeAction::Sell).matches(&buy));
        assert!(!Selector::Tick.matches(&buy));
        assert!(Selector::All.matches(&EventKind::Unrecognized("x".into())));
        assert!(Selector::Unrecognized.matches(&EventKind::Unrecognized("x".into())));
    }

    #[test]
    fn envelope_offsets_are_relative_to_epoch() {
        let epoch = Instant::now();
        let env = EventEnvelope::new(Source::PublicFeed, "playerUpdate", Payload::new(), epoch);
        assert_eq!(env.kind(), &EventKind::PlayerState);
        assert_eq!(env.doc_type(), "player_state");
        assert!(env.arrival() >= epoch);
        assert!(env.recv_unix_ns() > 0);
    }
}

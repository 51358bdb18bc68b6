//! In-process publish/subscribe bus.
//!
//! Producers call [`EventBus::publish`], which stamps an [`EventEnvelope`] and
//! `try_send`s it into a bounded crossbeam queue. A full queue drops the new
//! envelope and bumps [`EventBus::dropped_event_count`]; producers never block.
//!
//! A single dispatch thread pulls envelopes in FIFO order and calls every
//! matching subscriber synchronously. Subscribers are held by `Weak`
//! reference: a subscriber that has been dropped, or whose
//! [`Subscriber::is_alive`] returns false, is pruned with a debug log instead
//! of being called. Errors and panics from a subscriber are logged and counted
//! and never reach other subscribers or the loop.
//!
//! The subscriber table lock is never held while a callback runs, so
//! callbacks may subscribe or unsubscribe (themselves included).
//!
//! `stop()` drains: it stops accepting publishes, lets the dispatch loop
//! deliver everything already queued, joins the thread, and discards (and
//! counts as dropped) anything that raced in after the final drain. Start and
//! stop are serialised, so a concurrent `stop()` returns only after the loop
//! has terminated.
use crate::envelope::{EventEnvelope, Payload, Selector, Source};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// A consumer of bus envelopes.
pub trait Subscriber: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    fn on_event(&self, envelope: &EventEnvelope) -> anyhow::Result<()>;

    /// Cleared by the subscriber's own shutdown path. Dead subscribers are
    /// skipped and pruned.
    fn is_alive(&self) -> bool {
        true
    }
}

/// Liveness flag for subscribers that shut down before they are dropped.
#[derive(Debug)]
pub struct Liveness(AtomicBool);

impl Liveness {
    pub fn new() -> Self {
        Self(AtomicBool::new(true))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapts a closure into a [`Subscriber`]. The caller owns the returned `Arc`;
/// the bus only keeps a weak reference.
pub struct FnSubscriber<F> {
    name: String,
    callback: F,
}

impl<F> FnSubscriber<F>
where
    F: Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, callback: F) -> Arc<Self> {
        Arc::new(Self { name: name.into(), callback })
    }
}

impl<F> Subscriber for FnSubscriber<F>
where
    F: Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        (self.callback)(envelope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Bounded queue capacity; publishes beyond it are dropped.
    pub queue_capacity: usize,
    /// How long the dispatch loop waits on an empty queue before re-checking
    /// for shutdown.
    pub poll_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
    #[error("event queue full; envelope dropped")]
    QueueFull,
    #[error("event bus is stopped")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("event bus dispatch loop already running")]
    AlreadyRunning,
    #[error("failed to spawn dispatch thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("stop() called from the dispatch thread")]
    StopFromDispatch,
    #[error("dispatch thread panicked")]
    DispatchPanicked,
}

struct Registration {
    id: SubscriptionId,
    selector: Selector,
    key: usize,
    name: String,
    target: Weak<dyn Subscriber>,
}

#[derive(Default)]
struct SubscriberTable {
    next_id: u64,
    regs: Vec<Registration>,
}

impl SubscriberTable {
    fn contains(&self, id: SubscriptionId) -> bool {
        self.regs.iter().any(|r| r.id == id)
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.regs.len();
        self.regs.retain(|r| r.id != id);
        self.regs.len() != before
    }
}

struct Shared {
    tx: Sender<Arc<EventEnvelope>>,
    rx: Receiver<Arc<EventEnvelope>>,
    table: Mutex<SubscriberTable>,
    accepting: AtomicBool,
    running: AtomicBool,
    published: AtomicU64,
    dropped: AtomicU64,
    dispatched: AtomicU64,
    callback_failures: AtomicU64,
    dispatch_thread: Mutex<Option<ThreadId>>,
    epoch: Instant,
    poll_interval: Duration,
}

impl Shared {
    fn on_dispatch_thread(&self) -> bool {
        *self.dispatch_thread.lock() == Some(thread::current().id())
    }

    fn dispatch(&self, envelope: &EventEnvelope) {
        let targets: Vec<(SubscriptionId, Weak<dyn Subscriber>)> = {
            let table = self.table.lock();
            table
                .regs
                .iter()
                .filter(|r| r.selector.matches(envelope.kind()))
                .map(|r| (r.id, r.target.clone()))
                .collect()
        };

        for (id, target) in targets {
            // An earlier callback for this envelope may have unsubscribed it.
            if !self.table.lock().contains(id) {
                continue;
            }
            let Some(subscriber) = target.upgrade() else {
                debug!(subscription = ?id, event = envelope.event_name(), "subscriber dropped; pruning registration");
                self.table.lock().remove(id);
                continue;
            };
            if !subscriber.is_alive() {
                debug!(subscriber = subscriber.name(), event = envelope.event_name(), "subscriber shut down; pruning registration");
                self.table.lock().remove(id);
                continue;
            }

            match panic::catch_unwind(AssertUnwindSafe(|| subscriber.on_event(envelope))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.callback_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscriber = subscriber.name(),
                        event = envelope.event_name(),
                        error = %format!("{err:#}"),
                        "subscriber failed"
                    );
                }
                Err(payload) => {
                    self.callback_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        subscriber = subscriber.name(),
                        event = envelope.event_name(),
                        panic = %panic_message(payload.as_ref()),
                        "subscriber panicked"
                    );
                }
            }
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn discard_queued(&self) -> u64 {
        let mut discarded = 0u64;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        self.dropped.fetch_add(discarded, Ordering::Relaxed);
        discarded
    }
}

fn dispatch_loop(shared: Arc<Shared>) {
    *shared.dispatch_thread.lock() = Some(thread::current().id());
    info!("event bus dispatch loop started");
    while shared.running.load(Ordering::Acquire) {
        match shared.rx.recv_timeout(shared.poll_interval) {
            Ok(envelope) => shared.dispatch(&envelope),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    let mut drained = 0u64;
    while let Ok(envelope) = shared.rx.try_recv() {
        shared.dispatch(&envelope);
        drained += 1;
    }
    *shared.dispatch_thread.lock() = None;
    info!(drained, "event bus dispatch loop stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct Worker {
    handle: JoinHandle<()>,
    thread_id: ThreadId,
}

/// Owns the dispatch thread. Dropping the last bus handle stops and joins it.
struct WorkerSlot {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
    /// Held for the whole of `start()` and `stop()`, join included. Never
    /// taken by the dispatch thread.
    lifecycle: Mutex<()>,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            self.shared.accepting.store(false, Ordering::Release);
            self.shared.running.store(false, Ordering::Release);
            if worker.thread_id != thread::current().id() {
                let _ = worker.handle.join();
            }
        }
    }
}

/// Cloneable handle to one bus instance.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
    slot: Arc<WorkerSlot>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let (tx, rx) = bounded(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            tx,
            rx,
            table: Mutex::new(SubscriberTable::default()),
            accepting: AtomicBool::new(true),
            running: AtomicBool::new(false),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            callback_failures: AtomicU64::new(0),
            dispatch_thread: Mutex::new(None),
            epoch: Instant::now(),
            poll_interval: config.poll_interval,
        });
        let slot = Arc::new(WorkerSlot {
            shared: Arc::clone(&shared),
            worker: Mutex::new(None),
            lifecycle: Mutex::new(()),
        });
        Self { shared, slot }
    }

    /// Enqueue an envelope without blocking. Envelopes published before
    /// [`EventBus::start`] wait in the queue.
    pub fn publish(&self, source: Source, event_name: impl Into<String>, payload: Payload) -> Result<(), PublishError> {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(PublishError::Stopped);
        }
        let envelope = Arc::new(EventEnvelope::new(source, event_name, payload, self.shared.epoch));
        match self.shared.tx.try_send(envelope) {
            Ok(()) => {
                self.shared.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(envelope)) => {
                let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(event = envelope.event_name(), dropped, "event queue full; dropping envelope");
                }
                Err(PublishError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(PublishError::Stopped),
        }
    }

    /// Register `subscriber` for future envelopes matching `selector`.
    /// Subscribing the same subscriber to the same selector again returns the
    /// existing id.
    pub fn subscribe<S: Subscriber + 'static>(&self, selector: Selector, subscriber: &Arc<S>) -> SubscriptionId {
        let key = subscriber_key(subscriber);
        let mut table = self.shared.table.lock();
        if let Some(existing) = table
            .regs
            .iter()
            .find(|r| r.key == key && r.selector == selector && r.target.strong_count() > 0)
        {
            return existing.id;
        }
        // Same address but dead target: a previous allocation was freed.
        table.regs.retain(|r| !(r.key == key && r.selector == selector));

        let id = SubscriptionId(table.next_id);
        table.next_id += 1;
        let weak: Weak<S> = Arc::downgrade(subscriber);
        let target: Weak<dyn Subscriber> = weak;
        table.regs.push(Registration {
            id,
            selector,
            key,
            name: subscriber.name().to_string(),
            target,
        });
        debug!(subscriber = subscriber.name(), ?selector, subscription = ?id, "subscribed");
        id
    }

    pub fn unsubscribe<S: Subscriber + 'static>(&self, selector: Selector, subscriber: &Arc<S>) -> bool {
        let key = subscriber_key(subscriber);
        let mut table = self.shared.table.lock();
        let before = table.regs.len();
        table.regs.retain(|r| !(r.key == key && r.selector == selector));
        table.regs.len() != before
    }

    pub fn unsubscribe_id(&self, id: SubscriptionId) -> bool {
        self.shared.table.lock().remove(id)
    }

    /// Remove every registration held by `subscriber`.
    pub fn unsubscribe_all<S: Subscriber + 'static>(&self, subscriber: &Arc<S>) -> usize {
        let key = subscriber_key(subscriber);
        let mut table = self.shared.table.lock();
        let before = table.regs.len();
        table.regs.retain(|r| r.key != key);
        let removed = before - table.regs.len();
        if removed > 0 {
            debug!(subscriber = subscriber.name(), removed, "unsubscribed");
        }
        removed
    }

    /// Spawn the dispatch thread.
    pub fn start(&self) -> Result<(), BusError> {
        if self.shared.on_dispatch_thread() {
            return Err(BusError::AlreadyRunning);
        }
        let _lifecycle = self.slot.lifecycle.lock();
        let mut worker = self.slot.worker.lock();
        if worker.is_some() {
            return Err(BusError::AlreadyRunning);
        }
        self.shared.running.store(true, Ordering::Release);
        self.shared.accepting.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("event-bus-dispatch".into())
            .spawn(move || dispatch_loop(shared))
            .map_err(|err| {
                self.shared.running.store(false, Ordering::Release);
                BusError::Spawn(err)
            })?;
        let thread_id = handle.thread().id();
        *worker = Some(Worker { handle, thread_id });
        Ok(())
    }

    /// Stop accepting publishes, drain the queue through the dispatch loop and
    /// join it. Returns once the loop has terminated, also when another
    /// thread's `stop()` is the one doing the join.
    pub fn stop(&self) -> Result<(), BusError> {
        if self.shared.on_dispatch_thread() {
            return Err(BusError::StopFromDispatch);
        }
        let _lifecycle = self.slot.lifecycle.lock();
        let worker = self.slot.worker.lock().take();
        self.shared.accepting.store(false, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);

        let joined = match worker {
            Some(worker) => worker.handle.join().map_err(|_| BusError::DispatchPanicked),
            None => Ok(()),
        };
        let discarded = self.shared.discard_queued();
        if discarded > 0 {
            warn!(discarded, "discarded envelopes still queued after dispatch stopped");
        }
        joined
    }

    pub fn is_running(&self) -> bool {
        self.slot.worker.lock().is_some()
    }

    pub fn published_count(&self) -> u64 {
        self.shared.published.load(Ordering::Relaxed)
    }

    pub fn dropped_event_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn dispatched_count(&self) -> u64 {
        self.shared.dispatched.load(Ordering::Relaxed)
    }

    pub fn callback_failure_count(&self) -> u64 {
        self.shared.callback_failures.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.shared.rx.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.table.lock().regs.len()
    }

    /// Names of registered subscribers, for diagnostics.
    pub fn subscriber_names(&self) -> Vec<String> {
        self.shared.table.lock().regs.iter().map(|r| r.name.clone()).collect()
    }
}

fn subscriber_key<S>(subscriber: &Arc<S>) -> usize {
    Arc::as_ptr(subscriber) as *const () as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        name: String,
        seen: Mutex<Vec<String>>,
        liveness: Liveness,
    }

    impl Recorder {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self { name: name.into(), seen: Mutex::new(Vec::new()), liveness: Liveness::new() })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().clone()
        }
    }

    impl Subscriber for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_event(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
            let n = envelope.payload().get("n").and_then(|v| v.as_u64()).unwrap_or(0);
            self.seen.lock().push(format!("{}:{}", envelope.event_name(), n));
            Ok(())
        }

        fn is_alive(&self) -> bool {
            self.liveness.is_alive()
        }
    }

    fn payload(n: u64) -> Payload {
        let mut p = Payload::new();
        p.insert("n".into(), n.into());
        p
    }

    fn fast_bus(capacity: usize) -> EventBus {
        EventBus::new(BusConfig { queue_capacity: capacity, poll_interval: Duration::from_millis(5) })
    }

    #[test]
    fn delivers_in_publish_order() {
        let bus = fast_bus(1024);
        let rec = Recorder::new("rec");
        bus.subscribe(Selector::All, &rec);
        bus.start().unwrap();
        for n in 0..500 {
            bus.publish(Source::PublicFeed, "gameStateUpdate", payload(n)).unwrap();
        }
        bus.stop().unwrap();
        let expected: Vec<String> = (0..500).map(|n| format!("gameStateUpdate:{n}")).collect();
        assert_eq!(rec.seen(), expected);
        assert_eq!(bus.dispatched_count(), 500);
    }

    #[test]
    fn concurrent_producers_keep_their_own_order() {
        let bus = fast_bus(8192);
        let rec = Recorder::new("rec");
        bus.subscribe(Selector::All, &rec);
        bus.start().unwrap();
        let handles: Vec<_> = (0..4)
            .map(|p| {
                let bus = bus.clone();
                thread::spawn(move || {
                    for n in 0..250 {
                        bus.publish(Source::PublicFeed, format!("p{p}"), payload(n)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        bus.stop().unwrap();
        let seen = rec.seen();
        assert_eq!(seen.len(), 1000);
        for p in 0..4 {
            let prefix = format!("p{p}:");
            let ns: Vec<u64> = seen
                .iter()
                .filter_map(|s| s.strip_prefix(prefix.as_str()))
                .map(|n| n.parse().unwrap())
                .collect();
            assert_eq!(ns, (0..250).collect::<Vec<u64>>());
        }
    }

    #[test]
    fn only_matching_selectors_receive() {
        let bus = fast_bus(64);
        let ticks = Recorder::new("ticks");
        let trades = Recorder::new("trades");
        bus.subscribe(Selector::Tick, &ticks);
        bus.subscribe(Selector::Trades, &trades);
        bus.start().unwrap();
        bus.publish(Source::PublicFeed, "gameStateUpdate", payload(1)).unwrap();
        bus.publish(Source::Local, "buyOrder", payload(2)).unwrap();
        bus.publish(Source::Local, "sidebetPlaced", payload(3)).unwrap();
        bus.publish(Source::PublicFeed, "somethingElse", payload(4)).unwrap();
        bus.stop().unwrap();
        assert_eq!(ticks.seen(), vec!["gameStateUpdate:1"]);
        assert_eq!(trades.seen(), vec!["buyOrder:2", "sidebetPlaced:3"]);
    }

    #[test]
    fn unsubscribe_inside_own_callback() {
        let bus = fast_bus(64);
        let calls = Arc::new(AtomicUsize::new(0));
        let own_id: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let sub = {
            let bus = bus.clone();
            let calls = Arc::clone(&calls);
            let own_id = Arc::clone(&own_id);
            FnSubscriber::new("once", move |_env: &EventEnvelope| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = *own_id.lock() {
                    bus.unsubscribe_id(id);
                }
                Ok(())
            })
        };
        *own_id.lock() = Some(bus.subscribe(Selector::All, &sub));
        bus.start().unwrap();
        for n in 0..3 {
            bus.publish(Source::PublicFeed, "gameStateUpdate", payload(n)).unwrap();
        }
        bus.stop().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    /// Holds a weak handle to itself and unsubscribes through it.
    struct SelfRemoving {
        bus: EventBus,
        me: Weak<SelfRemoving>,
        calls: AtomicUsize,
    }

    impl Subscriber for SelfRemoving {
        fn name(&self) -> &str {
            "self-removing"
        }

        fn on_event(&self, _envelope: &EventEnvelope) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(me) = self.me.upgrade() {
                anyhow::ensure!(self.bus.unsubscribe(Selector::All, &me), "registration missing");
            }
            Ok(())
        }
    }

    #[test]
    fn unsubscribe_by_handle_inside_own_callback() {
        let bus = fast_bus(64);
        let sub = Arc::new_cyclic(|me| SelfRemoving { bus: bus.clone(), me: me.clone(), calls: AtomicUsize::new(0) });
        bus.subscribe(Selector::All, &sub);
        bus.start().unwrap();
        for n in 0..3 {
            bus.publish(Source::PublicFeed, "gameStateUpdate", payload(n)).unwrap();
        }
        bus.stop().unwrap();
        assert_eq!(sub.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.callback_failure_count(), 0);
    }

    #[test]
    fn concurrent_stop_waits_for_dispatch_to_finish() {
        let bus = fast_bus(64);
        let entered = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let slow = {
            let entered = Arc::clone(&entered);
            let finished = Arc::clone(&finished);
            FnSubscriber::new("slow", move |_env: &EventEnvelope| -> anyhow::Result<()> {
                entered.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(300));
                finished.store(true, Ordering::SeqCst);
                Ok(())
            })
        };
        bus.subscribe(Selector::All, &slow);
        bus.start().unwrap();
        bus.publish(Source::PublicFeed, "gameStateUpdate", payload(1)).unwrap();
        while !entered.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }

        let stoppers: Vec<_> = (0..2)
            .map(|_| {
                let bus = bus.clone();
                let finished = Arc::clone(&finished);
                thread::spawn(move || {
                    bus.stop().unwrap();
                    finished.load(Ordering::SeqCst)
                })
            })
            .collect();
        for stopper in stoppers {
            assert!(stopper.join().unwrap(), "stop() returned while a callback was still running");
        }
        assert!(!bus.is_running());
        assert_eq!(bus.dispatched_count(), 1);
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let bus = fast_bus(1000);
        let rec = Recorder::new("rec");
        bus.subscribe(Selector::All, &rec);
        let mut rejected = 0;
        for n in 0..2000 {
            if bus.publish(Source::PublicFeed, "gameStateUpdate", payload(n)) == Err(PublishError::QueueFull) {
                rejected += 1;
            }
        }
        assert_eq!(rejected, 1000);
        assert_eq!(bus.dropped_event_count(), 1000);
        bus.start().unwrap();
        bus.stop().unwrap();
        assert_eq!(rec.seen().len(), 1000);
        assert_eq!(bus.published_count(), 1000);
    }

    #[test]
    fn failing_and_panicking_subscribers_are_isolated() {
        let bus = fast_bus(64);
        let failing = FnSubscriber::new("failing", |_env: &EventEnvelope| -> anyhow::Result<()> { bail!("boom") });
        let panicking = FnSubscriber::new("panicking", |_env: &EventEnvelope| -> anyhow::Result<()> { panic!("kaboom") });
        let rec = Recorder::new("rec");
        bus.subscribe(Selector::All, &failing);
        bus.subscribe(Selector::All, &panicking);
        bus.subscribe(Selector::All, &rec);
        bus.start().unwrap();
        for n in 0..3 {
            bus.publish(Source::PublicFeed, "gameStateUpdate", payload(n)).unwrap();
        }
        bus.stop().unwrap();
        assert_eq!(rec.seen().len(), 3);
        assert_eq!(bus.callback_failure_count(), 6);
    }

    #[test]
    fn dropped_subscriber_is_pruned_silently() {
        let bus = fast_bus(64);
        let rec = Recorder::new("gone");
        bus.subscribe(Selector::All, &rec);
        drop(rec);
        bus.start().unwrap();
        bus.publish(Source::PublicFeed, "gameStateUpdate", payload(1)).unwrap();
        bus.stop().unwrap();
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.callback_failure_count(), 0);
    }

    #[test]
    fn shut_down_subscriber_is_skipped() {
        let bus = fast_bus(64);
        let rec = Recorder::new("closing");
        bus.subscribe(Selector::All, &rec);
        rec.liveness.shutdown();
        bus.start().unwrap();
        bus.publish(Source::PublicFeed, "gameStateUpdate", payload(1)).unwrap();
        bus.stop().unwrap();
        assert!(rec.seen().is_empty());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn duplicate_subscribe_is_idempotent() {
        let bus = fast_bus(64);
        let rec = Recorder::new("rec");
        let a = bus.subscribe(Selector::Tick, &rec);
        let b = bus.subscribe(Selector::Tick, &rec);
        assert_eq!(a, b);
        assert_eq!(bus.subscriber_count(), 1);
        bus.subscribe(Selector::PlayerState, &rec);
        assert_eq!(bus.subscriber_count(), 2);
        assert_eq!(bus.unsubscribe_all(&rec), 2);
    }

    #[test]
    fn stop_inside_callback_is_rejected() {
        let bus = fast_bus(64);
        let outcome: Arc<Mutex<Option<bool>>> = Arc::new(Mutex::new(None));
        let sub = {
            let bus = bus.clone();
            let outcome = Arc::clone(&outcome);
            FnSubscriber::new("stopper", move |_env: &EventEnvelope| {
                *outcome.lock() = Some(matches!(bus.stop(), Err(BusError::StopFromDispatch)));
                Ok(())
            })
        };
        bus.subscribe(Selector::All, &sub);
        bus.start().unwrap();
        bus.publish(Source::Local, "gameStateUpdate", payload(1)).unwrap();
        bus.stop().unwrap();
        assert_eq!(*outcome.lock(), Some(true));
    }

    #[test]
    fn publish_after_stop_is_rejected_and_restart_works() {
        let bus = fast_bus(64);
        let rec = Recorder::new("rec");
        bus.subscribe(Selector::All, &rec);
        bus.start().unwrap();
        assert!(matches!(bus.start(), Err(BusError::AlreadyRunning)));
        bus.stop().unwrap();
        assert!(!bus.is_running());
        assert_eq!(bus.publish(Source::Local, "x", payload(0)), Err(PublishError::Stopped));
        bus.start().unwrap();
        bus.publish(Source::Local, "x", payload(1)).unwrap();
        bus.stop().unwrap();
        assert_eq!(rec.seen(), vec!["x:1"]);
    }
}

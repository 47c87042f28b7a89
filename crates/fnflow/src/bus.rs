//! The in-process event bus: fan-out from the event log's tail to many
//! independent, selector-filtered subscribers.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};

use crate::model::event::{AggregateType, Event};

/// A label-selector expression used to route events to subscribers.
///
/// Mirrors the original's label-selector composition: field equality, set
/// membership (`In`), and boolean `And`/`Or` combination.
#[derive(Debug, Clone)]
pub enum Selector {
    /// Matches any event.
    Any,
    AggregateType(AggregateType),
    /// Matches a label key against a set of acceptable values, e.g.
    /// `In("aggregate.type", {"workflow", "workflow_invocation"})`.
    In { key: String, values: BTreeSet<String> },
    Label { key: String, value: String },
    And(Box<Selector>, Box<Selector>),
    Or(Box<Selector>, Box<Selector>),
}

impl Selector {
    pub fn and(self, other: Selector) -> Selector {
        Selector::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Selector) -> Selector {
        Selector::Or(Box::new(self), Box::new(other))
    }

    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Selector::Any => true,
            Selector::AggregateType(t) => event.aggregate.aggregate_type == *t,
            Selector::In { key, values } => {
                if key == "aggregate.type" {
                    values.contains(event.aggregate.aggregate_type.as_str())
                } else {
                    false
                }
            }
            Selector::Label { key, value } => {
                if key == "aggregate.id" {
                    event.aggregate.id.to_string() == *value
                } else {
                    false
                }
            }
            Selector::And(a, b) => a.matches(event) && b.matches(event),
            Selector::Or(a, b) => a.matches(event) || b.matches(event),
        }
    }
}

/// Bound applied to each subscriber's relay queue. Once full, the bus drops
/// the oldest undelivered event for that subscriber and records a lag
/// marker rather than blocking the publisher — `drop-oldest-and-signal-lag`.
const SUBSCRIBER_BUFFER: usize = 256;

/// A notification delivered to a subscriber: either an event it matched, or
/// a marker that some events were dropped because it fell behind.
#[derive(Debug, Clone)]
pub enum BusMessage {
    Event(Event),
    Lagged { skipped: u64 },
}

/// A bounded ring buffer shared between the relay task (producer) and the
/// subscriber (consumer). Unlike `mpsc`, whose `try_send` rejects the
/// *incoming* item when full, this evicts the *oldest* queued item on
/// overflow and tallies how many were dropped, so the subscriber later
/// learns it fell behind instead of silently missing the newest event.
struct Inner {
    queue: Mutex<VecDeque<Event>>,
    lag: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

impl Inner {
    fn push(&self, event: Event) {
        let mut queue = self.queue.lock();
        if queue.len() >= SUBSCRIBER_BUFFER {
            queue.pop_front();
            self.lag.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    fn record_lag(&self, skipped: u64) {
        self.lag.fetch_add(skipped, Ordering::Relaxed);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }
}

pub struct Subscription {
    inner: Arc<Inner>,
}

impl Subscription {
    /// Waits for the next message. A pending lag marker is always surfaced
    /// before any buffered event, so a subscriber never silently skips the
    /// fact that it fell behind. Returns `None` once the bus is dropped and
    /// the queue has drained.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            let skipped = self.inner.lag.swap(0, Ordering::Relaxed);
            if skipped > 0 {
                return Some(BusMessage::Lagged { skipped });
            }
            if let Some(event) = self.inner.queue.lock().pop_front() {
                return Some(BusMessage::Event(event));
            }
            if self.inner.closed.load(Ordering::Relaxed) {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }
}

/// Fans out events from an [`crate::eventlog::EventLog`]'s tail to any
/// number of selector-filtered subscribers.
pub struct EventBus {
    source: broadcast::Receiver<Event>,
    source_sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Builds a bus around an existing broadcast tail, as produced by
    /// [`crate::eventlog::EventLog::watch`]. Keeping the sender lets the bus
    /// mint fresh receivers for each subscription without re-subscribing
    /// through the log.
    pub fn new(source_sender: broadcast::Sender<Event>) -> Self {
        let source = source_sender.subscribe();
        Self { source, source_sender }
    }

    /// Registers a new subscriber and spawns the task that relays matching
    /// events to it until the bus (or the subscriber) is dropped.
    pub fn subscribe(&self, selector: Selector) -> Subscription {
        let mut rx = self.source_sender.subscribe();
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::with_capacity(SUBSCRIBER_BUFFER)),
            lag: AtomicU64::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let relay_inner = inner.clone();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if selector.matches(&event) {
                            relay_inner.push(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        relay_inner.record_lag(skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            relay_inner.close();
        });

        Subscription { inner }
    }

    /// A receiver over every event, unfiltered — used internally by
    /// components (like the cache) that need their own replay-then-tail
    /// bookkeeping rather than the relay's drop policy.
    pub fn raw_receiver(&self) -> broadcast::Receiver<Event> {
        self.source_sender.subscribe()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            source: self.source_sender.subscribe(),
            source_sender: self.source_sender.clone(),
        }
    }
}

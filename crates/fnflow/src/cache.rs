//! The subscribed cache: a materialized `(type, id) -> aggregate` map kept
//! live by tailing the event bus, falling back to a full re-replay whenever
//! it detects it missed an event.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{error, warn};
use uuid::Uuid;

use crate::eventlog::EventLog;
use crate::model::aggregate::Aggregate;
use crate::model::event::{AggregateRef, AggregateType, Event};

/// Whether a cache entry reflects the latest known event, or had to fall
/// back after a gap/corruption and may be behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// The reducer failed while folding an event; the aggregate is
    /// quarantined at its last-good snapshot and will not be updated
    /// further until a caller forces a reload.
    Corrupted,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    aggregate: Aggregate,
    sequence: u64,
    freshness: Freshness,
}

type CacheKey = (AggregateType, Uuid);

fn key_of(aggregate_ref: &AggregateRef) -> CacheKey {
    (aggregate_ref.aggregate_type, aggregate_ref.id)
}

/// A live, queryable snapshot of every aggregate the cache has seen,
/// maintained by tailing an [`EventLog`].
pub struct SubscribedCache {
    entries: Arc<DashMap<CacheKey, CacheEntry>>,
    log: Arc<dyn EventLog>,
}

impl SubscribedCache {
    /// Spawns the background tail task and returns a handle. The cache
    /// starts empty and populates lazily as events arrive — callers that
    /// need a populated snapshot before handling their first command
    /// should call [`SubscribedCache::reload`] for aggregates they know
    /// about in advance.
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        let entries: Arc<DashMap<CacheKey, CacheEntry>> = Arc::new(DashMap::new());
        let rx = log.watch();
        spawn_tail_loop(entries.clone(), log.clone(), rx);
        Self { entries, log }
    }

    /// Forces a clean re-replay of one aggregate from the log, clearing any
    /// `Corrupted` quarantine.
    pub async fn reload(&self, aggregate_ref: &AggregateRef) -> Result<(), crate::eventlog::StoreError> {
        let events = self.log.replay(aggregate_ref).await?;
        replay_into(&self.entries, aggregate_ref, events);
        Ok(())
    }

    /// Returns the cached snapshot for `aggregate_ref`, if the cache has
    /// seen it. Does not hand out a reference into live state — every read
    /// is an owned clone taken at this instant.
    pub fn get(&self, aggregate_ref: &AggregateRef) -> Option<Aggregate> {
        self.entries.get(&key_of(aggregate_ref)).map(|e| e.aggregate.generic_copy())
    }

    pub fn freshness(&self, aggregate_ref: &AggregateRef) -> Option<Freshness> {
        self.entries.get(&key_of(aggregate_ref)).map(|e| e.freshness)
    }

    /// All cached aggregates of a given type, e.g. for `List` API calls.
    pub fn list(&self, aggregate_type: AggregateType) -> Vec<Aggregate> {
        self.entries
            .iter()
            .filter(|e| e.key().0 == aggregate_type)
            .map(|e| e.value().aggregate.generic_copy())
            .collect()
    }
}

fn empty_aggregate(aggregate_ref: &AggregateRef) -> Aggregate {
    match aggregate_ref.aggregate_type {
        AggregateType::Workflow => Aggregate::new_workflow(aggregate_ref.id),
        AggregateType::WorkflowInvocation => Aggregate::new_invocation(aggregate_ref.id),
    }
}

fn replay_into(entries: &DashMap<CacheKey, CacheEntry>, aggregate_ref: &AggregateRef, events: Vec<Event>) {
    let last_sequence = events.last().map(|e| e.sequence).unwrap_or(0);
    match Aggregate::replay(empty_aggregate(aggregate_ref), &events) {
        Ok(aggregate) => {
            entries.insert(
                key_of(aggregate_ref),
                CacheEntry {
                    aggregate,
                    sequence: last_sequence,
                    freshness: Freshness::Fresh,
                },
            );
        }
        Err(err) => {
            error!(aggregate = ?aggregate_ref, %err, "quarantining aggregate: reducer failed during replay");
            entries
                .entry(key_of(aggregate_ref))
                .and_modify(|e| e.freshness = Freshness::Corrupted)
                .or_insert_with(|| CacheEntry {
                    aggregate: empty_aggregate(aggregate_ref),
                    sequence: 0,
                    freshness: Freshness::Corrupted,
                });
        }
    }
}

fn spawn_tail_loop(
    entries: Arc<DashMap<CacheKey, CacheEntry>>,
    log: Arc<dyn EventLog>,
    mut rx: tokio::sync::broadcast::Receiver<Event>,
) {
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "cache tail lagged, affected aggregates will re-replay on next event");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            let key = key_of(&event.aggregate);
            let expected_next = entries.get(&key).map(|e| e.sequence + 1).unwrap_or(1);

            if event.sequence == expected_next {
                let mut entry_guard = entries.entry(key).or_insert_with(|| CacheEntry {
                    aggregate: empty_aggregate(&event.aggregate),
                    sequence: 0,
                    freshness: Freshness::Fresh,
                });
                match entry_guard.aggregate.apply_event(&event) {
                    Ok(()) => {
                        entry_guard.sequence = event.sequence;
                        entry_guard.freshness = Freshness::Fresh;
                    }
                    Err(err) => {
                        error!(aggregate = ?event.aggregate, %err, "quarantining aggregate: reducer failed");
                        entry_guard.freshness = Freshness::Corrupted;
                    }
                }
            } else if event.sequence > expected_next {
                // Missed one or more events — fall back to a full replay
                // rather than fold a gapped stream.
                warn!(
                    aggregate = ?event.aggregate,
                    expected_next,
                    got = event.sequence,
                    "sequence gap detected, re-replaying aggregate"
                );
                match log.replay(&event.aggregate).await {
                    Ok(events) => replay_into(&entries, &event.aggregate, events),
                    Err(err) => {
                        error!(aggregate = ?event.aggregate, %err, "re-replay failed, quarantining");
                        entries
                            .entry(key)
                            .and_modify(|e| e.freshness = Freshness::Corrupted)
                            .or_insert_with(|| CacheEntry {
                                aggregate: empty_aggregate(&event.aggregate),
                                sequence: 0,
                                freshness: Freshness::Corrupted,
                            });
                    }
                }
            }
            // event.sequence < expected_next: a duplicate delivery (e.g. a
            // retried watch subscription); already applied, ignore.
        }
    });
}

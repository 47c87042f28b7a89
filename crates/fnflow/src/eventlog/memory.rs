//! An in-memory [`EventLog`], suitable for embedding a host process's own
//! durable backend behind the trait, and for this crate's own tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::event::{AggregateRef, Event, EventPayload};

use super::store::{EventLog, StoreError};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

struct Stream {
    events: Vec<Event>,
}

pub struct InMemoryEventLog {
    streams: Mutex<HashMap<Uuid, Stream>>,
    tail: broadcast::Sender<Event>,
    idempotency: Mutex<HashMap<String, u64>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        let (tail, _rx) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            streams: Mutex::new(HashMap::new()),
            tail,
            idempotency: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(
        &self,
        aggregate: AggregateRef,
        expected_sequence: u64,
        events: Vec<EventPayload>,
        idempotency_key: Option<String>,
    ) -> Result<u64, StoreError> {
        if events.is_empty() {
            return Ok(expected_sequence);
        }

        if let Some(key) = &idempotency_key {
            let idem = self.idempotency.lock();
            if let Some(existing) = idem.get(key) {
                return Ok(*existing);
            }
        }

        let mut streams = self.streams.lock();
        let stream = streams.entry(aggregate.id).or_insert_with(|| Stream { events: Vec::new() });

        let actual = stream.events.len() as u64;
        if actual != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                aggregate,
                expected: expected_sequence,
                actual,
            });
        }

        let mut last_sequence = actual;
        for payload in events {
            last_sequence += 1;
            let event = Event::new(aggregate.clone(), last_sequence, payload);
            stream.events.push(event.clone());
            // A lagging or absent subscriber must never block an append.
            let _ = self.tail.send(event);
        }

        if let Some(key) = idempotency_key {
            self.idempotency.lock().insert(key, last_sequence);
        }

        Ok(last_sequence)
    }

    async fn replay(&self, aggregate: &AggregateRef) -> Result<Vec<Event>, StoreError> {
        let streams = self.streams.lock();
        match streams.get(&aggregate.id) {
            Some(stream) => Ok(stream.events.clone()),
            None => Ok(Vec::new()),
        }
    }

    fn watch(&self) -> broadcast::Receiver<Event> {
        self.tail.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::event::{AggregateType, InvocationEventPayload, WorkflowEventPayload};
    use crate::model::TypedValue;

    fn workflow_parsed(spec: crate::model::WorkflowSpec) -> EventPayload {
        EventPayload::Workflow(WorkflowEventPayload::Parsed { spec })
    }

    #[tokio::test]
    async fn append_then_replay_round_trips() {
        let log = InMemoryEventLog::new();
        let aggregate = AggregateRef::new(AggregateType::Workflow, Uuid::nil());
        let spec = crate::model::WorkflowSpec::new("t1").with_task("t1", crate::model::TaskSpec::new("noop"));

        let seq = log
            .append(aggregate.clone(), 0, vec![workflow_parsed(spec)], None)
            .await
            .unwrap();
        assert_eq!(seq, 1);

        let events = log.replay(&aggregate).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sequence, 1);
    }

    #[tokio::test]
    async fn wrong_expected_sequence_conflicts() {
        let log = InMemoryEventLog::new();
        let aggregate = AggregateRef::new(AggregateType::Workflow, Uuid::nil());
        let spec = crate::model::WorkflowSpec::new("t1").with_task("t1", crate::model::TaskSpec::new("noop"));

        log.append(aggregate.clone(), 0, vec![workflow_parsed(spec.clone())], None)
            .await
            .unwrap();

        let err = log
            .append(aggregate.clone(), 0, vec![workflow_parsed(spec)], None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::ConcurrencyConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn idempotency_key_dedupes_append() {
        let log = InMemoryEventLog::new();
        let aggregate = AggregateRef::new(AggregateType::WorkflowInvocation, Uuid::nil());
        let payload = EventPayload::WorkflowInvocation(InvocationEventPayload::TaskSucceeded {
            task_id: "t1".into(),
            output: TypedValue::nil(),
        });

        let seq1 = log
            .append(aggregate.clone(), 0, vec![payload.clone()], Some("req-1".into()))
            .await
            .unwrap();
        let seq2 = log
            .append(aggregate.clone(), 0, vec![payload], Some("req-1".into()))
            .await
            .unwrap();
        assert_eq!(seq1, seq2);

        let events = log.replay(&aggregate).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn watch_receives_appended_events() {
        let log = InMemoryEventLog::new();
        let mut rx = log.watch();
        let aggregate = AggregateRef::new(AggregateType::WorkflowInvocation, Uuid::nil());
        let payload = EventPayload::WorkflowInvocation(InvocationEventPayload::Cancelled);

        log.append(aggregate.clone(), 0, vec![payload], None).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.aggregate, aggregate);
    }
}

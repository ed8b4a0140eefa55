use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

use botica_core::{ExpectedVersion, ItemId};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance. The whole store sits
/// behind one `RwLock`, so the optimistic version check and the append happen
/// in the same critical section: this is the conditional write that serializes
/// racing dispense admissions.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<ItemId, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        // All events in a batch must target the same item's stream.
        let item_id = events[0].item_id;
        for (idx, e) in events.iter().enumerate() {
            if e.item_id != item_id {
                return Err(EventStoreError::StreamMismatch(format!(
                    "batch contains multiple item_ids (index {idx})"
                )));
            }
        }

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        let stream = streams.entry(item_id).or_default();
        let current = Self::current_version(stream);

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, found {current}"
            )));
        }

        // Assign sequence numbers and append (append-only).
        let mut next = current + 1;
        let mut committed = Vec::with_capacity(events.len());
        for e in events {
            let stored = StoredEvent {
                event_id: e.event_id,
                item_id: e.item_id,
                sequence_number: next,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            };
            next += 1;
            stream.push(stored.clone());
            committed.push(stored);
        }

        Ok(committed)
    }

    fn load_stream(&self, item_id: ItemId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        Ok(streams.get(&item_id).cloned().unwrap_or_default())
    }

    fn scan_all(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        let mut all: Vec<StoredEvent> = streams.values().flatten().cloned().collect();
        // HashMap iteration order is arbitrary; the scan contract is not.
        all.sort_by(|a, b| {
            (a.item_id, a.sequence_number).cmp(&(b.item_id, b.sequence_number))
        });
        Ok(all)
    }

    fn delete_event(&self, item_id: ItemId, event_id: Uuid) -> Result<StoredEvent, EventStoreError> {
        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        let stream = streams.get_mut(&item_id).ok_or_else(|| {
            EventStoreError::EventNotFound(format!("no stream for item {item_id}"))
        })?;

        let position = stream
            .iter()
            .position(|e| e.event_id == event_id)
            .ok_or_else(|| {
                EventStoreError::EventNotFound(format!("event {event_id} not in stream for item {item_id}"))
            })?;

        // Remaining records keep their sequence numbers; a mid-stream delete
        // leaves a gap behind.
        Ok(stream.remove(position))
    }
}

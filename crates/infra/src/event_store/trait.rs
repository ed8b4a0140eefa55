use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use botica_core::{Event, ExpectedVersion, ItemId};
use std::sync::Arc;

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// `UncommittedEvent` represents an event that's ready to be persisted but hasn't been
/// assigned a sequence number yet. The event store assigns sequence numbers during append.
///
/// ## Event Lifecycle
///
/// Events go through this lifecycle:
///
/// 1. **Domain event**: Created by the aggregate's `handle()` method
/// 2. **UncommittedEvent**: Wrapped with stream metadata (item_id, event_type)
/// 3. **StoredEvent**: Persisted with an assigned sequence_number
///
/// ## Construction
///
/// Use `UncommittedEvent::from_typed()` to create an uncommitted event from a typed
/// domain event. This method:
/// - Serializes the event to JSON (payload)
/// - Extracts event metadata (event_type, version, occurred_at)
/// - Wraps it with the target stream's item id
///
/// Domain modules can build this from their typed events using serde, while preserving
/// the event metadata needed for deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub item_id: ItemId,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A stored event in an append-only stream (assigned a sequence number).
///
/// `StoredEvent` represents an event that has been **persisted** to the event store and
/// assigned a sequence number. This is what you get back from `EventStore::append()`.
///
/// ## Sequence Numbers
///
/// Sequence numbers are assigned by the event store during append and are:
/// - **Monotonically increasing**: Each event gets the next sequence number (last + 1)
/// - **Stream-scoped**: Sequence numbers are per-stream (one stream per item)
/// - **Immutable**: Once assigned, sequence numbers never change
///
/// Sequence numbers enable:
/// - **Ordering**: Events are replayed in sequence number order
/// - **Optimistic concurrency**: Version checking uses sequence numbers
///
/// A stream read back after an administrative `delete_event` may contain gaps;
/// consumers must tolerate missing sequence numbers but still require strict
/// ascending order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub item_id: ItemId,

    /// Monotonically increasing position in the item's stream.
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }
}

/// Event store operation error.
///
/// This enum represents errors that can occur when interacting with the event store.
/// These are **infrastructure errors** (storage, concurrency) as opposed to domain
/// errors (validation, invariants).
///
/// ## Error Categories
///
/// - **Concurrency**: Optimistic concurrency check failed (version mismatch). This is
///   transient: the caller may reload the stream and retry.
/// - **StreamMismatch**: A batch tried to touch more than one item's stream
/// - **InvalidAppend**: Invalid event data or stream state
/// - **EventNotFound**: Administrative delete targeted a record that doesn't exist
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("stream mismatch: {0}")]
    StreamMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event not found: {0}")]
    EventNotFound(String),
}

/// Append-only, per-item event store.
///
/// The `EventStore` is the **persistence layer** for ledger records. It provides an
/// append-only interface where events are stored in streams (one stream per item).
/// On-hand stock is never stored here; it is derived by replaying these streams.
///
/// ## Design Principles
///
/// - **No storage assumptions**: Works with in-memory implementations (tests/dev) and
///   future SQL/NoSQL backends (production)
/// - **Optimistic locking**: Via `ExpectedVersion` (no pessimistic locks). The version
///   check runs inside the store's own critical section, which is what makes
///   `ExpectedVersion::Exact` a true conditional write: two appends racing on the same
///   expected version cannot both succeed.
/// - **Append-only**: Events cannot be modified. The single exception is
///   `delete_event`, an administrative correction that removes one record and leaves
///   a sequence gap behind.
///
/// ## Append Semantics
///
/// `append()`:
/// - Validates stream scoping (all events in a batch must target the same item)
/// - Checks optimistic concurrency (version must match expected)
/// - Assigns sequence numbers (starting at current_version + 1)
/// - Persists events atomically (all or nothing); a failed append leaves the
///   stream untouched
///
/// ## Load Semantics
///
/// `load_stream()`:
/// - Returns all events for the item in sequence number order
/// - Returns an empty vector if the stream doesn't exist (item not yet registered)
///
/// `scan_all()`:
/// - Returns every stored event across all streams, ordered by (item_id,
///   sequence_number), so a single pass can fold per-item totals
pub trait EventStore: Send + Sync {
    /// Append events to an item's stream (append-only).
    ///
    /// Implementations must:
    /// - enforce single-stream batches
    /// - enforce optimistic concurrency against the current stream version
    /// - assign monotonically increasing `sequence_number`s starting at `current_version + 1`
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load the full stream for one item.
    fn load_stream(&self, item_id: ItemId) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load every event across all streams, ordered by (item_id, sequence_number).
    fn scan_all(&self) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Administratively remove one record from an item's stream.
    ///
    /// Returns the removed record. Remaining events keep their sequence numbers, so
    /// deleting anything but the newest record leaves a gap; deleting the newest
    /// record lowers the stream version. Derived quantities are stale after this
    /// call until a reconcile pass runs.
    fn delete_event(&self, item_id: ItemId, event_id: Uuid) -> Result<StoredEvent, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn load_stream(&self, item_id: ItemId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(item_id)
    }

    fn scan_all(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).scan_all()
    }

    fn delete_event(&self, item_id: ItemId, event_id: Uuid) -> Result<StoredEvent, EventStoreError> {
        (**self).delete_event(item_id, event_id)
    }
}

impl UncommittedEvent {
    /// Convenience constructor from a typed domain event.
    ///
    /// Keeps infra decoupled from business, while still capturing event metadata
    /// needed for future deserialization.
    pub fn from_typed<E>(item_id: ItemId, event_id: Uuid, event: &E) -> Result<Self, EventStoreError>
    where
        E: Event + Serialize,
    {
        let payload = serde_json::to_value(event)
            .map_err(|e| EventStoreError::InvalidAppend(format!("payload serialization failed: {e}")))?;

        Ok(Self {
            event_id,
            item_id,
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}

//! Ledger admission pipelines (application-level orchestration).
//!
//! This module implements the write paths for the two ledgers. It orchestrates
//! the full lifecycle: loading history, rehydrating state, handling commands,
//! persisting records, and keeping the stock cache adjusted.
//!
//! ## Admission Flow
//!
//! Both admitters implement this pipeline:
//!
//! ```text
//! Command
//!   ↓
//! 1. Load the item's events from the store
//!   ↓
//! 2. Rehydrate the aggregate (apply history to rebuild state)
//!   ↓
//! 3. Handle the command (pure decision logic, produces the ledger record)
//!   ↓
//! 4. Persist the record to the store (append-only)
//!   ↓
//! 5. Adjust the cached stock level (or mark it stale on failure)
//! ```
//!
//! ## Two Paths, Two Version Disciplines
//!
//! - **Restocks** append with `ExpectedVersion::Any`. Addition commutes: two
//!   restocks landing in either order produce the same totals, so there is
//!   nothing to serialize.
//! - **Dispenses** append with `ExpectedVersion::Exact(version)`, where the
//!   version is the stream position the admission replayed. The store checks
//!   that version inside its own critical section, which closes the
//!   read-validate-write race: of two dispenses racing for the last units,
//!   exactly one commits and the other replays against the new history. The
//!   loser retries a bounded number of times; if stock ran out in the
//!   meantime, the replay rejects it with `InsufficientStock`.
//!
//! ## Failure Semantics
//!
//! - **Append fails**: nothing happened. No record, no cache change; the
//!   whole request fails atomically.
//! - **Cache adjustment fails after a successful append**: the ledger is the
//!   truth and already holds the record. The entry is marked stale, the
//!   receipt says so, and a reconcile pass rebuilds the cache from history.
//!
//! This module contains no IO itself; it composes the store and cache traits.

use tracing::{debug, error};
use uuid::Uuid;

use botica_core::{Aggregate, DomainError, ExpectedVersion, ItemId};
use botica_dispensary::{RecordDispense, RecordRestock, RegisterItem, StockCommand, StockEvent, StockItem};

use crate::cache::{InventoryCache, StockLevel};
use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug)]
pub enum AdmissionError {
    /// The request asked for more than the ledgers can cover. Deterministic
    /// and user-correctable; nothing was recorded.
    InsufficientStock { requested: u32, on_hand: i64 },
    /// Domain validation failure (deterministic).
    Validation(String),
    /// Domain invariant failure (deterministic).
    InvariantViolation(String),
    /// The item has no registration record.
    NotFound,
    /// Lost a race (create-once registration, or dispense retries exhausted).
    Conflict(String),
    /// Failed to deserialize historical event payloads.
    Deserialize(String),
    /// The event store refused the operation.
    Store(EventStoreError),
}

impl From<EventStoreError> for AdmissionError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => AdmissionError::Conflict(msg),
            other => AdmissionError::Store(other),
        }
    }
}

impl From<DomainError> for AdmissionError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => AdmissionError::Validation(msg),
            DomainError::InvariantViolation(msg) => AdmissionError::InvariantViolation(msg),
            DomainError::InsufficientStock { requested, on_hand } => {
                AdmissionError::InsufficientStock { requested, on_hand }
            }
            DomainError::Conflict(msg) => AdmissionError::Conflict(msg),
            DomainError::NotFound => AdmissionError::NotFound,
            DomainError::InvalidId(msg) => AdmissionError::Validation(msg),
        }
    }
}

/// Outcome of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterReceipt {
    pub item_id: ItemId,
    pub event_id: Uuid,
    /// Normalized (trimmed, uppercased) registry name.
    pub name: String,
}

/// Outcome of a successfully admitted restock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestockReceipt {
    pub event_id: Uuid,
    pub item_id: ItemId,
    pub quantity: u32,
    /// On-hand as derived from the history this admission saw plus the new
    /// record. Concurrent admissions may have moved the live value since.
    pub on_hand: i64,
    /// True when the ledger append succeeded but the cache could not be
    /// adjusted; the entry is flagged for reconciliation.
    pub cache_stale: bool,
}

/// Outcome of a successfully admitted dispense.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispenseReceipt {
    pub event_id: Uuid,
    pub item_id: ItemId,
    pub quantity: u32,
    pub on_hand: i64,
    pub cache_stale: bool,
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

/// Reject another item's records even if a buggy backend returns them, and
/// require strictly ascending sequence numbers. Gaps are expected (removed
/// records leave them behind) and pass.
fn validate_loaded_stream(item_id: ItemId, stream: &[StoredEvent]) -> Result<(), AdmissionError> {
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.item_id != item_id {
            return Err(AdmissionError::Store(EventStoreError::StreamMismatch(
                format!("loaded stream contains wrong item_id at index {idx}"),
            )));
        }
        if e.sequence_number == 0 {
            return Err(AdmissionError::Store(EventStoreError::InvalidAppend(
                "stored event has sequence_number=0".to_string(),
            )));
        }
        if e.sequence_number <= last {
            return Err(AdmissionError::Store(EventStoreError::InvalidAppend(
                format!(
                    "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                    e.sequence_number
                ),
            )));
        }
        last = e.sequence_number;
    }
    Ok(())
}

/// Rebuild a [`StockItem`] by replaying stored history in sequence order.
fn rehydrate(item_id: ItemId, history: &[StoredEvent]) -> Result<StockItem, AdmissionError> {
    // Ensure deterministic ordering.
    let mut sorted = history.to_vec();
    sorted.sort_by_key(|e| e.sequence_number);

    let mut item = StockItem::empty(item_id);
    for stored in sorted {
        let event: StockEvent = serde_json::from_value(stored.payload)
            .map_err(|e| AdmissionError::Deserialize(e.to_string()))?;
        item.apply(&event);
    }
    Ok(item)
}

/// Adjust the cache after a committed append; on failure, flag the entry and
/// report staleness to the caller instead of failing the admitted request.
fn apply_cache_delta<C>(cache: &C, item_id: ItemId, delta: i64) -> bool
where
    C: InventoryCache,
{
    match cache.adjust(item_id, delta) {
        Ok(()) => false,
        Err(err) => {
            error!(
                item_id = %item_id,
                error = %err,
                "cache adjustment failed after append, marking entry stale"
            );
            if let Err(err) = cache.mark_stale(item_id) {
                error!(item_id = %item_id, error = %err, "marking cache entry stale also failed");
            }
            true
        }
    }
}

/// Admission path for additions: item registration and restocks.
///
/// Neither operation needs a version gate. Registration uses `Exact(0)` as a
/// create-once guard (the stream must not exist yet), and restocks append
/// with `Any` because addition commutes.
#[derive(Debug)]
pub struct RestockAdmitter<S, C> {
    store: S,
    cache: C,
}

impl<S, C> RestockAdmitter<S, C> {
    pub fn new(store: S, cache: C) -> Self {
        Self { store, cache }
    }
}

impl<S, C> RestockAdmitter<S, C>
where
    S: EventStore,
    C: InventoryCache,
{
    /// Register a new item and seed its cache line at zero stock.
    pub fn register_item(&self, cmd: RegisterItem) -> Result<RegisterReceipt, AdmissionError> {
        let item_id = cmd.item_id;
        let item = StockItem::empty(item_id);

        let decided = item
            .handle(&StockCommand::RegisterItem(cmd))
            .map_err(AdmissionError::from)?;
        let registered = match decided.as_slice() {
            [StockEvent::ItemRegistered(e)] => e.clone(),
            _ => {
                return Err(AdmissionError::InvariantViolation(
                    "registration decided an unexpected event set".to_string(),
                ));
            }
        };

        let event_id = Uuid::now_v7();
        let event = StockEvent::ItemRegistered(registered.clone());
        let uncommitted = UncommittedEvent::from_typed(item_id, event_id, &event)?;

        // Expecting version 0 makes registration create-once: a racing second
        // registration for the same id finds version 1 and loses.
        self.store.append(vec![uncommitted], ExpectedVersion::Exact(0))?;

        if let Err(err) = self.cache.upsert(StockLevel {
            item_id,
            name: registered.name.clone(),
            unit_price: registered.unit_price,
            restocked_total: 0,
            dispensed_total: 0,
            stale: false,
        }) {
            error!(item_id = %item_id, error = %err, "cache seed failed after registration");
        }

        debug!(item_id = %item_id, name = %registered.name, "item registered");

        Ok(RegisterReceipt {
            item_id,
            event_id,
            name: registered.name,
        })
    }

    /// Validate and append one restock record, then bump the cached totals.
    pub fn record_restock(&self, cmd: RecordRestock) -> Result<RestockReceipt, AdmissionError> {
        let item_id = cmd.item_id;
        let quantity = cmd.quantity;

        let history = self.store.load_stream(item_id)?;
        validate_loaded_stream(item_id, &history)?;
        let mut item = rehydrate(item_id, &history)?;

        let decided = item
            .handle(&StockCommand::RecordRestock(cmd))
            .map_err(AdmissionError::from)?;
        let event = match decided.as_slice() {
            [event] => event.clone(),
            _ => {
                return Err(AdmissionError::InvariantViolation(
                    "restock decided an unexpected event set".to_string(),
                ));
            }
        };

        let event_id = Uuid::now_v7();
        let uncommitted = UncommittedEvent::from_typed(item_id, event_id, &event)?;
        self.store.append(vec![uncommitted], ExpectedVersion::Any)?;
        item.apply(&event);

        let cache_stale = apply_cache_delta(&self.cache, item_id, i64::from(quantity));

        debug!(item_id = %item_id, quantity, on_hand = item.on_hand(), "restock recorded");

        Ok(RestockReceipt {
            event_id,
            item_id,
            quantity,
            on_hand: item.on_hand(),
            cache_stale,
        })
    }
}

const DEFAULT_MAX_RETRIES: u32 = 16;

/// Admission path for subtractions: dispensing against derived on-hand.
///
/// The guard never admits a dispense the replayed history cannot cover, and
/// the version-gated append guarantees the history it validated is the
/// history it extended.
#[derive(Debug)]
pub struct DispenseGuard<S, C> {
    store: S,
    cache: C,
    max_retries: u32,
}

impl<S, C> DispenseGuard<S, C> {
    pub fn new(store: S, cache: C) -> Self {
        Self {
            store,
            cache,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Cap the number of replays after version conflicts. Each retry means
    /// someone else committed, so the cap is only reachable under sustained
    /// contention on one item.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl<S, C> DispenseGuard<S, C>
where
    S: EventStore,
    C: InventoryCache,
{
    /// Validate and append one dispense record, then bump the cached totals.
    ///
    /// A rejection leaves no trace: no ledger record, no cache change.
    pub fn record_dispense(&self, cmd: RecordDispense) -> Result<DispenseReceipt, AdmissionError> {
        let item_id = cmd.item_id;
        let quantity = cmd.quantity;

        // Fast rejection off a fresh cache line. Stale entries are never
        // trusted; the replay below is the authority either way.
        if let Some(level) = self.cache.get(item_id) {
            if !level.stale && i64::from(quantity) > level.on_hand() {
                debug!(
                    item_id = %item_id,
                    quantity,
                    on_hand = level.on_hand(),
                    "dispense rejected by cache pre-check"
                );
                return Err(AdmissionError::InsufficientStock {
                    requested: quantity,
                    on_hand: level.on_hand(),
                });
            }
        }

        let command = StockCommand::RecordDispense(cmd);
        let mut attempt = 0u32;
        loop {
            let history = self.store.load_stream(item_id)?;
            validate_loaded_stream(item_id, &history)?;
            let expected = ExpectedVersion::Exact(stream_version(&history));
            let mut item = rehydrate(item_id, &history)?;

            let decided = item.handle(&command).map_err(AdmissionError::from)?;
            let event = match decided.as_slice() {
                [event] => event.clone(),
                _ => {
                    return Err(AdmissionError::InvariantViolation(
                        "dispense decided an unexpected event set".to_string(),
                    ));
                }
            };

            let event_id = Uuid::now_v7();
            let uncommitted = UncommittedEvent::from_typed(item_id, event_id, &event)?;

            // The version gate turns this append into a conditional write: it
            // commits only if no other record landed since the replay above.
            match self.store.append(vec![uncommitted], expected) {
                Ok(_) => {
                    item.apply(&event);
                    let cache_stale =
                        apply_cache_delta(&self.cache, item_id, -i64::from(quantity));

                    debug!(
                        item_id = %item_id,
                        quantity,
                        on_hand = item.on_hand(),
                        attempt,
                        "dispense recorded"
                    );

                    return Ok(DispenseReceipt {
                        event_id,
                        item_id,
                        quantity,
                        on_hand: item.on_hand(),
                        cache_stale,
                    });
                }
                Err(EventStoreError::Concurrency(detail)) => {
                    if attempt >= self.max_retries {
                        return Err(AdmissionError::Conflict(format!(
                            "dispense admission gave up after {} attempts: {detail}",
                            self.max_retries
                        )));
                    }
                    attempt += 1;
                    debug!(
                        item_id = %item_id,
                        attempt,
                        "stream advanced during dispense admission, replaying"
                    );
                }
                Err(err) => return Err(AdmissionError::from(err)),
            }
        }
    }
}

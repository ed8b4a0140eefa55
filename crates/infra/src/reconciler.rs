//! Ledger reconciliation: replay every stream and rebuild derived totals.
//!
//! The reconciler is the authority for on-hand stock. It folds the full event
//! scan into a [`Snapshot`] in one pass and can push that snapshot into an
//! [`InventoryCache`] wholesale. Running it twice against an unchanged store
//! yields identical snapshots, so a reconcile pass is always safe to repeat.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use botica_core::ItemId;
use botica_dispensary::StockEvent;

use crate::cache::{CacheError, InventoryCache, StockLevel};
use crate::event_store::{EventStore, EventStoreError};

/// Running ledger totals for one item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StockTotals {
    pub restocked: i64,
    pub dispensed: i64,
}

impl StockTotals {
    /// Raw derived on-hand. Negative only when the ledgers themselves are
    /// inconsistent; the reconciler reports that, it never hides it.
    pub fn on_hand(&self) -> i64 {
        self.restocked - self.dispensed
    }
}

/// Reconciled state of one registered item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotEntry {
    pub item_id: ItemId,
    pub name: String,
    pub unit_price: Option<u64>,
    pub totals: StockTotals,
}

/// A ledger whose replay produced a negative on-hand quantity.
///
/// Reads clamp the served value to zero, but the condition itself is never
/// silent: every reconcile pass that still sees it raises the alarm again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IntegrityAlarm {
    pub item_id: ItemId,
    pub raw_on_hand: i64,
}

/// Full output of one reconcile pass.
///
/// Deterministic: entries and buckets are ordered maps, alarms are emitted in
/// item order, so two passes over the same store compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    /// Registered items with their replayed totals.
    pub entries: BTreeMap<ItemId, SnapshotEntry>,
    /// Totals for streams that carry ledger records but no registration.
    pub unregistered: BTreeMap<ItemId, StockTotals>,
    /// Items whose raw on-hand came out negative.
    pub integrity_alarms: Vec<IntegrityAlarm>,
}

impl Snapshot {
    /// Raw on-hand for a registered item, if present.
    pub fn on_hand(&self, item_id: ItemId) -> Option<i64> {
        self.entries.get(&item_id).map(|e| e.totals.on_hand())
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("event store scan failed: {0}")]
    Scan(#[from] EventStoreError),

    #[error("corrupt stream for item {item_id}: {detail}")]
    CorruptStream { item_id: ItemId, detail: String },

    #[error("event payload deserialization failed: {0}")]
    Deserialize(String),

    #[error("cache replace failed: {0}")]
    Replace(#[from] CacheError),
}

/// Single authoritative rebuilder of derived stock state.
///
/// All paths that need totals recomputed from history go through this type;
/// nothing else in the system folds the ledgers.
#[derive(Debug, Clone)]
pub struct LedgerReconciler<S> {
    store: S,
}

impl<S> LedgerReconciler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S> LedgerReconciler<S>
where
    S: EventStore,
{
    /// Replay every stream into a fresh [`Snapshot`].
    ///
    /// Tolerates sequence gaps (administrative deletions leave them behind)
    /// but rejects out-of-order streams outright. Ledger records for items
    /// that were never registered accumulate in the unregistered bucket and
    /// produce a warning, not a failure.
    pub fn reconcile(&self) -> Result<Snapshot, ReconcileError> {
        let all = self.store.scan_all()?;

        let mut entries: BTreeMap<ItemId, SnapshotEntry> = BTreeMap::new();
        let mut unregistered: BTreeMap<ItemId, StockTotals> = BTreeMap::new();
        let mut last_seq: HashMap<ItemId, u64> = HashMap::new();

        for stored in all {
            let item_id = stored.item_id;

            if stored.sequence_number == 0 {
                return Err(ReconcileError::CorruptStream {
                    item_id,
                    detail: "stored event has sequence_number=0".to_string(),
                });
            }
            if let Some(last) = last_seq.get(&item_id) {
                // Gaps are fine, going backwards is not.
                if stored.sequence_number <= *last {
                    return Err(ReconcileError::CorruptStream {
                        item_id,
                        detail: format!(
                            "non-monotonic sequence_number (last={last}, found={})",
                            stored.sequence_number
                        ),
                    });
                }
            }
            last_seq.insert(item_id, stored.sequence_number);

            let event: StockEvent = serde_json::from_value(stored.payload)
                .map_err(|e| ReconcileError::Deserialize(e.to_string()))?;
            if event.item_id() != item_id {
                return Err(ReconcileError::CorruptStream {
                    item_id,
                    detail: format!("payload targets item {}", event.item_id()),
                });
            }

            match event {
                StockEvent::ItemRegistered(e) => {
                    let totals = entries
                        .get(&item_id)
                        .map(|existing| existing.totals)
                        .or_else(|| unregistered.remove(&item_id))
                        .unwrap_or_default();
                    entries.insert(
                        item_id,
                        SnapshotEntry {
                            item_id,
                            name: e.name,
                            unit_price: e.unit_price,
                            totals,
                        },
                    );
                }
                StockEvent::StockRestocked(e) => {
                    let quantity = i64::from(e.quantity);
                    match entries.get_mut(&item_id) {
                        Some(entry) => entry.totals.restocked += quantity,
                        None => unregistered.entry(item_id).or_default().restocked += quantity,
                    }
                }
                StockEvent::StockDispensed(e) => {
                    let quantity = i64::from(e.quantity);
                    match entries.get_mut(&item_id) {
                        Some(entry) => entry.totals.dispensed += quantity,
                        None => unregistered.entry(item_id).or_default().dispensed += quantity,
                    }
                }
            }
        }

        for (item_id, totals) in &unregistered {
            warn!(
                item_id = %item_id,
                restocked = totals.restocked,
                dispensed = totals.dispensed,
                "ledger records reference an unregistered item"
            );
        }

        let mut integrity_alarms = Vec::new();
        for entry in entries.values() {
            let raw = entry.totals.on_hand();
            if raw < 0 {
                error!(
                    item_id = %entry.item_id,
                    name = %entry.name,
                    raw_on_hand = raw,
                    "negative reconciled quantity"
                );
                integrity_alarms.push(IntegrityAlarm {
                    item_id: entry.item_id,
                    raw_on_hand: raw,
                });
            }
        }
        for (item_id, totals) in &unregistered {
            let raw = totals.on_hand();
            if raw < 0 {
                error!(item_id = %item_id, raw_on_hand = raw, "negative reconciled quantity (unregistered)");
                integrity_alarms.push(IntegrityAlarm {
                    item_id: *item_id,
                    raw_on_hand: raw,
                });
            }
        }

        Ok(Snapshot {
            entries,
            unregistered,
            integrity_alarms,
        })
    }

    /// Reconcile, report drift against the current cache, then swap the cache
    /// contents for the reconciled levels.
    ///
    /// Unregistered totals stay out of the cache: an item nobody registered
    /// has no servable stock line.
    pub fn reconcile_and_replace<C>(&self, cache: &C) -> Result<Snapshot, ReconcileError>
    where
        C: InventoryCache,
    {
        let snapshot = self.reconcile()?;

        let cached: HashMap<ItemId, StockLevel> =
            cache.list().into_iter().map(|l| (l.item_id, l)).collect();
        for entry in snapshot.entries.values() {
            if let Some(level) = cached.get(&entry.item_id) {
                if level.restocked_total != entry.totals.restocked
                    || level.dispensed_total != entry.totals.dispensed
                {
                    warn!(
                        item_id = %entry.item_id,
                        name = %entry.name,
                        cached_on_hand = level.on_hand(),
                        reconciled_on_hand = entry.totals.on_hand(),
                        "cache drifted from the ledgers"
                    );
                }
            }
        }
        for level in cached.values() {
            if !snapshot.entries.contains_key(&level.item_id) {
                warn!(
                    item_id = %level.item_id,
                    name = %level.name,
                    "cache entry has no registered ledger stream"
                );
            }
        }

        let levels = snapshot
            .entries
            .values()
            .map(|entry| StockLevel {
                item_id: entry.item_id,
                name: entry.name.clone(),
                unit_price: entry.unit_price,
                restocked_total: entry.totals.restocked,
                dispensed_total: entry.totals.dispensed,
                stale: false,
            })
            .collect();
        cache.replace_all(levels)?;

        info!(
            items = snapshot.entries.len(),
            unregistered = snapshot.unregistered.len(),
            alarms = snapshot.integrity_alarms.len(),
            "ledgers reconciled"
        );

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    use botica_core::ExpectedVersion;
    use botica_dispensary::{
        ItemRegistered, PatientCategory, PatientRef, Placement, StockDispensed, StockRestocked,
        Ward,
    };

    use crate::cache::InMemoryInventoryCache;
    use crate::event_store::{InMemoryEventStore, StoredEvent, UncommittedEvent};

    fn test_patient() -> PatientRef {
        PatientRef {
            patient: "JUAN DELA CRUZ".to_string(),
            ward: Ward::Mw,
            category: PatientCategory::Opd,
        }
    }

    fn registered_event(item_id: ItemId, name: &str) -> StockEvent {
        StockEvent::ItemRegistered(ItemRegistered {
            item_id,
            name: name.to_string(),
            unit_price: Some(450),
            occurred_at: Utc::now(),
        })
    }

    fn restocked_event(item_id: ItemId, quantity: u32) -> StockEvent {
        StockEvent::StockRestocked(StockRestocked {
            item_id,
            quantity,
            recorded_by: "RIVERA".to_string(),
            placement: Placement::Dispensary,
            occurred_at: Utc::now(),
        })
    }

    fn dispensed_event(item_id: ItemId, quantity: u32) -> StockEvent {
        StockEvent::StockDispensed(StockDispensed {
            item_id,
            quantity,
            recorded_by: "SANTOS".to_string(),
            patient: test_patient(),
            occurred_at: Utc::now(),
        })
    }

    fn append(store: &InMemoryEventStore, item_id: ItemId, event: &StockEvent) -> StoredEvent {
        let uncommitted = UncommittedEvent::from_typed(item_id, Uuid::now_v7(), event).unwrap();
        let mut committed = store.append(vec![uncommitted], ExpectedVersion::Any).unwrap();
        committed.remove(0)
    }

    fn seed_item(store: &InMemoryEventStore, name: &str) -> ItemId {
        let item_id = ItemId::new();
        append(store, item_id, &registered_event(item_id, name));
        item_id
    }

    #[test]
    fn reconcile_computes_totals_per_item() {
        let store = InMemoryEventStore::new();
        let amoxicillin = seed_item(&store, "AMOXICILLIN");
        let paracetamol = seed_item(&store, "PARACETAMOL");

        append(&store, amoxicillin, &restocked_event(amoxicillin, 100));
        append(&store, amoxicillin, &dispensed_event(amoxicillin, 30));
        append(&store, paracetamol, &restocked_event(paracetamol, 50));

        let reconciler = LedgerReconciler::new(store);
        let snapshot = reconciler.reconcile().unwrap();

        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.on_hand(amoxicillin), Some(70));
        assert_eq!(snapshot.on_hand(paracetamol), Some(50));
        assert_eq!(snapshot.entries[&amoxicillin].name, "AMOXICILLIN");
        assert_eq!(snapshot.entries[&amoxicillin].totals.restocked, 100);
        assert_eq!(snapshot.entries[&amoxicillin].totals.dispensed, 30);
        assert!(snapshot.unregistered.is_empty());
        assert!(snapshot.integrity_alarms.is_empty());
    }

    #[test]
    fn reconcile_is_idempotent() {
        let store = InMemoryEventStore::new();
        let item_id = seed_item(&store, "AMOXICILLIN");
        append(&store, item_id, &restocked_event(item_id, 100));
        append(&store, item_id, &dispensed_event(item_id, 30));
        append(&store, item_id, &dispensed_event(item_id, 20));

        let reconciler = LedgerReconciler::new(store);
        let first = reconciler.reconcile().unwrap();
        let second = reconciler.reconcile().unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn unregistered_records_accumulate_in_the_bucket() {
        let store = InMemoryEventStore::new();
        let item_id = ItemId::new();
        // Ledger records without any registration event.
        append(&store, item_id, &restocked_event(item_id, 40));
        append(&store, item_id, &dispensed_event(item_id, 15));

        let reconciler = LedgerReconciler::new(store);
        let snapshot = reconciler.reconcile().unwrap();

        assert!(snapshot.entries.is_empty());
        let totals = snapshot.unregistered[&item_id];
        assert_eq!(totals.restocked, 40);
        assert_eq!(totals.dispensed, 15);
        assert!(snapshot.integrity_alarms.is_empty());
    }

    #[test]
    fn late_registration_absorbs_bucketed_totals() {
        let store = InMemoryEventStore::new();
        let item_id = ItemId::new();
        append(&store, item_id, &restocked_event(item_id, 40));
        append(&store, item_id, &registered_event(item_id, "AMOXICILLIN"));

        let reconciler = LedgerReconciler::new(store);
        let snapshot = reconciler.reconcile().unwrap();

        assert!(snapshot.unregistered.is_empty());
        assert_eq!(snapshot.on_hand(item_id), Some(40));
    }

    #[test]
    fn negative_on_hand_raises_an_integrity_alarm() {
        let store = InMemoryEventStore::new();
        let item_id = seed_item(&store, "AMOXICILLIN");
        let restock = append(&store, item_id, &restocked_event(item_id, 100));
        append(&store, item_id, &dispensed_event(item_id, 30));

        // Remove the restock record; the dispense alone drives on-hand to -30.
        store.delete_event(item_id, restock.event_id).unwrap();

        let reconciler = LedgerReconciler::new(store);
        let snapshot = reconciler.reconcile().unwrap();

        assert_eq!(snapshot.on_hand(item_id), Some(-30));
        assert_eq!(
            snapshot.integrity_alarms,
            vec![IntegrityAlarm {
                item_id,
                raw_on_hand: -30
            }]
        );
    }

    #[test]
    fn sequence_gaps_from_deletions_are_tolerated() {
        let store = InMemoryEventStore::new();
        let item_id = seed_item(&store, "AMOXICILLIN");
        append(&store, item_id, &restocked_event(item_id, 100));
        let dispense = append(&store, item_id, &dispensed_event(item_id, 30));
        append(&store, item_id, &dispensed_event(item_id, 20));

        store.delete_event(item_id, dispense.event_id).unwrap();

        let reconciler = LedgerReconciler::new(store);
        let snapshot = reconciler.reconcile().unwrap();

        assert_eq!(snapshot.on_hand(item_id), Some(80));
    }

    /// Store double that returns its scan verbatim, however malformed.
    struct FixedScanStore {
        events: Vec<StoredEvent>,
    }

    impl EventStore for FixedScanStore {
        fn append(
            &self,
            _events: Vec<UncommittedEvent>,
            _expected_version: ExpectedVersion,
        ) -> Result<Vec<StoredEvent>, EventStoreError> {
            Err(EventStoreError::InvalidAppend("read-only".to_string()))
        }

        fn load_stream(&self, item_id: ItemId) -> Result<Vec<StoredEvent>, EventStoreError> {
            Ok(self
                .events
                .iter()
                .filter(|e| e.item_id == item_id)
                .cloned()
                .collect())
        }

        fn scan_all(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
            Ok(self.events.clone())
        }

        fn delete_event(
            &self,
            _item_id: ItemId,
            event_id: Uuid,
        ) -> Result<StoredEvent, EventStoreError> {
            Err(EventStoreError::EventNotFound(event_id.to_string()))
        }
    }

    fn stored(item_id: ItemId, sequence_number: u64, event: &StockEvent) -> StoredEvent {
        let uncommitted = UncommittedEvent::from_typed(item_id, Uuid::now_v7(), event).unwrap();
        StoredEvent {
            event_id: uncommitted.event_id,
            item_id,
            sequence_number,
            event_type: uncommitted.event_type,
            event_version: uncommitted.event_version,
            occurred_at: uncommitted.occurred_at,
            payload: uncommitted.payload,
        }
    }

    #[test]
    fn non_monotonic_streams_are_rejected() {
        let item_id = ItemId::new();
        let store = FixedScanStore {
            events: vec![
                stored(item_id, 2, &restocked_event(item_id, 10)),
                stored(item_id, 1, &registered_event(item_id, "AMOXICILLIN")),
            ],
        };

        let reconciler = LedgerReconciler::new(store);
        let err = reconciler.reconcile().unwrap_err();
        match err {
            ReconcileError::CorruptStream { item_id: id, .. } => assert_eq!(id, item_id),
            _ => panic!("Expected CorruptStream error"),
        }
    }

    #[test]
    fn payload_targeting_another_item_is_rejected() {
        let item_id = ItemId::new();
        let other = ItemId::new();
        let store = FixedScanStore {
            events: vec![stored(item_id, 1, &restocked_event(other, 10))],
        };

        let reconciler = LedgerReconciler::new(store);
        let err = reconciler.reconcile().unwrap_err();
        match err {
            ReconcileError::CorruptStream { .. } => {}
            _ => panic!("Expected CorruptStream error"),
        }
    }

    #[test]
    fn reconcile_and_replace_rebuilds_the_cache() {
        let store = InMemoryEventStore::new();
        let item_id = seed_item(&store, "AMOXICILLIN");
        append(&store, item_id, &restocked_event(item_id, 100));
        append(&store, item_id, &dispensed_event(item_id, 30));

        let cache = InMemoryInventoryCache::new();
        // Drifted and stale entry, plus a ghost entry with no stream.
        cache
            .upsert(StockLevel {
                item_id,
                name: "AMOXICILLIN".to_string(),
                unit_price: Some(450),
                restocked_total: 5,
                dispensed_total: 0,
                stale: true,
            })
            .unwrap();
        cache
            .upsert(StockLevel {
                item_id: ItemId::new(),
                name: "GHOST".to_string(),
                unit_price: None,
                restocked_total: 1,
                dispensed_total: 0,
                stale: false,
            })
            .unwrap();

        let reconciler = LedgerReconciler::new(store);
        reconciler.reconcile_and_replace(&cache).unwrap();

        assert_eq!(cache.list().len(), 1);
        let level = cache.get(item_id).unwrap();
        assert_eq!(level.on_hand(), 70);
        assert!(!level.stale);
        assert_eq!(level.name, "AMOXICILLIN");
    }

    #[test]
    fn unregistered_totals_stay_out_of_the_cache() {
        let store = InMemoryEventStore::new();
        let item_id = ItemId::new();
        append(&store, item_id, &restocked_event(item_id, 40));

        let cache = InMemoryInventoryCache::new();
        let reconciler = LedgerReconciler::new(store);
        let snapshot = reconciler.reconcile_and_replace(&cache).unwrap();

        assert_eq!(snapshot.unregistered.len(), 1);
        assert!(cache.get(item_id).is_none());
    }

    #[cfg(test)]
    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: the snapshot depends only on each item's own event
            /// order, not on how appends interleaved across items.
            #[test]
            fn snapshot_is_invariant_under_cross_item_interleaving(
                ops_a in proptest::collection::vec((any::<bool>(), 1u32..=100), 1..12),
                ops_b in proptest::collection::vec((any::<bool>(), 1u32..=100), 1..12),
            ) {
                let item_a = ItemId::new();
                let item_b = ItemId::new();

                let events_a: Vec<StockEvent> = ops_a
                    .iter()
                    .map(|(restock, q)| {
                        if *restock {
                            restocked_event(item_a, *q)
                        } else {
                            dispensed_event(item_a, *q)
                        }
                    })
                    .collect();
                let events_b: Vec<StockEvent> = ops_b
                    .iter()
                    .map(|(restock, q)| {
                        if *restock {
                            restocked_event(item_b, *q)
                        } else {
                            dispensed_event(item_b, *q)
                        }
                    })
                    .collect();

                // Interleaving one: item A's history first, then item B's.
                let sequential = InMemoryEventStore::new();
                append(&sequential, item_a, &registered_event(item_a, "ITEM A"));
                append(&sequential, item_b, &registered_event(item_b, "ITEM B"));
                for event in &events_a {
                    append(&sequential, item_a, event);
                }
                for event in &events_b {
                    append(&sequential, item_b, event);
                }

                // Interleaving two: alternate between items.
                let alternating = InMemoryEventStore::new();
                append(&alternating, item_a, &registered_event(item_a, "ITEM A"));
                append(&alternating, item_b, &registered_event(item_b, "ITEM B"));
                let mut iter_a = events_a.iter();
                let mut iter_b = events_b.iter();
                loop {
                    match (iter_a.next(), iter_b.next()) {
                        (None, None) => break,
                        (a, b) => {
                            if let Some(event) = b {
                                append(&alternating, item_b, event);
                            }
                            if let Some(event) = a {
                                append(&alternating, item_a, event);
                            }
                        }
                    }
                }

                let first = LedgerReconciler::new(sequential).reconcile().unwrap();
                let second = LedgerReconciler::new(alternating).reconcile().unwrap();
                prop_assert_eq!(first, second);
            }
        }
    }
}

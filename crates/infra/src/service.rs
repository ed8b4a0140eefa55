//! Dispensary service facade: one wiring of admission, cache, and reconcile.
//!
//! Callers talk to [`DispensaryService`]; it owns the admission pipelines and
//! the reconciler over one shared store and cache pair, stamps timestamps,
//! and runs the stale-cache recovery policy so call sites don't have to.

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use botica_core::ItemId;
use botica_dispensary::{PatientRef, Placement, RecordDispense, RecordRestock, RegisterItem};

use crate::admission::{
    AdmissionError, DispenseGuard, DispenseReceipt, RegisterReceipt, RestockAdmitter,
    RestockReceipt,
};
use crate::cache::{InventoryCache, StockLevel};
use crate::event_store::{EventStore, EventStoreError};
use crate::reconciler::{LedgerReconciler, ReconcileError, Snapshot};

/// Error type for the administrative operations the service runs itself
/// (record deletion, forced reconciliation).
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("event store operation failed: {0}")]
    Store(#[from] EventStoreError),

    #[error("reconcile failed: {0}")]
    Reconcile(#[from] ReconcileError),
}

pub struct DispensaryService<S, C> {
    admitter: RestockAdmitter<S, C>,
    guard: DispenseGuard<S, C>,
    reconciler: LedgerReconciler<S>,
    store: S,
    cache: C,
}

impl<S, C> DispensaryService<S, C>
where
    S: EventStore + Clone,
    C: InventoryCache + Clone,
{
    pub fn new(store: S, cache: C) -> Self {
        Self {
            admitter: RestockAdmitter::new(store.clone(), cache.clone()),
            guard: DispenseGuard::new(store.clone(), cache.clone()),
            reconciler: LedgerReconciler::new(store.clone()),
            store,
            cache,
        }
    }

    /// Register a new item in the dispensary at zero stock.
    pub fn register_item(
        &self,
        name: &str,
        unit_price: Option<u64>,
    ) -> Result<RegisterReceipt, AdmissionError> {
        let receipt = self.admitter.register_item(RegisterItem {
            item_id: ItemId::new(),
            name: name.to_string(),
            unit_price,
            occurred_at: Utc::now(),
        })?;
        info!(item_id = %receipt.item_id, name = %receipt.name, "item registered");
        Ok(receipt)
    }

    /// Record a delivery into stock.
    pub fn record_restock(
        &self,
        item_id: ItemId,
        quantity: u32,
        recorded_by: &str,
        placement: Placement,
    ) -> Result<RestockReceipt, AdmissionError> {
        let receipt = self.admitter.record_restock(RecordRestock {
            item_id,
            quantity,
            recorded_by: recorded_by.to_string(),
            placement,
            occurred_at: Utc::now(),
        })?;
        if receipt.cache_stale {
            self.recover_cache("restock");
        }
        Ok(receipt)
    }

    /// Record a dispense to a patient, guarded against overdraw.
    pub fn record_dispense(
        &self,
        item_id: ItemId,
        quantity: u32,
        recorded_by: &str,
        patient: PatientRef,
    ) -> Result<DispenseReceipt, AdmissionError> {
        let receipt = self.guard.record_dispense(RecordDispense {
            item_id,
            quantity,
            recorded_by: recorded_by.to_string(),
            patient,
            occurred_at: Utc::now(),
        })?;
        if receipt.cache_stale {
            self.recover_cache("dispense");
        }
        Ok(receipt)
    }

    /// Served on-hand quantity. Never negative: a drifted ledger can derive a
    /// negative raw value, which is clamped here and reported by the next
    /// reconcile pass. Unknown items serve zero.
    pub fn get_quantity(&self, item_id: ItemId) -> i64 {
        match self.cache.get(item_id) {
            Some(level) => {
                let raw = level.on_hand();
                if raw < 0 {
                    warn!(item_id = %item_id, raw_on_hand = raw, "negative on-hand clamped to zero");
                    0
                } else {
                    raw
                }
            }
            None => 0,
        }
    }

    /// Raw cached stock line, staleness flag and all.
    pub fn stock_level(&self, item_id: ItemId) -> Option<StockLevel> {
        self.cache.get(item_id)
    }

    /// Replay every ledger and swap the cache for the reconciled levels.
    pub fn force_reconcile(&self) -> Result<Snapshot, AdminError> {
        Ok(self.reconciler.reconcile_and_replace(&self.cache)?)
    }

    /// Administratively remove one ledger record, then reconcile so derived
    /// quantities reflect the edited history immediately.
    pub fn delete_event_and_reconcile(
        &self,
        item_id: ItemId,
        event_id: Uuid,
    ) -> Result<Snapshot, AdminError> {
        let removed = self.store.delete_event(item_id, event_id)?;
        info!(
            item_id = %item_id,
            event_id = %event_id,
            event_type = %removed.event_type,
            "ledger record removed, reconciling"
        );
        Ok(self.reconciler.reconcile_and_replace(&self.cache)?)
    }

    /// True when the served quantity sits at or below the threshold.
    pub fn is_low_stock(&self, item_id: ItemId, threshold: i64) -> bool {
        self.get_quantity(item_id) <= threshold
    }

    /// The `limit` items with the least served stock, ascending, names
    /// breaking ties.
    pub fn lowest_stock(&self, limit: usize) -> Vec<StockLevel> {
        let mut levels = self.cache.list();
        levels.sort_by(|a, b| {
            (a.on_hand().max(0), &a.name).cmp(&(b.on_hand().max(0), &b.name))
        });
        levels.truncate(limit);
        levels
    }

    fn recover_cache(&self, context: &str) {
        warn!(context, "cache flagged stale, forcing a reconcile pass");
        match self.reconciler.reconcile_and_replace(&self.cache) {
            Ok(_) => info!(context, "cache rebuilt from the ledgers"),
            Err(err) => {
                error!(context, error = %err, "cache rebuild failed, stale levels remain flagged");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cache::InMemoryInventoryCache;
    use crate::event_store::InMemoryEventStore;

    fn setup() -> (
        DispensaryService<Arc<InMemoryEventStore>, Arc<InMemoryInventoryCache>>,
        Arc<InMemoryInventoryCache>,
    ) {
        let store = Arc::new(InMemoryEventStore::new());
        let cache = Arc::new(InMemoryInventoryCache::new());
        let service = DispensaryService::new(store, Arc::clone(&cache));
        (service, cache)
    }

    #[test]
    fn unknown_items_serve_zero() {
        let (service, _cache) = setup();
        assert_eq!(service.get_quantity(ItemId::new()), 0);
        assert!(service.stock_level(ItemId::new()).is_none());
    }

    #[test]
    fn registered_items_serve_their_running_quantity() {
        let (service, _cache) = setup();
        let receipt = service.register_item("amoxicillin 500mg", Some(450)).unwrap();
        assert_eq!(service.get_quantity(receipt.item_id), 0);

        service
            .record_restock(receipt.item_id, 100, "RIVERA", Placement::Dispensary)
            .unwrap();
        assert_eq!(service.get_quantity(receipt.item_id), 100);
    }

    #[test]
    fn negative_raw_quantities_are_clamped_not_served() {
        let (service, cache) = setup();
        let item_id = ItemId::new();
        cache
            .upsert(StockLevel {
                item_id,
                name: "DRIFTED".to_string(),
                unit_price: None,
                restocked_total: 20,
                dispensed_total: 50,
                stale: false,
            })
            .unwrap();

        assert_eq!(service.get_quantity(item_id), 0);
        // The raw line still shows the truth.
        assert_eq!(service.stock_level(item_id).unwrap().on_hand(), -30);
    }

    #[test]
    fn low_stock_threshold_is_inclusive() {
        let (service, _cache) = setup();
        let receipt = service.register_item("GAUZE", None).unwrap();
        service
            .record_restock(receipt.item_id, 10, "RIVERA", Placement::StockRoom)
            .unwrap();

        assert!(service.is_low_stock(receipt.item_id, 10));
        assert!(!service.is_low_stock(receipt.item_id, 9));
    }

    #[test]
    fn lowest_stock_sorts_ascending_with_name_tiebreak() {
        let (service, _cache) = setup();
        for (name, quantity) in [("CEFALEXIN", 9u32), ("AMOXICILLIN", 2), ("BIOGESIC", 5)] {
            let receipt = service.register_item(name, None).unwrap();
            service
                .record_restock(receipt.item_id, quantity, "RIVERA", Placement::Dispensary)
                .unwrap();
        }
        let tied = service.register_item("ASPIRIN", None).unwrap();
        service
            .record_restock(tied.item_id, 2, "RIVERA", Placement::Dispensary)
            .unwrap();

        let lowest = service.lowest_stock(3);
        let names: Vec<&str> = lowest.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["AMOXICILLIN", "ASPIRIN", "BIOGESIC"]);
    }
}

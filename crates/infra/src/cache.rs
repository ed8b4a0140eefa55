//! Disposable on-hand stock cache.
//!
//! The cache holds the running totals the admission paths consult between
//! reconcile passes. It is a convenience view over the event streams, never a
//! source of truth: any entry can be rebuilt by replaying the ledgers, and
//! `replace_all` does exactly that wholesale.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use botica_core::ItemId;

/// One cached stock line: identity plus running ledger totals.
///
/// `stale` marks an entry whose totals may lag the ledgers (an adjustment was
/// lost, or a ledger record was removed out-of-band). Stale entries are still
/// served for reads, but admission fast-paths must not trust them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub item_id: ItemId,
    pub name: String,
    pub unit_price: Option<u64>,
    pub restocked_total: i64,
    pub dispensed_total: i64,
    pub stale: bool,
}

impl StockLevel {
    /// Derived on-hand quantity. Raw: a drifted cache can report a negative
    /// value here, and callers that surface quantities clamp it.
    pub fn on_hand(&self) -> i64 {
        self.restocked_total - self.dispensed_total
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache lock poisoned")]
    Poisoned,
}

/// Keyed store for cached stock levels.
///
/// Writes return `Result` so callers can observe a failed update and mark the
/// affected entry dirty instead of silently diverging from the ledgers.
pub trait InventoryCache: Send + Sync {
    fn get(&self, item_id: ItemId) -> Option<StockLevel>;

    fn upsert(&self, level: StockLevel) -> Result<(), CacheError>;

    /// Apply a signed quantity delta to an entry's running totals.
    ///
    /// Positive deltas add to `restocked_total`, negative deltas add to
    /// `dispensed_total`. A missing entry is created stale with only this
    /// delta, since its prior history is unknown until the next reconcile.
    /// Does not clear an existing stale flag.
    fn adjust(&self, item_id: ItemId, delta: i64) -> Result<(), CacheError>;

    /// Flag an entry as possibly out of sync with the ledgers.
    fn mark_stale(&self, item_id: ItemId) -> Result<(), CacheError>;

    /// Atomically swap the entire cache contents for freshly reconciled
    /// levels. Clears all staleness.
    fn replace_all(&self, levels: Vec<StockLevel>) -> Result<(), CacheError>;

    fn list(&self) -> Vec<StockLevel>;
}

impl<C> InventoryCache for Arc<C>
where
    C: InventoryCache + ?Sized,
{
    fn get(&self, item_id: ItemId) -> Option<StockLevel> {
        (**self).get(item_id)
    }

    fn upsert(&self, level: StockLevel) -> Result<(), CacheError> {
        (**self).upsert(level)
    }

    fn adjust(&self, item_id: ItemId, delta: i64) -> Result<(), CacheError> {
        (**self).adjust(item_id, delta)
    }

    fn mark_stale(&self, item_id: ItemId) -> Result<(), CacheError> {
        (**self).mark_stale(item_id)
    }

    fn replace_all(&self, levels: Vec<StockLevel>) -> Result<(), CacheError> {
        (**self).replace_all(levels)
    }

    fn list(&self) -> Vec<StockLevel> {
        (**self).list()
    }
}

/// In-memory cache for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryInventoryCache {
    inner: RwLock<HashMap<ItemId, StockLevel>>,
}

impl InMemoryInventoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InventoryCache for InMemoryInventoryCache {
    fn get(&self, item_id: ItemId) -> Option<StockLevel> {
        let map = self.inner.read().ok()?;
        map.get(&item_id).cloned()
    }

    fn upsert(&self, level: StockLevel) -> Result<(), CacheError> {
        let mut map = self.inner.write().map_err(|_| CacheError::Poisoned)?;
        map.insert(level.item_id, level);
        Ok(())
    }

    fn adjust(&self, item_id: ItemId, delta: i64) -> Result<(), CacheError> {
        let mut map = self.inner.write().map_err(|_| CacheError::Poisoned)?;
        let entry = map.entry(item_id).or_insert_with(|| StockLevel {
            item_id,
            name: String::new(),
            unit_price: None,
            restocked_total: 0,
            dispensed_total: 0,
            stale: true,
        });

        if delta >= 0 {
            entry.restocked_total += delta;
        } else {
            entry.dispensed_total += -delta;
        }
        Ok(())
    }

    fn mark_stale(&self, item_id: ItemId) -> Result<(), CacheError> {
        let mut map = self.inner.write().map_err(|_| CacheError::Poisoned)?;
        if let Some(entry) = map.get_mut(&item_id) {
            entry.stale = true;
        }
        Ok(())
    }

    fn replace_all(&self, levels: Vec<StockLevel>) -> Result<(), CacheError> {
        let mut map = self.inner.write().map_err(|_| CacheError::Poisoned)?;
        *map = levels
            .into_iter()
            .map(|level| (level.item_id, StockLevel { stale: false, ..level }))
            .collect();
        Ok(())
    }

    fn list(&self) -> Vec<StockLevel> {
        let map = match self.inner.read() {
            Ok(m) => m,
            Err(_) => return vec![],
        };
        map.values().cloned().collect()
    }
}

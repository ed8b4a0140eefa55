//! Infrastructure layer: event store, stock cache, reconciliation, admission.

pub mod admission;
pub mod cache;
pub mod event_store;
pub mod reconciler;
pub mod service;
pub mod worker;


pub use admission::{
    AdmissionError, DispenseGuard, DispenseReceipt, RegisterReceipt, RestockAdmitter,
    RestockReceipt,
};
pub use cache::{CacheError, InMemoryInventoryCache, InventoryCache, StockLevel};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore, StoredEvent, UncommittedEvent};
pub use reconciler::{IntegrityAlarm, LedgerReconciler, ReconcileError, Snapshot, SnapshotEntry, StockTotals};
pub use service::{AdminError, DispensaryService};
pub use worker::{ReconcileWorker, WorkerHandle};

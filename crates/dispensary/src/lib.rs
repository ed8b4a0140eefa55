//! Dispensary domain module (event-sourced).
//!
//! This crate contains business rules for dispensary stock, implemented purely
//! as deterministic domain logic (no IO, no HTTP, no storage). On-hand stock is
//! never stored as a primary fact: it is the running sum of restock and
//! dispense events replayed onto the [`StockItem`] aggregate.

pub mod item;
pub mod reference;

pub use item::{
    ItemRegistered, RecordDispense, RecordRestock, RegisterItem, StockCommand, StockDispensed,
    StockEvent, StockItem, StockRestocked,
};
pub use reference::{PatientCategory, PatientRef, Placement, Ward};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use botica_core::{Aggregate, AggregateRoot, DomainError, Event, ItemId};

use crate::reference::{PatientRef, Placement};

/// Aggregate root: one stocked item and its event-derived quantities.
///
/// On-hand is never stored independently: it is always
/// `restocked_total - dispensed_total` over the applied history. The dispense
/// handler is the single place the non-negativity rule lives; every admission
/// path goes through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockItem {
    id: ItemId,
    name: String,
    unit_price: Option<u64>,
    restocked_total: i64,
    dispensed_total: i64,
    version: u64,
    registered: bool,
}

impl StockItem {
    /// Create an empty, not-yet-registered aggregate instance for rehydration.
    pub fn empty(id: ItemId) -> Self {
        Self {
            id,
            name: String::new(),
            unit_price: None,
            restocked_total: 0,
            dispensed_total: 0,
            version: 0,
            registered: false,
        }
    }

    pub fn id_typed(&self) -> ItemId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unit price in minor currency units (centavos). Optional: price keeping
    /// is a recording convenience, not part of the stock arithmetic.
    pub fn unit_price(&self) -> Option<u64> {
        self.unit_price
    }

    pub fn restocked_total(&self) -> i64 {
        self.restocked_total
    }

    pub fn dispensed_total(&self) -> i64 {
        self.dispensed_total
    }

    /// Derived on-hand quantity: restocked minus dispensed.
    ///
    /// Can only go negative through out-of-band history edits; `handle` never
    /// admits a dispense that would take it below zero.
    pub fn on_hand(&self) -> i64 {
        self.restocked_total - self.dispensed_total
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }
}

impl AggregateRoot for StockItem {
    type Id = ItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RegisterItem (create-once admission of a new item).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterItem {
    pub item_id: ItemId,
    pub name: String,
    pub unit_price: Option<u64>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordRestock (addition).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRestock {
    pub item_id: ItemId,
    pub quantity: u32,
    pub recorded_by: String,
    pub placement: Placement,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordDispense (subtraction, guarded by on-hand).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDispense {
    pub item_id: ItemId,
    pub quantity: u32,
    pub recorded_by: String,
    pub patient: PatientRef,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockCommand {
    RegisterItem(RegisterItem),
    RecordRestock(RecordRestock),
    RecordDispense(RecordDispense),
}

/// Event: ItemRegistered.
///
/// The name is stored trimmed and uppercased; the registry reads uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRegistered {
    pub item_id: ItemId,
    pub name: String,
    pub unit_price: Option<u64>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockRestocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRestocked {
    pub item_id: ItemId,
    pub quantity: u32,
    pub recorded_by: String,
    pub placement: Placement,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockDispensed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockDispensed {
    pub item_id: ItemId,
    pub quantity: u32,
    pub recorded_by: String,
    pub patient: PatientRef,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockEvent {
    ItemRegistered(ItemRegistered),
    StockRestocked(StockRestocked),
    StockDispensed(StockDispensed),
}

impl StockEvent {
    pub fn item_id(&self) -> ItemId {
        match self {
            StockEvent::ItemRegistered(e) => e.item_id,
            StockEvent::StockRestocked(e) => e.item_id,
            StockEvent::StockDispensed(e) => e.item_id,
        }
    }
}

impl Event for StockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StockEvent::ItemRegistered(_) => "dispensary.item.registered",
            StockEvent::StockRestocked(_) => "dispensary.item.restocked",
            StockEvent::StockDispensed(_) => "dispensary.item.dispensed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            StockEvent::ItemRegistered(e) => e.occurred_at,
            StockEvent::StockRestocked(e) => e.occurred_at,
            StockEvent::StockDispensed(e) => e.occurred_at,
        }
    }
}

impl Aggregate for StockItem {
    type Command = StockCommand;
    type Event = StockEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            StockEvent::ItemRegistered(e) => {
                self.id = e.item_id;
                self.name = e.name.clone();
                self.unit_price = e.unit_price;
                self.restocked_total = 0;
                self.dispensed_total = 0;
                self.registered = true;
            }
            StockEvent::StockRestocked(e) => {
                self.restocked_total += i64::from(e.quantity);
            }
            StockEvent::StockDispensed(e) => {
                self.dispensed_total += i64::from(e.quantity);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            StockCommand::RegisterItem(cmd) => self.handle_register(cmd),
            StockCommand::RecordRestock(cmd) => self.handle_restock(cmd),
            StockCommand::RecordDispense(cmd) => self.handle_dispense(cmd),
        }
    }
}

impl StockItem {
    fn ensure_item_id(&self, item_id: ItemId) -> Result<(), DomainError> {
        if self.id != item_id {
            return Err(DomainError::invariant("item_id mismatch"));
        }
        Ok(())
    }

    fn ensure_positive_quantity(quantity: u32) -> Result<(), DomainError> {
        if quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        Ok(())
    }

    fn ensure_recorder(recorded_by: &str) -> Result<(), DomainError> {
        if recorded_by.trim().is_empty() {
            return Err(DomainError::validation("recorder cannot be blank"));
        }
        Ok(())
    }

    fn handle_register(&self, cmd: &RegisterItem) -> Result<Vec<StockEvent>, DomainError> {
        if self.registered {
            return Err(DomainError::conflict("item is already registered"));
        }

        let name = cmd.name.trim().to_uppercase();
        if name.is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }

        Ok(vec![StockEvent::ItemRegistered(ItemRegistered {
            item_id: cmd.item_id,
            name,
            unit_price: cmd.unit_price,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_restock(&self, cmd: &RecordRestock) -> Result<Vec<StockEvent>, DomainError> {
        if !self.registered {
            return Err(DomainError::not_found());
        }
        self.ensure_item_id(cmd.item_id)?;
        Self::ensure_positive_quantity(cmd.quantity)?;
        Self::ensure_recorder(&cmd.recorded_by)?;

        Ok(vec![StockEvent::StockRestocked(StockRestocked {
            item_id: cmd.item_id,
            quantity: cmd.quantity,
            recorded_by: cmd.recorded_by.clone(),
            placement: cmd.placement,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_dispense(&self, cmd: &RecordDispense) -> Result<Vec<StockEvent>, DomainError> {
        if !self.registered {
            return Err(DomainError::not_found());
        }
        self.ensure_item_id(cmd.item_id)?;
        Self::ensure_positive_quantity(cmd.quantity)?;
        Self::ensure_recorder(&cmd.recorded_by)?;

        if cmd.patient.patient.trim().is_empty() {
            return Err(DomainError::validation("patient name cannot be blank"));
        }

        if i64::from(cmd.quantity) > self.on_hand() {
            return Err(DomainError::insufficient_stock(cmd.quantity, self.on_hand()));
        }

        Ok(vec![StockEvent::StockDispensed(StockDispensed {
            item_id: cmd.item_id,
            quantity: cmd.quantity,
            recorded_by: cmd.recorded_by.clone(),
            patient: cmd.patient.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

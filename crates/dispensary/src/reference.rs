//! Reference values carried on stock events.
//!
//! These are closed sets used by the recording forms; the serialized names
//! match the strings the station's records use (`"DISPENSARY"`, `"MICU"`, ...).

use serde::{Deserialize, Serialize};

/// Where restocked stock physically lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Placement {
    Dispensary,
    StockRoom,
}

impl Default for Placement {
    /// Routine restocks go straight to the dispensary shelf.
    fn default() -> Self {
        Placement::Dispensary
    }
}

/// Ward a dispense was issued to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Ward {
    Annex,
    Dr,
    Infirmary,
    Micu,
    Mw,
    Nicu,
    Obw,
    Opd,
    Or,
    Picu,
    Pw,
    Sicu,
    Sw,
}

/// Billing/eligibility category of the receiving patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatientCategory {
    Er,
    Indigent,
    Mai,
    Opd,
    Phc,
}

/// Who a dispense went to: patient name plus ward and category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRef {
    pub patient: String,
    pub ward: Ward,
    pub category: PatientCategory,
}

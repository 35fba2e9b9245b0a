// Record Model - purchases from growers, shipments to clients
// Derived fields (net weight, total amount) only ever come out of settle(),
// so a stored record is always consistent with its inputs.

use crate::error::ValidationError;
use crate::settlement::{compute_purchase, compute_shipment};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// RECORD KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// Grower → company produce intake
    Purchase,
    /// Company → client delivery
    Shipment,
}

impl RecordKind {
    pub fn table(&self) -> &'static str {
        match self {
            RecordKind::Purchase => "grower_records",
            RecordKind::Shipment => "client_records",
        }
    }

    pub fn name_column(&self) -> &'static str {
        match self {
            RecordKind::Purchase => "grower_name",
            RecordKind::Shipment => "client_name",
        }
    }

    /// Column summed as "total weight" in daily summaries
    pub fn weight_column(&self) -> &'static str {
        match self {
            RecordKind::Purchase => "net_weight",
            RecordKind::Shipment => "weight",
        }
    }

    pub fn settlement_title(&self) -> &'static str {
        match self {
            RecordKind::Purchase => "种植户结算单",
            RecordKind::Shipment => "客户结算单",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RecordKind::Purchase => "种植户",
            RecordKind::Shipment => "客户",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Purchase => write!(f, "purchase"),
            RecordKind::Shipment => write!(f, "shipment"),
        }
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "purchase" | "purchases" | "grower" | "growers" => Ok(RecordKind::Purchase),
            "shipment" | "shipments" | "client" | "clients" => Ok(RecordKind::Shipment),
            other => Err(format!("unknown record kind: {}", other)),
        }
    }
}

// ============================================================================
// DUPLICATE KEY
// ============================================================================

/// Two records of the same kind sharing this tuple are the same transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DuplicateKey {
    pub date: NaiveDate,
    pub name: String,
    pub spec: String,
}

// ============================================================================
// SHARED RECORD BEHAVIOUR
// ============================================================================

/// Raw entry fields that settle into a stored record
pub trait RecordEntry: DeserializeOwned + Send + 'static {
    type Record: LedgerRecord;

    fn settle(self) -> Result<Self::Record, ValidationError>;
}

pub trait LedgerRecord: Clone + fmt::Debug + Serialize + Send + Sync + 'static {
    const KIND: RecordKind;

    type Entry: RecordEntry<Record = Self>;

    fn id(&self) -> Option<i64>;
    fn set_id(&mut self, id: i64);
    fn date(&self) -> NaiveDate;
    fn name(&self) -> &str;
    fn spec(&self) -> &str;
    fn total_amount(&self) -> f64;

    /// Weight used in summaries: net weight for purchases, weight for shipments
    fn summary_weight(&self) -> f64;

    fn key(&self) -> DuplicateKey {
        DuplicateKey {
            date: self.date(),
            name: self.name().to_string(),
            spec: self.spec().to_string(),
        }
    }
}

fn require_text(field: &str, value: String, message: &str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new(field, message));
    }
    Ok(trimmed.to_string())
}

// ============================================================================
// PURCHASE (GROWER)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseEntry {
    pub date: NaiveDate,
    pub grower_name: String,
    pub spec: String,
    pub gross_weight: f64,
    #[serde(default)]
    pub secondary_fruit: f64,
    #[serde(default)]
    pub tare_weight: f64,
    pub unit_price: f64,
    #[serde(default)]
    pub notes: String,
}

impl PurchaseEntry {
    /// Net-weight-only entry: the net weight is recorded as the gross weight
    /// with no secondary fruit and no tare, so both entry modes store the
    /// same three components.
    pub fn from_net_weight(
        date: NaiveDate,
        grower_name: &str,
        spec: &str,
        net_weight: f64,
        unit_price: f64,
        notes: &str,
    ) -> Self {
        PurchaseEntry {
            date,
            grower_name: grower_name.to_string(),
            spec: spec.to_string(),
            gross_weight: net_weight,
            secondary_fruit: 0.0,
            tare_weight: 0.0,
            unit_price,
            notes: notes.to_string(),
        }
    }
}

impl RecordEntry for PurchaseEntry {
    type Record = PurchaseRecord;

    fn settle(self) -> Result<PurchaseRecord, ValidationError> {
        let grower_name = require_text("grower_name", self.grower_name, "姓名不能为空")?;
        let spec = require_text("spec", self.spec, "规格不能为空")?;
        let amounts = compute_purchase(
            self.gross_weight,
            self.secondary_fruit,
            self.tare_weight,
            self.unit_price,
        )?;

        Ok(PurchaseRecord {
            id: None,
            date: self.date,
            grower_name,
            spec,
            gross_weight: self.gross_weight,
            secondary_fruit: self.secondary_fruit,
            tare_weight: self.tare_weight,
            net_weight: amounts.net_weight,
            unit_price: self.unit_price,
            total_amount: amounts.total_amount,
            notes: self.notes.trim().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub date: NaiveDate,
    pub grower_name: String,
    pub spec: String,
    pub gross_weight: f64,
    pub secondary_fruit: f64,
    pub tare_weight: f64,
    pub net_weight: f64,
    pub unit_price: f64,
    pub total_amount: f64,
    pub notes: String,
}

impl PurchaseRecord {
    /// The entry this record was settled from, for editing
    pub fn to_entry(&self) -> PurchaseEntry {
        PurchaseEntry {
            date: self.date,
            grower_name: self.grower_name.clone(),
            spec: self.spec.clone(),
            gross_weight: self.gross_weight,
            secondary_fruit: self.secondary_fruit,
            tare_weight: self.tare_weight,
            unit_price: self.unit_price,
            notes: self.notes.clone(),
        }
    }
}

impl LedgerRecord for PurchaseRecord {
    const KIND: RecordKind = RecordKind::Purchase;

    type Entry = PurchaseEntry;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn date(&self) -> NaiveDate {
        self.date
    }

    fn name(&self) -> &str {
        &self.grower_name
    }

    fn spec(&self) -> &str {
        &self.spec
    }

    fn total_amount(&self) -> f64 {
        self.total_amount
    }

    fn summary_weight(&self) -> f64 {
        self.net_weight
    }
}

// ============================================================================
// SHIPMENT (CLIENT)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentEntry {
    pub date: NaiveDate,
    pub client_name: String,
    pub spec: String,
    pub pieces: i64,
    pub weight: f64,
    pub unit_price: f64,
    #[serde(default)]
    pub notes: String,
}

impl RecordEntry for ShipmentEntry {
    type Record = ShipmentRecord;

    fn settle(self) -> Result<ShipmentRecord, ValidationError> {
        let client_name = require_text("client_name", self.client_name, "客户名称不能为空")?;
        let spec = require_text("spec", self.spec, "规格不能为空")?;
        let amounts = compute_shipment(self.pieces, self.weight, self.unit_price)?;

        Ok(ShipmentRecord {
            id: None,
            date: self.date,
            client_name,
            spec,
            pieces: self.pieces,
            weight: self.weight,
            unit_price: self.unit_price,
            total_amount: amounts.total_amount,
            notes: self.notes.trim().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub date: NaiveDate,
    pub client_name: String,
    pub spec: String,
    pub pieces: i64,
    pub weight: f64,
    pub unit_price: f64,
    pub total_amount: f64,
    pub notes: String,
}

impl ShipmentRecord {
    pub fn to_entry(&self) -> ShipmentEntry {
        ShipmentEntry {
            date: self.date,
            client_name: self.client_name.clone(),
            spec: self.spec.clone(),
            pieces: self.pieces,
            weight: self.weight,
            unit_price: self.unit_price,
            notes: self.notes.clone(),
        }
    }
}

impl LedgerRecord for ShipmentRecord {
    const KIND: RecordKind = RecordKind::Shipment;

    type Entry = ShipmentEntry;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn date(&self) -> NaiveDate {
        self.date
    }

    fn name(&self) -> &str {
        &self.client_name
    }

    fn spec(&self) -> &str {
        &self.spec
    }

    fn total_amount(&self) -> f64 {
        self.total_amount
    }

    fn summary_weight(&self) -> f64 {
        self.weight
    }
}

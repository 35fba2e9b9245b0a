// Produce Ledger - Core Library
// Purchase/shipment bookkeeping shared by the terminal UI, CLI and web server

pub mod config;
pub mod db;
pub mod error;
pub mod exporter;
pub mod importer;
pub mod logging;
pub mod records;
pub mod settlement;
pub mod users;
pub mod words;
pub mod worker;

#[cfg(feature = "tui")]
pub mod ui;

#[cfg(feature = "server")]
pub mod web;

// Re-export commonly used types
pub use config::{AppConfig, ConfigOrigin, ConfigUpdate};
pub use db::{
    backup_database, bulk_insert_records, count_records, delete_record, fetch_distinct_values,
    fetch_matching_records, fetch_paged_records, get_daily_summary, get_record,
    get_records_by_ids, insert_record, record_exists, setup_database, total_pages,
    update_record, DailySummary, DistinctColumn, RecordQuery, SqlRecord, ALL_ENTITIES,
};
pub use error::{LedgerError, Result, ValidationError};
pub use exporter::{export_settlement, SettlementRow, SettlementSheet};
pub use importer::{import_file, import_sheet, ImportOutcome, ImportRow, SkippedRow};
pub use records::{
    DuplicateKey, LedgerRecord, PurchaseEntry, PurchaseRecord, RecordEntry, RecordKind,
    ShipmentEntry, ShipmentRecord,
};
pub use settlement::{
    compute_purchase, compute_shipment, detect_duplicates, round_currency, DuplicateLookup,
    DuplicateScan,
};
pub use users::{authenticate, Role, User};
pub use words::amount_to_words;
pub use worker::{TaskOutcome, TaskSlot};

/// A record type the whole application can store, import and settle
pub trait ManagedRecord: SqlRecord + ImportRow + SettlementRow {}

impl<R: SqlRecord + ImportRow + SettlementRow> ManagedRecord for R {}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ⚖️ Settlement Engine - derived amounts and duplicate detection
// Pure arithmetic over entry fields, plus one external read for duplicates.

use crate::error::{LedgerError, ValidationError};
use crate::records::{DuplicateKey, LedgerRecord, RecordKind};
use serde::Serialize;
use tracing::{debug, warn};

// ============================================================================
// DERIVED AMOUNTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PurchaseAmounts {
    pub net_weight: f64,
    pub total_amount: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ShipmentAmounts {
    pub total_amount: f64,
}

/// Round to 2 decimal places on the exact binary value, ties to even.
///
/// `(value * 100.0).round()` would round the inflated product instead, so
/// 2.005 (stored as 2.00499...) would come out as 2.01.
pub fn round_currency(value: f64) -> f64 {
    format!("{:.2}", value).parse().unwrap_or(value)
}

fn require_non_negative(field: &str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::new(field, "must be a finite number"));
    }
    if value < 0.0 {
        return Err(ValidationError::new(field, "must not be negative"));
    }
    Ok(())
}

fn require_positive(field: &str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::new(field, "must be a finite number"));
    }
    if value <= 0.0 {
        return Err(ValidationError::new(field, "must be greater than zero"));
    }
    Ok(())
}

/// net_weight = gross - secondary - tare, total = round(net_weight * unit_price, 2)
pub fn compute_purchase(
    gross: f64,
    secondary: f64,
    tare: f64,
    unit_price: f64,
) -> Result<PurchaseAmounts, ValidationError> {
    require_non_negative("gross_weight", gross)?;
    require_non_negative("secondary_fruit", secondary)?;
    require_non_negative("tare_weight", tare)?;
    require_non_negative("unit_price", unit_price)?;

    let net_weight = gross - secondary - tare;
    if net_weight <= 0.0 {
        return Err(ValidationError::new(
            "net_weight",
            "net weight must be positive",
        ));
    }

    Ok(PurchaseAmounts {
        net_weight,
        total_amount: round_currency(net_weight * unit_price),
    })
}

/// total = round(pieces * weight * unit_price, 2)
pub fn compute_shipment(
    pieces: i64,
    weight: f64,
    unit_price: f64,
) -> Result<ShipmentAmounts, ValidationError> {
    if pieces <= 0 {
        return Err(ValidationError::new("pieces", "must be greater than zero"));
    }
    require_positive("weight", weight)?;
    require_non_negative("unit_price", unit_price)?;

    Ok(ShipmentAmounts {
        total_amount: round_currency(pieces as f64 * weight * unit_price),
    })
}

// ============================================================================
// DUPLICATE DETECTION
// ============================================================================

/// Point lookup against stored records of one kind
pub trait DuplicateLookup {
    fn contains_key(&self, kind: RecordKind, key: &DuplicateKey) -> Result<bool, LedgerError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateScan<R> {
    /// Candidates not found in the store, in input order
    pub new_records: Vec<R>,
    pub duplicate_count: usize,
    /// The lookup failed and every candidate was passed through as new
    pub lookup_failed: bool,
}

/// Drop candidates whose (date, name, spec) already exists in the store.
///
/// Fails open: if any lookup errors, the whole batch is returned as new with
/// zero duplicates. Over-importing is preferred to silently losing rows.
pub fn detect_duplicates<R, L>(lookup: &L, candidates: Vec<R>) -> DuplicateScan<R>
where
    R: LedgerRecord,
    L: DuplicateLookup + ?Sized,
{
    let mut keep = Vec::with_capacity(candidates.len());
    let mut duplicate_count = 0;

    for (index, candidate) in candidates.iter().enumerate() {
        match lookup.contains_key(R::KIND, &candidate.key()) {
            Ok(true) => duplicate_count += 1,
            Ok(false) => keep.push(index),
            Err(e) => {
                warn!(kind = %R::KIND, error = %e, "duplicate check failed, treating all candidates as new");
                return DuplicateScan {
                    new_records: candidates,
                    duplicate_count: 0,
                    lookup_failed: true,
                };
            }
        }
    }

    debug!(
        kind = %R::KIND,
        kept = keep.len(),
        duplicates = duplicate_count,
        "duplicate check complete"
    );

    let mut keep = keep.into_iter().peekable();
    let new_records = candidates
        .into_iter()
        .enumerate()
        .filter_map(|(index, record)| {
            if keep.peek() == Some(&index) {
                keep.next();
                Some(record)
            } else {
                None
            }
        })
        .collect();

    DuplicateScan {
        new_records,
        duplicate_count,
        lookup_failed: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{PurchaseEntry, PurchaseRecord, RecordEntry};
    use chrono::NaiveDate;
    use std::cell::Cell;
    use std::collections::HashSet;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn purchase(day: &str, name: &str, spec: &str) -> PurchaseRecord {
        PurchaseEntry::from_net_weight(date(day), name, spec, 10.0, 2.0, "")
            .settle()
            .unwrap()
    }

    struct KnownKeys(HashSet<(RecordKind, DuplicateKey)>);

    impl DuplicateLookup for KnownKeys {
        fn contains_key(&self, kind: RecordKind, key: &DuplicateKey) -> Result<bool, LedgerError> {
            Ok(self.0.contains(&(kind, key.clone())))
        }
    }

    /// Answers "not found" a few times, then errors
    struct FlakyLookup {
        remaining_ok: Cell<usize>,
    }

    impl DuplicateLookup for FlakyLookup {
        fn contains_key(&self, _kind: RecordKind, _key: &DuplicateKey) -> Result<bool, LedgerError> {
            let left = self.remaining_ok.get();
            if left == 0 {
                return Err(LedgerError::Lookup("connection reset".to_string()));
            }
            self.remaining_ok.set(left - 1);
            Ok(false)
        }
    }

    #[test]
    fn test_compute_purchase_formula() {
        let amounts = compute_purchase(100.0, 5.5, 4.5, 1.35).unwrap();
        assert_eq!(amounts.net_weight, 100.0 - 5.5 - 4.5);
        assert_eq!(amounts.total_amount, 121.5);
    }

    #[test]
    fn test_compute_purchase_rounds_to_cents() {
        let amounts = compute_purchase(3.0, 0.0, 0.0, 0.333).unwrap();
        assert_eq!(amounts.total_amount, 1.0);

        let amounts = compute_purchase(7.0, 0.0, 0.0, 1.111).unwrap();
        assert_eq!(amounts.total_amount, 7.78);
    }

    #[test]
    fn test_compute_purchase_requires_positive_net_weight() {
        let err = compute_purchase(10.0, 4.0, 6.0, 2.0).unwrap_err();
        assert_eq!(err.field, "net_weight");
        assert_eq!(err.message, "net weight must be positive");

        let err = compute_purchase(10.0, 8.0, 6.0, 2.0).unwrap_err();
        assert_eq!(err.field, "net_weight");
    }

    #[test]
    fn test_compute_purchase_rejects_bad_inputs() {
        assert_eq!(compute_purchase(-1.0, 0.0, 0.0, 1.0).unwrap_err().field, "gross_weight");
        assert_eq!(compute_purchase(10.0, -1.0, 0.0, 1.0).unwrap_err().field, "secondary_fruit");
        assert_eq!(compute_purchase(10.0, 0.0, f64::NAN, 1.0).unwrap_err().field, "tare_weight");
        assert_eq!(compute_purchase(10.0, 0.0, 0.0, -0.5).unwrap_err().field, "unit_price");
        assert_eq!(
            compute_purchase(f64::INFINITY, 0.0, 0.0, 1.0).unwrap_err().field,
            "gross_weight"
        );
    }

    #[test]
    fn test_compute_purchase_zero_price_is_allowed() {
        let amounts = compute_purchase(10.0, 1.0, 1.0, 0.0).unwrap();
        assert_eq!(amounts.net_weight, 8.0);
        assert_eq!(amounts.total_amount, 0.0);
    }

    #[test]
    fn test_compute_shipment_formula() {
        let amounts = compute_shipment(12, 20.5, 3.0).unwrap();
        assert_eq!(amounts.total_amount, 738.0);

        let amounts = compute_shipment(3, 1.0, 0.335).unwrap();
        assert_eq!(amounts.total_amount, round_currency(3.0 * 0.335));
    }

    #[test]
    fn test_compute_shipment_names_offending_field() {
        assert_eq!(compute_shipment(0, 1.0, 1.0).unwrap_err().field, "pieces");
        assert_eq!(compute_shipment(-2, 1.0, 1.0).unwrap_err().field, "pieces");
        assert_eq!(compute_shipment(1, 0.0, 1.0).unwrap_err().field, "weight");
        assert_eq!(compute_shipment(1, -3.0, 1.0).unwrap_err().field, "weight");
        assert_eq!(compute_shipment(1, 1.0, -1.0).unwrap_err().field, "unit_price");
    }

    #[test]
    fn test_computations_are_idempotent() {
        assert_eq!(
            compute_purchase(55.5, 1.25, 3.0, 2.2).unwrap(),
            compute_purchase(55.5, 1.25, 3.0, 2.2).unwrap()
        );
        assert_eq!(
            compute_shipment(7, 12.3, 4.56).unwrap(),
            compute_shipment(7, 12.3, 4.56).unwrap()
        );
    }

    #[test]
    fn test_round_currency() {
        assert_eq!(round_currency(1.234), 1.23);
        assert_eq!(round_currency(1.235001), 1.24);
        assert_eq!(round_currency(0.0), 0.0);
        assert_eq!(round_currency(99.999), 100.0);
        assert_eq!(round_currency(-1.236), -1.24);
    }

    #[test]
    fn test_round_currency_uses_exact_binary_value() {
        // 2.005 and 1.005 are stored just below the tie
        assert_eq!(round_currency(2.005), 2.0);
        assert_eq!(round_currency(1.005), 1.0);
        // 0.125 is exact, so the tie goes to the even cent
        assert_eq!(round_currency(0.125), 0.12);
        assert_eq!(round_currency(0.375), 0.38);
    }

    #[test]
    fn test_compute_totals_do_not_drift_up_on_ties() {
        let amounts = compute_purchase(2.005, 0.0, 0.0, 1.0).unwrap();
        assert_eq!(amounts.total_amount, 2.0);

        let amounts = compute_shipment(1, 2.005, 1.0).unwrap();
        assert_eq!(amounts.total_amount, 2.0);
    }

    #[test]
    fn test_detect_duplicates_drops_existing_tuple() {
        let existing = purchase("2024-01-01", "张三", "A");
        let lookup = KnownKeys(HashSet::from([(RecordKind::Purchase, existing.key())]));

        let candidates = vec![
            purchase("2024-01-01", "张三", "A"),
            purchase("2024-01-01", "张三", "B"),
        ];
        let scan = detect_duplicates(&lookup, candidates);

        assert_eq!(scan.new_records.len(), 1);
        assert_eq!(scan.new_records[0].spec, "B");
        assert_eq!(scan.duplicate_count, 1);
        assert!(!scan.lookup_failed);
    }

    #[test]
    fn test_detect_duplicates_preserves_order() {
        let lookup = KnownKeys(HashSet::from([(
            RecordKind::Purchase,
            purchase("2024-01-02", "李四", "A").key(),
        )]));

        let candidates = vec![
            purchase("2024-01-03", "甲", "A"),
            purchase("2024-01-02", "李四", "A"),
            purchase("2024-01-01", "乙", "A"),
            purchase("2024-01-04", "丙", "A"),
        ];
        let scan = detect_duplicates(&lookup, candidates);

        let names: Vec<&str> = scan.new_records.iter().map(|r| r.grower_name.as_str()).collect();
        assert_eq!(names, vec!["甲", "乙", "丙"]);
    }

    #[test]
    fn test_detect_duplicates_is_scoped_to_kind() {
        let record = purchase("2024-01-01", "张三", "A");
        let lookup = KnownKeys(HashSet::from([(RecordKind::Shipment, record.key())]));

        let scan = detect_duplicates(&lookup, vec![record]);
        assert_eq!(scan.new_records.len(), 1);
        assert_eq!(scan.duplicate_count, 0);
    }

    #[test]
    fn test_detect_duplicates_fails_open_on_lookup_error() {
        let lookup = FlakyLookup {
            remaining_ok: Cell::new(1),
        };
        let candidates = vec![
            purchase("2024-01-01", "张三", "A"),
            purchase("2024-01-02", "张三", "A"),
            purchase("2024-01-03", "张三", "A"),
        ];

        let scan = detect_duplicates(&lookup, candidates);
        assert_eq!(scan.new_records.len(), 3);
        assert_eq!(scan.duplicate_count, 0);
        assert!(scan.lookup_failed);
    }

    #[test]
    fn test_detect_duplicates_empty_batch() {
        let lookup = FlakyLookup {
            remaining_ok: Cell::new(0),
        };
        let scan: DuplicateScan<PurchaseRecord> = detect_duplicates(&lookup, Vec::new());
        assert!(scan.new_records.is_empty());
        assert_eq!(scan.duplicate_count, 0);
        assert!(!scan.lookup_failed);
    }
}

// 📥 Bulk Import - CSV sheets → settled records → duplicate check
// Inserting is a separate step so the operator can confirm the counts first.

use crate::error::{LedgerError, Result, ValidationError};
use crate::records::{LedgerRecord, PurchaseEntry, PurchaseRecord, RecordEntry, ShipmentEntry, ShipmentRecord};
use crate::settlement::{detect_duplicates, DuplicateLookup};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

// ============================================================================
// SHEET ROWS
// ============================================================================

/// Purchase sheet row, every cell as text
#[derive(Debug, Deserialize)]
pub struct PurchaseRow {
    #[serde(rename = "日期")]
    pub date: String,
    #[serde(rename = "姓名")]
    pub name: String,
    #[serde(rename = "规格")]
    pub spec: String,
    #[serde(rename = "毛重(斤)")]
    pub gross_weight: String,
    #[serde(rename = "次果(斤)")]
    pub secondary_fruit: String,
    #[serde(rename = "皮重(斤)")]
    pub tare_weight: String,
    #[serde(rename = "单价")]
    pub unit_price: String,
    #[serde(rename = "备注")]
    pub notes: String,
}

/// Shipment sheet row, every cell as text
#[derive(Debug, Deserialize)]
pub struct ShipmentRow {
    #[serde(rename = "日期")]
    pub date: String,
    #[serde(rename = "姓名")]
    pub name: String,
    #[serde(rename = "规格")]
    pub spec: String,
    #[serde(rename = "件数")]
    pub pieces: String,
    #[serde(rename = "重量(斤)")]
    pub weight: String,
    #[serde(rename = "单价")]
    pub unit_price: String,
    #[serde(rename = "备注")]
    pub notes: String,
}

/// A record type that can be read from an import sheet
pub trait ImportRow: LedgerRecord {
    type Row: DeserializeOwned;

    /// Required sheet headers
    const HEADERS: &'static [&'static str];

    fn from_sheet_row(row: Self::Row) -> std::result::Result<Self, ValidationError>;

    /// Entry fields in `HEADERS` order, as they would appear in a sheet
    fn sheet_cells(&self) -> Vec<String>;
}

/// Settle one row of text cells given in `HEADERS` order
pub fn record_from_cells<R: ImportRow>(cells: &[String]) -> Result<R> {
    let headers = csv::StringRecord::from(R::HEADERS.to_vec());
    let row = csv::StringRecord::from(cells.to_vec());
    let parsed: R::Row = row
        .deserialize(Some(&headers))
        .map_err(|e| LedgerError::Import(e.to_string()))?;
    Ok(R::from_sheet_row(parsed)?)
}

pub fn parse_sheet_date(raw: &str) -> std::result::Result<NaiveDate, ValidationError> {
    let raw = raw.trim();
    // Spreadsheet exports sometimes carry a midnight time component
    let day = raw.split_whitespace().next().unwrap_or("");
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(day, "%Y/%m/%d"))
        .map_err(|_| ValidationError::new("date", format!("无法识别的日期: {}", raw)))
}

/// Empty cells count as zero
fn parse_number(field: &str, raw: &str) -> std::result::Result<f64, ValidationError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0.0);
    }
    raw.parse::<f64>()
        .map_err(|_| ValidationError::new(field, format!("不是有效数字: {}", raw)))
}

fn parse_count(field: &str, raw: &str) -> std::result::Result<i64, ValidationError> {
    let value = parse_number(field, raw)?;
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(ValidationError::new(field, format!("必须是整数: {}", raw.trim())));
    }
    Ok(value as i64)
}

impl ImportRow for PurchaseRecord {
    type Row = PurchaseRow;

    const HEADERS: &'static [&'static str] = &[
        "日期", "姓名", "规格", "毛重(斤)", "次果(斤)", "皮重(斤)", "单价", "备注",
    ];

    fn from_sheet_row(row: PurchaseRow) -> std::result::Result<Self, ValidationError> {
        PurchaseEntry {
            date: parse_sheet_date(&row.date)?,
            grower_name: row.name,
            spec: row.spec,
            gross_weight: parse_number("gross_weight", &row.gross_weight)?,
            secondary_fruit: parse_number("secondary_fruit", &row.secondary_fruit)?,
            tare_weight: parse_number("tare_weight", &row.tare_weight)?,
            unit_price: parse_number("unit_price", &row.unit_price)?,
            notes: row.notes,
        }
        .settle()
    }

    fn sheet_cells(&self) -> Vec<String> {
        vec![
            self.date.to_string(),
            self.grower_name.clone(),
            self.spec.clone(),
            self.gross_weight.to_string(),
            self.secondary_fruit.to_string(),
            self.tare_weight.to_string(),
            self.unit_price.to_string(),
            self.notes.clone(),
        ]
    }
}

impl ImportRow for ShipmentRecord {
    type Row = ShipmentRow;

    const HEADERS: &'static [&'static str] =
        &["日期", "姓名", "规格", "件数", "重量(斤)", "单价", "备注"];

    fn from_sheet_row(row: ShipmentRow) -> std::result::Result<Self, ValidationError> {
        ShipmentEntry {
            date: parse_sheet_date(&row.date)?,
            client_name: row.name,
            spec: row.spec,
            pieces: parse_count("pieces", &row.pieces)?,
            weight: parse_number("weight", &row.weight)?,
            unit_price: parse_number("unit_price", &row.unit_price)?,
            notes: row.notes,
        }
        .settle()
    }

    fn sheet_cells(&self) -> Vec<String> {
        vec![
            self.date.to_string(),
            self.client_name.clone(),
            self.spec.clone(),
            self.pieces.to_string(),
            self.weight.to_string(),
            self.unit_price.to_string(),
            self.notes.clone(),
        ]
    }
}

// ============================================================================
// IMPORT OUTCOME
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRow {
    /// 1-based line in the file (the header is line 1)
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportOutcome<R> {
    pub new_records: Vec<R>,
    pub duplicate_count: usize,
    pub total_rows: usize,
    pub skipped: Vec<SkippedRow>,
    pub lookup_failed: bool,
}

impl<R> ImportOutcome<R> {
    pub fn summary(&self) -> String {
        let mut parts = vec![format!("解析 {} 行", self.total_rows)];
        if !self.skipped.is_empty() {
            parts.push(format!("跳过 {} 行无效数据", self.skipped.len()));
        }
        if self.duplicate_count > 0 {
            parts.push(format!("发现 {} 条重复记录", self.duplicate_count));
        }
        if self.lookup_failed {
            parts.push("重复检查失败, 全部视为新记录".to_string());
        }
        parts.push(format!("{} 条新记录待导入", self.new_records.len()));
        parts.join(", ")
    }
}

/// Parsed rows before the duplicate check
#[derive(Debug)]
pub struct ParsedSheet<R> {
    pub records: Vec<R>,
    pub total_rows: usize,
    pub skipped: Vec<SkippedRow>,
}

// ============================================================================
// PARSING
// ============================================================================

/// Read a sheet; rows that don't parse or settle are skipped, not fatal
pub fn parse_sheet<R: ImportRow, T: Read>(reader: T) -> Result<ParsedSheet<R>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .flexible(true)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    let missing: Vec<&str> = R::HEADERS
        .iter()
        .copied()
        .filter(|h| !headers.iter().any(|present| present.trim_start_matches('\u{feff}') == *h))
        .collect();
    if !missing.is_empty() {
        return Err(LedgerError::Import(format!(
            "文件缺少必要的列: {}",
            missing.join(", ")
        )));
    }
    // Tolerate a UTF-8 BOM on the first header
    let cleaned: csv::StringRecord = headers
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}'))
        .collect();
    rdr.set_headers(cleaned.clone());

    let mut records = Vec::new();
    let mut skipped = Vec::new();
    let mut total_rows = 0;

    for (index, result) in rdr.records().enumerate() {
        let raw = result?;
        // Quoted cells may span lines, so ask the reader where the row began
        let line = raw
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(index + 2);
        if raw.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        total_rows += 1;

        let parsed = raw
            .deserialize::<R::Row>(Some(&cleaned))
            .map_err(|e| e.to_string())
            .and_then(|row| R::from_sheet_row(row).map_err(|e| e.to_string()));

        match parsed {
            Ok(record) => records.push(record),
            Err(reason) => {
                warn!(kind = %R::KIND, line, %reason, "skipping import row");
                skipped.push(SkippedRow { line, reason });
            }
        }
    }

    Ok(ParsedSheet {
        records,
        total_rows,
        skipped,
    })
}

/// Parse a sheet and drop rows already in the store
pub fn import_sheet<R, T, L>(reader: T, lookup: &L) -> Result<ImportOutcome<R>>
where
    R: ImportRow,
    T: Read,
    L: DuplicateLookup + ?Sized,
{
    let parsed = parse_sheet::<R, T>(reader)?;
    let scan = detect_duplicates(lookup, parsed.records);

    let outcome = ImportOutcome {
        new_records: scan.new_records,
        duplicate_count: scan.duplicate_count,
        total_rows: parsed.total_rows,
        skipped: parsed.skipped,
        lookup_failed: scan.lookup_failed,
    };
    info!(kind = %R::KIND, "{}", outcome.summary());
    Ok(outcome)
}

pub fn import_file<R, L>(path: &Path, lookup: &L) -> Result<ImportOutcome<R>>
where
    R: ImportRow,
    L: DuplicateLookup + ?Sized,
{
    let file = File::open(path)
        .map_err(|e| LedgerError::Import(format!("无法读取文件 {}: {}", path.display(), e)))?;
    import_sheet(file, lookup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{insert_record, setup_database};
    use rusqlite::Connection;

    const PURCHASE_SHEET: &str = "\
日期,姓名,规格,毛重(斤),次果(斤),皮重(斤),单价,备注
2024-01-01,张三,A,120,5,15,2.5,
2024/01/02,李四,B,80,,,3,早上
2024-01-03,王五,A,abc,0,0,2,
2024-01-04,赵六,A,10,6,6,2,
,,,,,,,
2024-01-05,,A,10,0,0,2,
";

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_parse_purchase_sheet() {
        let parsed: ParsedSheet<PurchaseRecord> = parse_sheet(PURCHASE_SHEET.as_bytes()).unwrap();

        assert_eq!(parsed.total_rows, 5);
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.records[0].net_weight, 100.0);
        assert_eq!(parsed.records[0].total_amount, 250.0);
        // Empty secondary/tare cells count as zero
        assert_eq!(parsed.records[1].net_weight, 80.0);
        assert_eq!(parsed.records[1].notes, "早上");

        let lines: Vec<usize> = parsed.skipped.iter().map(|s| s.line).collect();
        assert_eq!(lines, vec![4, 5, 7]);
        assert!(parsed.skipped[0].reason.contains("gross_weight"));
        assert!(parsed.skipped[1].reason.contains("net weight must be positive"));
        assert!(parsed.skipped[2].reason.contains("grower_name"));
    }

    #[test]
    fn test_skipped_line_counts_multiline_cells() {
        let sheet = "日期,姓名,规格,毛重(斤),次果(斤),皮重(斤),单价,备注\n\
                     2024-01-01,张三,A,120,5,15,2.5,\"上午一车\n下午一车\"\n\
                     2024-01-02,李四,A,abc,0,0,2,\n\
                     \n\
                     2024-01-03,,A,10,0,0,2,\n";
        let parsed: ParsedSheet<PurchaseRecord> = parse_sheet(sheet.as_bytes()).unwrap();

        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].notes, "上午一车\n下午一车");
        let lines: Vec<usize> = parsed.skipped.iter().map(|s| s.line).collect();
        assert_eq!(lines, vec![4, 6]);
    }

    #[test]
    fn test_missing_columns_are_reported() {
        let sheet = "日期,姓名,单价\n2024-01-01,张三,2\n";
        let err = parse_sheet::<ShipmentRecord, _>(sheet.as_bytes()).unwrap_err();

        let message = err.to_string();
        assert!(message.contains("规格"));
        assert!(message.contains("件数"));
        assert!(message.contains("重量(斤)"));
        assert!(message.contains("备注"));
    }

    #[test]
    fn test_shipment_sheet_with_bom_and_fractional_pieces() {
        let sheet = "\u{feff}日期,姓名,规格,件数,重量(斤),单价,备注\n\
                     2024-03-01,客户甲,大果,10,25,1.2,\n\
                     2024-03-01,客户乙,大果,2.5,25,1.2,\n\
                     2024-03-02 00:00:00,客户甲,小果,3.0,10,2,\n";
        let parsed: ParsedSheet<ShipmentRecord> = parse_sheet(sheet.as_bytes()).unwrap();

        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.records[0].total_amount, 300.0);
        assert_eq!(parsed.records[1].pieces, 3);
        assert_eq!(parsed.skipped.len(), 1);
        assert!(parsed.skipped[0].reason.contains("pieces"));
    }

    #[test]
    fn test_import_sheet_skips_existing_records() {
        let conn = test_db();
        let existing = PurchaseEntry::from_net_weight(
            parse_sheet_date("2024-01-01").unwrap(),
            "张三",
            "A",
            1.0,
            1.0,
            "",
        )
        .settle()
        .unwrap();
        insert_record(&conn, &existing).unwrap();

        let outcome: ImportOutcome<PurchaseRecord> =
            import_sheet(PURCHASE_SHEET.as_bytes(), &conn).unwrap();

        assert_eq!(outcome.total_rows, 5);
        assert_eq!(outcome.duplicate_count, 1);
        assert_eq!(outcome.new_records.len(), 1);
        assert_eq!(outcome.new_records[0].grower_name, "李四");
        assert!(!outcome.lookup_failed);
        assert!(outcome.summary().contains("1 条重复记录"));
    }

    #[test]
    fn test_import_file_missing() {
        let conn = test_db();
        let err = import_file::<PurchaseRecord, _>(Path::new("/nonexistent/sheet.csv"), &conn)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Import(_)));
    }

    #[test]
    fn test_record_from_cells_matches_sheet_cells() {
        let cells: Vec<String> = ["2024-01-01", " 张三 ", "A", "120", "5", "", "2.5", "早上"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let record: PurchaseRecord = record_from_cells(&cells).unwrap();

        assert_eq!(record.grower_name, "张三");
        assert_eq!(record.net_weight, 115.0);
        assert_eq!(record.total_amount, 287.5);
        let again: PurchaseRecord = record_from_cells(&record.sheet_cells()).unwrap();
        assert_eq!(again, record);

        let mut bad = cells.clone();
        bad[6] = "两块".to_string();
        let err = record_from_cells::<PurchaseRecord>(&bad).unwrap_err();
        assert_eq!(err.field(), Some("unit_price"));
    }

    #[test]
    fn test_parse_sheet_date_formats() {
        assert!(parse_sheet_date("2024-02-29").is_ok());
        assert!(parse_sheet_date("2024/2/3").is_ok());
        assert_eq!(parse_sheet_date("29.02.2024").unwrap_err().field, "date");
    }
}

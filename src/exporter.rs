// 🧾 Settlement Export - one entity's records as a printable sheet
// Written as UTF-8 CSV with a BOM so spreadsheet software opens it directly.

use crate::config::AppConfig;
use crate::error::{LedgerError, Result, ValidationError};
use crate::records::{LedgerRecord, PurchaseRecord, ShipmentRecord};
use crate::settlement::round_currency;
use crate::words::amount_to_words;
use chrono::{Local, NaiveDate, NaiveDateTime};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const AMOUNT_COLUMN: &str = "金额";

/// A record that can appear as a row of a settlement sheet
pub trait SettlementRow: LedgerRecord {
    const SETTLEMENT_COLUMNS: &'static [&'static str];

    fn cells(&self) -> Vec<String>;
}

fn money(value: f64) -> String {
    format!("{:.2}", value)
}

impl SettlementRow for PurchaseRecord {
    const SETTLEMENT_COLUMNS: &'static [&'static str] = &[
        "日期", "规格", "毛重(斤)", "次果(斤)", "皮重(斤)", "净重(斤)", "单价", AMOUNT_COLUMN, "备注",
    ];

    fn cells(&self) -> Vec<String> {
        vec![
            self.date.to_string(),
            self.spec.clone(),
            money(self.gross_weight),
            money(self.secondary_fruit),
            money(self.tare_weight),
            money(self.net_weight),
            money(self.unit_price),
            money(self.total_amount),
            self.notes.clone(),
        ]
    }
}

impl SettlementRow for ShipmentRecord {
    const SETTLEMENT_COLUMNS: &'static [&'static str] =
        &["日期", "规格", "件数", "重量(斤)", "单价", AMOUNT_COLUMN, "备注"];

    fn cells(&self) -> Vec<String> {
        vec![
            self.date.to_string(),
            self.spec.clone(),
            self.pieces.to_string(),
            money(self.weight),
            money(self.unit_price),
            money(self.total_amount),
            self.notes.clone(),
        ]
    }
}

// ============================================================================
// SHEET
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SettlementSheet {
    pub company_name: String,
    pub title: String,
    pub entity: String,
    pub period: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub total_amount: f64,
    pub total_in_words: String,
    pub footer_text: String,
    pub phone_number: String,
    pub generated_at: NaiveDateTime,
}

fn format_period(first: NaiveDate, last: NaiveDate) -> String {
    if first == last {
        first.to_string()
    } else {
        format!("{} 至 {}", first, last)
    }
}

impl SettlementSheet {
    /// Validate that `records` belong to one entity and lay them out
    pub fn build<R: SettlementRow>(
        records: &[R],
        config: &AppConfig,
        generated_at: NaiveDateTime,
    ) -> Result<Self> {
        let first = records
            .first()
            .ok_or_else(|| ValidationError::new("records", "没有可导出的记录"))?;

        let entity = first.name().to_string();
        if let Some(other) = records.iter().find(|r| r.name() != entity) {
            return Err(ValidationError::new(
                "name",
                format!(
                    "结算单只能包含一个结算对象, 找到 {} 和 {}, 请先按姓名筛选",
                    entity,
                    other.name()
                ),
            )
            .into());
        }

        let mut ordered: Vec<&R> = records.iter().collect();
        ordered.sort_by_key(|r| (r.date(), r.id().unwrap_or(i64::MAX)));

        let start = ordered[0].date();
        let end = ordered[ordered.len() - 1].date();

        let total_amount = round_currency(ordered.iter().map(|r| r.total_amount()).sum());
        let total_in_words = amount_to_words(total_amount)?;

        Ok(SettlementSheet {
            company_name: config.company_name.clone(),
            title: R::KIND.settlement_title().to_string(),
            entity,
            period: format_period(start, end),
            columns: R::SETTLEMENT_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows: ordered.iter().map(|r| r.cells()).collect(),
            total_amount,
            total_in_words,
            footer_text: config.footer_text.clone(),
            phone_number: config.phone_number.clone(),
            generated_at,
        })
    }

    pub fn write_csv<W: Write>(&self, mut out: W) -> Result<()> {
        out.write_all(UTF8_BOM)?;

        let width = self.columns.len();
        let padded = |cells: Vec<String>| -> Vec<String> {
            let mut cells = cells;
            cells.resize(width, String::new());
            cells
        };

        let mut wtr = csv::WriterBuilder::new().flexible(true).from_writer(out);

        wtr.write_record(padded(vec![self.company_name.clone()]))?;
        wtr.write_record(padded(vec![self.title.clone()]))?;
        wtr.write_record(padded(vec![]))?;
        wtr.write_record(padded(vec![
            format!("结算对象: {}", self.entity),
            String::new(),
            format!("结算周期: {}", self.period),
        ]))?;
        wtr.write_record(padded(vec![]))?;

        wtr.write_record(&self.columns)?;
        for row in &self.rows {
            wtr.write_record(row)?;
        }
        wtr.write_record(padded(vec![]))?;

        let amount_index = self
            .columns
            .iter()
            .position(|c| c == AMOUNT_COLUMN)
            .unwrap_or(width.saturating_sub(1));
        let mut total_row = padded(vec!["总计 (TOTAL)".to_string()]);
        total_row[amount_index] = money(self.total_amount);
        wtr.write_record(&total_row)?;
        wtr.write_record(padded(vec![format!("金额大写: {}", self.total_in_words)]))?;
        wtr.write_record(padded(vec![]))?;

        wtr.write_record(padded(vec![self.footer_text.clone()]))?;
        wtr.write_record(padded(vec![format!(
            "联系电话: {} | 生成时间: {}",
            self.phone_number,
            self.generated_at.format("%Y-%m-%d %H:%M:%S")
        )]))?;

        wtr.flush()?;
        Ok(())
    }

    pub fn file_name(&self) -> String {
        let entity: String = self
            .entity
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == ' ' || *c == '_')
            .collect();
        let entity = entity.trim();
        let entity = if entity.is_empty() { "结算" } else { entity };
        format!(
            "{}_{}_{}.csv",
            entity,
            self.title,
            self.generated_at.format("%Y%m%d-%H%M%S")
        )
    }

    /// Write into `dir` (created if needed) and return the file path
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir).map_err(|e| {
            LedgerError::Config(format!("cannot create export dir {}: {}", dir.display(), e))
        })?;
        let path = dir.join(self.file_name());
        let file = File::create(&path)?;
        self.write_csv(BufWriter::new(file))?;

        info!(
            path = %path.display(),
            entity = %self.entity,
            rows = self.rows.len(),
            total = self.total_amount,
            "settlement exported"
        );
        Ok(path)
    }
}

/// Build and save a settlement sheet into the configured export directory
pub fn export_settlement<R: SettlementRow>(records: &[R], config: &AppConfig) -> Result<PathBuf> {
    let sheet = SettlementSheet::build(records, config, Local::now().naive_local())?;
    sheet.save(&config.export_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{PurchaseEntry, RecordEntry, ShipmentEntry};
    use tempfile::tempdir;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn stamp() -> NaiveDateTime {
        day("2024-05-01").and_hms_opt(9, 30, 0).unwrap()
    }

    fn purchase(id: i64, date: &str, name: &str, gross: f64, price: f64) -> PurchaseRecord {
        let mut record = PurchaseEntry {
            date: day(date),
            grower_name: name.to_string(),
            spec: "A".to_string(),
            gross_weight: gross,
            secondary_fruit: 0.0,
            tare_weight: 0.0,
            unit_price: price,
            notes: String::new(),
        }
        .settle()
        .unwrap();
        record.set_id(id);
        record
    }

    #[test]
    fn test_build_orders_rows_and_totals() {
        let records = vec![
            purchase(3, "2024-01-05", "张三", 10.0, 1.5),
            purchase(1, "2024-01-02", "张三", 100.0, 2.5),
            purchase(2, "2024-01-02", "张三", 33.3, 3.0),
        ];

        let sheet = SettlementSheet::build(&records, &AppConfig::default(), stamp()).unwrap();

        assert_eq!(sheet.entity, "张三");
        assert_eq!(sheet.title, "种植户结算单");
        assert_eq!(sheet.period, "2024-01-02 至 2024-01-05");
        assert_eq!(sheet.columns.len(), 9);
        let dates_and_amounts: Vec<(&str, &str)> = sheet
            .rows
            .iter()
            .map(|r| (r[0].as_str(), r[7].as_str()))
            .collect();
        assert_eq!(
            dates_and_amounts,
            vec![("2024-01-02", "250.00"), ("2024-01-02", "99.90"), ("2024-01-05", "15.00")]
        );
        assert_eq!(sheet.total_amount, 364.9);
        assert_eq!(sheet.total_in_words, "叁佰陆拾肆元玖角");
    }

    #[test]
    fn test_single_day_period() {
        let records = vec![purchase(1, "2024-02-01", "李四", 10.0, 1.0)];
        let sheet = SettlementSheet::build(&records, &AppConfig::default(), stamp()).unwrap();
        assert_eq!(sheet.period, "2024-02-01");
    }

    #[test]
    fn test_rejects_mixed_entities_and_empty_sets() {
        let mixed = vec![
            purchase(1, "2024-01-01", "张三", 10.0, 1.0),
            purchase(2, "2024-01-01", "李四", 10.0, 1.0),
        ];
        let err = SettlementSheet::build(&mixed, &AppConfig::default(), stamp()).unwrap_err();
        assert_eq!(err.field(), Some("name"));

        let empty: Vec<PurchaseRecord> = Vec::new();
        let err = SettlementSheet::build(&empty, &AppConfig::default(), stamp()).unwrap_err();
        assert_eq!(err.field(), Some("records"));
    }

    #[test]
    fn test_csv_layout() {
        let shipment = ShipmentEntry {
            date: day("2024-03-01"),
            client_name: "客户甲".to_string(),
            spec: "大果".to_string(),
            pieces: 10,
            weight: 25.0,
            unit_price: 1.2,
            notes: "冷库".to_string(),
        }
        .settle()
        .unwrap();
        let config = AppConfig {
            company_name: "绿源果业".to_string(),
            phone_number: "138-0000-0000".to_string(),
            ..AppConfig::default()
        };
        let sheet = SettlementSheet::build(&[shipment], &config, stamp()).unwrap();

        let mut buf = Vec::new();
        sheet.write_csv(&mut buf).unwrap();

        assert!(buf.starts_with(UTF8_BOM));
        let text = String::from_utf8(buf[UTF8_BOM.len()..].to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "绿源果业,,,,,,");
        assert_eq!(lines[1], "客户结算单,,,,,,");
        assert_eq!(lines[3], "结算对象: 客户甲,,结算周期: 2024-03-01,,,,");
        assert_eq!(lines[5], "日期,规格,件数,重量(斤),单价,金额,备注");
        assert_eq!(lines[6], "2024-03-01,大果,10,25.00,1.20,300.00,冷库");
        assert_eq!(lines[8], "总计 (TOTAL),,,,,300.00,");
        assert_eq!(lines[9], "金额大写: 叁佰元整,,,,,,");
        assert!(lines[12].contains("138-0000-0000"));
        assert!(lines[12].contains("2024-05-01 09:30:00"));
    }

    #[test]
    fn test_save_sanitizes_file_name() {
        let dir = tempdir().unwrap();
        let records = vec![purchase(1, "2024-01-01", "王/五*", 10.0, 1.0)];
        let sheet = SettlementSheet::build(&records, &AppConfig::default(), stamp()).unwrap();

        let path = sheet.save(&dir.path().join("结算单")).unwrap();

        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "王五_种植户结算单_20240501-093000.csv"
        );
        assert!(fs::read(&path).unwrap().starts_with(UTF8_BOM));
    }
}

// 🗄️ Record Store - SQLite (WAL) backing for purchases and shipments
// Free functions over a Connection; callers own the handle and pass it in.

use crate::error::{LedgerError, Result};
use crate::records::{DuplicateKey, LedgerRecord, PurchaseRecord, RecordKind, ShipmentRecord};
use crate::settlement::DuplicateLookup;
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, DatabaseName, Row};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Selector value meaning "every entity" in summaries
pub const ALL_ENTITIES: &str = "全部";

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grower_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            date TEXT NOT NULL,
            grower_name TEXT NOT NULL,
            spec TEXT NOT NULL,
            gross_weight REAL NOT NULL,
            secondary_fruit REAL NOT NULL DEFAULT 0,
            tare_weight REAL NOT NULL DEFAULT 0,
            net_weight REAL NOT NULL,
            unit_price REAL NOT NULL,
            total_amount REAL NOT NULL,
            notes TEXT NOT NULL DEFAULT '',
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS client_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            date TEXT NOT NULL,
            client_name TEXT NOT NULL,
            spec TEXT NOT NULL,
            pieces INTEGER NOT NULL,
            weight REAL NOT NULL,
            unit_price REAL NOT NULL,
            total_amount REAL NOT NULL,
            notes TEXT NOT NULL DEFAULT '',
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'user',
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes (duplicate key lookups + date-ordered paging)
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grower_key ON grower_records(date, grower_name, spec)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_client_key ON client_records(date, client_name, spec)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// ROW MAPPING
// ============================================================================

/// Column layout of a record table
pub trait SqlRecord: LedgerRecord {
    /// Every column except `id`, in insert order
    const COLUMNS: &'static [&'static str];

    fn to_values(&self) -> Vec<Value>;
    fn from_row(row: &Row) -> rusqlite::Result<Self>;
}

fn date_value(date: NaiveDate) -> Value {
    Value::Text(date.format("%Y-%m-%d").to_string())
}

impl SqlRecord for PurchaseRecord {
    const COLUMNS: &'static [&'static str] = &[
        "date",
        "grower_name",
        "spec",
        "gross_weight",
        "secondary_fruit",
        "tare_weight",
        "net_weight",
        "unit_price",
        "total_amount",
        "notes",
    ];

    fn to_values(&self) -> Vec<Value> {
        vec![
            date_value(self.date),
            Value::Text(self.grower_name.clone()),
            Value::Text(self.spec.clone()),
            Value::Real(self.gross_weight),
            Value::Real(self.secondary_fruit),
            Value::Real(self.tare_weight),
            Value::Real(self.net_weight),
            Value::Real(self.unit_price),
            Value::Real(self.total_amount),
            Value::Text(self.notes.clone()),
        ]
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(PurchaseRecord {
            id: Some(row.get("id")?),
            date: row.get("date")?,
            grower_name: row.get("grower_name")?,
            spec: row.get("spec")?,
            gross_weight: row.get("gross_weight")?,
            secondary_fruit: row.get("secondary_fruit")?,
            tare_weight: row.get("tare_weight")?,
            net_weight: row.get("net_weight")?,
            unit_price: row.get("unit_price")?,
            total_amount: row.get("total_amount")?,
            notes: row.get("notes")?,
        })
    }
}

impl SqlRecord for ShipmentRecord {
    const COLUMNS: &'static [&'static str] = &[
        "date",
        "client_name",
        "spec",
        "pieces",
        "weight",
        "unit_price",
        "total_amount",
        "notes",
    ];

    fn to_values(&self) -> Vec<Value> {
        vec![
            date_value(self.date),
            Value::Text(self.client_name.clone()),
            Value::Text(self.spec.clone()),
            Value::Integer(self.pieces),
            Value::Real(self.weight),
            Value::Real(self.unit_price),
            Value::Real(self.total_amount),
            Value::Text(self.notes.clone()),
        ]
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(ShipmentRecord {
            id: Some(row.get("id")?),
            date: row.get("date")?,
            client_name: row.get("client_name")?,
            spec: row.get("spec")?,
            pieces: row.get("pieces")?,
            weight: row.get("weight")?,
            unit_price: row.get("unit_price")?,
            total_amount: row.get("total_amount")?,
            notes: row.get("notes")?,
        })
    }
}

fn insert_sql<R: SqlRecord>() -> String {
    let placeholders: Vec<String> = (1..=R::COLUMNS.len()).map(|i| format!("?{}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        R::KIND.table(),
        R::COLUMNS.join(", "),
        placeholders.join(", ")
    )
}

// ============================================================================
// SEARCH
// ============================================================================

/// Name and inclusive date-range filter.
///
/// `name` is a substring match unless `exact_name` is set; settlements use
/// the exact form so "张三" does not pull in "张三丰".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub name: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub exact_name: bool,
}

/// Escape LIKE wildcards so user input matches literally (`ESCAPE '\'`)
fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl RecordQuery {
    /// Every record of exactly one entity, optionally within a date range
    pub fn for_entity(name: &str, start_date: Option<NaiveDate>, end_date: Option<NaiveDate>) -> Self {
        RecordQuery {
            name: Some(name.trim().to_string()),
            start_date,
            end_date,
            exact_name: true,
        }
    }

    /// Same dates, but the name (if any) matched exactly
    pub fn exact(&self) -> Self {
        RecordQuery {
            exact_name: true,
            ..self.clone()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.start_date.is_none() && self.end_date.is_none()
    }

    fn where_clause(&self, kind: RecordKind) -> (String, Vec<Value>) {
        let mut conditions = Vec::new();
        let mut values = Vec::new();

        if let Some(name) = self.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            if self.exact_name {
                values.push(Value::Text(name.to_string()));
                conditions.push(format!("{} = ?{}", kind.name_column(), values.len()));
            } else {
                values.push(Value::Text(format!("%{}%", escape_like(name))));
                conditions.push(format!("{} LIKE ?{} ESCAPE '\\'", kind.name_column(), values.len()));
            }
        }
        if let Some(start) = self.start_date {
            values.push(date_value(start));
            conditions.push(format!("date >= ?{}", values.len()));
        }
        if let Some(end) = self.end_date {
            values.push(date_value(end));
            conditions.push(format!("date <= ?{}", values.len()));
        }

        if conditions.is_empty() {
            (String::new(), values)
        } else {
            (format!(" WHERE {}", conditions.join(" AND ")), values)
        }
    }
}

/// Number of pages for `total` records; an empty result still has one page
pub fn total_pages(total: i64, page_size: u32) -> u32 {
    if total <= 0 || page_size == 0 {
        return 1;
    }
    ((total as u64 + page_size as u64 - 1) / page_size as u64) as u32
}

fn select_records<R: SqlRecord>(conn: &Connection, sql: &str, values: Vec<Value>) -> Result<Vec<R>> {
    let mut stmt = conn.prepare(sql)?;
    let records = stmt
        .query_map(params_from_iter(values), |row| R::from_row(row))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

/// One page (1-based) ordered by date desc, id desc
pub fn fetch_paged_records<R: SqlRecord>(
    conn: &Connection,
    query: &RecordQuery,
    page: u32,
    page_size: u32,
) -> Result<Vec<R>> {
    let (where_sql, mut values) = query.where_clause(R::KIND);
    let offset = page.saturating_sub(1) as i64 * page_size as i64;
    values.push(Value::Integer(page_size as i64));
    values.push(Value::Integer(offset));

    let sql = format!(
        "SELECT * FROM {}{} ORDER BY date DESC, id DESC LIMIT ?{} OFFSET ?{}",
        R::KIND.table(),
        where_sql,
        values.len() - 1,
        values.len()
    );
    select_records(conn, &sql, values)
}

/// Every record matching the query, same ordering as paging
pub fn fetch_matching_records<R: SqlRecord>(conn: &Connection, query: &RecordQuery) -> Result<Vec<R>> {
    let (where_sql, values) = query.where_clause(R::KIND);
    let sql = format!(
        "SELECT * FROM {}{} ORDER BY date DESC, id DESC",
        R::KIND.table(),
        where_sql
    );
    select_records(conn, &sql, values)
}

pub fn count_records(conn: &Connection, kind: RecordKind, query: &RecordQuery) -> Result<i64> {
    let (where_sql, values) = query.where_clause(kind);
    let sql = format!("SELECT COUNT(*) FROM {}{}", kind.table(), where_sql);
    let count = conn.query_row(&sql, params_from_iter(values), |row| row.get(0))?;
    Ok(count)
}

pub fn get_record<R: SqlRecord>(conn: &Connection, id: i64) -> Result<Option<R>> {
    let sql = format!("SELECT * FROM {} WHERE id = ?1", R::KIND.table());
    let mut records = select_records(conn, &sql, vec![Value::Integer(id)])?;
    Ok(records.pop())
}

pub fn get_records_by_ids<R: SqlRecord>(conn: &Connection, ids: &[i64]) -> Result<Vec<R>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "SELECT * FROM {} WHERE id IN ({}) ORDER BY date, id",
        R::KIND.table(),
        placeholders.join(", ")
    );
    select_records(conn, &sql, ids.iter().map(|id| Value::Integer(*id)).collect())
}

// ============================================================================
// DUPLICATE LOOKUP
// ============================================================================

pub fn record_exists(conn: &Connection, kind: RecordKind, key: &DuplicateKey) -> Result<bool> {
    let sql = format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE date = ?1 AND {} = ?2 AND spec = ?3)",
        kind.table(),
        kind.name_column()
    );
    let exists: bool = conn.query_row(
        &sql,
        params![date_value(key.date), key.name, key.spec],
        |row| row.get(0),
    )?;
    Ok(exists)
}

impl DuplicateLookup for Connection {
    fn contains_key(&self, kind: RecordKind, key: &DuplicateKey) -> Result<bool> {
        record_exists(self, kind, key).map_err(|e| LedgerError::Lookup(e.to_string()))
    }
}

// ============================================================================
// WRITES
// ============================================================================

fn persistence(e: rusqlite::Error) -> LedgerError {
    LedgerError::Persistence(e.to_string())
}

/// Insert one record, returning its new id
pub fn insert_record<R: SqlRecord>(conn: &Connection, record: &R) -> Result<i64> {
    conn.execute(&insert_sql::<R>(), params_from_iter(record.to_values()))
        .map_err(persistence)?;
    let id = conn.last_insert_rowid();
    debug!(kind = %R::KIND, id, "record inserted");
    Ok(id)
}

/// Insert a batch in one transaction: either every record lands or none does
pub fn bulk_insert_records<R: SqlRecord>(conn: &Connection, records: &[R]) -> Result<usize> {
    if records.is_empty() {
        return Ok(0);
    }

    let tx = conn.unchecked_transaction().map_err(persistence)?;
    {
        let mut stmt = tx.prepare(&insert_sql::<R>()).map_err(persistence)?;
        for record in records {
            stmt.execute(params_from_iter(record.to_values()))
                .map_err(persistence)?;
        }
    }
    tx.commit().map_err(persistence)?;

    info!(kind = %R::KIND, count = records.len(), "bulk insert committed");
    Ok(records.len())
}

/// Overwrite every column of record `id` (last write wins)
pub fn update_record<R: SqlRecord>(conn: &Connection, id: i64, record: &R) -> Result<()> {
    let assignments: Vec<String> = R::COLUMNS
        .iter()
        .enumerate()
        .map(|(i, column)| format!("{} = ?{}", column, i + 1))
        .collect();
    let mut values = record.to_values();
    values.push(Value::Integer(id));

    let sql = format!(
        "UPDATE {} SET {} WHERE id = ?{}",
        R::KIND.table(),
        assignments.join(", "),
        values.len()
    );
    let changed = conn
        .execute(&sql, params_from_iter(values))
        .map_err(persistence)?;

    if changed == 0 {
        return Err(LedgerError::NotFound {
            table: R::KIND.table(),
            id,
        });
    }
    debug!(kind = %R::KIND, id, "record updated");
    Ok(())
}

pub fn delete_record(conn: &Connection, kind: RecordKind, id: i64) -> Result<()> {
    let sql = format!("DELETE FROM {} WHERE id = ?1", kind.table());
    let changed = conn.execute(&sql, params![id]).map_err(persistence)?;

    if changed == 0 {
        return Err(LedgerError::NotFound {
            table: kind.table(),
            id,
        });
    }
    info!(kind = %kind, id, "record deleted");
    Ok(())
}

// ============================================================================
// DISTINCT VALUES & SUMMARIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistinctColumn {
    Name,
    Spec,
}

impl DistinctColumn {
    fn column(&self, kind: RecordKind) -> &'static str {
        match self {
            DistinctColumn::Name => kind.name_column(),
            DistinctColumn::Spec => "spec",
        }
    }
}

/// Sorted non-empty values of a column, for autocomplete
pub fn fetch_distinct_values(
    conn: &Connection,
    kind: RecordKind,
    column: DistinctColumn,
) -> Result<Vec<String>> {
    let col = column.column(kind);
    let sql = format!(
        "SELECT DISTINCT {col} FROM {} WHERE {col} <> '' ORDER BY {col}",
        kind.table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let values = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(values)
}

/// Per-day totals for the summary view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub total_amount: f64,
    pub total_weight: f64,
    pub record_count: i64,
}

/// Totals grouped by date within [start, end]; `name` of None or 全部 covers
/// every entity, anything else must match exactly
pub fn get_daily_summary(
    conn: &Connection,
    kind: RecordKind,
    start: NaiveDate,
    end: NaiveDate,
    name: Option<&str>,
) -> Result<Vec<DailySummary>> {
    let mut values = vec![date_value(start), date_value(end)];
    let mut name_filter = String::new();
    if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty() && *n != ALL_ENTITIES) {
        values.push(Value::Text(name.to_string()));
        name_filter = format!(" AND {} = ?3", kind.name_column());
    }

    let sql = format!(
        "SELECT date, SUM(total_amount), SUM({}), COUNT(*)
         FROM {}
         WHERE date >= ?1 AND date <= ?2{}
         GROUP BY date
         ORDER BY date",
        kind.weight_column(),
        kind.table(),
        name_filter
    );

    let mut stmt = conn.prepare(&sql)?;
    let summary = stmt
        .query_map(params_from_iter(values), |row| {
            Ok(DailySummary {
                date: row.get(0)?,
                total_amount: row.get(1)?,
                total_weight: row.get(2)?,
                record_count: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(summary)
}

// ============================================================================
// BACKUP
// ============================================================================

/// Copy the live database into `backup_dir` as `{stem}_backup_{timestamp}.db`.
///
/// Uses SQLite's online backup, so the copy is consistent even while other
/// connections keep writing.
pub fn backup_database(
    conn: &Connection,
    db_path: &Path,
    backup_dir: &Path,
    at: NaiveDateTime,
) -> Result<PathBuf> {
    fs::create_dir_all(backup_dir)?;

    let stem = db_path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("ledger");
    let timestamp = at.format("%Y%m%d_%H%M%S");
    let mut target = backup_dir.join(format!("{}_backup_{}.db", stem, timestamp));
    let mut attempt = 1;
    while target.exists() {
        target = backup_dir.join(format!("{}_backup_{}_{}.db", stem, timestamp, attempt));
        attempt += 1;
    }

    conn.backup(DatabaseName::Main, &target, None)?;
    info!(path = %target.display(), "database backed up");
    Ok(target)
}

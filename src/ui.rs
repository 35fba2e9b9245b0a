// 🖥️ Terminal UI - purchases, shipments, the daily summary and admin
// Import, export and backup run on background task slots that the event loop
// polls every tick, so the screen keeps redrawing while they work.
// Nothing is shown until someone signs in.

use crate::config::{AppConfig, ConfigUpdate};
use crate::db::{
    backup_database, bulk_insert_records, count_records, delete_record, fetch_matching_records,
    fetch_paged_records, get_daily_summary, insert_record, total_pages, update_record,
    DailySummary, RecordQuery, ALL_ENTITIES,
};
use crate::error::{LedgerError, ValidationError};
use crate::exporter::export_settlement;
use crate::importer::{import_file, parse_sheet_date, record_from_cells, ImportOutcome};
use crate::records::{PurchaseRecord, RecordKind, ShipmentRecord};
use crate::users::{
    add_user, authenticate, count_users, create_first_admin, delete_user, list_users, require_admin, Role,
    User,
};
use crate::worker::{TaskOutcome, TaskSlot};
use crate::ManagedRecord;
use anyhow::Result;
use chrono::{Local, NaiveDate};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use rusqlite::Connection;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info};

const TICK: Duration = Duration::from_millis(100);
const STATUS_TTL: Duration = Duration::from_secs(6);
const SUMMARY_DAYS: i64 = 30;
const SEARCH_LABELS: [&str; 3] = ["姓名", "开始日期", "结束日期"];
const CONFIG_LABELS: [&str; 4] = ["公司名称", "联系电话", "页脚文字", "导出目录"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Purchases,
    Shipments,
    Summary,
    /// Admins only
    Admin,
}

impl Page {
    pub fn next(&self) -> Self {
        match self {
            Page::Purchases => Page::Shipments,
            Page::Shipments => Page::Summary,
            Page::Summary => Page::Admin,
            Page::Admin => Page::Purchases,
        }
    }

    pub fn previous(&self) -> Self {
        match self {
            Page::Purchases => Page::Admin,
            Page::Shipments => Page::Purchases,
            Page::Summary => Page::Shipments,
            Page::Admin => Page::Summary,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Page::Purchases => "种植户收购",
            Page::Shipments => "客户出货",
            Page::Summary => "每日汇总",
            Page::Admin => "系统管理",
        }
    }

    pub fn kind(&self) -> Option<RecordKind> {
        match self {
            Page::Purchases => Some(RecordKind::Purchase),
            Page::Shipments => Some(RecordKind::Shipment),
            Page::Summary | Page::Admin => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub text: String,
    pub is_error: bool,
    shown_at: Instant,
}

// ============================================================================
// FORMS & MODES
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum FormPurpose {
    Entry { kind: RecordKind, id: Option<i64> },
    Search(Page),
    ImportPath(RecordKind),
    Login,
    /// First run: no accounts exist yet
    SetupAdmin,
    EditConfig,
    AddUser,
}

impl FormPurpose {
    /// Sign-in forms cannot be dismissed; Esc quits instead
    fn is_sign_in(&self) -> bool {
        matches!(self, FormPurpose::Login | FormPurpose::SetupAdmin)
    }
}

#[derive(Debug, Clone)]
pub struct InputForm {
    pub purpose: FormPurpose,
    pub title: String,
    pub labels: Vec<&'static str>,
    pub values: Vec<String>,
    pub focus: usize,
    pub error: Option<String>,
    /// Indices of password fields, drawn as asterisks
    masked: Vec<usize>,
}

impl InputForm {
    fn new(purpose: FormPurpose, title: String, labels: &[&'static str], mut values: Vec<String>) -> Self {
        values.resize(labels.len(), String::new());
        InputForm {
            purpose,
            title,
            labels: labels.to_vec(),
            values,
            focus: 0,
            error: None,
            masked: Vec::new(),
        }
    }

    fn with_masked(mut self, fields: &[usize]) -> Self {
        self.masked = fields.to_vec();
        self
    }

    fn display_value(&self, index: usize) -> String {
        let value = &self.values[index];
        if self.masked.contains(&index) {
            "*".repeat(value.chars().count())
        } else {
            value.clone()
        }
    }

    fn next_field(&mut self) {
        self.focus = (self.focus + 1) % self.labels.len();
    }

    fn previous_field(&mut self) {
        self.focus = (self.focus + self.labels.len() - 1) % self.labels.len();
    }
}

#[derive(Debug, Clone)]
pub enum Mode {
    Browse,
    Form(InputForm),
    ConfirmDelete { kind: RecordKind, id: i64 },
    ConfirmImport(RecordKind),
    ConfirmDeleteUser { id: i64, username: String },
}

enum KeyResult {
    Handled,
    OpenMode(Mode),
    Info(String),
}

fn optional_date(raw: &str) -> std::result::Result<Option<NaiveDate>, ValidationError> {
    let raw = raw.trim();
    if raw.is_empty() {
        Ok(None)
    } else {
        parse_sheet_date(raw).map(Some)
    }
}

fn search_query(values: &[String]) -> std::result::Result<RecordQuery, ValidationError> {
    let name = values[0].trim();
    let query = RecordQuery {
        name: (!name.is_empty()).then(|| name.to_string()),
        start_date: optional_date(&values[1])?,
        end_date: optional_date(&values[2])?,
        exact_name: false,
    };
    if let (Some(start), Some(end)) = (query.start_date, query.end_date) {
        if start > end {
            return Err(ValidationError::new("start_date", "开始日期晚于结束日期"));
        }
    }
    Ok(query)
}

// ============================================================================
// RECORD PANE
// ============================================================================

pub enum ImportStep<R> {
    Previewed(ImportOutcome<R>),
    Inserted(usize),
}

enum TaskNotice {
    Info(String),
    Error(String),
}

/// One page of records of a single kind plus its background jobs
pub struct RecordPane<R: ManagedRecord> {
    pub records: Vec<R>,
    pub state: TableState,
    pub page: u32,
    pub total_pages: u32,
    pub total_records: i64,
    pub query: RecordQuery,
    pub show_detail: bool,
    page_size: u32,
    import: TaskSlot<ImportStep<R>>,
    export: TaskSlot<PathBuf>,
    pending_import: Option<ImportOutcome<R>>,
}

impl<R: ManagedRecord> RecordPane<R> {
    fn new(page_size: u32) -> Self {
        RecordPane {
            records: Vec::new(),
            state: TableState::default(),
            page: 1,
            total_pages: 1,
            total_records: 0,
            query: RecordQuery::default(),
            show_detail: false,
            page_size,
            import: TaskSlot::new("import"),
            export: TaskSlot::new("export"),
            pending_import: None,
        }
    }

    pub fn refresh(&mut self, conn: &Connection) -> crate::Result<()> {
        self.total_records = count_records(conn, R::KIND, &self.query)?;
        self.total_pages = total_pages(self.total_records, self.page_size);
        self.page = self.page.clamp(1, self.total_pages);
        self.records = fetch_paged_records(conn, &self.query, self.page, self.page_size)?;

        let selected = match self.state.selected() {
            _ if self.records.is_empty() => None,
            Some(i) if i < self.records.len() => Some(i),
            Some(_) => Some(self.records.len() - 1),
            None => Some(0),
        };
        self.state.select(selected);
        Ok(())
    }

    pub fn selected(&self) -> Option<&R> {
        self.state.selected().and_then(|i| self.records.get(i))
    }

    fn next_row(&mut self) {
        let len = self.records.len();
        if len == 0 {
            return;
        }
        let i = match self.state.selected() {
            Some(i) if i + 1 < len => i + 1,
            _ => 0,
        };
        self.state.select(Some(i));
    }

    fn previous_row(&mut self) {
        let len = self.records.len();
        if len == 0 {
            return;
        }
        let i = match self.state.selected() {
            Some(0) | None => len - 1,
            Some(i) => i - 1,
        };
        self.state.select(Some(i));
    }

    fn go_to_page(&mut self, conn: &Connection, page: u32) -> crate::Result<()> {
        if page < 1 || page > self.total_pages || page == self.page {
            return Ok(());
        }
        self.page = page;
        self.state.select(Some(0));
        self.refresh(conn)
    }

    fn set_query(&mut self, conn: &Connection, query: RecordQuery) -> crate::Result<()> {
        self.query = query;
        self.page = 1;
        self.state.select(Some(0));
        self.refresh(conn)
    }

    pub fn is_busy(&self) -> bool {
        self.import.is_busy() || self.export.is_busy()
    }

    fn start_import(&mut self, path: PathBuf, db_path: PathBuf) -> crate::Result<()> {
        info!(kind = %R::KIND, path = %path.display(), "import requested");
        self.import.spawn(move || {
            let conn = Connection::open(&db_path)?;
            Ok(ImportStep::Previewed(import_file::<R, _>(&path, &conn)?))
        })
    }

    fn confirm_import(&mut self, db_path: PathBuf) -> crate::Result<()> {
        let Some(outcome) = self.pending_import.take() else {
            return Ok(());
        };
        let records = outcome.new_records;
        self.import.spawn(move || {
            let conn = Connection::open(&db_path)?;
            Ok(ImportStep::Inserted(bulk_insert_records(&conn, &records)?))
        })
    }

    fn start_export(&mut self, conn: &Connection, config: &AppConfig) -> crate::Result<()> {
        // The search name is a substring; a settlement is for that name only
        let records = fetch_matching_records::<R>(conn, &self.query.exact())?;
        let config = config.clone();
        self.export.spawn(move || export_settlement(&records, &config))
    }

    fn poll_tasks(&mut self, conn: &Connection) -> Vec<TaskNotice> {
        let mut notices = Vec::new();

        match self.import.poll() {
            Some(TaskOutcome::Completed(ImportStep::Previewed(outcome))) => {
                if outcome.new_records.is_empty() {
                    notices.push(TaskNotice::Info(outcome.summary()));
                } else {
                    self.pending_import = Some(outcome);
                }
            }
            Some(TaskOutcome::Completed(ImportStep::Inserted(count))) => {
                match self.refresh(conn) {
                    Ok(()) => notices.push(TaskNotice::Info(format!("成功导入 {} 条记录", count))),
                    Err(e) => notices.push(TaskNotice::Error(e.to_string())),
                }
            }
            Some(TaskOutcome::Failed(message)) => {
                notices.push(TaskNotice::Error(format!("导入失败: {}", message)));
            }
            None => {}
        }

        match self.export.poll() {
            Some(TaskOutcome::Completed(path)) => {
                notices.push(TaskNotice::Info(format!("结算单已保存: {}", path.display())));
            }
            Some(TaskOutcome::Failed(message)) => {
                notices.push(TaskNotice::Error(format!("导出失败: {}", message)));
            }
            None => {}
        }

        notices
    }

    fn entry_form(&self, editing: Option<&R>) -> InputForm {
        let (id, values, verb) = match editing {
            Some(record) => (record.id(), record.sheet_cells(), "修改"),
            None => (None, vec![Local::now().date_naive().to_string()], "新增"),
        };
        InputForm::new(
            FormPurpose::Entry { kind: R::KIND, id },
            format!(" {}{}记录 ", verb, R::KIND.label()),
            R::HEADERS,
            values,
        )
    }

    fn search_form(&self, page: Page) -> InputForm {
        let values = vec![
            self.query.name.clone().unwrap_or_default(),
            self.query.start_date.map(|d| d.to_string()).unwrap_or_default(),
            self.query.end_date.map(|d| d.to_string()).unwrap_or_default(),
        ];
        InputForm::new(FormPurpose::Search(page), " 查询 ".to_string(), &SEARCH_LABELS, values)
    }

    /// Store a form's values, returning the status line text
    fn save_entry(&mut self, conn: &Connection, id: Option<i64>, values: &[String]) -> crate::Result<String> {
        let record: R = record_from_cells(values)?;
        let message = match id {
            Some(id) => {
                update_record(conn, id, &record)?;
                format!("记录 {} 已保存", id)
            }
            None => {
                let id = insert_record(conn, &record)?;
                format!("新记录 {} 已保存, 金额 {:.2}", id, record.total_amount())
            }
        };
        self.refresh(conn)?;
        Ok(message)
    }
}

/// Browse-mode keys on a record page
fn pane_key<R: ManagedRecord>(
    pane: &mut RecordPane<R>,
    page: Page,
    conn: &Connection,
    config: &AppConfig,
    key: KeyEvent,
) -> crate::Result<KeyResult> {
    match key.code {
        KeyCode::Down | KeyCode::Char('j') => pane.next_row(),
        KeyCode::Up | KeyCode::Char('k') => pane.previous_row(),
        KeyCode::Home => pane.state.select((!pane.records.is_empty()).then_some(0)),
        KeyCode::End => pane.state.select(pane.records.len().checked_sub(1)),
        KeyCode::PageDown | KeyCode::Right | KeyCode::Char('n') => pane.go_to_page(conn, pane.page + 1)?,
        KeyCode::PageUp | KeyCode::Left | KeyCode::Char('p') => {
            pane.go_to_page(conn, pane.page.saturating_sub(1))?
        }
        KeyCode::Enter => pane.show_detail = !pane.show_detail,
        KeyCode::Char('r') => pane.refresh(conn)?,
        KeyCode::Char('/') => return Ok(KeyResult::OpenMode(Mode::Form(pane.search_form(page)))),
        KeyCode::Char('c') => {
            pane.set_query(conn, RecordQuery::default())?;
            return Ok(KeyResult::Info("已清除查询条件".to_string()));
        }
        KeyCode::Char('a') => return Ok(KeyResult::OpenMode(Mode::Form(pane.entry_form(None)))),
        KeyCode::Char('e') => {
            if let Some(record) = pane.selected() {
                return Ok(KeyResult::OpenMode(Mode::Form(pane.entry_form(Some(record)))));
            }
        }
        KeyCode::Char('d') => {
            if let Some(id) = pane.selected().and_then(|r| r.id()) {
                return Ok(KeyResult::OpenMode(Mode::ConfirmDelete { kind: R::KIND, id }));
            }
        }
        KeyCode::Char('i') => {
            let form = InputForm::new(
                FormPurpose::ImportPath(R::KIND),
                format!(" 导入{}数据 (CSV) ", R::KIND.label()),
                &["文件路径"],
                Vec::new(),
            );
            return Ok(KeyResult::OpenMode(Mode::Form(form)));
        }
        KeyCode::Char('x') => {
            pane.start_export(conn, config)?;
            return Ok(KeyResult::Info("正在生成结算单...".to_string()));
        }
        _ => {}
    }
    Ok(KeyResult::Handled)
}

// ============================================================================
// SUMMARY VIEW
// ============================================================================

pub struct SummaryView {
    pub kind: RecordKind,
    pub name: Option<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub rows: Vec<DailySummary>,
    pub state: TableState,
}

impl SummaryView {
    fn new(today: NaiveDate) -> Self {
        SummaryView {
            kind: RecordKind::Purchase,
            name: None,
            start: today - chrono::Duration::days(SUMMARY_DAYS),
            end: today,
            rows: Vec::new(),
            state: TableState::default(),
        }
    }

    pub fn refresh(&mut self, conn: &Connection) -> crate::Result<()> {
        self.rows = get_daily_summary(conn, self.kind, self.start, self.end, self.name.as_deref())?;
        self.state.select((!self.rows.is_empty()).then_some(0));
        Ok(())
    }

    fn toggle_kind(&mut self) {
        self.kind = match self.kind {
            RecordKind::Purchase => RecordKind::Shipment,
            RecordKind::Shipment => RecordKind::Purchase,
        };
    }

    /// (amount, weight, record count) over the shown days
    pub fn totals(&self) -> (f64, f64, i64) {
        self.rows.iter().fold((0.0, 0.0, 0), |(amount, weight, count), row| {
            (amount + row.total_amount, weight + row.total_weight, count + row.record_count)
        })
    }

    fn search_form(&self) -> InputForm {
        let values = vec![
            self.name.clone().unwrap_or_else(|| ALL_ENTITIES.to_string()),
            self.start.to_string(),
            self.end.to_string(),
        ];
        InputForm::new(
            FormPurpose::Search(Page::Summary),
            " 汇总范围 ".to_string(),
            &SEARCH_LABELS,
            values,
        )
    }

    fn apply_search(&mut self, conn: &Connection, values: &[String]) -> crate::Result<()> {
        let query = search_query(values)?;
        let today = Local::now().date_naive();
        self.end = query.end_date.unwrap_or(today);
        self.start = query
            .start_date
            .unwrap_or(self.end - chrono::Duration::days(SUMMARY_DAYS));
        if self.start > self.end {
            return Err(ValidationError::new("start_date", "开始日期晚于结束日期").into());
        }
        self.name = query.name.filter(|n| n != ALL_ENTITIES);
        self.refresh(conn)
    }
}

// ============================================================================
// ADMIN VIEW
// ============================================================================

pub struct AdminView {
    pub users: Vec<User>,
    pub state: TableState,
    backup: TaskSlot<PathBuf>,
}

impl AdminView {
    fn new() -> Self {
        AdminView {
            users: Vec::new(),
            state: TableState::default(),
            backup: TaskSlot::new("backup"),
        }
    }

    pub fn refresh(&mut self, conn: &Connection) -> crate::Result<()> {
        self.users = list_users(conn)?;
        let selected = match self.state.selected() {
            _ if self.users.is_empty() => None,
            Some(i) => Some(i.min(self.users.len() - 1)),
            None => Some(0),
        };
        self.state.select(selected);
        Ok(())
    }

    pub fn selected(&self) -> Option<&User> {
        self.state.selected().and_then(|i| self.users.get(i))
    }

    fn move_selection(&mut self, forward: bool) {
        let len = self.users.len();
        if len == 0 {
            return;
        }
        let i = match (self.state.selected(), forward) {
            (Some(i), true) => (i + 1) % len,
            (Some(i), false) => (i + len - 1) % len,
            (None, _) => 0,
        };
        self.state.select(Some(i));
    }

    fn start_backup(&mut self, db_path: PathBuf, backup_dir: PathBuf) -> crate::Result<()> {
        info!(dir = %backup_dir.display(), "backup requested");
        self.backup.spawn(move || {
            let conn = Connection::open(&db_path)?;
            backup_database(&conn, &db_path, &backup_dir, Local::now().naive_local())
        })
    }

    fn poll_tasks(&mut self) -> Vec<TaskNotice> {
        match self.backup.poll() {
            Some(TaskOutcome::Completed(path)) => {
                vec![TaskNotice::Info(format!("数据库已备份: {}", path.display()))]
            }
            Some(TaskOutcome::Failed(message)) => vec![TaskNotice::Error(format!("备份失败: {}", message))],
            None => Vec::new(),
        }
    }
}

fn config_form(config: &AppConfig) -> InputForm {
    let values = vec![
        config.company_name.clone(),
        config.phone_number.clone(),
        config.footer_text.clone(),
        config.export_dir.display().to_string(),
    ];
    InputForm::new(FormPurpose::EditConfig, " 修改配置 ".to_string(), &CONFIG_LABELS, values)
}

fn add_user_form() -> InputForm {
    InputForm::new(
        FormPurpose::AddUser,
        " 新增用户 (角色: admin / user) ".to_string(),
        &["用户名", "密码", "角色"],
        vec![String::new(), String::new(), Role::User.to_string()],
    )
    .with_masked(&[1])
}

// ============================================================================
// APP
// ============================================================================

pub struct App {
    conn: Connection,
    db_path: PathBuf,
    config: AppConfig,
    /// Where admin edits to the config are saved; None keeps them in memory
    config_path: Option<PathBuf>,
    pub user: Option<User>,
    pub current_page: Page,
    pub purchases: RecordPane<PurchaseRecord>,
    pub shipments: RecordPane<ShipmentRecord>,
    pub summary: SummaryView,
    pub admin: AdminView,
    pub mode: Mode,
    pub status: Option<StatusMessage>,
}

impl App {
    /// `db_path` must name the same file as `conn`; background jobs open
    /// their own connections to it. The app starts on the sign-in form.
    pub fn new(conn: Connection, db_path: PathBuf, config: AppConfig) -> crate::Result<Self> {
        let page_size = config.page_size;
        let mut app = App {
            conn,
            db_path,
            config,
            config_path: None,
            user: None,
            current_page: Page::Purchases,
            purchases: RecordPane::new(page_size),
            shipments: RecordPane::new(page_size),
            summary: SummaryView::new(Local::now().date_naive()),
            admin: AdminView::new(),
            mode: Mode::Browse,
            status: None,
        };
        app.purchases.refresh(&app.conn)?;
        app.shipments.refresh(&app.conn)?;
        app.summary.refresh(&app.conn)?;
        app.mode = Mode::Form(app.sign_in_form()?);
        Ok(app)
    }

    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    fn sign_in_form(&self) -> crate::Result<InputForm> {
        let form = if count_users(&self.conn)? == 0 {
            InputForm::new(
                FormPurpose::SetupAdmin,
                " 首次使用: 创建管理员 ".to_string(),
                &["用户名", "密码", "确认密码"],
                Vec::new(),
            )
            .with_masked(&[1, 2])
        } else {
            InputForm::new(FormPurpose::Login, " 登录 ".to_string(), &["用户名", "密码"], Vec::new())
                .with_masked(&[1])
        };
        Ok(form)
    }

    pub fn sign_in(&mut self, username: &str, password: &str) -> crate::Result<()> {
        let user = authenticate(&self.conn, username, password)?;
        self.start_session(user)
    }

    fn start_session(&mut self, user: User) -> crate::Result<()> {
        if user.is_admin() {
            self.admin.refresh(&self.conn)?;
        }
        self.user = Some(user);
        self.current_page = Page::Purchases;
        self.mode = Mode::Browse;
        Ok(())
    }

    pub fn sign_out(&mut self) -> crate::Result<()> {
        if let Some(user) = self.user.take() {
            info!(username = %user.username, "signed out");
        }
        self.current_page = Page::Purchases;
        self.mode = Mode::Form(self.sign_in_form()?);
        Ok(())
    }

    fn acting_user(&self) -> crate::Result<&User> {
        self.user
            .as_ref()
            .ok_or_else(|| LedgerError::Unauthorized("请先登录".to_string()))
    }

    fn is_admin(&self) -> bool {
        self.user.as_ref().is_some_and(User::is_admin)
    }

    pub fn set_status(&mut self, text: impl Into<String>, is_error: bool) {
        let text = text.into();
        if is_error {
            error!(status = %text, "ui error");
        }
        self.status = Some(StatusMessage {
            text,
            is_error,
            shown_at: Instant::now(),
        });
    }

    pub fn expire_status(&mut self) {
        if self
            .status
            .as_ref()
            .is_some_and(|s| s.shown_at.elapsed() >= STATUS_TTL)
        {
            self.status = None;
        }
    }

    fn report<T>(&mut self, result: crate::Result<T>) {
        if let Err(e) = result {
            self.set_status(e.to_string(), true);
        }
    }

    pub fn is_busy(&self) -> bool {
        self.purchases.is_busy() || self.shipments.is_busy() || self.admin.backup.is_busy()
    }

    /// Collect finished background jobs; called once per tick
    pub fn poll_tasks(&mut self) {
        let mut notices = self.purchases.poll_tasks(&self.conn);
        notices.extend(self.shipments.poll_tasks(&self.conn));
        notices.extend(self.admin.poll_tasks());
        for notice in notices {
            match notice {
                TaskNotice::Info(text) => self.set_status(text, false),
                TaskNotice::Error(text) => self.set_status(text, true),
            }
        }

        if matches!(self.mode, Mode::Browse) {
            if self.purchases.pending_import.is_some() {
                self.mode = Mode::ConfirmImport(RecordKind::Purchase);
            } else if self.shipments.pending_import.is_some() {
                self.mode = Mode::ConfirmImport(RecordKind::Shipment);
            }
        }
    }

    pub fn next_page(&mut self) {
        self.current_page = self.current_page.next();
        if self.current_page == Page::Admin && !self.is_admin() {
            self.current_page = self.current_page.next();
        }
    }

    pub fn previous_page(&mut self) {
        self.current_page = self.current_page.previous();
        if self.current_page == Page::Admin && !self.is_admin() {
            self.current_page = self.current_page.previous();
        }
    }

    /// Returns true when the user asked to quit
    pub fn handle_key(&mut self, key: KeyEvent) -> bool {
        match std::mem::replace(&mut self.mode, Mode::Browse) {
            Mode::Browse => return self.handle_browse_key(key),
            Mode::Form(form) => return self.handle_form_key(form, key),
            Mode::ConfirmDelete { kind, id } => self.handle_delete_key(kind, id, key),
            Mode::ConfirmImport(kind) => self.handle_import_key(kind, key),
            Mode::ConfirmDeleteUser { id, username } => self.handle_delete_user_key(id, &username, key),
        }
        false
    }

    fn handle_browse_key(&mut self, key: KeyEvent) -> bool {
        if self.user.is_none() {
            let result = self.sign_out();
            self.report(result);
            return false;
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return true,
            KeyCode::Char('o') => {
                let result = self.sign_out();
                self.report(result);
            }
            KeyCode::BackTab => self.previous_page(),
            KeyCode::Tab => {
                if key.modifiers.contains(KeyModifiers::SHIFT) {
                    self.previous_page();
                } else {
                    self.next_page();
                }
            }
            _ => match self.current_page {
                Page::Purchases => self.handle_record_key(RecordKind::Purchase, key),
                Page::Shipments => self.handle_record_key(RecordKind::Shipment, key),
                Page::Summary => self.handle_summary_key(key),
                Page::Admin => self.handle_admin_key(key),
            },
        }
        false
    }

    fn handle_admin_key(&mut self, key: KeyEvent) {
        if !self.is_admin() {
            self.current_page = Page::Purchases;
            return;
        }
        match key.code {
            KeyCode::Down | KeyCode::Char('j') => self.admin.move_selection(true),
            KeyCode::Up | KeyCode::Char('k') => self.admin.move_selection(false),
            KeyCode::Char('r') => {
                let result = self.admin.refresh(&self.conn);
                self.report(result);
            }
            KeyCode::Char('e') => self.mode = Mode::Form(config_form(&self.config)),
            KeyCode::Char('a') => self.mode = Mode::Form(add_user_form()),
            KeyCode::Char('d') => {
                if let Some(user) = self.admin.selected() {
                    self.mode = Mode::ConfirmDeleteUser {
                        id: user.id,
                        username: user.username.clone(),
                    };
                }
            }
            KeyCode::Char('b') => {
                let db_path = self.db_path.clone();
                let backup_dir = self.config.backup_dir.clone();
                match self.admin.start_backup(db_path, backup_dir) {
                    Ok(()) => self.set_status("正在备份数据库...", false),
                    Err(e) => self.set_status(e.to_string(), true),
                }
            }
            _ => {}
        }
    }

    fn handle_record_key(&mut self, kind: RecordKind, key: KeyEvent) {
        let page = self.current_page;
        let result = match kind {
            RecordKind::Purchase => pane_key(&mut self.purchases, page, &self.conn, &self.config, key),
            RecordKind::Shipment => pane_key(&mut self.shipments, page, &self.conn, &self.config, key),
        };
        match result {
            Ok(KeyResult::Handled) => {}
            Ok(KeyResult::OpenMode(mode)) => self.mode = mode,
            Ok(KeyResult::Info(text)) => self.set_status(text, false),
            Err(e) => self.set_status(e.to_string(), true),
        }
    }

    fn handle_summary_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Left | KeyCode::Right => {
                self.summary.toggle_kind();
                let result = self.summary.refresh(&self.conn);
                self.report(result);
            }
            KeyCode::Char('r') => {
                let result = self.summary.refresh(&self.conn);
                self.report(result);
            }
            KeyCode::Char('/') => self.mode = Mode::Form(self.summary.search_form()),
            KeyCode::Down | KeyCode::Char('j') => {
                let len = self.summary.rows.len();
                if len > 0 {
                    let i = self.summary.state.selected().map_or(0, |i| (i + 1) % len);
                    self.summary.state.select(Some(i));
                }
            }
            KeyCode::Up | KeyCode::Char('k') => {
                let len = self.summary.rows.len();
                if len > 0 {
                    let i = self.summary.state.selected().map_or(0, |i| (i + len - 1) % len);
                    self.summary.state.select(Some(i));
                }
            }
            _ => {}
        }
    }

    /// Returns true when Esc is pressed on a sign-in form
    fn handle_form_key(&mut self, mut form: InputForm, key: KeyEvent) -> bool {
        match key.code {
            KeyCode::Esc => return form.purpose.is_sign_in(),
            KeyCode::Tab | KeyCode::Down => form.next_field(),
            KeyCode::BackTab | KeyCode::Up => form.previous_field(),
            KeyCode::Backspace => {
                form.values[form.focus].pop();
            }
            KeyCode::Char(c) => form.values[form.focus].push(c),
            KeyCode::Enter => match self.submit_form(&form) {
                Ok(Some(text)) => {
                    self.set_status(text, false);
                    return false;
                }
                Ok(None) => return false,
                Err(e) => form.error = Some(e.to_string()),
            },
            _ => {}
        }
        self.mode = Mode::Form(form);
        false
    }

    /// Ok closes the form; Err keeps it open with the message
    fn submit_form(&mut self, form: &InputForm) -> crate::Result<Option<String>> {
        match &form.purpose {
            FormPurpose::Entry { kind, id } => {
                let message = match kind {
                    RecordKind::Purchase => self.purchases.save_entry(&self.conn, *id, &form.values)?,
                    RecordKind::Shipment => self.shipments.save_entry(&self.conn, *id, &form.values)?,
                };
                Ok(Some(message))
            }
            FormPurpose::Search(Page::Summary) => {
                self.summary.apply_search(&self.conn, &form.values)?;
                Ok(None)
            }
            FormPurpose::Search(page) => {
                let query = search_query(&form.values)?;
                match page.kind() {
                    Some(RecordKind::Purchase) => self.purchases.set_query(&self.conn, query)?,
                    Some(RecordKind::Shipment) => self.shipments.set_query(&self.conn, query)?,
                    None => {}
                }
                Ok(None)
            }
            FormPurpose::ImportPath(kind) => {
                let path = form.values[0].trim();
                if path.is_empty() {
                    return Err(ValidationError::new("path", "请输入文件路径").into());
                }
                let path = PathBuf::from(path);
                let db_path = self.db_path.clone();
                match kind {
                    RecordKind::Purchase => self.purchases.start_import(path, db_path)?,
                    RecordKind::Shipment => self.shipments.start_import(path, db_path)?,
                }
                Ok(Some("正在读取导入文件...".to_string()))
            }
            FormPurpose::Login => {
                self.sign_in(&form.values[0], &form.values[1])?;
                Ok(Some(format!("欢迎, {}", form.values[0].trim())))
            }
            FormPurpose::SetupAdmin => {
                if form.values[1] != form.values[2] {
                    return Err(ValidationError::new("password", "两次输入的密码不一致").into());
                }
                let user = create_first_admin(&self.conn, &form.values[0], &form.values[1])?;
                let message = format!("管理员 {} 已创建", user.username);
                self.start_session(user)?;
                Ok(Some(message))
            }
            FormPurpose::EditConfig => {
                require_admin(self.acting_user()?)?;
                let update = ConfigUpdate {
                    company_name: Some(form.values[0].clone()),
                    phone_number: Some(form.values[1].clone()),
                    footer_text: Some(form.values[2].clone()),
                    export_dir: Some(PathBuf::from(form.values[3].trim())),
                };
                let mut next = self.config.clone();
                next.apply(update)?;
                if let Some(path) = &self.config_path {
                    next.save(path)?;
                }
                self.config = next;
                info!("config updated from the terminal");
                Ok(Some("配置已保存".to_string()))
            }
            FormPurpose::AddUser => {
                require_admin(self.acting_user()?)?;
                let role = form.values[2].parse::<Role>()?;
                let user = add_user(&self.conn, &form.values[0], &form.values[1], role)?;
                self.admin.refresh(&self.conn)?;
                Ok(Some(format!("用户 {} 已添加 ({})", user.username, user.role.label())))
            }
        }
    }

    fn handle_delete_key(&mut self, kind: RecordKind, id: i64, key: KeyEvent) {
        if !matches!(key.code, KeyCode::Char('y') | KeyCode::Enter) {
            self.set_status("已取消删除", false);
            return;
        }
        let result = delete_record(&self.conn, kind, id).and_then(|()| match kind {
            RecordKind::Purchase => self.purchases.refresh(&self.conn),
            RecordKind::Shipment => self.shipments.refresh(&self.conn),
        });
        match result {
            Ok(()) => self.set_status(format!("记录 {} 已删除", id), false),
            Err(e) => self.set_status(e.to_string(), true),
        }
    }

    fn handle_delete_user_key(&mut self, id: i64, username: &str, key: KeyEvent) {
        if !matches!(key.code, KeyCode::Char('y') | KeyCode::Enter) {
            self.set_status("已取消删除", false);
            return;
        }
        let result = self
            .acting_user()
            .cloned()
            .and_then(|acting| delete_user(&self.conn, id, &acting))
            .and_then(|_| self.admin.refresh(&self.conn));
        match result {
            Ok(()) => self.set_status(format!("用户 {} 已删除", username), false),
            Err(e) => self.set_status(e.to_string(), true),
        }
    }

    fn handle_import_key(&mut self, kind: RecordKind, key: KeyEvent) {
        let db_path = self.db_path.clone();
        match key.code {
            KeyCode::Char('y') | KeyCode::Enter => {
                let result = match kind {
                    RecordKind::Purchase => self.purchases.confirm_import(db_path),
                    RecordKind::Shipment => self.shipments.confirm_import(db_path),
                };
                match result {
                    Ok(()) => self.set_status("正在写入导入记录...", false),
                    Err(e) => self.set_status(e.to_string(), true),
                }
            }
            KeyCode::Char('n') | KeyCode::Esc => {
                match kind {
                    RecordKind::Purchase => self.purchases.pending_import = None,
                    RecordKind::Shipment => self.shipments.pending_import = None,
                }
                self.set_status("已取消导入", false);
            }
            _ => self.mode = Mode::ConfirmImport(kind),
        }
    }

    fn import_preview(&self, kind: RecordKind) -> Option<String> {
        match kind {
            RecordKind::Purchase => self.purchases.pending_import.as_ref().map(|o| o.summary()),
            RecordKind::Shipment => self.shipments.pending_import.as_ref().map(|o| o.summary()),
        }
    }
}

// ============================================================================
// EVENT LOOP
// ============================================================================

pub fn run_ui(app: &mut App) -> Result<()> {
    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Run the app
    let res = run_app(&mut terminal, app);

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    res?;
    Ok(())
}

fn run_app<B: ratatui::backend::Backend>(terminal: &mut Terminal<B>, app: &mut App) -> io::Result<()> {
    loop {
        app.poll_tasks();
        app.expire_status();
        terminal.draw(|f| ui(f, app))?;

        if event::poll(TICK)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press && app.handle_key(key) {
                    return Ok(());
                }
            }
        }
    }
}

// ============================================================================
// RENDERING
// ============================================================================

fn ui(f: &mut Frame, app: &mut App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header with navigation
            Constraint::Min(0),    // Content area
            Constraint::Length(3), // Status bar
        ])
        .split(f.size());

    render_header(f, chunks[0], app);

    match app.current_page {
        _ if app.user.is_none() => {
            f.render_widget(Block::default().borders(Borders::ALL).title(" 请登录 "), chunks[1]);
        }
        Page::Purchases => render_pane(f, chunks[1], &mut app.purchases),
        Page::Shipments => render_pane(f, chunks[1], &mut app.shipments),
        Page::Summary => render_summary(f, chunks[1], &mut app.summary),
        Page::Admin => render_admin(f, chunks[1], &app.config, &mut app.admin),
    }

    render_status_bar(f, chunks[2], app);

    match &app.mode {
        Mode::Browse => {}
        Mode::Form(form) => render_form(f, form),
        Mode::ConfirmDelete { id, .. } => {
            render_confirm(f, " 删除确认 ", vec![format!("确定删除记录 {} 吗?", id)]);
        }
        Mode::ConfirmImport(kind) => {
            let summary = app.import_preview(*kind).unwrap_or_default();
            render_confirm(f, " 导入确认 ", vec![summary, "确认导入这些新记录吗?".to_string()]);
        }
        Mode::ConfirmDeleteUser { username, .. } => {
            render_confirm(f, " 删除用户 ", vec![format!("确定删除用户 {} 吗?", username)]);
        }
    }
}

fn render_header(f: &mut Frame, area: Rect, app: &App) {
    let Some(user) = &app.user else {
        let header = Paragraph::new(format!(" {} · 请登录", app.config.company_name))
            .block(Block::default().borders(Borders::ALL).border_style(Style::default().fg(Color::Cyan)));
        f.render_widget(header, area);
        return;
    };
    let mut pages = vec![Page::Purchases, Page::Shipments, Page::Summary];
    if user.is_admin() {
        pages.push(Page::Admin);
    }

    let mut tab_spans = vec![];
    for (i, page) in pages.iter().enumerate() {
        if i > 0 {
            tab_spans.push(Span::raw(" │ "));
        }

        let style = if *page == app.current_page {
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD | Modifier::UNDERLINED)
        } else {
            Style::default().fg(Color::DarkGray)
        };

        tab_spans.push(Span::styled(page.title().to_string(), style));
    }

    tab_spans.push(Span::raw("  |  "));
    tab_spans.push(Span::styled(
        format!("收购 {} 条", app.purchases.total_records),
        Style::default().fg(Color::Green),
    ));
    tab_spans.push(Span::raw("  "));
    tab_spans.push(Span::styled(
        format!("出货 {} 条", app.shipments.total_records),
        Style::default().fg(Color::Cyan),
    ));
    if app.is_busy() {
        tab_spans.push(Span::raw("  |  "));
        tab_spans.push(Span::styled("⏳ 后台任务进行中", Style::default().fg(Color::Magenta)));
    }
    tab_spans.push(Span::raw("  |  "));
    tab_spans.push(Span::styled(
        format!("👤 {} ({})", user.username, user.role.label()),
        Style::default().fg(Color::White),
    ));

    let header = Paragraph::new(vec![Line::from(tab_spans)])
        .block(Block::default().borders(Borders::ALL).border_style(Style::default().fg(Color::Cyan)));

    f.render_widget(header, area);
}

fn render_pane<R: ManagedRecord>(f: &mut Frame, area: Rect, pane: &mut RecordPane<R>) {
    if pane.show_detail {
        let content_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(65), Constraint::Percentage(35)])
            .split(area);

        render_table(f, content_chunks[0], pane);
        render_detail_panel(f, content_chunks[1], pane);
    } else {
        render_table(f, area, pane);
    }
}

fn render_table<R: ManagedRecord>(f: &mut Frame, area: Rect, pane: &mut RecordPane<R>) {
    // ID, date and name, then the settlement columns after the date
    let mut titles = vec!["ID", "日期", "姓名"];
    titles.extend(R::SETTLEMENT_COLUMNS.iter().skip(1));

    let header_cells = titles.iter().map(|h| {
        Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD))
    });
    let header = Row::new(header_cells)
        .style(Style::default().bg(Color::DarkGray))
        .height(1);

    let rows = pane.records.iter().map(|record| {
        let cells = record.cells();
        let mut row = vec![
            Cell::from(record.id().map(|id| id.to_string()).unwrap_or_default()),
            Cell::from(cells[0].clone()),
            Cell::from(truncate(record.name(), 10)),
        ];
        row.extend(cells.into_iter().skip(1).map(|c| Cell::from(truncate(&c, 14))));
        Row::new(row).height(1)
    });

    let mut widths = vec![Constraint::Length(6), Constraint::Length(11), Constraint::Length(12)];
    widths.extend((3..titles.len() - 1).map(|_| Constraint::Length(10)));
    widths.push(Constraint::Min(8));

    let title = format!(
        " 第 {}/{} 页 · 共 {} 条{} ",
        pane.page,
        pane.total_pages,
        pane.total_records,
        if pane.query.is_empty() { "" } else { " · 已筛选" }
    );

    let table = Table::new(rows, widths)
        .header(header)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::White))
                .title(title),
        )
        .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
        .highlight_symbol("→ ");

    f.render_stateful_widget(table, area, &mut pane.state);
}

fn render_detail_panel<R: ManagedRecord>(f: &mut Frame, area: Rect, pane: &RecordPane<R>) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow))
        .title(" 记录详情 ");

    let Some(record) = pane.selected() else {
        f.render_widget(Paragraph::new("未选择记录").block(block), area);
        return;
    };

    let label_style = Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD);
    let mut content = vec![
        Line::from(""),
        Line::from(vec![
            Span::styled(format!("  {}: ", R::KIND.label()), label_style),
            Span::raw(record.name().to_string()),
        ]),
    ];
    for (label, value) in R::SETTLEMENT_COLUMNS.iter().zip(record.cells()) {
        content.push(Line::from(vec![
            Span::styled(format!("  {}: ", label), label_style),
            Span::raw(value),
        ]));
    }
    content.push(Line::from(""));
    content.push(Line::from(Span::styled(
        "  Enter 关闭 · e 修改 · d 删除",
        Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
    )));

    f.render_widget(Paragraph::new(content).block(block), area);
}

fn render_summary(f: &mut Frame, area: Rect, summary: &mut SummaryView) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)])
        .split(area);

    let (amount, weight, count) = summary.totals();
    let scope = Line::from(vec![
        Span::styled(format!(" {} ", summary.kind.label()), Style::default().fg(Color::Yellow)),
        Span::raw(format!(
            "· {} · {} 至 {} · 合计 {} 条, {:.2} 斤, {:.2} 元",
            summary.name.as_deref().unwrap_or(ALL_ENTITIES),
            summary.start,
            summary.end,
            count,
            weight,
            amount
        )),
    ]);
    f.render_widget(
        Paragraph::new(vec![scope]).block(Block::default().borders(Borders::ALL).title(" 汇总范围 ")),
        chunks[0],
    );

    let header = Row::new(["日期", "笔数", "重量(斤)", "金额"].iter().map(|h| {
        Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD))
    }))
    .style(Style::default().bg(Color::DarkGray))
    .height(1);

    let rows = summary.rows.iter().map(|row| {
        Row::new(vec![
            Cell::from(row.date.to_string()),
            Cell::from(row.record_count.to_string()),
            Cell::from(format!("{:.2}", row.total_weight)),
            Cell::from(format!("{:.2}", row.total_amount)).style(Style::default().fg(Color::Green)),
        ])
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(12),
            Constraint::Length(8),
            Constraint::Length(14),
            Constraint::Length(16),
        ],
    )
    .header(header)
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::White))
            .title(" 每日汇总 "),
    )
    .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
    .highlight_symbol("→ ");

    f.render_stateful_widget(table, chunks[1], &mut summary.state);
}

fn render_admin(f: &mut Frame, area: Rect, config: &AppConfig, admin: &mut AdminView) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(8), Constraint::Min(0)])
        .split(area);

    let label_style = Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD);
    let settings = [
        ("公司名称", config.company_name.clone()),
        ("联系电话", config.phone_number.clone()),
        ("页脚文字", config.footer_text.clone()),
        ("导出目录", config.export_dir.display().to_string()),
        ("备份目录", config.backup_dir.display().to_string()),
        ("数据库", config.database_path.display().to_string()),
    ];
    let content: Vec<Line> = settings
        .into_iter()
        .map(|(label, value)| {
            Line::from(vec![Span::styled(format!(" {}: ", label), label_style), Span::raw(value)])
        })
        .collect();
    f.render_widget(
        Paragraph::new(content).block(Block::default().borders(Borders::ALL).title(" 系统配置 ")),
        chunks[0],
    );

    let header = Row::new(["ID", "用户名", "角色"].iter().map(|h| {
        Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD))
    }))
    .style(Style::default().bg(Color::DarkGray))
    .height(1);

    let rows = admin.users.iter().map(|user| {
        Row::new(vec![
            Cell::from(user.id.to_string()),
            Cell::from(user.username.clone()),
            Cell::from(user.role.label()),
        ])
    });

    let table = Table::new(rows, [Constraint::Length(6), Constraint::Length(20), Constraint::Min(8)])
        .header(header)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::White))
                .title(format!(" 用户 · 共 {} 个 ", admin.users.len())),
        )
        .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
        .highlight_symbol("→ ");

    f.render_stateful_widget(table, chunks[1], &mut admin.state);
}

fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let line = match &app.status {
        Some(status) => Line::from(Span::styled(
            format!(" {}", status.text),
            Style::default().fg(if status.is_error { Color::Red } else { Color::Green }),
        )),
        None => {
            let hints: &[(&str, &str)] = match (&app.mode, app.current_page) {
                (Mode::Form(form), _) if form.purpose.is_sign_in() => {
                    &[("Tab", "下一项"), ("Enter", "登录"), ("Esc", "退出")]
                }
                (Mode::Form(_), _) => &[("Tab", "下一项"), ("Enter", "确定"), ("Esc", "取消")],
                (Mode::ConfirmDelete { .. } | Mode::ConfirmImport(_) | Mode::ConfirmDeleteUser { .. }, _) => {
                    &[("y", "确认"), ("n", "取消")]
                }
                (Mode::Browse, Page::Summary) => &[
                    ("Tab", "页面"),
                    ("←/→", "收购/出货"),
                    ("/", "范围"),
                    ("r", "刷新"),
                    ("o", "注销"),
                    ("q", "退出"),
                ],
                (Mode::Browse, Page::Admin) => &[
                    ("Tab", "页面"),
                    ("e", "修改配置"),
                    ("a", "新增用户"),
                    ("d", "删除用户"),
                    ("b", "备份数据库"),
                    ("o", "注销"),
                    ("q", "退出"),
                ],
                (Mode::Browse, _) => &[
                    ("Tab", "页面"),
                    ("PgUp/PgDn", "翻页"),
                    ("/", "查询"),
                    ("a", "新增"),
                    ("e", "修改"),
                    ("d", "删除"),
                    ("i", "导入"),
                    ("x", "结算单"),
                    ("o", "注销"),
                    ("q", "退出"),
                ],
            };
            let mut spans = vec![Span::raw(" ")];
            for (i, (key, action)) in hints.iter().enumerate() {
                if i > 0 {
                    spans.push(Span::raw(" | "));
                }
                spans.push(Span::styled(*key, Style::default().fg(Color::Yellow)));
                spans.push(Span::raw(format!(" {}", action)));
            }
            Line::from(spans)
        }
    };

    let status_bar = Paragraph::new(vec![line]).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::White)),
    );

    f.render_widget(status_bar, area);
}

fn render_form(f: &mut Frame, form: &InputForm) {
    let height = form.labels.len() as u16 + if form.error.is_some() { 5 } else { 3 };
    let area = centered_rect(60, height, f.size());

    let mut content = Vec::new();
    for (i, label) in form.labels.iter().enumerate() {
        let focused = i == form.focus;
        let style = if focused {
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(Color::Cyan)
        };
        content.push(Line::from(vec![
            Span::styled(format!(" {:<8} ", label), style),
            Span::raw(form.display_value(i)),
            Span::raw(if focused { "▏" } else { "" }),
        ]));
    }
    if let Some(message) = &form.error {
        content.push(Line::from(""));
        content.push(Line::from(Span::styled(
            format!(" {}", message),
            Style::default().fg(Color::Red),
        )));
    }

    f.render_widget(Clear, area);
    f.render_widget(
        Paragraph::new(content).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Yellow))
                .title(form.title.clone()),
        ),
        area,
    );
}

fn render_confirm(f: &mut Frame, title: &str, lines: Vec<String>) {
    let area = centered_rect(50, lines.len() as u16 + 4, f.size());
    let mut content: Vec<Line> = lines.into_iter().map(|l| Line::from(format!(" {}", l))).collect();
    content.push(Line::from(""));
    content.push(Line::from(vec![
        Span::styled(" y", Style::default().fg(Color::Green)),
        Span::raw(" 确认  "),
        Span::styled("n", Style::default().fg(Color::Red)),
        Span::raw(" 取消"),
    ]));

    f.render_widget(Clear, area);
    f.render_widget(
        Paragraph::new(content).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Red))
                .title(title.to_string()),
        ),
        area,
    );
}

/// Rect of `percent_x` width and fixed `height`, centered in `area`
fn centered_rect(percent_x: u16, height: u16, area: Rect) -> Rect {
    let width = area.width * percent_x / 100;
    let height = height.min(area.height);
    Rect {
        x: area.x + (area.width - width) / 2,
        y: area.y + (area.height - height) / 2,
        width,
        height,
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}

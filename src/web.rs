// 🌐 Web API - JSON routes over the shared ledger database
// Every handler takes the connection lock for the duration of one
// operation; the desktop UI and this server may share the same file.

use crate::config::{AppConfig, ConfigUpdate};
use crate::db::{
    backup_database, bulk_insert_records, count_records, delete_record, fetch_distinct_values,
    fetch_matching_records, fetch_paged_records, get_daily_summary, get_record, insert_record,
    total_pages, update_record, DailySummary, DistinctColumn, RecordQuery,
};
use crate::error::{LedgerError, ValidationError};
use crate::exporter::SettlementSheet;
use crate::importer::{import_sheet, ImportOutcome};
use crate::records::{PurchaseRecord, RecordEntry, RecordKind, ShipmentRecord};
use crate::users::{
    add_user, authenticate, create_first_admin, delete_user, list_users, require_admin, Role, User,
};
use crate::ManagedRecord;
use axum::{
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Extension, Router,
};
use chrono::{Duration, Local, NaiveDate};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

/// Days covered by a summary request without a start date
pub const DEFAULT_SUMMARY_DAYS: i64 = 30;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    db: Arc<Mutex<Connection>>,
    config: Arc<RwLock<AppConfig>>,
    /// Where admin edits to the config are saved; None keeps them in memory
    config_path: Option<Arc<PathBuf>>,
    /// Bearer token -> signed-in user
    sessions: Arc<Mutex<HashMap<String, User>>>,
}

impl AppState {
    pub fn new(conn: Connection, config: AppConfig) -> Self {
        AppState {
            db: Arc::new(Mutex::new(conn)),
            config: Arc::new(RwLock::new(config)),
            config_path: None,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(Arc::new(path));
        self
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> crate::Result<T>) -> crate::Result<T> {
        // A panic mid-request leaves the connection itself usable
        let conn = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    }

    fn config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update_config(&self, update: ConfigUpdate) -> crate::Result<AppConfig> {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = config.clone();
        next.apply(update)?;
        if let Some(path) = &self.config_path {
            next.save(path)?;
        }
        *config = next.clone();
        Ok(next)
    }

    /// Start a session for `user`, returning its bearer token
    pub fn open_session(&self, user: User) -> String {
        let token = Uuid::new_v4().simple().to_string();
        info!(username = %user.username, "session opened");
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.clone(), user);
        token
    }

    fn session(&self, token: &str) -> Option<User> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()
    }

    fn close_session(&self, token: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .is_some()
    }

    fn close_sessions_of(&self, user_id: i64) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, user| user.id != user_id);
    }
}

/// API Response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    success: bool,
    data: T,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<String>,
}

/// LedgerError as an HTTP response
pub struct ApiError(LedgerError);

impl<E: Into<LedgerError>> From<E> for ApiError {
    fn from(e: E) -> Self {
        ApiError(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
            LedgerError::Import(_) => StatusCode::BAD_REQUEST,
            LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
            LedgerError::Busy(_) => StatusCode::CONFLICT,
            LedgerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            LedgerError::Forbidden(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }

        let body = ErrorBody {
            success: false,
            error: self.0.to_string(),
            field: self.0.field().map(str::to_string),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

// ============================================================================
// Query parameters
// ============================================================================

/// Blank strings count as absent, so HTML forms can submit empty fields
#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    page: Option<String>,
    name: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_date_param(field: &str, value: &Option<String>) -> Result<Option<NaiveDate>, ValidationError> {
    non_blank(value)
        .map(|raw| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map_err(|_| ValidationError::new(field, format!("expected YYYY-MM-DD, got {}", raw)))
        })
        .transpose()
}

impl SearchParams {
    fn query(&self) -> Result<RecordQuery, ValidationError> {
        let query = RecordQuery {
            name: non_blank(&self.name).map(str::to_string),
            start_date: parse_date_param("start_date", &self.start_date)?,
            end_date: parse_date_param("end_date", &self.end_date)?,
            exact_name: false,
        };
        if let (Some(start), Some(end)) = (query.start_date, query.end_date) {
            if start > end {
                return Err(ValidationError::new("start_date", "start date is after end date"));
            }
        }
        Ok(query)
    }

    fn page(&self) -> Result<u32, ValidationError> {
        match non_blank(&self.page) {
            None => Ok(1),
            Some(raw) => raw
                .parse::<u32>()
                .ok()
                .filter(|p| *p >= 1)
                .ok_or_else(|| ValidationError::new("page", format!("expected a page number, got {}", raw))),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RecordPage<R> {
    records: Vec<R>,
    page: u32,
    total_pages: u32,
    total_records: i64,
}

fn parse_kind(raw: &str) -> Result<RecordKind, ValidationError> {
    raw.parse::<RecordKind>()
        .map_err(|e| ValidationError::new("kind", e))
}

// ============================================================================
// Record handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    ApiResponse::ok("OK")
}

/// GET /api/{purchases,shipments} - One page of matching records
async fn list_records<R: ManagedRecord>(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<RecordPage<R>> {
    let query = params.query()?;
    let requested = params.page()?;
    let page_size = state.config().page_size;

    let page = state.with_conn(|conn| {
        let total_records = count_records(conn, R::KIND, &query)?;
        let total_pages = total_pages(total_records, page_size);
        let page = requested.min(total_pages);
        let records = fetch_paged_records::<R>(conn, &query, page, page_size)?;
        Ok(RecordPage {
            records,
            page,
            total_pages,
            total_records,
        })
    })?;
    Ok(ApiResponse::ok(page))
}

/// POST /api/{purchases,shipments} - Settle and store a new entry
async fn create_record<R: ManagedRecord>(
    State(state): State<AppState>,
    Json(entry): Json<R::Entry>,
) -> Result<(StatusCode, Json<ApiResponse<R>>), ApiError> {
    let mut record = entry.settle()?;
    let id = state.with_conn(|conn| insert_record(conn, &record))?;
    record.set_id(id);
    info!(kind = %R::KIND, id, "record created");
    Ok((StatusCode::CREATED, ApiResponse::ok(record)))
}

/// GET /api/{purchases,shipments}/:id
async fn get_one<R: ManagedRecord>(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<R> {
    let record = state
        .with_conn(|conn| get_record::<R>(conn, id))?
        .ok_or(LedgerError::NotFound {
            table: R::KIND.table(),
            id,
        })?;
    Ok(ApiResponse::ok(record))
}

/// PUT /api/{purchases,shipments}/:id - Replace the entry, derived fields recomputed
async fn update_one<R: ManagedRecord>(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(entry): Json<R::Entry>,
) -> ApiResult<R> {
    let mut record = entry.settle()?;
    state.with_conn(|conn| update_record(conn, id, &record))?;
    record.set_id(id);
    info!(kind = %R::KIND, id, "record updated");
    Ok(ApiResponse::ok(record))
}

/// DELETE /api/{purchases,shipments}/:id
async fn delete_one<R: ManagedRecord>(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<i64> {
    state.with_conn(|conn| delete_record(conn, R::KIND, id))?;
    info!(kind = %R::KIND, id, "record deleted");
    Ok(ApiResponse::ok(id))
}

// ============================================================================
// Lookup, summary, import and export handlers
// ============================================================================

/// GET /api/distinct/:kind/:column - Values for autocomplete
async fn distinct_values(
    State(state): State<AppState>,
    Path((kind, column)): Path<(String, String)>,
) -> ApiResult<Vec<String>> {
    let kind = parse_kind(&kind)?;
    let column = match column.as_str() {
        "name" => DistinctColumn::Name,
        "spec" => DistinctColumn::Spec,
        other => {
            return Err(ValidationError::new("column", format!("expected name or spec, got {}", other)).into())
        }
    };
    let values = state.with_conn(|conn| fetch_distinct_values(conn, kind, column))?;
    Ok(ApiResponse::ok(values))
}

/// GET /api/summary/:kind - Per-day totals
async fn daily_summary(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Vec<DailySummary>> {
    let kind = parse_kind(&kind)?;
    let query = params.query()?;
    let end = query.end_date.unwrap_or_else(|| Local::now().date_naive());
    let start = query
        .start_date
        .unwrap_or_else(|| end - Duration::days(DEFAULT_SUMMARY_DAYS));

    let rows = state.with_conn(|conn| get_daily_summary(conn, kind, start, end, query.name.as_deref()))?;
    Ok(ApiResponse::ok(rows))
}

#[derive(Debug, Default, Deserialize)]
pub struct ImportParams {
    #[serde(default)]
    confirm: bool,
}

#[derive(Debug, Serialize)]
pub struct ImportReport<R> {
    #[serde(flatten)]
    outcome: ImportOutcome<R>,
    inserted: usize,
    summary: String,
}

fn run_import<R: ManagedRecord>(conn: &Connection, body: &str, confirm: bool) -> crate::Result<ImportReport<R>> {
    let outcome = import_sheet::<R, _, _>(body.as_bytes(), conn)?;
    let inserted = if confirm {
        bulk_insert_records(conn, &outcome.new_records)?
    } else {
        0
    };
    let summary = outcome.summary();
    Ok(ImportReport {
        outcome,
        inserted,
        summary,
    })
}

/// POST /api/import/:kind - CSV body; `?confirm=true` stores the new rows
async fn import_records(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(params): Query<ImportParams>,
    body: String,
) -> Result<Response, ApiError> {
    let response = match parse_kind(&kind)? {
        RecordKind::Purchase => {
            let report = state.with_conn(|conn| run_import::<PurchaseRecord>(conn, &body, params.confirm))?;
            ApiResponse::ok(report).into_response()
        }
        RecordKind::Shipment => {
            let report = state.with_conn(|conn| run_import::<ShipmentRecord>(conn, &body, params.confirm))?;
            ApiResponse::ok(report).into_response()
        }
    };
    Ok(response)
}

fn render_settlement<R: ManagedRecord>(
    conn: &Connection,
    query: &RecordQuery,
    config: &AppConfig,
) -> crate::Result<(String, Vec<u8>)> {
    let records = fetch_matching_records::<R>(conn, query)?;
    let sheet = SettlementSheet::build(&records, config, Local::now().naive_local())?;
    let mut bytes = Vec::new();
    sheet.write_csv(&mut bytes)?;
    Ok((sheet.file_name(), bytes))
}

/// GET /api/settlement/:kind?name=... - Settlement sheet as a CSV download
async fn settlement_sheet(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(params): Query<SearchParams>,
) -> Result<Response, ApiError> {
    let kind = parse_kind(&kind)?;
    let query = params.query()?.exact();
    if query.name.is_none() {
        return Err(ValidationError::new("name", "a settlement needs one name").into());
    }

    let config = state.config();
    let (file_name, bytes) = state.with_conn(|conn| match kind {
        RecordKind::Purchase => render_settlement::<PurchaseRecord>(conn, &query, &config),
        RecordKind::Shipment => render_settlement::<ShipmentRecord>(conn, &query, &config),
    })?;

    let disposition = format!(
        "attachment; filename*=UTF-8''{}",
        urlencoding::encode(&file_name)
    );
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

// ============================================================================
// Sessions
// ============================================================================

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Rejects requests without a live session and hands the user to handlers
async fn require_session(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user = bearer_token(req.headers())
        .and_then(|token| state.session(token))
        .ok_or_else(|| LedgerError::Unauthorized("请先登录".to_string()))?;
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

#[derive(Debug, Deserialize)]
pub struct Credentials {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    token: String,
    user: User,
}

/// POST /api/login
async fn login(State(state): State<AppState>, Json(credentials): Json<Credentials>) -> ApiResult<SessionInfo> {
    let user = state.with_conn(|conn| authenticate(conn, &credentials.username, &credentials.password))?;
    let token = state.open_session(user.clone());
    Ok(ApiResponse::ok(SessionInfo { token, user }))
}

/// POST /api/setup - First admin on an empty database, signed in straight away
async fn setup_admin(
    State(state): State<AppState>,
    Json(credentials): Json<Credentials>,
) -> Result<(StatusCode, Json<ApiResponse<SessionInfo>>), ApiError> {
    let user = state.with_conn(|conn| create_first_admin(conn, &credentials.username, &credentials.password))?;
    let token = state.open_session(user.clone());
    Ok((StatusCode::CREATED, ApiResponse::ok(SessionInfo { token, user })))
}

/// POST /api/logout
async fn logout(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<bool> {
    let closed = bearer_token(&headers).is_some_and(|token| state.close_session(token));
    Ok(ApiResponse::ok(closed))
}

/// GET /api/me
async fn current_user(Extension(user): Extension<User>) -> ApiResult<User> {
    Ok(ApiResponse::ok(user))
}

// ============================================================================
// Admin handlers
// ============================================================================

fn default_role() -> Role {
    Role::User
}

#[derive(Debug, Deserialize)]
pub struct NewUser {
    username: String,
    password: String,
    #[serde(default = "default_role")]
    role: Role,
}

/// GET /api/users
async fn list_accounts(State(state): State<AppState>, Extension(user): Extension<User>) -> ApiResult<Vec<User>> {
    require_admin(&user)?;
    let users = state.with_conn(list_users)?;
    Ok(ApiResponse::ok(users))
}

/// POST /api/users
async fn create_account(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(new_user): Json<NewUser>,
) -> Result<(StatusCode, Json<ApiResponse<User>>), ApiError> {
    require_admin(&user)?;
    let created =
        state.with_conn(|conn| add_user(conn, &new_user.username, &new_user.password, new_user.role))?;
    Ok((StatusCode::CREATED, ApiResponse::ok(created)))
}

/// DELETE /api/users/:id - Also ends that user's sessions
async fn delete_account(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<i64>,
) -> ApiResult<User> {
    let removed = state.with_conn(|conn| delete_user(conn, id, &user))?;
    state.close_sessions_of(removed.id);
    Ok(ApiResponse::ok(removed))
}

/// GET /api/config
async fn get_config(State(state): State<AppState>, Extension(user): Extension<User>) -> ApiResult<AppConfig> {
    require_admin(&user)?;
    Ok(ApiResponse::ok(state.config()))
}

/// PUT /api/config - Company name, phone, footer and export directory
async fn put_config(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(update): Json<ConfigUpdate>,
) -> ApiResult<AppConfig> {
    require_admin(&user)?;
    let config = state.update_config(update)?;
    info!(by = %user.username, "config updated");
    Ok(ApiResponse::ok(config))
}

#[derive(Debug, Serialize)]
pub struct BackupReport {
    path: String,
}

/// POST /api/backup - Timestamped copy of the database in backup_dir
async fn backup_now(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<(StatusCode, Json<ApiResponse<BackupReport>>), ApiError> {
    require_admin(&user)?;
    let config = state.config();
    let path = state.with_conn(|conn| {
        backup_database(conn, &config.database_path, &config.backup_dir, Local::now().naive_local())
    })?;
    let report = BackupReport {
        path: path.display().to_string(),
    };
    Ok((StatusCode::CREATED, ApiResponse::ok(report)))
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health_check))
        .route("/login", post(login))
        .route("/setup", post(setup_admin));

    let protected = Router::new()
        .route("/logout", post(logout))
        .route("/me", get(current_user))
        .route(
            "/purchases",
            get(list_records::<PurchaseRecord>).post(create_record::<PurchaseRecord>),
        )
        .route(
            "/purchases/:id",
            get(get_one::<PurchaseRecord>)
                .put(update_one::<PurchaseRecord>)
                .delete(delete_one::<PurchaseRecord>),
        )
        .route(
            "/shipments",
            get(list_records::<ShipmentRecord>).post(create_record::<ShipmentRecord>),
        )
        .route(
            "/shipments/:id",
            get(get_one::<ShipmentRecord>)
                .put(update_one::<ShipmentRecord>)
                .delete(delete_one::<ShipmentRecord>),
        )
        .route("/distinct/:kind/:column", get(distinct_values))
        .route("/summary/:kind", get(daily_summary))
        .route("/import/:kind", post(import_records))
        .route("/settlement/:kind", get(settlement_sheet))
        .route("/users", get(list_accounts).post(create_account))
        .route("/users/:id", delete(delete_account))
        .route("/config", get(get_config).put(put_config))
        .route("/backup", post(backup_now))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_session));

    let api_routes = public.merge(protected).with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigOrigin;
    use crate::db::setup_database;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct TestApi {
        router: Router,
        state: AppState,
        token: String,
    }

    impl TestApi {
        fn bearer(&self) -> String {
            format!("Bearer {}", self.token)
        }
    }

    fn empty_state(config: AppConfig) -> AppState {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        AppState::new(conn, config)
    }

    /// Router with an admin account already signed in
    fn test_app_with(config: AppConfig) -> TestApi {
        let state = empty_state(config);
        let admin = state.with_conn(|conn| add_user(conn, "admin", "secret", Role::Admin)).unwrap();
        let token = state.open_session(admin);
        TestApi {
            router: router(state.clone()),
            state,
            token,
        }
    }

    fn test_app() -> TestApi {
        test_app_with(AppConfig::default())
    }

    async fn call(
        router: &Router,
        token: Option<&str>,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = router.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn send(app: &TestApi, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        call(&app.router, Some(&app.token), method, uri, body).await
    }

    /// Sign in through the API and return the new token
    async fn login_as(app: &TestApi, username: &str, password: &str) -> String {
        let (status, body) = call(
            &app.router,
            None,
            "POST",
            "/api/login",
            Some(json!({ "username": username, "password": password })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["data"]["token"].as_str().unwrap().to_string()
    }

    fn purchase_body(date: &str, name: &str, gross: f64) -> Value {
        json!({
            "date": date,
            "grower_name": name,
            "spec": "A",
            "gross_weight": gross,
            "secondary_fruit": 5.0,
            "tare_weight": 15.0,
            "unit_price": 2.5
        })
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app();
        let (status, body) = send(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], "OK");
    }

    #[tokio::test]
    async fn test_create_get_update_delete_purchase() {
        let app = test_app();

        let (status, body) = send(&app, "POST", "/api/purchases", Some(purchase_body("2024-01-01", "张三", 120.0))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["net_weight"], 100.0);
        assert_eq!(body["data"]["total_amount"], 250.0);
        let id = body["data"]["id"].as_i64().unwrap();

        let (status, body) = send(&app, "GET", &format!("/api/purchases/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["grower_name"], "张三");

        let (status, body) = send(
            &app,
            "PUT",
            &format!("/api/purchases/{}", id),
            Some(purchase_body("2024-01-01", "张三", 220.0)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total_amount"], 500.0);

        let (status, _) = send(&app, "DELETE", &format!("/api/purchases/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, "GET", &format!("/api/purchases/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_invalid_entry_is_rejected_with_field() {
        let app = test_app();
        let (status, body) = send(&app, "POST", "/api/purchases", Some(purchase_body("2024-01-01", "张三", 10.0))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "net_weight");

        let (_, body) = send(&app, "GET", "/api/purchases", None).await;
        assert_eq!(body["data"]["total_records"], 0);
    }

    #[tokio::test]
    async fn test_list_filters_and_blank_params() {
        let app = test_app();
        for (date, name) in [("2024-01-01", "张三"), ("2024-01-02", "李四"), ("2024-01-03", "张三丰")] {
            send(&app, "POST", "/api/purchases", Some(purchase_body(date, name, 120.0))).await;
        }

        let (status, body) = send(&app, "GET", "/api/purchases?name=%E5%BC%A0%E4%B8%89&start_date=&end_date=&page=", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total_records"], 2);
        assert_eq!(body["data"]["page"], 1);
        assert_eq!(body["data"]["total_pages"], 1);
        assert_eq!(body["data"]["records"][0]["date"], "2024-01-03");

        let (status, body) = send(&app, "GET", "/api/purchases?start_date=2024-13-01", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "start_date");
    }

    #[tokio::test]
    async fn test_import_preview_then_confirm() {
        let app = test_app();
        let sheet = "日期,姓名,规格,件数,重量(斤),单价,备注\n\
                     2024-03-01,客户甲,大果,10,25,1.2,\n\
                     2024-03-02,客户乙,小果,0,10,2,\n";

        let request = |uri: &str| {
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::AUTHORIZATION, app.bearer())
                .body(Body::from(sheet))
                .unwrap()
        };

        let response = app.router.clone().oneshot(request("/api/import/shipments")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["data"]["total_rows"], 2);
        assert_eq!(body["data"]["inserted"], 0);
        assert_eq!(body["data"]["skipped"][0]["line"], 3);

        let response = app.router.clone().oneshot(request("/api/import/shipments?confirm=true")).await.unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["data"]["inserted"], 1);

        // Same sheet again: the stored row is now a duplicate
        let response = app.router.clone().oneshot(request("/api/import/shipments?confirm=true")).await.unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["data"]["duplicate_count"], 1);
        assert_eq!(body["data"]["inserted"], 0);
    }

    #[tokio::test]
    async fn test_distinct_and_summary() {
        let app = test_app();
        send(&app, "POST", "/api/purchases", Some(purchase_body("2024-01-01", "张三", 120.0))).await;
        send(&app, "POST", "/api/purchases", Some(purchase_body("2024-01-01", "李四", 120.0))).await;

        let (status, body) = send(&app, "GET", "/api/distinct/purchases/name", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 2);

        let (status, _) = send(&app, "GET", "/api/distinct/purchases/price", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            "GET",
            "/api/summary/purchases?start_date=2024-01-01&end_date=2024-01-31",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["record_count"], 2);
        assert_eq!(body["data"][0]["total_amount"], 500.0);
    }

    #[tokio::test]
    async fn test_settlement_download() {
        let app = test_app();
        send(&app, "POST", "/api/purchases", Some(purchase_body("2024-01-01", "张三", 120.0))).await;
        send(&app, "POST", "/api/purchases", Some(purchase_body("2024-01-02", "李四", 120.0))).await;
        send(&app, "POST", "/api/purchases", Some(purchase_body("2024-01-03", "张三丰", 220.0))).await;

        let response = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/settlement/purchases?name=%E5%BC%A0%E4%B8%89")
                    .header(header::AUTHORIZATION, app.bearer())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response.headers()[header::CONTENT_DISPOSITION].to_str().unwrap().to_string();
        assert!(disposition.starts_with("attachment; filename*=UTF-8''"));
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("结算对象: 张三"));
        assert!(!text.contains("张三丰"));
        assert!(text.contains("金额大写: 贰佰伍拾元整"));

        let (status, body) = send(&app, "GET", "/api/settlement/purchases", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "name");
    }

    #[tokio::test]
    async fn test_requests_need_a_session() {
        let app = test_app();

        let (status, body) = call(&app.router, None, "GET", "/api/purchases", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);

        let (status, _) = call(&app.router, Some("not-a-token"), "GET", "/api/purchases", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&app.router, None, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_login_and_logout() {
        let app = test_app();

        let (status, _) = call(
            &app.router,
            None,
            "POST",
            "/api/login",
            Some(json!({ "username": "admin", "password": "wrong" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let token = login_as(&app, "admin", "secret").await;
        let (status, body) = call(&app.router, Some(&token), "GET", "/api/me", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["username"], "admin");
        assert_eq!(body["data"]["role"], "admin");

        let (_, body) = call(&app.router, Some(&token), "POST", "/api/logout", None).await;
        assert_eq!(body["data"], true);
        let (status, _) = call(&app.router, Some(&token), "GET", "/api/me", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // The other session is untouched
        let (status, _) = send(&app, "GET", "/api/me", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_setup_only_on_empty_database() {
        let app = router(empty_state(AppConfig::default()));
        let credentials = json!({ "username": "boss", "password": "pw" });

        let (status, body) = call(&app, None, "POST", "/api/setup", Some(credentials.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["user"]["role"], "admin");
        let token = body["data"]["token"].as_str().unwrap().to_string();

        let (status, _) = call(&app, Some(&token), "GET", "/api/users", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&app, None, "POST", "/api/setup", Some(credentials)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_admin_routes_reject_regular_users() {
        let app = test_app();
        let (status, _) = send(
            &app,
            "POST",
            "/api/users",
            Some(json!({ "username": "clerk", "password": "pw" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let clerk = login_as(&app, "clerk", "pw").await;
        for (method, uri) in [("GET", "/api/users"), ("GET", "/api/config"), ("POST", "/api/backup")] {
            let (status, _) = call(&app.router, Some(&clerk), method, uri, None).await;
            assert_eq!(status, StatusCode::FORBIDDEN, "{} {}", method, uri);
        }
        let (status, _) = call(
            &app.router,
            Some(&clerk),
            "PUT",
            "/api/config",
            Some(json!({ "company_name": "x" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // Record routes stay open to them
        let (status, _) = call(&app.router, Some(&clerk), "GET", "/api/purchases", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_manages_users() {
        let app = test_app();
        let (_, body) = send(
            &app,
            "POST",
            "/api/users",
            Some(json!({ "username": "clerk", "password": "pw", "role": "user" })),
        )
        .await;
        let clerk_id = body["data"]["id"].as_i64().unwrap();
        let clerk = login_as(&app, "clerk", "pw").await;

        let (status, body) = send(
            &app,
            "POST",
            "/api/users",
            Some(json!({ "username": "clerk", "password": "other" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "username");

        let (_, body) = send(&app, "GET", "/api/users", None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
        assert!(body["data"][0].get("password_hash").is_none());

        let admin_id = body["data"][0]["id"].as_i64().unwrap();
        let (status, _) = send(&app, "DELETE", &format!("/api/users/{}", admin_id), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "DELETE", &format!("/api/users/{}", clerk_id), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app.router, Some(&clerk), "GET", "/api/me", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_config_update_is_saved_and_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let admin = add_user(&conn, "admin", "secret", Role::Admin).unwrap();
        let state = AppState::new(conn, AppConfig::default()).with_config_path(path.clone());
        let app = TestApi {
            token: state.open_session(admin),
            router: router(state.clone()),
            state,
        };

        let (status, body) = send(
            &app,
            "PUT",
            "/api/config",
            Some(json!({ "company_name": "新果园", "phone_number": "123" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["company_name"], "新果园");

        let (saved, _) = AppConfig::load_or_init(&path).unwrap();
        assert_eq!(saved.company_name, "新果园");
        assert_eq!(saved.phone_number, "123");
        assert_eq!(app.state.config().company_name, "新果园");

        let (status, body) = send(&app, "PUT", "/api/config", Some(json!({ "company_name": " " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "company_name");
        let (saved, origin) = AppConfig::load_or_init(&path).unwrap();
        assert_eq!(origin, ConfigOrigin::Loaded);
        assert_eq!(saved.company_name, "新果园");
    }

    #[tokio::test]
    async fn test_backup_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            backup_dir: dir.path().join("db_backups"),
            ..AppConfig::default()
        };
        let app = test_app_with(config);
        send(&app, "POST", "/api/purchases", Some(purchase_body("2024-01-01", "张三", 120.0))).await;

        let (status, body) = send(&app, "POST", "/api/backup", None).await;
        assert_eq!(status, StatusCode::CREATED);
        let path = PathBuf::from(body["data"]["path"].as_str().unwrap());
        assert!(path.starts_with(dir.path().join("db_backups")));

        let copy = Connection::open(&path).unwrap();
        let count: i64 = copy
            .query_row("SELECT COUNT(*) FROM grower_records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}

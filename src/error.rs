// Error taxonomy for the ledger
// ValidationError is reported inline with the offending field; everything
// else is wrapped in LedgerError.

use thiserror::Error;

// ============================================================================
// VALIDATION ERROR
// ============================================================================

/// A bad or missing field on a record entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

// ============================================================================
// LEDGER ERROR
// ============================================================================

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid {0}")]
    Validation(#[from] ValidationError),

    /// Duplicate-check query failed. Import recovers from this by failing open.
    #[error("duplicate lookup failed: {0}")]
    Lookup(String),

    /// The store rejected a write; the message is the store's own.
    #[error("store rejected write: {0}")]
    Persistence(String),

    #[error("record {id} not found in {table}")]
    NotFound { table: &'static str, id: i64 },

    #[error("import failed: {0}")]
    Import(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// A background operation of this kind is already running
    #[error("{0} is already running")]
    Busy(&'static str),

    #[error("background task failed: {0}")]
    TaskFailed(String),

    /// Bad credentials or no live session
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Signed in, but the role does not allow it
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("password hashing failed: {0}")]
    PasswordHash(#[from] bcrypt::BcryptError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LedgerError {
    /// Field name when this is a validation failure
    pub fn field(&self) -> Option<&str> {
        match self {
            LedgerError::Validation(e) => Some(&e.field),
            _ => None,
        }
    }
}

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;

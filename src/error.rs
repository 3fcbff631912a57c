use thiserror::Error;

/// Failures surfaced by the attendance core. Every variant maps to a stable
/// wire code and an HTTP-equivalent status for the inbound surface.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Validation(String),

    #[error("roster too large: {size} bytes (limit {limit})")]
    RosterTooLarge { size: usize, limit: usize },

    #[error("unsupported roster format: {0}")]
    Format(String),

    #[error("{0}")]
    Schema(String),

    #[error("malformed roster: {0}")]
    Parse(String),

    #[error("approval window {0} is not active")]
    WindowInactive(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation_error",
            CoreError::RosterTooLarge { .. } => "roster_too_large",
            CoreError::Format(_) => "format_error",
            CoreError::Schema(_) => "schema_error",
            CoreError::Parse(_) => "parse_error",
            CoreError::WindowInactive(_) => "window_inactive",
            CoreError::NotFound(_) => "not_found",
            CoreError::Forbidden(_) => "forbidden",
            CoreError::StoreUnavailable(_) => "store_unavailable",
            CoreError::Internal(_) => "internal",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::Validation(_) => 400,
            CoreError::Forbidden(_) => 403,
            CoreError::NotFound(_) => 404,
            CoreError::WindowInactive(_) => 409,
            CoreError::RosterTooLarge { .. } => 413,
            CoreError::Format(_) => 415,
            CoreError::Schema(_) | CoreError::Parse(_) => 422,
            CoreError::StoreUnavailable(_) => 503,
            CoreError::Internal(_) => 500,
        }
    }
}

/// Store-layer failure, classified so call sites know whether one retry is
/// worth attempting.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &e {
            rusqlite::Error::SqliteFailure(f, _)
                if matches!(
                    f.code,
                    ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::SystemIoFailure
                        | ErrorCode::CannotOpen
                ) =>
            {
                StoreError::Transient(e.to_string())
            }
            _ => StoreError::Permanent(e.to_string()),
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Transient(m) => CoreError::StoreUnavailable(m),
            StoreError::Permanent(m) => CoreError::Internal(m),
        }
    }
}

use std::fmt;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("time parse error: {0}")]
    TimeParse(#[from] chrono::ParseError),
    #[error("cycle already active for {provider}/{quota_key}")]
    CycleAlreadyActive { provider: String, quota_key: String },
    #[error("session already open for {0}")]
    SessionAlreadyOpen(String),
    #[error("session not found: {0}")]
    SessionNotFound(Uuid),
    #[error("session already closed: {0}")]
    SessionClosed(Uuid),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} is closed; open a new session first")]
    Closed(Uuid),
}

/// A store failure that did not stop in-memory bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreWarning {
    pub op: &'static str,
    pub message: String,
}

impl StoreWarning {
    pub(crate) fn new(op: &'static str, err: &StoreError) -> Self {
        Self {
            op,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for StoreWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.op, self.message)
    }
}

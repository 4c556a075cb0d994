use thiserror::Error;

/// Classified failure of one upstream API call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// The identifier has no visible data upstream. Expected, never retried.
    #[error("api error [404] on {endpoint}: resource not found")]
    NotFound { endpoint: String },

    #[error("api error [429] on {endpoint}: rate limit exceeded (retry after {retry_after_secs}s)")]
    RateLimited {
        endpoint: String,
        retry_after_secs: u64,
    },

    #[error("api error [{status}] on {endpoint}: server error")]
    Server { status: u16, endpoint: String },

    #[error("api error [{status}] on {endpoint}: {message}")]
    Client {
        status: u16,
        endpoint: String,
        message: String,
    },

    #[error("request to {endpoint} failed after {attempts} attempts: {message}")]
    Transport {
        endpoint: String,
        attempts: u32,
        message: String,
    },

    #[error("failed to decode response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
}

impl SourceError {
    pub fn status(&self) -> Option<u16> {
        match self {
            SourceError::NotFound { .. } => Some(404),
            SourceError::RateLimited { .. } => Some(429),
            SourceError::Server { status, .. } | SourceError::Client { status, .. } => {
                Some(*status)
            }
            SourceError::Transport { .. } | SourceError::Decode { .. } => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::NotFound { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SourceError::RateLimited { .. }
                | SourceError::Server { .. }
                | SourceError::Transport { .. }
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid battle time {value:?}: {reason}")]
    InvalidBattleTime { value: String, reason: String },
}

/// Storage failure, tagged with the operation and table it happened on.
#[derive(Debug, Error)]
#[error("db error on {table}.{operation}: {source}")]
pub struct StoreError {
    pub operation: &'static str,
    pub table: &'static str,
    #[source]
    pub source: StoreErrorSource,
}

#[derive(Debug, Error)]
pub enum StoreErrorSource {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn new(
        operation: &'static str,
        table: &'static str,
        source: impl Into<StoreErrorSource>,
    ) -> Self {
        Self {
            operation,
            table,
            source: source.into(),
        }
    }
}

/// Failures that abort a collection run.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("failed to load roster: {0}")]
    Roster(#[source] SourceError),

    #[error("failed to {operation}: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: StoreError,
    },
}

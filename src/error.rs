use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum GriddleError {
    /// Backing store unreachable or timed out. Retryable; callers degrade
    /// to fallback storage instead of failing.
    #[error("Backing store unavailable: {0}")]
    Connectivity(String),

    /// A fallback document failed to parse. The affected entity type starts
    /// empty; startup continues.
    #[error("Corrupt fallback document for {table}: {message}")]
    CorruptDocument {
        table: &'static str,
        message: String,
    },

    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("Unknown entity table: {0}")]
    UnknownTable(String),

    #[error("SQL error: {0}")]
    Sql(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

pub type Result<T> = std::result::Result<T, GriddleError>;

impl GriddleError {
    /// Connectivity-class failures are retried by the connection manager;
    /// everything else propagates immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, GriddleError::Connectivity(_))
    }
}

impl From<std::io::Error> for GriddleError {
    fn from(e: std::io::Error) -> Self {
        GriddleError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for GriddleError {
    fn from(e: serde_json::Error) -> Self {
        GriddleError::Json(e.to_string())
    }
}

impl From<sqlx::Error> for GriddleError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(e) => GriddleError::Connectivity(e.to_string()),
            sqlx::Error::Tls(e) => GriddleError::Connectivity(e.to_string()),
            sqlx::Error::PoolTimedOut => {
                GriddleError::Connectivity("connection pool timed out".to_string())
            }
            sqlx::Error::PoolClosed => {
                GriddleError::Connectivity("connection pool closed".to_string())
            }
            sqlx::Error::WorkerCrashed => {
                GriddleError::Connectivity("database worker crashed".to_string())
            }
            other => GriddleError::Sql(other.to_string()),
        }
    }
}

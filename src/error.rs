use thiserror::Error;

/// Result type for provbus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by a downstream pipeline call
pub type PipelineError = Box<dyn std::error::Error + Send + Sync>;

/// Error types for consumer, producer and broker operations
#[derive(Debug, Error)]
pub enum Error {
    /// Broker or database connection/session could not be created or was lost
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Message store rejected or failed an insert
    #[error("Message store error: {0}")]
    Store(String),

    /// Downstream pipeline failed while processing a message
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// Worker pool no longer accepts tasks
    #[error("Worker pool is shut down")]
    PoolShutdown,

    /// Worker pool failed for a reason other than saturation
    #[error("Worker pool internal error: {0}")]
    PoolInternal(String),

    /// Missing or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Selector expression could not be parsed
    #[error("Selector error at position {position}: {message}")]
    Selector { position: usize, message: String },

    /// Invalid input data
    #[error("Validation error: {0}")]
    Validation(String),

    /// SQL errors and constraint violations
    #[error("Database error: {0}")]
    Database(String),

    /// Connection pool issues
    #[error("Pool error: {0}")]
    Pool(String),

    /// Unit-of-work specific errors
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Operation attempted on a closed session or receiver
    #[error("Session closed: {0}")]
    Closed(String),
}

impl Error {
    /// Whether this error belongs to the connectivity class: broker or
    /// database resources that failed or went away underneath the caller.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Error::Connectivity(_) | Error::Database(_) | Error::Pool(_) | Error::Closed(_)
        )
    }

    pub(crate) fn connectivity(context: &str, err: impl std::fmt::Display) -> Self {
        Error::Connectivity(format!("{}: {}", context, err))
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_error) = err.as_db_error() {
            return Error::Database(format!("{}: {}", db_error.code().code(), db_error.message()));
        }

        if err.is_closed() {
            return Error::Connectivity(format!("connection closed: {}", err));
        }

        Error::Database(format!("{:?}", err))
    }
}

impl From<deadpool_postgres::PoolError> for Error {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Error::Pool(err.to_string())
    }
}

impl From<deadpool_postgres::BuildError> for Error {
    fn from(err: deadpool_postgres::BuildError) -> Self {
        Error::Connectivity(err.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(err: uuid::Error) -> Self {
        Error::Validation(format!("Invalid UUID: {}", err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Validation(format!("JSON error: {}", err))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

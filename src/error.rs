use thiserror::Error;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// Resource not found error.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Rejected input (missing identifiers, bad values).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Event ignored by the ingest debounce.
    #[error("Duplicate event ignored by debounce: {0}")]
    Duplicate(String),

    /// Feature switched off in configuration.
    #[error("Disabled: {0}")]
    Disabled(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage error.
    #[error("Database error: {0}")]
    Database(String),

    /// JSON encoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether a scheduled job failing with this error should be redelivered.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Io(_) | AppError::Database(_) | AppError::Internal(_)
        )
    }
}

/// Result type alias for the application.
pub type Result<T> = std::result::Result<T, AppError>;

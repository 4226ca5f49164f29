use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Cache entry not found: {session_id}/{fingerprint}")]
    EntryNotFound {
        session_id: String,
        fingerprint: String,
    },

    #[error("Call event not found: {session_id}/{node_id}")]
    EventNotFound { session_id: String, node_id: u64 },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Failure of a real endpoint call, surfaced to the instrumented program
/// unchanged. Never cached.
#[derive(Debug, Error)]
#[error("Endpoint call failed: {endpoint} - {message}")]
pub struct EndpointError {
    /// Model/endpoint identifier of the failed call.
    pub endpoint: String,
    /// Native error message from the adapter.
    pub message: String,
}

impl EndpointError {
    /// Create a new endpoint error
    pub fn new(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

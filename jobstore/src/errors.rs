// Error handling framework for the document-backed job store

use thiserror::Error;

/// Errors raised by the document repository layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("Document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Concurrency token mismatch on {collection}/{id}")]
    ConcurrencyConflict { collection: String, id: String },

    #[error("Document store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Document serialization failed: {0}")]
    Serialization(String),

    #[error("Query failed: {0}")]
    Query(String),
}

/// Schedule and calendar arithmetic errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid repeat interval: {0}")]
    InvalidInterval(String),

    #[error("Invalid schedule configuration: {0}")]
    InvalidConfiguration(String),
}

/// Validation errors for input handed to the job store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),
}

/// Errors surfaced to the scheduler engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobStoreError {
    #[error("Document store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Timed out acquiring lock '{lock}' after {waited_ms}ms")]
    LockTimeout { lock: String, waited_ms: u64 },

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Invalid misfire instruction {code} on trigger {trigger}")]
    MisfirePolicy { trigger: String, code: i32 },

    #[error("Object already exists: {0}")]
    ObjectAlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Job store is shutting down")]
    ShuttingDown,
}

impl JobStoreError {
    /// Whether the scheduler engine should back off and retry the whole operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobStoreError::StoreUnavailable(_) | JobStoreError::LockTimeout { .. }
        )
    }
}

impl From<RepositoryError> for JobStoreError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound { collection, id } => {
                JobStoreError::NotFound(format!("{}/{}", collection, id))
            }
            RepositoryError::ConcurrencyConflict { collection, id } => {
                JobStoreError::ConcurrencyConflict(format!("{}/{}", collection, id))
            }
            RepositoryError::StoreUnavailable(msg) => JobStoreError::StoreUnavailable(msg),
            RepositoryError::Serialization(msg) => JobStoreError::Serialization(msg),
            RepositoryError::Query(msg) => JobStoreError::StoreUnavailable(msg),
        }
    }
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => RepositoryError::StoreUnavailable(err.to_string()),
            sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
                RepositoryError::Serialization(err.to_string())
            }
            _ => RepositoryError::Query(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for JobStoreError {
    fn from(err: serde_json::Error) -> Self {
        JobStoreError::Serialization(err.to_string())
    }
}

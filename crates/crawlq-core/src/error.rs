use thiserror::Error;

/// Application-wide error types for crawlq.
#[derive(Error, Debug)]
pub enum AppError {
    /// Queue message body could not be turned into a dispatchable task.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// No plan registered under the requested name.
    #[error("Plan '{0}' not found")]
    PlanNotFound(String),

    /// A plan with the same name is already registered.
    #[error("Plan '{0}' already registered")]
    DuplicatePlan(String),

    /// A plan returned output that can never be persisted or expanded.
    #[error("Invalid plan output: {0}")]
    InvalidPlanOutput(String),

    /// HTTP request failed (fetching a page).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request or plan execution timed out; carries the limit in milliseconds.
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Page content did not have the expected structure.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// A result could not be written to the record store.
    #[error("Failed to persist result for {url}: {source}")]
    PersistFailed {
        url: String,
        #[source]
        source: Box<AppError>,
    },

    /// A child task could not be published to the message queue.
    #[error("Failed to enqueue task {url}: {source}")]
    PublishFailed {
        url: String,
        #[source]
        source: Box<AppError>,
    },

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Message transport operation failed.
    #[error("Queue error: {0}")]
    QueueError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A record filter could not be interpreted.
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// No record with the given id.
    #[error("Record '{0}' not found")]
    RecordNotFound(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::DatabaseError(_)
            | AppError::QueueError(_) => true,
            AppError::PersistFailed { source, .. } | AppError::PublishFailed { source, .. } => {
                source.is_retryable()
            }
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true if redelivering the same message can never succeed.
    ///
    /// The worker pool rejects (no requeue) messages whose result handling
    /// failed with a permanent error and retries everything else.
    pub fn is_permanent(&self) -> bool {
        match self {
            AppError::MalformedMessage(_)
            | AppError::PlanNotFound(_)
            | AppError::InvalidPlanOutput(_) => true,
            AppError::PersistFailed { source, .. } | AppError::PublishFailed { source, .. } => {
                source.is_permanent()
            }
            _ => false,
        }
    }
}

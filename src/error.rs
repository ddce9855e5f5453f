//! Error types for chatdesk.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
///
/// Any of these aborts the current operation; no partial write is assumed
/// to have been committed.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors talking to a messaging platform.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Platform {platform} request failed: {reason}")]
    Transient { platform: String, reason: String },

    #[error("Platform {platform} {operation} timed out after {timeout:?}")]
    Timeout {
        platform: String,
        operation: String,
        timeout: Duration,
    },

    #[error("Platform {platform} rejected the request: {reason}")]
    Rejected { platform: String, reason: String },

    #[error("Invalid {platform} payload: {reason}")]
    InvalidPayload { platform: String, reason: String },
}

impl AdapterError {
    /// Network/timeout failures that are worth retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Malformed or unusable inbound events. Dropped after logging, never retried.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Event is missing required field: {0}")]
    MissingField(&'static str),

    #[error("Event field {0} is empty")]
    EmptyField(&'static str),

    #[error("No adapter registered for platform {0}")]
    UnknownPlatform(String),
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Pipeline configuration error: {0}")]
    Config(String),

    #[error("Stage {stage} requires context field {field}, which is not set")]
    MissingContext {
        stage: &'static str,
        field: &'static str,
    },

    #[error("Stage {stage} failed: {reason}")]
    Stage { stage: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Event queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Event queue is full ({capacity} events waiting)")]
    Full { capacity: usize },

    #[error("Event queue is closed")]
    Closed,
}

/// Result type alias for chatdesk.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_adapter_errors() {
        let timeout = AdapterError::Timeout {
            platform: "telegram".into(),
            operation: "sendMessage".into(),
            timeout: Duration::from_secs(5),
        };
        assert!(timeout.is_transient());

        let rejected = AdapterError::Rejected {
            platform: "facebook".into(),
            reason: "invalid recipient".into(),
        };
        assert!(!rejected.is_transient());
    }

    #[test]
    fn pipeline_error_wraps_database_error() {
        let err: PipelineError = DatabaseError::Query("boom".into()).into();
        assert!(err.to_string().contains("boom"));
    }
}

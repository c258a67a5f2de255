//! Error types for the consumption pipeline.

use thiserror::Error;

/// Errors produced by the worker, the writer, the lock client, and the
/// handler lifecycle.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Payload rejected before reaching the broker.
    #[error("payload of {size} bytes exceeds the {limit} byte publish limit")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Writer constructed without any nsqd TCP address.
    #[error("writer is disabled: no nsqd TCP addresses configured")]
    WriterDisabled,

    /// Lock service failed after exhausting its retries.
    #[error("lock service error: {0}")]
    LockService(String),

    /// Mandatory lock still held by another owner when the blocking
    /// timeout expired.
    #[error("lock not acquired for '{0}'")]
    LockNotAcquired(String),

    /// Mandatory lock configured but the payload carries no resource id.
    #[error("no resource id at '{path}' for route '{route}'")]
    MissingResourceId { route: String, path: String },

    /// Message execution exceeded the configured deadline.
    #[error("handler '{handler}' exceeded its timeout for message {message_id}")]
    HandlerTimeout { handler: String, message_id: String },

    /// Failure reported (or panicked) by user handler code.
    #[error("handler error: {0}")]
    Handler(String),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Redis connection or command error.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Broker admin HTTP error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Broker subscription or publish error.
    #[error("broker error: {0}")]
    Broker(String),

    /// Invalid worker or route configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid matcher pattern.
    #[error("invalid matcher pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl WorkerError {
    /// Shorthand for a handler-level failure.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// Check if this is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::HandlerTimeout { .. })
    }

    /// Check if this error came out of the lock client.
    pub fn is_lock_error(&self) -> bool {
        matches!(
            self,
            Self::LockService(_) | Self::LockNotAcquired(_) | Self::MissingResourceId { .. }
        )
    }
}

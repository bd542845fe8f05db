//! Error types for the AMQP gateway

use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// AMQP gateway error
#[derive(Debug, Error)]
pub enum Error {
    /// Connection establishment or teardown failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Channel creation, consume, or ack/reject failure
    #[error("Channel error: {0}")]
    Channel(String),

    /// Publish failure after retries were exhausted
    #[error("Publish error: {0}")]
    Publish(String),

    /// Protocol misuse, e.g. publishing on a channel in an invalid
    /// state. Never retried.
    #[error("Illegal operation: {0}")]
    IllegalOperation(String),

    /// Inbound content could not be decrypted or parsed
    #[error("Decode error: {0}")]
    Decode(#[from] envelope_codec::Error),

    /// Outgoing encrypted payload is over the configured limit
    #[error("Outgoing payload of {size} bytes exceeds the limit of {limit} bytes")]
    SizeLimitExceeded {
        /// Encrypted payload size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// An HTTP reply was requested without a `reply_to` header
    #[error("Message has no reply_to header")]
    MissingReplyTo,

    /// No registry entry for the given message id
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

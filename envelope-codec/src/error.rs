//! Error types for the envelope codec

use thiserror::Error;

/// Result type for codec operations
pub type Result<T> = std::result::Result<T, Error>;

/// Envelope codec error
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid crypto configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Decryption failure
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// Base64 decode failure (v1 wire format)
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Decoded content did not match the expected envelope shape
    #[error("Malformed message: {0}")]
    Malformed(String),
}

//! # Core Error Types
//!
//! Centralized error definitions shared by every chain crate.
//! All errors implement `std::error::Error` and `std::fmt::Display`.

use thiserror::Error;

/// Unified error type for core-logic operations.
///
/// Wraps the specific error families so the application layer can hold a
/// single error type when it does not care which collaborator failed.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Config(ConfigError),

    #[error("Persistence error: {0}")]
    Persistence(PersistenceError),

    #[error(transparent)]
    Provider(ProviderError),

    #[error(transparent)]
    Payload(SubscriptionPayloadError),

    #[error("Unknown error: {message}")]
    Unknown { message: String },
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        CoreError::Config(e)
    }
}

impl From<PersistenceError> for CoreError {
    fn from(e: PersistenceError) -> Self {
        CoreError::Persistence(e)
    }
}

impl From<ProviderError> for CoreError {
    fn from(e: ProviderError) -> Self {
        CoreError::Provider(e)
    }
}

impl From<SubscriptionPayloadError> for CoreError {
    fn from(e: SubscriptionPayloadError) -> Self {
        CoreError::Payload(e)
    }
}

/// Configuration-related errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Invalid URL for '{field}': '{url}'")]
    InvalidUrl { field: String, url: String },

    #[error("Missing required configuration field: '{field}'")]
    MissingField { field: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Failed to parse configuration {path}: {msg}")]
    ParseError { path: String, msg: String },
}

/// Errors raised by the persistence collaborator.
#[derive(Error, Debug, Clone)]
pub enum PersistenceError {
    #[error("Connection pool exhausted (max: {max_size})")]
    PoolExhausted { max_size: u32 },

    #[error("Write failed for {entity}: {msg}")]
    WriteFailed { entity: String, msg: String },

    #[error("Read failed for {entity}: {msg}")]
    ReadFailed { entity: String, msg: String },

    #[error("Migration failed: {msg}")]
    MigrationFailed { msg: String },

    #[error("Corrupt record for {key}: {msg}")]
    Corrupt { key: String, msg: String },
}

/// Errors raised by a node endpoint or an indexing service.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Request to {endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("Rate limited by {endpoint}")]
    RateLimited { endpoint: String },

    #[error("Connection refused to {endpoint}: {reason}")]
    ConnectionRefused { endpoint: String, reason: String },

    /// Gas estimation failed because execution is expected to revert.
    #[error("Cannot estimate gas: {reason}")]
    UnpredictableGas { reason: String },

    #[error("RPC error from {endpoint}: {msg}")]
    Rpc { endpoint: String, msg: String },

    #[error("Invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("{operation} is not supported by {endpoint}")]
    Unsupported { endpoint: String, operation: String },
}

impl ProviderError {
    /// Timeouts, rate limiting and refused connections are expected to clear
    /// up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout { .. }
                | ProviderError::RateLimited { .. }
                | ProviderError::ConnectionRefused { .. }
        )
    }
}

/// A push message that could not be normalized. Dropped per message.
#[derive(Error, Debug, Clone)]
pub enum SubscriptionPayloadError {
    #[error("Malformed {topic} payload: {reason}")]
    Malformed { topic: String, reason: String },

    #[error("{topic} payload is missing '{field}'")]
    MissingField { topic: String, field: String },
}

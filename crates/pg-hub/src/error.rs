//! Error types for hub operations
//!
//! Transport failures never reach callers: the hub recovers from them by
//! reconnecting. The errors here report caller misuse, synchronously.

use crate::codec::CodecError;
use thiserror::Error;

/// Hub error types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    /// The hub has been stopped
    #[error("Hub is stopped")]
    Stopped,

    /// The hub is not connected and is not starting up
    #[error("Hub is not ready")]
    NotReady,

    /// Topic name is empty or contains characters outside `[A-Za-z0-9_]`
    #[error("Invalid topic: {0:?}")]
    InvalidTopic(String),

    /// Keys or value could not be encoded
    #[error("Encoding failed: {0}")]
    Encode(#[from] CodecError),

    /// Encoded payload exceeds the configured limit
    #[error("Payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge {
        /// Encoded payload size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// The consumer has been closed
    #[error("Consumer is closed")]
    ConsumerClosed,
}

/// Result type for hub operations.
pub type HubResult<T> = Result<T, HubError>;

impl HubError {
    /// Check if retrying the same call later may succeed.
    ///
    /// Only `NotReady` is transient: the hub may be between connections.
    pub fn is_transient(&self) -> bool {
        matches!(self, HubError::NotReady)
    }
}

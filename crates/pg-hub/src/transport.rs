//! Connection collaborator interfaces
//!
//! The hub drives a database connection through these traits only. A pool
//! hands out dedicated connections; each connection runs one statement at a
//! time and reports notifications and errors on its event channel.
//!
//! Implementations:
//! - [`MemoryPool`](crate::MemoryPool) (feature `memory`): in-process server
//! - [`PgConnectionPool`](crate::PgConnectionPool) (feature `postgres`): PostgreSQL via `sqlx`

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport error types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Failed to establish a connection
    #[error("Connection error: {0}")]
    Connect(String),

    /// A statement failed
    #[error("Query failed: {0}")]
    Query(String),

    /// An established connection broke
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The connection was already released
    #[error("Connection closed")]
    Closed,
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Notification received on a listened channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Channel the notification was broadcast on
    pub channel: String,
    /// Raw payload string
    pub payload: String,
}

impl Notification {
    /// Create a notification.
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Asynchronous event raised by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A notification arrived
    Notification(Notification),
    /// The connection failed; no further events follow
    Error(TransportError),
}

/// A dedicated connection checked out of a pool.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a single statement. Callers never overlap calls.
    async fn query(&self, statement: &str) -> TransportResult<()>;

    /// Give the connection back. With `discard` the connection must not be
    /// reused, since it may still hold channel subscriptions.
    fn release(&self, discard: bool);
}

/// A freshly established connection and its event stream.
pub struct Connected {
    /// Connection handle
    pub connection: Arc<dyn Connection>,
    /// Notifications and errors raised by the connection
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl fmt::Debug for Connected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connected").finish_non_exhaustive()
    }
}

/// Source of dedicated connections.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Establish a new connection.
    async fn connect(&self) -> TransportResult<Connected>;
}

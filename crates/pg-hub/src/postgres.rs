//! PostgreSQL transport.
//!
//! Each connection is a dedicated `sqlx` [`PgListener`] owned by a driver
//! task. The driver runs one statement at a time, sent over a channel using
//! the simple-query protocol, and forwards notifications as they arrive.
//! The listener's own reconnection is not used: the first lost connection
//! is reported to the hub, which reconnects and resubscribes itself.

use crate::transport::{
    Connected, Connection, ConnectionEvent, ConnectionPool, Notification, TransportError, TransportResult,
};
use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use sqlx::Executor;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

/// Connection pool collaborator backed by a `sqlx` PostgreSQL pool.
///
/// # Example
///
/// ```rust,no_run
/// use pg_hub::{Hub, HubConfig, PgConnectionPool};
///
/// async fn example() -> Result<(), Box<dyn std::error::Error>> {
///     let pool = PgConnectionPool::from_url("postgres://localhost/app").await?;
///     let hub = Hub::new(pool, HubConfig::from_env());
///     hub.start().await;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct PgConnectionPool {
    pool: PgPool,
}

impl PgConnectionPool {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a pool for a database URL.
    ///
    /// # Arguments
    ///
    /// * `database_url` - PostgreSQL connection URL (e.g., `postgres://localhost/app`)
    pub async fn from_url(database_url: &str) -> TransportResult<Self> {
        let pool = PgPoolOptions::new()
            .connect(database_url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(Self::new(pool))
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ConnectionPool for PgConnectionPool {
    async fn connect(&self) -> TransportResult<Connected> {
        let listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();

        let driver = tokio::spawn(listener_loop(listener, requests, events_tx));
        tracing::debug!("PostgreSQL listener connection opened");

        Ok(Connected {
            connection: Arc::new(PgConnection {
                requests: requests_tx,
                driver: driver.abort_handle(),
            }),
            events,
        })
    }
}

/// A statement waiting for the driver.
struct Request {
    statement: String,
    reply: oneshot::Sender<TransportResult<()>>,
}

struct PgConnection {
    requests: mpsc::UnboundedSender<Request>,
    driver: AbortHandle,
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, statement: &str) -> TransportResult<()> {
        let (reply, result) = oneshot::channel();

        self.requests
            .send(Request { statement: statement.to_string(), reply })
            .map_err(|_| TransportError::Closed)?;

        result.await.map_err(|_| TransportError::Closed)?
    }

    fn release(&self, discard: bool) {
        // Dropping the listener closes the session and its subscriptions.
        self.driver.abort();
        tracing::debug!(discard, "PostgreSQL listener connection released");
    }
}

/// Driver loop: run statements and forward notifications until the
/// connection fails or the hub releases it.
async fn listener_loop(
    mut listener: PgListener,
    mut requests: mpsc::UnboundedReceiver<Request>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(Request { statement, reply }) = request else {
                    break;
                };

                let result = (&mut listener)
                    .execute(statement.as_str())
                    .await
                    .map(|_| ())
                    .map_err(|e| TransportError::Query(e.to_string()));

                if let Err(e) = &result {
                    tracing::warn!(error = %e, "Statement failed");
                }
                let _ = reply.send(result);
            }
            received = listener.try_recv() => {
                let lost = match received {
                    Ok(Some(notification)) => {
                        let notification = Notification::new(notification.channel(), notification.payload());
                        if events.send(ConnectionEvent::Notification(notification)).is_err() {
                            break;
                        }
                        continue;
                    }
                    Ok(None) => TransportError::ConnectionLost("connection closed".to_string()),
                    Err(e) => TransportError::ConnectionLost(e.to_string()),
                };

                tracing::warn!(error = %lost, "PostgreSQL listener connection lost");
                let _ = events.send(ConnectionEvent::Error(lost));
                break;
            }
        }
    }
}

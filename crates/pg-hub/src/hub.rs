//! Hub facade
//!
//! [`Hub`] is the public surface. It serialises every call and every async
//! completion through the engine lock, then performs the effects the engine
//! requested with the lock released. Background tasks hold weak references,
//! so dropping the last `Hub` handle tears the connection down.

use crate::codec::{self, ToKey};
use crate::config::HubConfig;
use crate::consumer::{Callback, Consumer};
use crate::engine::{Engine, HubStats};
use crate::error::{HubError, HubResult};
use crate::fsm::{Effect, Input};
use crate::index::valid_topic;
use crate::outbound;
use crate::transport::ConnectionPool;
use crate::types::Event;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

pub(crate) struct Shared {
    config: HubConfig,
    runtime: Handle,
    engine: Mutex<Engine>,
    /// Retry timer task
    timer: Mutex<Option<AbortHandle>>,
    started: watch::Sender<Option<bool>>,
    stopped: watch::Sender<Option<bool>>,
}

impl Shared {
    /// Feed one input to the engine and perform the resulting effects.
    fn drive(self: &Arc<Self>, input: Input) {
        self.with_engine(|engine| engine.handle(input));
    }

    /// Run `f` under the engine lock, then perform queued effects.
    pub(crate) fn with_engine<R>(self: &Arc<Self>, f: impl FnOnce(&mut Engine) -> R) -> R {
        let (result, effects) = {
            let mut engine = self.engine.lock();
            let result = f(&mut engine);
            (result, engine.take_effects())
        };

        for effect in effects {
            self.apply(effect);
        }
        result
    }

    fn apply(self: &Arc<Self>, effect: Effect) {
        let hub = Arc::downgrade(self);

        match effect {
            Effect::Connect { epoch, pool } => {
                self.runtime.spawn(async move {
                    let result = pool.connect().await;
                    match hub.upgrade() {
                        Some(shared) => shared.drive(Input::ConnectResult { epoch, result }),
                        None => {
                            if let Ok(connected) = result {
                                connected.connection.release(true);
                            }
                        }
                    }
                });
            }
            Effect::Listen { epoch, mut events } => {
                self.runtime.spawn(async move {
                    while let Some(event) = events.recv().await {
                        let Some(shared) = hub.upgrade() else {
                            break;
                        };
                        shared.drive((epoch, event).into());
                    }
                });
            }
            Effect::Query { epoch, connection, statement } => {
                self.runtime.spawn(async move {
                    let result = connection.query(&statement).await;
                    if let Some(shared) = hub.upgrade() {
                        shared.drive(Input::QueryResult { epoch, result });
                    }
                });
            }
            Effect::Release { connection, discard } => connection.release(discard),
            Effect::ArmTimer { epoch, delay } => {
                let task = self.runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(shared) = hub.upgrade() {
                        shared.drive(Input::Timeout { epoch });
                    }
                });
                if let Some(previous) = self.timer.lock().replace(task.abort_handle()) {
                    previous.abort();
                }
            }
            Effect::CancelTimer => {
                if let Some(timer) = self.timer.lock().take() {
                    timer.abort();
                }
            }
            Effect::ResolveStart(started) => {
                self.started.send_replace(Some(started));
            }
            Effect::ResolveStop(stopped) => {
                self.stopped.send_replace(Some(stopped));
            }
            Effect::Flush => {
                self.runtime.spawn(async move {
                    if let Some(shared) = hub.upgrade() {
                        shared.flush();
                    }
                });
            }
        }
    }

    /// Drain the delivery queue, invoking callbacks without the lock held.
    fn flush(&self) {
        self.engine.lock().dispatch.begin();

        loop {
            let batch = self.engine.lock().dispatch.take();
            if batch.is_empty() {
                break;
            }

            for delivery in batch {
                delivery.consumer.deliver(&delivery.event);
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let engine = self.engine.get_mut();
        if let Some(connection) = engine.connection.take() {
            connection.release(true);
        }
        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
    }
}

/// Reliable publish/subscribe hub over a notification channel transport.
///
/// # Example
///
/// ```rust,no_run
/// use pg_hub::{Hub, HubConfig, MemoryPool};
/// use serde_json::json;
///
/// # async fn example() -> pg_hub::HubResult<()> {
/// let hub = Hub::new(MemoryPool::new(), HubConfig::default());
///
/// let consumer = hub
///     .consumer(|event, _consumer| println!("{:?}", event))
///     .ok_or(pg_hub::HubError::Stopped)?;
/// consumer.subscribe("orders")?;
///
/// if hub.start().await {
///     hub.notify("orders", &[42u64], &json!({ "status": "paid" }))?;
/// }
///
/// hub.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Hub {
    shared: Arc<Shared>,
}

impl Hub {
    /// Create a hub over a connection pool.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(pool: impl ConnectionPool + 'static, config: HubConfig) -> Self {
        Self::with_shared_pool(Arc::new(pool), config)
    }

    /// Create a hub over a pool shared with other users.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn with_shared_pool(pool: Arc<dyn ConnectionPool>, config: HubConfig) -> Self {
        let engine = Engine::new(&config, pool);

        Self {
            shared: Arc::new(Shared {
                runtime: Handle::current(),
                engine: Mutex::new(engine),
                timer: Mutex::new(None),
                started: watch::Sender::new(None),
                stopped: watch::Sender::new(None),
                config,
            }),
        }
    }

    /// Get the hub name.
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Get the hub configuration.
    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    /// Start the hub.
    ///
    /// The call takes effect immediately; the returned future resolves to
    /// `true` once the first connection is established, or to `false` if the
    /// hub is stopped first. Every call observes the same
    /// outcome.
    pub fn start(&self) -> impl Future<Output = bool> + Send + 'static {
        self.shared.drive(Input::Start);
        wait_resolved(self.shared.started.subscribe())
    }

    /// Stop the hub.
    ///
    /// Every live consumer receives a final `stop` event. The call takes
    /// effect immediately; the returned future resolves to `true` once the
    /// hub is torn down.
    pub fn stop(&self) -> impl Future<Output = bool> + Send + 'static {
        self.shared.drive(Input::Stop);
        wait_resolved(self.shared.stopped.subscribe())
    }

    /// Broadcast an event on `topic`.
    ///
    /// Success means the event was queued, not delivered. Events queued
    /// while connected survive a reconnect and are sent in order.
    pub fn notify<K, V>(&self, topic: &str, keys: &[K], value: &V) -> HubResult<()>
    where
        K: ToKey,
        V: Serialize + ?Sized,
    {
        if !valid_topic(topic) {
            return Err(HubError::InvalidTopic(topic.to_string()));
        }

        let payload = codec::encode(keys, value)?;
        let limit = self.shared.config.max_payload_bytes;
        if payload.len() > limit {
            return Err(HubError::PayloadTooLarge { size: payload.len(), limit });
        }

        let statement = outbound::notify(topic, &payload);
        self.shared.with_engine(|engine| engine.enqueue_notify(topic, statement))
    }

    /// Create a consumer.
    ///
    /// Returns `None` if the hub is stopped.
    pub fn consumer<F>(&self, callback: F) -> Option<Consumer>
    where
        F: Fn(&Event, &Consumer) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let hub = Arc::downgrade(&self.shared);

        self.shared
            .with_engine(|engine| engine.register(|id| Consumer::new(id, hub, callback)))
    }

    /// Create a consumer whose events are forwarded to a channel.
    ///
    /// The channel closes after the final event.
    pub fn consumer_channel(&self) -> Option<(Consumer, mpsc::UnboundedReceiver<Event>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let tx = Mutex::new(Some(tx));

        let consumer = self.consumer(move |event, _| {
            let mut slot = tx.lock();
            if let Some(sender) = slot.as_ref() {
                // Receiver may be gone; the consumer keeps running regardless.
                let _ = sender.send(event.clone());
            }
            if event.is_final() {
                slot.take();
            }
        })?;

        Some((consumer, rx))
    }

    /// Number of live consumers.
    pub fn consumer_count(&self) -> usize {
        self.shared.engine.lock().consumer_count()
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.shared.engine.lock().topic_count()
    }

    /// Snapshot of the statistics counters.
    pub fn stats(&self) -> HubStats {
        self.shared.engine.lock().stats.clone()
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let engine = self.shared.engine.lock();
        f.debug_struct("Hub")
            .field("name", &self.shared.config.name)
            .field("state", &engine.state)
            .field("consumers", &engine.consumer_count())
            .field("topics", &engine.topic_count())
            .finish()
    }
}

async fn wait_resolved(mut outcome: watch::Receiver<Option<bool>>) -> bool {
    match outcome.wait_for(Option::is_some).await {
        Ok(value) => value.unwrap_or(false),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connected, TransportError, TransportResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RefusingPool {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionPool for RefusingPool {
        async fn connect(&self) -> TransportResult<Connected> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Connect("connection refused".to_string()))
        }
    }

    fn refusing_hub() -> (Hub, Arc<RefusingPool>) {
        let pool = Arc::new(RefusingPool { attempts: AtomicUsize::new(0) });
        let hub = Hub::with_shared_pool(pool.clone(), HubConfig::default().with_name("refusing"));
        (hub, pool)
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let (hub, _) = refusing_hub();

        let stop = hub.stop();
        let start = hub.start();

        assert!(stop.await);
        assert!(!start.await);
        assert!(hub.consumer(|_, _| {}).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_stopped() {
        let (hub, pool) = refusing_hub();
        let start = hub.start();

        tokio::time::sleep(hub.config().reconnect_delay() * 3).await;
        tokio::task::yield_now().await;
        assert!(pool.attempts.load(Ordering::SeqCst) >= 3);
        assert!(hub.stats().connect_fail >= 3);

        assert!(hub.stop().await);
        assert!(!start.await);
    }

    #[tokio::test]
    async fn test_notify_validation() {
        let (hub, _) = refusing_hub();

        assert_eq!(hub.notify("a-b", &[1u64], &()), Err(HubError::InvalidTopic("a-b".to_string())));
        assert!(matches!(hub.notify("t", &["x"], &()), Err(HubError::Encode(_))));
        assert_eq!(hub.notify("t", &[1u64], &()), Err(HubError::NotReady));

        let big = "x".repeat(8000);
        assert!(matches!(hub.notify("t", &[1u64], &big), Err(HubError::PayloadTooLarge { limit: 7999, .. })));

        hub.stop().await;
        assert_eq!(hub.notify("t", &[1u64], &()), Err(HubError::Stopped));
    }

    #[tokio::test]
    async fn test_debug_output() {
        let (hub, _) = refusing_hub();
        let text = format!("{:?}", hub);

        assert!(text.contains("refusing"));
        assert!(text.contains("Init"));
    }
}

//! Consumer handles
//!
//! A consumer is a delivery callback plus a set of topic memberships, owned
//! by the hub that created it. Handles are cheap to clone; every clone
//! refers to the same consumer.

use crate::error::{HubError, HubResult};
use crate::hub::Shared;
use crate::types::Event;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Consumer identifier, unique within a hub and increasing in creation order.
pub type ConsumerId = u64;

/// Delivery callback.
///
/// Runs on the hub's flush task without any hub lock held, so it may call
/// back into the hub (subscribe, notify, close).
pub type Callback = Arc<dyn Fn(&Event, &Consumer) + Send + Sync>;

/// Subscriber handle.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    id: ConsumerId,
    hub: Weak<Shared>,
    closed: AtomicBool,
    /// Dropped after the final event is delivered
    callback: Mutex<Option<Callback>>,
}

impl Consumer {
    pub(crate) fn new(id: ConsumerId, hub: Weak<Shared>, callback: Callback) -> Self {
        Self {
            inner: Arc::new(ConsumerInner {
                id,
                hub,
                closed: AtomicBool::new(false),
                callback: Mutex::new(Some(callback)),
            }),
        }
    }

    /// Create a consumer that belongs to no hub.
    #[cfg(test)]
    pub(crate) fn detached<F>(id: ConsumerId, callback: F) -> Self
    where
        F: Fn(&Event, &Consumer) + Send + Sync + 'static,
    {
        Self::new(id, Weak::new(), Arc::new(callback))
    }

    /// Get the consumer ID.
    pub fn id(&self) -> ConsumerId {
        self.inner.id
    }

    /// Check if the consumer has been closed, explicitly or by hub stop.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Subscribe to a topic.
    ///
    /// Each new subscription is confirmed by a `subscribe` control event.
    /// Subscribing to a topic twice is a no-op.
    pub fn subscribe(&self, topic: &str) -> HubResult<()> {
        self.subscribe_all([topic])
    }

    /// Subscribe to several topics at once.
    ///
    /// Every name is validated before any subscription is made; one invalid
    /// name fails the whole call.
    pub fn subscribe_all<I, S>(&self, topics: I) -> HubResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let topics: Vec<String> = topics.into_iter().map(|t| t.as_ref().to_string()).collect();
        let hub = self.inner.hub.upgrade().ok_or(HubError::Stopped)?;

        hub.with_engine(|engine| engine.subscribe(self.id(), &topics))
    }

    /// Topics this consumer is subscribed to, in name order.
    pub fn topics(&self) -> Vec<String> {
        match self.inner.hub.upgrade() {
            Some(hub) => hub.with_engine(|engine| engine.topics_of(self.id())),
            None => Vec::new(),
        }
    }

    /// Close the consumer.
    ///
    /// Drops every subscription and delivers a final `close` event. Closing
    /// an already closed consumer does nothing.
    pub fn close(&self) {
        match self.inner.hub.upgrade() {
            Some(hub) => hub.with_engine(|engine| engine.close(self.id())),
            None => self.mark_closed(),
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Invoke the callback for one event.
    ///
    /// Non-final events are skipped once the consumer is closed. The final
    /// event is the last invocation: the callback is dropped before it runs.
    pub(crate) fn deliver(&self, event: &Event) {
        let callback = {
            let mut slot = self.inner.callback.lock();
            if event.is_final() {
                self.mark_closed();
                slot.take()
            } else if self.is_closed() {
                None
            } else {
                slot.clone()
            }
        };

        let Some(callback) = callback else {
            return;
        };

        if catch_unwind(AssertUnwindSafe(|| callback(event, self))).is_err() {
            tracing::error!(consumer = self.id(), "Consumer callback panicked");
        }
    }
}

impl PartialEq for Consumer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Consumer {}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Action;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting() -> (Consumer, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let consumer = Consumer::detached(1, move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (consumer, count)
    }

    #[test]
    fn test_final_event_is_last() {
        let (consumer, count) = counting();

        consumer.deliver(&Event::data("t", vec![1], json!(1)));
        consumer.deliver(&Event::control(Action::Close));
        consumer.deliver(&Event::data("t", vec![2], json!(2)));
        consumer.deliver(&Event::control(Action::Stop));

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(consumer.is_closed());
    }

    #[test]
    fn test_closed_consumer_still_gets_pending_final() {
        let (consumer, count) = counting();
        consumer.mark_closed();

        consumer.deliver(&Event::data("t", vec![], json!(null)));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        consumer.deliver(&Event::control(Action::Stop));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let consumer = Consumer::detached(9, |_, _| panic!("consumer bug"));

        consumer.deliver(&Event::control(Action::Connect));
        consumer.deliver(&Event::control(Action::Stop));
        assert!(consumer.is_closed());
    }

    #[test]
    fn test_detached_consumer_operations() {
        let (consumer, _) = counting();

        assert_eq!(consumer.subscribe("orders"), Err(HubError::Stopped));
        assert!(consumer.topics().is_empty());

        consumer.close();
        assert!(consumer.is_closed());
        assert_eq!(consumer.clone(), consumer);
    }
}

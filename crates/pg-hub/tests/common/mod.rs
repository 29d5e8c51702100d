//! Shared helpers for hub integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use pg_hub::{Action, Consumer, Event, Hub, HubConfig};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for any condition to become true.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Config with a short reconnect delay.
pub fn test_config(name: &str) -> HubConfig {
    HubConfig::default()
        .with_name(name)
        .with_reconnect_delay(Duration::from_millis(20))
}

/// Poll `condition` until it holds, panicking after [`TEST_TIMEOUT`].
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let result = tokio::time::timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    if result.is_err() {
        panic!("Timeout waiting for {what}");
    }
}

/// Records every event delivered to the consumers it is attached to.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a consumer on `hub` that records into this recorder.
    pub fn attach(&self, hub: &Hub) -> Consumer {
        let events = self.events.clone();
        hub.consumer(move |event, _| events.lock().push(event.clone()))
            .expect("hub is not stopped")
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Data events only, in delivery order.
    pub fn data(&self) -> Vec<Event> {
        self.events.lock().iter().filter(|e| !e.is_control()).cloned().collect()
    }

    /// Control actions only, in delivery order.
    pub fn actions(&self) -> Vec<Action> {
        self.events.lock().iter().filter_map(Event::action).collect()
    }

    pub fn count(&self, action: Action) -> usize {
        self.actions().into_iter().filter(|a| *a == action).count()
    }

    /// First key of every data event.
    pub fn first_keys(&self) -> Vec<u64> {
        self.data().iter().filter_map(|e| e.keys().first().copied()).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }
}

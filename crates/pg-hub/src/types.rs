//! Event types delivered to consumers
//!
//! This module defines the immutable event envelope handed to consumer
//! callbacks. Data events are decoded from broadcast payloads and carry a
//! topic, an ordered key list and a JSON value. Control events carry no topic
//! and describe lifecycle changes of the hub or of the receiving consumer.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

/// Lifecycle action carried by a control event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// The hub established its first connection
    Connect,
    /// The hub re-established a lost connection
    Reconnect,
    /// The hub lost its connection and is reconnecting
    Disconnect,
    /// The consumer joined a topic
    Subscribe,
    /// The consumer was closed (final)
    Close,
    /// The hub was stopped (final)
    Stop,
}

impl Action {
    /// Wire name of the action, as found in the control event's value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Connect => "connect",
            Action::Reconnect => "reconnect",
            Action::Disconnect => "disconnect",
            Action::Subscribe => "subscribe",
            Action::Close => "close",
            Action::Stop => "stop",
        }
    }

    /// Whether no further delivery follows this action for the consumer.
    pub fn is_final(&self) -> bool {
        matches!(self, Action::Close | Action::Stop)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event delivered to a consumer.
///
/// Events are immutable and cheap to clone: every consumer subscribed to a
/// topic receives a handle to the same decoded value.
#[derive(Clone, PartialEq)]
pub struct Event {
    inner: Arc<EventInner>,
}

#[derive(Debug, PartialEq)]
struct EventInner {
    /// Topic name; `None` for control events
    topic: Option<String>,

    /// Ordered key sequence, possibly empty
    keys: Vec<u64>,

    /// Event value (`Null` when absent)
    value: Value,

    /// Control action; `None` for data events
    action: Option<Action>,
}

impl Event {
    /// Create a data event.
    pub(crate) fn data(topic: impl Into<String>, keys: Vec<u64>, value: Value) -> Self {
        Self {
            inner: Arc::new(EventInner {
                topic: Some(topic.into()),
                keys,
                value,
                action: None,
            }),
        }
    }

    /// Create a control event for a hub-wide or consumer-wide action.
    pub(crate) fn control(action: Action) -> Self {
        Self::control_with_value(
            action,
            json!({ "action": action.as_str(), "final": action.is_final() }),
        )
    }

    /// Create the control event confirming a subscription to `topic`.
    pub(crate) fn subscribed(topic: &str) -> Self {
        Self::control_with_value(
            Action::Subscribe,
            json!({ "action": Action::Subscribe.as_str(), "topic": topic, "final": false }),
        )
    }

    fn control_with_value(action: Action, value: Value) -> Self {
        Self {
            inner: Arc::new(EventInner {
                topic: None,
                keys: Vec::new(),
                value,
                action: Some(action),
            }),
        }
    }

    /// Topic the event was broadcast on, or `None` for control events.
    pub fn topic(&self) -> Option<&str> {
        self.inner.topic.as_deref()
    }

    /// Ordered key sequence.
    pub fn keys(&self) -> &[u64] {
        &self.inner.keys
    }

    /// Event value.
    ///
    /// For control events this is an object with `action` and `final`
    /// members (and `topic` for subscribe confirmations).
    pub fn value(&self) -> &Value {
        &self.inner.value
    }

    /// Control action, or `None` for data events.
    pub fn action(&self) -> Option<Action> {
        self.inner.action
    }

    /// Check if this is a control event.
    pub fn is_control(&self) -> bool {
        self.inner.action.is_some()
    }

    /// Check if this is the last event the consumer will receive.
    pub fn is_final(&self) -> bool {
        self.inner.action.map(|a| a.is_final()).unwrap_or(false)
    }

    /// Topic confirmed by a subscribe control event.
    pub fn subscribed_topic(&self) -> Option<&str> {
        match self.inner.action {
            Some(Action::Subscribe) => self.inner.value.get("topic").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Parse the value into a specific type.
    pub fn parse_value<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.inner.value)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.action {
            Some(action) => f
                .debug_struct("Event")
                .field("action", &action)
                .field("value", &self.inner.value)
                .finish(),
            None => f
                .debug_struct("Event")
                .field("topic", &self.inner.topic)
                .field("keys", &self.inner.keys)
                .field("value", &self.inner.value)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_event_shape() {
        let event = Event::control(Action::Stop);

        assert!(event.is_control());
        assert!(event.is_final());
        assert_eq!(event.topic(), None);
        assert!(event.keys().is_empty());
        assert_eq!(event.value()["action"], "stop");
        assert_eq!(event.value()["final"], true);
    }

    #[test]
    fn test_subscribe_event_names_topic() {
        let event = Event::subscribed("orders");

        assert_eq!(event.action(), Some(Action::Subscribe));
        assert!(!event.is_final());
        assert_eq!(event.subscribed_topic(), Some("orders"));
        assert_eq!(Event::control(Action::Connect).subscribed_topic(), None);
    }

    #[test]
    fn test_data_event_accessors() {
        let event = Event::data("orders", vec![1, 2], json!({ "n": 1 }));

        assert!(!event.is_control());
        assert!(!event.is_final());
        assert_eq!(event.topic(), Some("orders"));
        assert_eq!(event.keys(), &[1, 2]);

        #[derive(Deserialize)]
        struct Order {
            n: u32,
        }

        let order: Order = event.parse_value().unwrap();
        assert_eq!(order.n, 1);
    }

    #[test]
    fn test_clones_share_value() {
        let event = Event::data("t", vec![], json!([1, 2, 3]));
        let copy = event.clone();

        assert!(std::ptr::eq(event.value(), copy.value()));
        assert_eq!(event, copy);
    }

    #[test]
    fn test_final_actions() {
        assert!(Action::Close.is_final());
        assert!(Action::Stop.is_final());
        assert!(!Action::Connect.is_final());
        assert!(!Action::Reconnect.is_final());
        assert!(!Action::Disconnect.is_final());
        assert!(!Action::Subscribe.is_final());
        assert_eq!(Action::Reconnect.to_string(), "reconnect");
    }
}

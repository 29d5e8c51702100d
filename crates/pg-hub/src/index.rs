//! Topic / consumer subscription index
//!
//! Maps each topic to the consumers watching it, and each consumer to its
//! topics. A topic entry exists only while its subscriber set is non-empty;
//! the caller turns the opened/closed transitions reported here into listen
//! and unlisten statements.

use crate::consumer::ConsumerId;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Check a topic name against `^[A-Za-z0-9_]+$`.
pub fn valid_topic(topic: &str) -> bool {
    !topic.is_empty() && topic.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Outcome of adding a consumer to a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Membership {
    /// The consumer joined; `opened` if it is the topic's first subscriber
    Joined { opened: bool },
    /// The consumer was already subscribed
    AlreadyMember,
}

/// A subscription dropped by [`SubscriptionIndex::remove_consumer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Departure {
    pub topic: String,
    /// The topic has no subscribers left and its entry was deleted
    pub closed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct SubscriptionIndex {
    /// Subscriber sets, ordered by consumer creation
    topics: BTreeMap<String, BTreeSet<ConsumerId>>,
    /// Inverse view per consumer
    memberships: HashMap<ConsumerId, BTreeSet<String>>,
}

impl SubscriptionIndex {
    pub(crate) fn subscribe(&mut self, consumer: ConsumerId, topic: &str) -> Membership {
        let topics = self.memberships.entry(consumer).or_default();
        if topics.contains(topic) {
            return Membership::AlreadyMember;
        }
        topics.insert(topic.to_string());

        let opened = !self.topics.contains_key(topic);
        self.topics.entry(topic.to_string()).or_default().insert(consumer);

        Membership::Joined { opened }
    }

    /// Remove the consumer from every topic it belongs to.
    pub(crate) fn remove_consumer(&mut self, consumer: ConsumerId) -> Vec<Departure> {
        let Some(topics) = self.memberships.remove(&consumer) else {
            return Vec::new();
        };

        topics
            .into_iter()
            .map(|topic| {
                let closed = match self.topics.get_mut(&topic) {
                    Some(subscribers) => {
                        subscribers.remove(&consumer);
                        subscribers.is_empty()
                    }
                    None => false,
                };
                if closed {
                    self.topics.remove(&topic);
                }
                Departure { topic, closed }
            })
            .collect()
    }

    /// Subscribers of `topic`, or `None` if nobody watches it.
    pub(crate) fn subscribers(&self, topic: &str) -> Option<&BTreeSet<ConsumerId>> {
        self.topics.get(topic)
    }

    /// Active topics in name order.
    pub(crate) fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    /// Topics the consumer is subscribed to, in name order.
    pub(crate) fn topics_of(&self, consumer: ConsumerId) -> Vec<String> {
        self.memberships
            .get(&consumer)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub(crate) fn clear(&mut self) {
        self.topics.clear();
        self.memberships.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_validation() {
        assert!(valid_topic("orders"));
        assert!(valid_topic("test_topic_0"));
        assert!(valid_topic("ABC123"));

        assert!(!valid_topic(""));
        assert!(!valid_topic("a-b-c"));
        assert!(!valid_topic("()"));
        assert!(!valid_topic("()=>{return true;}"));
        assert!(!valid_topic("orders; drop table x"));
        assert!(!valid_topic("caf\u{e9}"));
        assert!(!valid_topic("a\"b"));
    }

    #[test]
    fn test_first_subscriber_opens_topic() {
        let mut index = SubscriptionIndex::default();

        assert_eq!(index.subscribe(1, "orders"), Membership::Joined { opened: true });
        assert_eq!(index.subscribe(2, "orders"), Membership::Joined { opened: false });
        assert_eq!(index.subscribe(1, "orders"), Membership::AlreadyMember);
        assert_eq!(index.topic_count(), 1);

        let subscribers: Vec<_> = index.subscribers("orders").unwrap().iter().copied().collect();
        assert_eq!(subscribers, vec![1, 2]);
    }

    #[test]
    fn test_last_subscriber_closes_topic() {
        let mut index = SubscriptionIndex::default();
        index.subscribe(1, "a");
        index.subscribe(1, "b");
        index.subscribe(2, "b");

        let departures = index.remove_consumer(1);
        assert_eq!(
            departures,
            vec![
                Departure { topic: "a".to_string(), closed: true },
                Departure { topic: "b".to_string(), closed: false },
            ]
        );
        assert!(index.subscribers("a").is_none());
        assert_eq!(index.topics().collect::<Vec<_>>(), vec!["b"]);

        assert!(index.remove_consumer(1).is_empty());
        assert_eq!(index.remove_consumer(2).len(), 1);
        assert_eq!(index.topic_count(), 0);
    }

    #[test]
    fn test_topics_of_consumer() {
        let mut index = SubscriptionIndex::default();
        index.subscribe(7, "zeta");
        index.subscribe(7, "alpha");

        assert_eq!(index.topics_of(7), vec!["alpha".to_string(), "zeta".to_string()]);
        assert!(index.topics_of(8).is_empty());

        index.clear();
        assert!(index.topics_of(7).is_empty());
        assert_eq!(index.topic_count(), 0);
    }
}

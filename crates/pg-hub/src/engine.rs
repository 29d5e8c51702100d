//! Hub engine state
//!
//! The engine owns everything the hub mutates: lifecycle state, outbound
//! queues, subscription index, live consumers, the delivery queue and the
//! statistics. It performs no I/O. Operations that need the outside world
//! append an [`Effect`] which the hub performs after releasing the engine
//! lock.

use crate::config::HubConfig;
use crate::consumer::{Consumer, ConsumerId};
use crate::dispatch::DispatchQueue;
use crate::error::{HubError, HubResult};
use crate::fsm::{Effect, Input, State};
use crate::index::{valid_topic, Departure, Membership, SubscriptionIndex};
use crate::outbound::{self, Outbound};
use crate::transport::{Connection, ConnectionPool};
use crate::types::{Action, Event};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Listen / unlisten statements completed
    pub listens: i64,
    /// Notify statements completed
    pub sent: i64,
    /// Notifications received on the live connection
    pub received: i64,
    /// Notifications dropped for a malformed payload
    pub received_error: i64,
    /// Notifications dropped for a channel nobody subscribes to
    pub received_unroutable: i64,
    /// Connections established
    pub connect: i64,
    /// Connection attempts failed
    pub connect_fail: i64,
    /// Established connections lost
    pub connect_loss: i64,
}

pub(crate) struct Engine {
    pub(crate) name: String,
    pub(crate) reconnect_delay: Duration,
    pub(crate) state: State,
    /// Generation of the current connection attempt
    pub(crate) epoch: u64,
    pub(crate) ever_connected: bool,
    pub(crate) start_resolved: bool,
    pub(crate) pool: Option<Arc<dyn ConnectionPool>>,
    pub(crate) connection: Option<Arc<dyn Connection>>,
    pub(crate) timer_armed: bool,
    pub(crate) outbound: Outbound,
    pub(crate) index: SubscriptionIndex,
    /// Live consumers in creation order
    pub(crate) consumers: BTreeMap<ConsumerId, Consumer>,
    pub(crate) dispatch: DispatchQueue,
    pub(crate) stats: HubStats,
    pub(crate) effects: Vec<Effect>,
    /// Nesting depth of `handle`; anything above one is a bug
    pub(crate) entrancy: u32,
    next_consumer_id: ConsumerId,
}

impl Engine {
    pub(crate) fn new(config: &HubConfig, pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            name: config.name.clone(),
            reconnect_delay: config.reconnect_delay(),
            state: State::Init,
            epoch: 0,
            ever_connected: false,
            start_resolved: false,
            pool: Some(pool),
            connection: None,
            timer_armed: false,
            outbound: Outbound::default(),
            index: SubscriptionIndex::default(),
            consumers: BTreeMap::new(),
            dispatch: DispatchQueue::default(),
            stats: HubStats::default(),
            effects: Vec::new(),
            entrancy: 0,
            next_consumer_id: 0,
        }
    }

    /// Register a consumer built by `make` with a fresh ID.
    ///
    /// Returns `None` once the hub is stopped.
    pub(crate) fn register(&mut self, make: impl FnOnce(ConsumerId) -> Consumer) -> Option<Consumer> {
        if self.state == State::Stopped {
            return None;
        }

        let id = self.next_consumer_id;
        self.next_consumer_id += 1;

        let consumer = make(id);
        self.consumers.insert(id, consumer.clone());
        tracing::debug!(name = %self.name, consumer = id, "Consumer created");

        Some(consumer)
    }

    pub(crate) fn subscribe(&mut self, id: ConsumerId, topics: &[String]) -> HubResult<()> {
        if self.state == State::Stopped {
            return Err(HubError::Stopped);
        }

        let consumer = match self.consumers.get(&id) {
            Some(consumer) if !consumer.is_closed() => consumer.clone(),
            _ => return Err(HubError::ConsumerClosed),
        };

        if let Some(invalid) = topics.iter().find(|topic| !valid_topic(topic)) {
            return Err(HubError::InvalidTopic(invalid.clone()));
        }

        let mut queued = false;
        for topic in topics {
            match self.index.subscribe(id, topic) {
                Membership::Joined { opened } => {
                    if opened {
                        tracing::info!(name = %self.name, topic = %topic, "Topic opened");
                        self.outbound.push_control(outbound::listen(topic));
                        queued = true;
                    }
                    tracing::debug!(name = %self.name, consumer = id, topic = %topic, "Subscription started");
                    self.dispatch.push(consumer.clone(), Event::subscribed(topic));
                }
                Membership::AlreadyMember => {}
            }
        }

        if queued {
            self.handle(Input::QueueRequest);
        }
        self.schedule_flush();

        Ok(())
    }

    /// Close a consumer: drop its subscriptions and queue its final event.
    pub(crate) fn close(&mut self, id: ConsumerId) {
        let Some(consumer) = self.consumers.remove(&id) else {
            return;
        };
        consumer.mark_closed();

        let mut queued = false;
        for Departure { topic, closed } in self.index.remove_consumer(id) {
            tracing::debug!(name = %self.name, consumer = id, topic = %topic, "Subscription ended");
            if closed {
                tracing::info!(name = %self.name, topic = %topic, "Topic closed");
                self.outbound.push_control(outbound::unlisten(&topic));
                queued = true;
            }
        }

        if queued {
            self.handle(Input::QueueRequest);
        }

        tracing::debug!(name = %self.name, consumer = id, "Consumer closed");
        self.dispatch.push(consumer, Event::control(Action::Close));
        self.schedule_flush();
    }

    /// Queue a notify statement if the hub can accept broadcasts.
    pub(crate) fn enqueue_notify(&mut self, topic: &str, statement: String) -> HubResult<()> {
        self.accepting()?;

        tracing::debug!(name = %self.name, topic = %topic, "Notify queued");
        self.outbound.push_data(statement);
        self.handle(Input::QueueRequest);

        Ok(())
    }

    /// Check if broadcasts are accepted in the current state.
    ///
    /// Work is accepted while connected, and while connecting for the first
    /// time so producers may notify right after `start`.
    pub(crate) fn accepting(&self) -> HubResult<()> {
        match self.state {
            State::Stopped => Err(HubError::Stopped),
            State::Connected | State::Querying => Ok(()),
            State::Connecting if !self.ever_connected => Ok(()),
            State::Init | State::Connecting | State::Waiting => Err(HubError::NotReady),
        }
    }

    /// Queue the same control event for every live consumer.
    pub(crate) fn broadcast(&mut self, action: Action) {
        let event = Event::control(action);
        for consumer in self.consumers.values() {
            self.dispatch.push(consumer.clone(), event.clone());
        }
        self.schedule_flush();
    }

    pub(crate) fn schedule_flush(&mut self) {
        if self.dispatch.schedule() {
            self.effects.push(Effect::Flush);
        }
    }

    pub(crate) fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub(crate) fn topics_of(&self, id: ConsumerId) -> Vec<String> {
        self.index.topics_of(id)
    }

    pub(crate) fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub(crate) fn topic_count(&self) -> usize {
        self.index.topic_count()
    }
}

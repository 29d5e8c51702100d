//! Connection lifecycle state machine
//!
//! ```text
//! init -> connecting -> { waiting, connected }
//! waiting -> connecting            (retry timer)
//! connected <-> querying           (one statement in flight)
//! connected/querying -> connecting (connection lost)
//! any -> stopped                   (terminal)
//! ```
//!
//! Every trigger is an [`Input`] processed to completion under the engine
//! lock. Inputs produced by a specific connection attempt carry its epoch;
//! inputs from a superseded attempt are logged and dropped.

use crate::codec;
use crate::engine::Engine;
use crate::outbound::Lane;
use crate::transport::{
    Connected, Connection, ConnectionEvent, ConnectionPool, Notification, TransportError, TransportResult,
};
use crate::types::{Action, Event};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Init,
    Connecting,
    /// Waiting for the retry timer after a failed connect
    Waiting,
    Connected,
    /// A statement is in flight
    Querying,
    Stopped,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Init => "init",
            State::Connecting => "connecting",
            State::Waiting => "waiting",
            State::Connected => "connected",
            State::Querying => "querying",
            State::Stopped => "stopped",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) enum Input {
    Start,
    Stop,
    /// New outbound work was queued
    QueueRequest,
    ConnectResult { epoch: u64, result: TransportResult<Connected> },
    QueryResult { epoch: u64, result: TransportResult<()> },
    Timeout { epoch: u64 },
    Notification { epoch: u64, notification: Notification },
    Error { epoch: u64, error: TransportError },
}

impl Input {
    fn name(&self) -> &'static str {
        match self {
            Input::Start => "start",
            Input::Stop => "stop",
            Input::QueueRequest => "queue_request",
            Input::ConnectResult { .. } => "connect_result",
            Input::QueryResult { .. } => "query_result",
            Input::Timeout { .. } => "timeout",
            Input::Notification { .. } => "notification",
            Input::Error { .. } => "error",
        }
    }
}

impl From<(u64, ConnectionEvent)> for Input {
    fn from((epoch, event): (u64, ConnectionEvent)) -> Self {
        match event {
            ConnectionEvent::Notification(notification) => Input::Notification { epoch, notification },
            ConnectionEvent::Error(error) => Input::Error { epoch, error },
        }
    }
}

/// Side effect requested by the engine, performed outside the lock.
pub(crate) enum Effect {
    /// Check out a connection; completes with `Input::ConnectResult`
    Connect { epoch: u64, pool: Arc<dyn ConnectionPool> },
    /// Forward connection events as inputs tagged with `epoch`
    Listen { epoch: u64, events: mpsc::UnboundedReceiver<ConnectionEvent> },
    /// Run one statement; completes with `Input::QueryResult`
    Query { epoch: u64, connection: Arc<dyn Connection>, statement: String },
    Release { connection: Arc<dyn Connection>, discard: bool },
    /// Fire `Input::Timeout` after `delay`
    ArmTimer { epoch: u64, delay: Duration },
    CancelTimer,
    ResolveStart(bool),
    ResolveStop(bool),
    /// Spawn the delivery flush task
    Flush,
}

impl Engine {
    /// Process one input to completion.
    pub(crate) fn handle(&mut self, input: Input) {
        self.entrancy += 1;
        if self.entrancy > 1 {
            tracing::error!(name = %self.name, input = input.name(), "State machine reentrancy");
        }

        self.step(input);
        self.entrancy -= 1;
    }

    fn step(&mut self, input: Input) {
        match input {
            Input::Start => self.on_start(),
            Input::Stop => self.on_stop(),
            Input::QueueRequest => self.on_queue_request(),
            Input::ConnectResult { epoch, result } => self.on_connect_result(epoch, result),
            Input::QueryResult { epoch, result } => self.on_query_result(epoch, result),
            Input::Timeout { epoch } => self.on_timeout(epoch),
            Input::Notification { epoch, notification } => self.on_notification(epoch, notification),
            Input::Error { epoch, error } => self.on_error(epoch, error),
        }
    }

    fn on_start(&mut self) {
        if self.state == State::Init {
            self.begin_connect();
        }
    }

    fn on_stop(&mut self) {
        if self.state != State::Stopped {
            self.teardown();
        }
    }

    fn on_queue_request(&mut self) {
        if self.state == State::Connected {
            self.dispatch_query();
        }
    }

    fn on_connect_result(&mut self, epoch: u64, result: TransportResult<Connected>) {
        if self.state != State::Connecting || epoch != self.epoch {
            if self.state != State::Stopped {
                tracing::info!(name = %self.name, epoch, "Ignored late connect result");
            }
            if let Ok(connected) = result {
                self.effects.push(Effect::Release { connection: connected.connection, discard: true });
            }
            return;
        }

        match result {
            Ok(Connected { connection, events }) => {
                self.stats.connect += 1;
                self.connection = Some(connection);
                self.effects.push(Effect::Listen { epoch, events });

                self.outbound.abandon();
                self.outbound.resync(self.index.topics());

                if self.ever_connected {
                    tracing::info!(name = %self.name, epoch, "Reconnected");
                    self.broadcast(Action::Reconnect);
                } else {
                    tracing::info!(name = %self.name, epoch, "Connected");
                    self.ever_connected = true;
                    self.resolve_start(true);
                    self.broadcast(Action::Connect);
                }

                self.change_state(State::Connected);
                self.dispatch_query();
            }
            Err(e) => {
                self.stats.connect_fail += 1;
                tracing::warn!(
                    name = %self.name,
                    error = %e,
                    delay_ms = self.reconnect_delay.as_millis() as u64,
                    "Connect failed, retrying after delay"
                );
                self.change_state(State::Waiting);
                self.timer_armed = true;
                self.effects.push(Effect::ArmTimer { epoch, delay: self.reconnect_delay });
            }
        }
    }

    fn on_query_result(&mut self, epoch: u64, result: TransportResult<()>) {
        if self.state != State::Querying || epoch != self.epoch {
            self.ignore("query result", epoch);
            return;
        }

        match result {
            Ok(()) => {
                match self.outbound.complete() {
                    Some(Lane::Control) => self.stats.listens += 1,
                    Some(Lane::Data) => self.stats.sent += 1,
                    None => {}
                }
                self.dispatch_query();
            }
            Err(e) => {
                tracing::warn!(name = %self.name, error = %e, "Query failed");
                self.lose_connection();
            }
        }
    }

    fn on_timeout(&mut self, epoch: u64) {
        if self.state != State::Waiting || epoch != self.epoch {
            self.ignore("timeout", epoch);
            return;
        }

        self.timer_armed = false;
        self.begin_connect();
    }

    fn on_notification(&mut self, epoch: u64, notification: Notification) {
        if epoch != self.epoch {
            self.ignore("notification", epoch);
            return;
        }

        match self.state {
            State::Connected | State::Querying => self.route(notification),
            State::Stopped => {}
            state => self.unexpected("notification", state),
        }
    }

    fn on_error(&mut self, epoch: u64, error: TransportError) {
        if epoch != self.epoch {
            self.ignore("error", epoch);
            return;
        }

        match self.state {
            State::Connected | State::Querying => {
                tracing::warn!(name = %self.name, error = %error, "Connection error");
                self.lose_connection();
            }
            State::Stopped => {}
            state => self.unexpected("error", state),
        }
    }

    fn begin_connect(&mut self) {
        self.epoch += 1;
        self.change_state(State::Connecting);

        match &self.pool {
            Some(pool) => self.effects.push(Effect::Connect { epoch: self.epoch, pool: pool.clone() }),
            None => tracing::error!(name = %self.name, "No connection pool"),
        }
    }

    /// Issue the next queued statement, or fall back to connected when idle.
    fn dispatch_query(&mut self) {
        let Some(connection) = self.connection.clone() else {
            return;
        };

        match self.outbound.next() {
            Some(statement) => {
                tracing::debug!(name = %self.name, statement = %statement, "Executing statement");
                self.effects.push(Effect::Query { epoch: self.epoch, connection, statement });
                if self.state != State::Querying {
                    self.change_state(State::Querying);
                }
            }
            None => {
                if self.state == State::Querying && self.outbound.in_flight().is_none() {
                    self.change_state(State::Connected);
                }
            }
        }
    }

    fn lose_connection(&mut self) {
        self.stats.connect_loss += 1;
        self.outbound.abandon();

        if let Some(connection) = self.connection.take() {
            self.effects.push(Effect::Release { connection, discard: true });
        }

        self.broadcast(Action::Disconnect);
        self.begin_connect();
    }

    fn route(&mut self, notification: Notification) {
        self.stats.received += 1;

        let Some(subscribers) = self.index.subscribers(&notification.channel) else {
            self.stats.received_unroutable += 1;
            tracing::info!(name = %self.name, channel = %notification.channel, "Unroutable event");
            return;
        };

        let event = match codec::decode(&notification.channel, &notification.payload) {
            Ok(event) => event,
            Err(e) => {
                self.stats.received_error += 1;
                tracing::warn!(name = %self.name, channel = %notification.channel, error = %e, "Invalid event");
                return;
            }
        };

        for id in subscribers {
            if let Some(consumer) = self.consumers.get(id) {
                self.dispatch.push(consumer.clone(), event.clone());
            }
        }
        self.schedule_flush();
    }

    fn resolve_start(&mut self, started: bool) {
        if !self.start_resolved {
            self.start_resolved = true;
            self.effects.push(Effect::ResolveStart(started));
        }
    }

    fn teardown(&mut self) {
        self.change_state(State::Stopped);

        if self.timer_armed {
            self.timer_armed = false;
            self.effects.push(Effect::CancelTimer);
        }
        if let Some(connection) = self.connection.take() {
            self.effects.push(Effect::Release { connection, discard: true });
        }

        self.resolve_start(false);
        self.effects.push(Effect::ResolveStop(true));

        let stop = Event::control(Action::Stop);
        for consumer in std::mem::take(&mut self.consumers).into_values() {
            consumer.mark_closed();
            self.dispatch.push(consumer, stop.clone());
        }

        self.index.clear();
        self.outbound.clear();
        self.pool = None;
        self.schedule_flush();
    }

    fn change_state(&mut self, next: State) {
        if next == self.state {
            tracing::error!(name = %self.name, state = %next, "State change to same state");
            return;
        }

        tracing::debug!(name = %self.name, from = %self.state, to = %next, "State change");
        self.state = next;
    }

    fn ignore(&self, what: &str, epoch: u64) {
        tracing::info!(name = %self.name, epoch, current = self.epoch, state = %self.state, "Ignored late {}", what);
    }

    fn unexpected(&self, what: &str, state: State) {
        tracing::error!(name = %self.name, state = %state, "Unexpected {} input", what);
    }
}

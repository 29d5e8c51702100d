//! In-process notification server
//!
//! [`MemoryPool`] emulates the PostgreSQL LISTEN/NOTIFY primitive for a
//! single process. Each connection is a session with its own listen set;
//! `notify` reaches every session listening on the channel, the sender
//! included, in issue order.
//!
//! Understood statements:
//! - `listen <channel>`
//! - `unlisten <channel>` and `unlisten *`
//! - `notify <channel>,$$<payload>$$;`
//!
//! Channel identifiers follow PostgreSQL rules: quoted names are taken as
//! written, unquoted names are folded to lower case.
//!
//! The pool also offers fault injection and observation helpers so tests can
//! exercise reconnection and hostile producers.

use crate::transport::{
    Connected, Connection, ConnectionEvent, ConnectionPool, Notification, TransportError, TransportResult,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// PostgreSQL rejects NOTIFY payloads of this size or larger.
pub const PAYLOAD_LIMIT: usize = 8000;

/// In-process connection pool.
///
/// Clones share the same server.
#[derive(Clone, Default)]
pub struct MemoryPool {
    server: Arc<Mutex<Server>>,
}

#[derive(Default)]
struct Server {
    sessions: BTreeMap<u64, Session>,
    next_session: u64,
    connect_attempts: usize,
    failing_connects: usize,
    failing_queries: usize,
    /// Completed statements per session, kept after release
    executed: BTreeMap<u64, Vec<String>>,
}

struct Session {
    listening: BTreeSet<String>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

/// A parsed statement.
#[derive(Debug, PartialEq, Eq)]
enum Statement {
    Listen(String),
    Unlisten(String),
    UnlistenAll,
    Notify { channel: String, payload: String },
}

impl MemoryPool {
    /// Create a pool backed by a fresh server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: usize) {
        self.server.lock().failing_connects = count;
    }

    /// Fail the next `count` statements, on any session.
    pub fn fail_next_queries(&self, count: usize) {
        self.server.lock().failing_queries = count;
    }

    /// Raise a connection error on every live session and drop them.
    pub fn sever_all(&self) {
        let sessions = std::mem::take(&mut self.server.lock().sessions);

        for (id, session) in sessions {
            tracing::debug!(session = id, "Severing session");
            let _ = session
                .events
                .send(ConnectionEvent::Error(TransportError::ConnectionLost("terminated by administrator".to_string())));
        }
    }

    /// Broadcast a raw payload, bypassing any encoding.
    ///
    /// Returns the number of sessions reached.
    pub fn inject(&self, channel: &str, payload: &str) -> usize {
        self.server.lock().broadcast(channel, payload)
    }

    /// Completed statements, one list per session in connection order.
    pub fn executed(&self) -> Vec<Vec<String>> {
        self.server.lock().executed.values().cloned().collect()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.server.lock().sessions.len()
    }

    /// Number of sessions listening on `channel`.
    pub fn listener_count(&self, channel: &str) -> usize {
        self.server
            .lock()
            .sessions
            .values()
            .filter(|session| session.listening.contains(channel))
            .count()
    }

    /// Number of connection attempts, failed ones included.
    pub fn connect_attempts(&self) -> usize {
        self.server.lock().connect_attempts
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("sessions", &self.session_count())
            .finish()
    }
}

#[async_trait]
impl ConnectionPool for MemoryPool {
    async fn connect(&self) -> TransportResult<Connected> {
        tokio::task::yield_now().await;

        let mut server = self.server.lock();
        server.connect_attempts += 1;

        if server.failing_connects > 0 {
            server.failing_connects -= 1;
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let id = server.next_session;
        server.next_session += 1;

        let (tx, events) = mpsc::unbounded_channel();
        server.sessions.insert(id, Session { listening: BTreeSet::new(), events: tx });
        server.executed.insert(id, Vec::new());
        tracing::debug!(session = id, "Session opened");

        Ok(Connected {
            connection: Arc::new(MemoryConnection { id, server: self.server.clone() }),
            events,
        })
    }
}

struct MemoryConnection {
    id: u64,
    server: Arc<Mutex<Server>>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn query(&self, statement: &str) -> TransportResult<()> {
        tokio::task::yield_now().await;
        self.server.lock().execute(self.id, statement)
    }

    fn release(&self, discard: bool) {
        if self.server.lock().sessions.remove(&self.id).is_some() {
            tracing::debug!(session = self.id, discard, "Session released");
        }
    }
}

impl Server {
    fn execute(&mut self, id: u64, text: &str) -> TransportResult<()> {
        if !self.sessions.contains_key(&id) {
            return Err(TransportError::Closed);
        }

        if self.failing_queries > 0 {
            self.failing_queries -= 1;
            return Err(TransportError::Query("injected failure".to_string()));
        }

        let statement =
            parse(text).ok_or_else(|| TransportError::Query(format!("syntax error in statement: {text}")))?;

        match statement {
            Statement::Listen(channel) => {
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.listening.insert(channel);
                }
            }
            Statement::Unlisten(channel) => {
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.listening.remove(&channel);
                }
            }
            Statement::UnlistenAll => {
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.listening.clear();
                }
            }
            Statement::Notify { channel, payload } => {
                if payload.len() >= PAYLOAD_LIMIT {
                    return Err(TransportError::Query("payload string too long".to_string()));
                }
                self.broadcast(&channel, &payload);
            }
        }

        self.executed.entry(id).or_default().push(text.to_string());
        Ok(())
    }

    fn broadcast(&self, channel: &str, payload: &str) -> usize {
        let mut reached = 0;

        for session in self.sessions.values() {
            if session.listening.contains(channel) {
                let notification = Notification::new(channel, payload);
                if session.events.send(ConnectionEvent::Notification(notification)).is_ok() {
                    reached += 1;
                }
            }
        }

        reached
    }
}

fn parse(text: &str) -> Option<Statement> {
    let text = text.trim();
    let (keyword, rest) = text.split_once(char::is_whitespace)?;
    let rest = rest.trim_start();

    if keyword.eq_ignore_ascii_case("listen") {
        let (channel, tail) = identifier(rest)?;
        end_of_statement(tail).then_some(Statement::Listen(channel))
    } else if keyword.eq_ignore_ascii_case("unlisten") {
        if let Some(tail) = rest.strip_prefix('*') {
            return end_of_statement(tail).then_some(Statement::UnlistenAll);
        }
        let (channel, tail) = identifier(rest)?;
        end_of_statement(tail).then_some(Statement::Unlisten(channel))
    } else if keyword.eq_ignore_ascii_case("notify") {
        let (channel, tail) = identifier(rest)?;
        let literal = tail.trim_start().strip_prefix(',')?.trim_start().strip_prefix("$$")?;
        let (payload, tail) = literal.split_once("$$")?;
        end_of_statement(tail).then(|| Statement::Notify { channel, payload: payload.to_string() })
    } else {
        None
    }
}

/// Parse a leading identifier, returning it and the remaining text.
fn identifier(text: &str) -> Option<(String, &str)> {
    if let Some(quoted) = text.strip_prefix('"') {
        let mut name = String::new();
        let mut chars = quoted.char_indices();

        while let Some((i, c)) = chars.next() {
            if c != '"' {
                name.push(c);
                continue;
            }
            // A doubled quote stands for one quote character.
            if quoted[i + 1..].starts_with('"') {
                name.push('"');
                chars.next();
                continue;
            }
            return (!name.is_empty()).then(|| (name, &quoted[i + 1..]));
        }
        return None;
    }

    let end = text
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(text.len());
    let (name, rest) = text.split_at(end);
    let starts_with_digit = name.starts_with(|c: char| c.is_ascii_digit());

    (!name.is_empty() && !starts_with_digit).then(|| (name.to_ascii_lowercase(), rest))
}

fn end_of_statement(tail: &str) -> bool {
    matches!(tail.trim(), "" | ";")
}

//! # pg-hub
//!
//! A reliable publish/subscribe bus layered on PostgreSQL `LISTEN`/`NOTIFY`.
//!
//! ## Overview
//!
//! The hub holds one dedicated database connection and multiplexes any
//! number of consumers over it:
//! - **Consumers**: callbacks subscribed to named topics
//! - **Events**: an ordered list of integer keys plus a JSON value
//! - **Reconnection**: lost connections are re-established with a fixed
//!   delay and every active topic is listened to again
//! - **Control events**: consumers learn about connect, disconnect,
//!   reconnect, subscribe, close and stop through events with no topic
//!
//! Delivery follows the underlying primitive: at most once, and events
//! broadcast while the hub is disconnected are lost.
//!
//! ## Features
//!
//! - `memory` (default): in-process transport, for tests and single-process apps
//! - `postgres`: PostgreSQL transport built on `sqlx`
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pg_hub::{Action, Hub, HubConfig, MemoryPool};
//! use serde_json::json;
//!
//! async fn example() -> pg_hub::HubResult<()> {
//!     let hub = Hub::new(MemoryPool::new(), HubConfig::from_env());
//!
//!     let Some(consumer) = hub.consumer(|event, _consumer| match event.action() {
//!         Some(Action::Stop) => println!("hub stopped"),
//!         Some(action) => println!("control: {}", action),
//!         None => println!("{:?} {:?} {}", event.topic(), event.keys(), event.value()),
//!     }) else {
//!         return Ok(());
//!     };
//!
//!     consumer.subscribe_all(["orders", "invoices"])?;
//!
//!     if hub.start().await {
//!         hub.notify("orders", &[1001u64, 7], &json!({ "status": "shipped" }))?;
//!     }
//!
//!     hub.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Topics
//!
//! Topic names match `^[A-Za-z0-9_]+$` and map one-to-one to notification
//! channels. Payloads produced elsewhere (triggers, other services) are
//! delivered too, provided they follow the [`codec`] format.

pub mod codec;
pub mod config;
pub mod error;
pub mod transport;
pub mod types;

mod consumer;
mod dispatch;
mod engine;
mod fsm;
mod hub;
mod index;
mod outbound;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

// Re-export main types
pub use codec::{CodecError, CodecResult, ToKey};
pub use config::{ConfigError, HubConfig, MAX_NOTIFY_PAYLOAD_BYTES};
pub use consumer::{Callback, Consumer, ConsumerId};
pub use engine::HubStats;
pub use error::{HubError, HubResult};
pub use hub::Hub;
pub use index::valid_topic;
pub use transport::{
    Connected, Connection, ConnectionEvent, ConnectionPool, Notification, TransportError, TransportResult,
};
pub use types::{Action, Event};

#[cfg(feature = "memory")]
pub use memory::MemoryPool;

#[cfg(feature = "postgres")]
pub use postgres::PgConnectionPool;

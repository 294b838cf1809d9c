//! Topic subscriber for a WebSocket publish/subscribe broker.
//!
//! Subscribes to named topics and hands each message payload to a callback,
//! with at-least-once, resumable delivery.
//!
//! # Features
//! - Offset-based resume: every reconnect resubscribes at the last delivered offset
//! - Jittered resend of unacknowledged subscription requests
//! - Broker redirects (failover to another broker instance)
//! - Automatic reconnect to the registry broker after an unexpected disconnect
//! - Optional bounded retries and checksum verification ([`ConsumerConfig`])
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), topic_subscriber::Error> {
//! use topic_subscriber::Consumer;
//!
//! let consumer = Consumer::new("localhost:12345")?;
//! consumer.subscribe("topic", |payload| {
//!     println!("{}", String::from_utf8_lossy(&payload));
//! })?;
//! # Ok(())
//! # }
//! ```

mod config;
mod consumer;
pub mod protocol;
mod session;
mod subscription;
pub mod transport;
mod types;

pub use config::{ConsumerConfig, load as load_config};
pub use consumer::Consumer;
pub use transport::{Connection, Opened, Transport, TransportEvent, WsTransport};
pub use types::{Callback, Error, SubscriptionState};

//! Public entry point: [`Consumer`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use url::Url;

use crate::config::ConsumerConfig;
use crate::protocol::{self, DEFAULT_OFFSET};
use crate::session::{Attempt, Session};
use crate::subscription::{ConnectionId, Subscription};
use crate::transport::{Opened, Transport, WsTransport};
use crate::types::{Callback, Error, SubscriptionState};

/// Subscribes to topics on a broker and delivers their messages to callbacks.
///
/// Each topic runs its own background task that negotiates the subscription,
/// resends unacknowledged requests, follows broker redirects, and resumes
/// from the last delivered offset after a disconnect. Connection-level
/// failures never surface here; only invalid arguments do.
///
/// Dropping the consumer unsubscribes every topic.
pub struct Consumer {
    shared: Arc<Shared>,
}

/// State shared between the [`Consumer`] handle and its topic tasks.
pub(crate) struct Shared {
    registry_endpoint: Url,
    current_endpoint: Mutex<Url>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    next_connection: AtomicU64,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    pub config: ConsumerConfig,
}

impl Consumer {
    /// Create a consumer for the broker registry at `host` (`host:port`),
    /// with default settings.
    pub fn new(host: &str) -> Result<Self, Error> {
        Self::with_config(host, ConsumerConfig::default())
    }

    pub fn with_config(host: &str, config: ConsumerConfig) -> Result<Self, Error> {
        let transport = WsTransport::new(config.connect_timeout());
        Self::with_transport(host, config, Arc::new(transport))
    }

    /// Create a consumer that opens its connections through `transport`.
    ///
    /// Must be called from within a Tokio runtime; topic tasks are spawned
    /// onto it.
    pub fn with_transport(
        host: &str,
        config: ConsumerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let registry_endpoint = protocol::subscribe_url(host)?;
        let runtime = Handle::try_current()?;
        Ok(Self {
            shared: Arc::new(Shared {
                current_endpoint: Mutex::new(registry_endpoint.clone()),
                registry_endpoint,
                subscriptions: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
                transport,
                runtime,
                config,
            }),
        })
    }

    /// Subscribe to `topic` from the broker's default position.
    ///
    /// Ignored if the topic is already subscribed.
    pub fn subscribe<F>(&self, topic: &str, callback: F) -> Result<(), Error>
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        self.subscribe_from(topic, DEFAULT_OFFSET, callback)
    }

    /// Subscribe to `topic`, resuming at `offset` (`-1` for the broker's
    /// default position).
    ///
    /// Ignored if the topic is already subscribed.
    pub fn subscribe_from<F>(&self, topic: &str, offset: i64, callback: F) -> Result<(), Error>
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        validate_topic(topic)?;
        if offset < DEFAULT_OFFSET {
            return Err(Error::InvalidArgument(format!(
                "offset must be >= {DEFAULT_OFFSET}, got {offset}"
            )));
        }
        self.start(topic, offset, Arc::new(callback));
        Ok(())
    }

    /// Unsubscribe from `topic` and close its connection. No-op if the topic
    /// is not subscribed.
    pub fn unsubscribe(&self, topic: &str) -> Result<(), Error> {
        validate_topic(topic)?;
        // Remove before closing so the close is not mistaken for a failure.
        let removed = self.shared.subscriptions().remove(topic);
        if let Some(mut sub) = removed {
            sub.cancel.cancel();
            sub.close();
            tracing::info!(topic, "Unsubscribed");
        }
        Ok(())
    }

    /// Unsubscribe from every topic.
    pub fn close(&self) {
        let drained: Vec<(String, Subscription)> = self.shared.subscriptions().drain().collect();
        for (topic, mut sub) in drained {
            sub.cancel.cancel();
            sub.close();
            tracing::debug!(topic, "Unsubscribed on close");
        }
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.shared.subscriptions().contains_key(topic)
    }

    /// Last committed resume offset of `topic`.
    pub fn offset(&self, topic: &str) -> Option<i64> {
        self.shared.subscriptions().get(topic).map(|s| s.offset)
    }

    pub fn state(&self, topic: &str) -> Option<SubscriptionState> {
        self.shared.subscriptions().get(topic).map(|s| s.state)
    }

    /// Subscribed topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.shared.subscriptions().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Endpoint the consumer was created with.
    pub fn registry_endpoint(&self) -> &Url {
        &self.shared.registry_endpoint
    }

    /// Endpoint new connections are opened against.
    pub fn current_endpoint(&self) -> Url {
        self.shared.current_endpoint()
    }

    fn start(&self, topic: &str, offset: i64, callback: Callback) {
        let (owner, cancel) = {
            let mut subs = self.shared.subscriptions();
            if subs.contains_key(topic) {
                tracing::debug!(topic, "Already subscribed, ignoring");
                return;
            }
            let owner = self.shared.next_connection_id();
            let sub = Subscription::new(owner, offset);
            let cancel = sub.cancel.clone();
            subs.insert(topic.to_string(), sub);
            (owner, cancel)
        };

        tracing::info!(topic, offset, "Subscribing");
        let session = Session::new(
            Arc::clone(&self.shared),
            topic.to_string(),
            callback,
            cancel,
        );
        self.shared.runtime.spawn(session.run(owner));
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.close();
    }
}

fn validate_topic(topic: &str) -> Result<(), Error> {
    if topic.is_empty() {
        return Err(Error::InvalidArgument(
            "topic should be a non-empty string".to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared state, used by topic sessions
// ---------------------------------------------------------------------------

impl Shared {
    fn subscriptions(&self) -> MutexGuard<'_, HashMap<String, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    pub fn current_endpoint(&self) -> Url {
        self.current_endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_endpoint(&self, endpoint: Url) {
        *self
            .current_endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = endpoint;
    }

    /// Fall back to the registry endpoint, abandoning any redirect.
    pub fn reset_endpoint(&self) {
        self.set_endpoint(self.registry_endpoint.clone());
    }

    /// Whether `topic` is still owned by connection attempt `id`.
    pub fn owns(&self, topic: &str, id: ConnectionId) -> bool {
        self.subscriptions()
            .get(topic)
            .is_some_and(|s| s.connection == id)
    }

    /// Open a new connection for `topic` and hand it ownership, provided the
    /// topic is still owned by `owner`.
    pub fn connect(&self, topic: &str, owner: ConnectionId) -> Option<Attempt> {
        let endpoint = self.current_endpoint();
        let mut subs = self.subscriptions();
        let sub = subs
            .get_mut(topic)
            .filter(|s| s.connection == owner && !s.cancel.is_cancelled())?;

        // `open` only spawns the handshake, so it runs under the lock and an
        // unsubscribe cannot land between the ownership check and the open.
        let id = self.next_connection_id();
        let Opened { connection, events } = self.transport.open(&endpoint);
        sub.close();
        sub.connection = id;
        sub.handle = Some(Arc::clone(&connection));
        sub.state = SubscriptionState::Connecting;
        tracing::debug!(topic, %endpoint, offset = sub.offset, "Opening connection");
        Some(Attempt {
            id,
            connection,
            events,
        })
    }

    pub fn offset_of(&self, topic: &str, id: ConnectionId) -> Option<i64> {
        self.subscriptions()
            .get(topic)
            .filter(|s| s.connection == id)
            .map(|s| s.offset)
    }

    pub fn set_state(&self, topic: &str, id: ConnectionId, state: SubscriptionState) {
        if let Some(sub) = self
            .subscriptions()
            .get_mut(topic)
            .filter(|s| s.connection == id)
        {
            sub.state = state;
        }
    }

    /// Advance `topic`'s offset past a delivered frame. `None` if `id` no
    /// longer owns the topic.
    pub fn advance(&self, topic: &str, id: ConnectionId, length: usize) -> Option<i64> {
        self.subscriptions()
            .get_mut(topic)
            .filter(|s| s.connection == id)
            .map(|s| s.advance(length))
    }

    /// Drop `topic` after exhausting its retries.
    pub fn give_up(&self, topic: &str, id: ConnectionId) {
        let mut subs = self.subscriptions();
        if subs.get(topic).is_some_and(|s| s.connection == id)
            && let Some(mut sub) = subs.remove(topic)
        {
            sub.close();
            tracing::error!(
                topic,
                offset = sub.offset,
                max_retries = ?self.config.max_retries,
                "Giving up on subscription"
            );
        }
    }
}

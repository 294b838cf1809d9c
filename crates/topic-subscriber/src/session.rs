//! Per-topic subscription state machine.
//!
//! One task per subscribed topic drives its connection attempts:
//!
//! ```text
//! Connecting -> AwaitingAck -> Active
//!     ^              |           |
//!     |   redirect --+           |
//!     +-- backoff <-- close -----+
//! ```
//!
//! Every mutation of the shared topic map is guarded by the attempt's
//! [`ConnectionId`], so once `unsubscribe` (or a newer attempt) takes the
//! topic over, this task's remaining events are no-ops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::consumer::Shared;
use crate::protocol::{self, status};
use crate::subscription::ConnectionId;
use crate::transport::{Connection, TransportEvent};
use crate::types::{Callback, SubscriptionState};

/// One connection attempt owned by a session.
pub(crate) struct Attempt {
    pub id: ConnectionId,
    pub connection: Arc<dyn Connection>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

enum Phase {
    Connecting,
    AwaitingAck { deadline: Instant },
    Active,
}

enum Outcome {
    /// Unsubscribed or superseded; stop without touching the topic map.
    Cancelled,
    /// Connection closed, failed to open, or a send failed.
    Lost,
    /// Broker asked us to move to another `host:port`.
    Redirect(String),
    /// `max_retries` consecutive retries without reaching Active.
    Exhausted,
}

enum AckAction {
    Active,
    Redirect(String),
}

/// Uniformly random delay in `[0, max_ms)`.
pub(crate) fn jitter(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::random_range(0..max_ms))
}

pub(crate) struct Session {
    shared: Arc<Shared>,
    topic: String,
    callback: Callback,
    cancel: CancellationToken,
    /// Consecutive retries since the subscription was last acknowledged.
    attempts: u32,
}

impl Session {
    pub fn new(
        shared: Arc<Shared>,
        topic: String,
        callback: Callback,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            topic,
            callback,
            cancel,
            attempts: 0,
        }
    }

    /// Drive the topic until it is unsubscribed or gives up. `owner` is the
    /// connection id the topic was registered with.
    pub async fn run(mut self, mut owner: ConnectionId) {
        loop {
            let Some(mut attempt) = self.shared.connect(&self.topic, owner) else {
                tracing::debug!(topic = %self.topic, "Subscription no longer owned, stopping");
                return;
            };
            owner = attempt.id;

            match self.drive(&mut attempt).await {
                Outcome::Cancelled => return,
                Outcome::Exhausted => {
                    attempt.connection.close();
                    self.shared.give_up(&self.topic, owner);
                    return;
                }
                Outcome::Redirect(host) => {
                    attempt.connection.close();
                    if !self.shared.owns(&self.topic, owner) {
                        return;
                    }
                    match protocol::subscribe_url(&host) {
                        Ok(endpoint) => {
                            self.attempts += 1;
                            if self.shared.config.retries_exhausted(self.attempts) {
                                self.shared.give_up(&self.topic, owner);
                                return;
                            }
                            tracing::info!(topic = %self.topic, %endpoint, "Redirected by broker");
                            self.shared.set_endpoint(endpoint);
                        }
                        Err(e) => {
                            tracing::warn!(topic = %self.topic, "Ignoring redirect to {host:?}: {e}");
                            self.shared.reset_endpoint();
                            if !self.backoff(owner).await {
                                return;
                            }
                        }
                    }
                }
                Outcome::Lost => {
                    attempt.connection.close();
                    if !self.shared.owns(&self.topic, owner) {
                        tracing::debug!(topic = %self.topic, "Ignoring close of superseded connection");
                        return;
                    }
                    self.shared
                        .set_state(&self.topic, owner, SubscriptionState::Connecting);
                    // A dead connection may mean the redirected broker died too.
                    self.shared.reset_endpoint();
                    if !self.backoff(owner).await {
                        return;
                    }
                }
            }
        }
    }

    /// Wait a jittered delay before the next attempt. Returns `false` if the
    /// session should stop instead.
    async fn backoff(&mut self, owner: ConnectionId) -> bool {
        self.attempts += 1;
        if self.shared.config.retries_exhausted(self.attempts) {
            self.shared.give_up(&self.topic, owner);
            return false;
        }
        let wait = jitter(self.shared.config.max_retry_interval_ms);
        tracing::warn!(
            topic = %self.topic,
            attempt = self.attempts,
            ?wait,
            "Connection lost, resubscribing after backoff"
        );
        tokio::select! {
            _ = tokio::time::sleep(wait) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    async fn drive(&mut self, attempt: &mut Attempt) -> Outcome {
        let mut phase = Phase::Connecting;

        loop {
            let ack_deadline = match phase {
                Phase::AwaitingAck { deadline } => Some(deadline),
                Phase::Connecting | Phase::Active => None,
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return Outcome::Cancelled,

                _ = tokio::time::sleep_until(ack_deadline.unwrap_or_else(Instant::now)), if ack_deadline.is_some() => {
                    self.attempts += 1;
                    if self.shared.config.retries_exhausted(self.attempts) {
                        return Outcome::Exhausted;
                    }
                    tracing::warn!(
                        topic = %self.topic,
                        attempt = self.attempts,
                        "No ack from broker, resending subscription request"
                    );
                    match self.send_request(attempt) {
                        Some(next) => phase = next,
                        None => return Outcome::Lost,
                    }
                }

                event = attempt.events.recv() => {
                    match event {
                        Some(TransportEvent::Open) => match self.send_request(attempt) {
                            Some(next) => phase = next,
                            None => return Outcome::Lost,
                        },
                        Some(TransportEvent::Frame(data)) => match phase {
                            Phase::Connecting => {
                                tracing::debug!(topic = %self.topic, "Ignoring frame before open");
                            }
                            Phase::AwaitingAck { .. } => match self.on_ack(attempt.id, &data) {
                                Some(AckAction::Active) => phase = Phase::Active,
                                Some(AckAction::Redirect(host)) => return Outcome::Redirect(host),
                                None => {}
                            },
                            Phase::Active => {
                                if !self.on_message(attempt.id, &data) {
                                    return Outcome::Cancelled;
                                }
                            }
                        },
                        Some(TransportEvent::Closed) | None => return Outcome::Lost,
                    }
                }
            }
        }
    }

    /// Send the subscription request at the topic's current offset and arm
    /// the ack timer. `None` means the request could not be sent.
    fn send_request(&mut self, attempt: &Attempt) -> Option<Phase> {
        let offset = self.shared.offset_of(&self.topic, attempt.id)?;
        let frame = match protocol::encode_subscription(&self.topic, offset) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(topic = %self.topic, "Failed to encode subscription request: {e}");
                return None;
            }
        };
        if !attempt.connection.send(frame) {
            tracing::warn!(topic = %self.topic, "Failed to send subscription request, reconnecting");
            return None;
        }
        tracing::debug!(topic = %self.topic, offset, "Subscription request sent");
        self.shared
            .set_state(&self.topic, attempt.id, SubscriptionState::AwaitingAck);
        let deadline = Instant::now() + jitter(self.shared.config.max_retry_interval_ms);
        Some(Phase::AwaitingAck { deadline })
    }

    fn on_ack(&mut self, id: ConnectionId, data: &[u8]) -> Option<AckAction> {
        let ack = match protocol::decode_ack(data) {
            Ok(ack) => ack,
            Err(e) => {
                tracing::warn!(topic = %self.topic, "Dropping malformed ack: {e}");
                return None;
            }
        };
        match ack.status {
            status::SUCCESS => {
                tracing::info!(topic = %self.topic, "Subscription acknowledged");
                self.attempts = 0;
                self.shared
                    .set_state(&self.topic, id, SubscriptionState::Active);
                Some(AckAction::Active)
            }
            status::REDIRECT => match ack.redirect_target() {
                Some(host) => Some(AckAction::Redirect(host)),
                None => {
                    tracing::warn!(topic = %self.topic, "Ignoring redirect without a target host");
                    None
                }
            },
            other => {
                tracing::debug!(topic = %self.topic, status = other, "Ignoring ack");
                None
            }
        }
    }

    /// Deliver one message frame. Returns `false` if the topic is no longer
    /// owned by this attempt.
    fn on_message(&self, id: ConnectionId, data: &[u8]) -> bool {
        let message = match protocol::decode_message(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(topic = %self.topic, "Dropping malformed message frame: {e}");
                return true;
            }
        };
        let Some(offset) = self.shared.advance(&self.topic, id, message.length) else {
            return false;
        };

        let computed = protocol::checksum(&message);
        if computed != message.checksum {
            tracing::warn!(
                topic = %self.topic,
                offset,
                expected = message.checksum,
                computed,
                "Checksum mismatch"
            );
            if self.shared.config.verify_checksums {
                return true;
            }
        }

        tracing::trace!(topic = %self.topic, offset, length = message.length, "Delivering message");
        (self.callback)(message.payload);
        true
    }
}

//! Per-topic subscription record held in the consumer's topic map.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::protocol::FRAME_OVERHEAD;
use crate::transport::Connection;
use crate::types::SubscriptionState;

/// Identity of one connection attempt. Strictly increasing per consumer, so
/// events from a superseded attempt can be told apart from the live one.
pub(crate) type ConnectionId = u64;

pub(crate) struct Subscription {
    /// Attempt that currently owns this topic.
    pub connection: ConnectionId,
    /// Outbound handle of that attempt; `None` until the transport is opened.
    pub handle: Option<Arc<dyn Connection>>,
    /// Resume cursor; `-1` means the broker's default position.
    pub offset: i64,
    pub state: SubscriptionState,
    /// Stops the topic's state-machine task.
    pub cancel: CancellationToken,
}

impl Subscription {
    pub fn new(connection: ConnectionId, offset: i64) -> Self {
        Self {
            connection,
            handle: None,
            offset,
            state: SubscriptionState::Connecting,
            cancel: CancellationToken::new(),
        }
    }

    /// Move the cursor past one delivered frame carrying `length` payload bytes.
    pub fn advance(&mut self, length: usize) -> i64 {
        let length = i64::try_from(length).unwrap_or(i64::MAX);
        self.offset = self
            .offset
            .saturating_add(length)
            .saturating_add(FRAME_OVERHEAD);
        self.offset
    }

    /// Detach and close the owned connection, if any.
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
    }
}

//! Public types for the topic-subscriber crate.

use std::sync::Arc;

use tokio_tungstenite::tungstenite;

/// Application callback invoked with each decoded message payload.
pub type Callback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Observable phase of a topic's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// A connection is being opened; no request sent yet.
    Connecting,
    /// A subscription request is in flight; it is resent until acknowledged.
    AwaitingAck,
    /// Acknowledged; inbound frames are topic messages.
    Active,
}

/// Errors returned by this crate.
///
/// Only [`Error::InvalidArgument`], [`Error::Url`], [`Error::Config`] and
/// [`Error::NoRuntime`] reach callers of the public API; the rest are
/// logged and recovered by the subscription state machine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    #[error("protocol encode error: {0}")]
    ProtocolEncode(String),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("config error: {0}")]
    Config(String),

    #[error("consumer must be created inside a Tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

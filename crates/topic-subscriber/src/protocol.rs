//! Broker wire protocol: frame shapes, constants, and JSON encode/decode.
//!
//! Every frame is a JSON text frame. Byte fields (`Payload`) travel as
//! standard base64 strings, the way the broker serializes `[]byte`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::Error;

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

/// URL path of the broker's subscription endpoint.
pub const PATH: &str = "subscribe";

pub mod status {
    pub const SUCCESS: i32 = 200;
    pub const REDIRECT: i32 = 320;
    pub const NOT_READY: i32 = 350;
    pub const FAILURE: i32 = 400;
}

/// Per-frame bytes the broker log stores alongside a payload (length prefix,
/// ID, checksum, request id). Added to the decoded payload length when
/// advancing the resume offset.
pub const FRAME_OVERHEAD: i64 = 40;

/// Offset meaning "start from the broker's default position".
pub const DEFAULT_OFFSET: i64 = -1;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Client -> broker subscription request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscribeRequest {
    pub topic: String,
    pub offset: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct AckFrame {
    status: i32,
    payload: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct MessageFrame {
    source: i32,
    topic: String,
    #[serde(rename = "ID", skip_serializing_if = "Option::is_none")]
    id: Option<i64>,
    payload: Option<String>,
    checksum: u32,
}

/// Broker -> client acknowledgement of a subscription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub status: i32,
    /// Decoded payload; empty when the broker sent none.
    pub payload: Vec<u8>,
}

impl Ack {
    /// The `host:port` carried by a redirect, if any.
    pub fn redirect_target(&self) -> Option<String> {
        if self.status != status::REDIRECT {
            return None;
        }
        let host = std::str::from_utf8(&self.payload).ok()?.trim();
        (!host.is_empty()).then(|| host.to_string())
    }
}

/// A decoded topic message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub source: i32,
    pub topic: String,
    pub id: Option<i64>,
    pub payload: Vec<u8>,
    /// Byte length of the decoded payload.
    pub length: usize,
    /// Checksum computed by the producer.
    pub checksum: u32,
}

// ---------------------------------------------------------------------------
// Encode / decode
// ---------------------------------------------------------------------------

pub fn encode_subscription(topic: &str, offset: i64) -> Result<String, Error> {
    if topic.is_empty() {
        return Err(Error::InvalidArgument(
            "topic should be a non-empty string".to_string(),
        ));
    }
    if offset < DEFAULT_OFFSET {
        return Err(Error::InvalidArgument(format!(
            "offset must be >= {DEFAULT_OFFSET}, got {offset}"
        )));
    }
    let request = SubscribeRequest {
        topic: topic.to_string(),
        offset,
    };
    serde_json::to_string(&request).map_err(|e| Error::ProtocolEncode(e.to_string()))
}

pub fn decode_ack(data: &[u8]) -> Result<Ack, Error> {
    let frame: AckFrame = serde_json::from_slice(data)
        .map_err(|e| Error::ProtocolDecode(format!("ack decode error: {e}")))?;
    let payload = match frame.payload {
        Some(encoded) => decode_base64(&encoded)?,
        None => Vec::new(),
    };
    Ok(Ack {
        status: frame.status,
        payload,
    })
}

pub fn decode_message(data: &[u8]) -> Result<WireMessage, Error> {
    let frame: MessageFrame = serde_json::from_slice(data)
        .map_err(|e| Error::ProtocolDecode(format!("message decode error: {e}")))?;
    let payload = match frame.payload {
        Some(encoded) => decode_base64(&encoded)?,
        None => Vec::new(),
    };
    Ok(WireMessage {
        source: frame.source,
        topic: frame.topic,
        id: frame.id,
        length: payload.len(),
        payload,
        checksum: frame.checksum,
    })
}

/// CRC-32 (IEEE) of the decoded payload bytes, as the producer computes it.
pub fn checksum(message: &WireMessage) -> u32 {
    crc32fast::hash(&message.payload)
}

/// Build an acknowledgement frame, as a broker would.
pub fn encode_ack(status: i32, payload: Option<&[u8]>) -> Result<String, Error> {
    let frame = AckFrame {
        status,
        payload: payload.map(|p| BASE64.encode(p)),
    };
    serde_json::to_string(&frame).map_err(|e| Error::ProtocolEncode(e.to_string()))
}

/// Build a message frame carrying `payload`, with its checksum filled in.
pub fn encode_message(topic: &str, id: i64, payload: &[u8]) -> Result<String, Error> {
    let frame = MessageFrame {
        source: 0,
        topic: topic.to_string(),
        id: Some(id),
        payload: Some(BASE64.encode(payload)),
        checksum: crc32fast::hash(payload),
    };
    serde_json::to_string(&frame).map_err(|e| Error::ProtocolEncode(e.to_string()))
}

fn decode_base64(encoded: &str) -> Result<Vec<u8>, Error> {
    BASE64
        .decode(encoded)
        .map_err(|e| Error::ProtocolDecode(format!("payload is not valid base64: {e}")))
}

// ---------------------------------------------------------------------------
// Endpoint construction
// ---------------------------------------------------------------------------

/// Subscription endpoint for a broker at `host` (`host:port`).
pub fn subscribe_url(host: &str) -> Result<Url, Error> {
    let host = host.trim();
    if host.is_empty() {
        return Err(Error::InvalidArgument(
            "invalid host, it should look like example.com:123".to_string(),
        ));
    }
    let url = Url::parse(&format!("ws://{host}/{PATH}"))?;
    if url.path() != format!("/{PATH}") || url.host_str().is_none() {
        return Err(Error::InvalidArgument(format!(
            "invalid host {host:?}, it should look like example.com:123"
        )));
    }
    Ok(url)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Correlation identifiers and the request/response wire envelope.
//!
//! # Correlation
//!
//! The channel primitive only knows how to publish a message and deliver
//! every message to every subscriber. Request/response semantics are layered
//! on top by tagging each request with a [`CorrelationId`] and having the
//! responder echo that id back. The envelope carrying the id is
//! [`ChannelMessage`], serialized as JSON:
//!
//! ```text
//! {"kind":"request","correlationId":"…","payload":{…}}
//! {"kind":"response","correlationId":"…","response":{…}}
//! {"kind":"error","correlationId":"…","error":"…"}
//! ```
//!
//! Requests and responses share one channel, so a client sees its own
//! requests echoed back by the subscription. Only `response` and `error`
//! envelopes are ever matched against pending requests.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifies one in-flight request on a channel.
///
/// Ids are random v4 UUIDs. The channel additionally refuses to register a
/// waiter under an id that is already pending, so an id is never reused
/// while a waiter for it is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Create a new random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<CorrelationId> for Uuid {
    fn from(cid: CorrelationId) -> Uuid {
        cid.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Envelope for every message carried on a request/response channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ChannelMessage {
    /// An outbound request.
    Request {
        /// Id the responder must echo back.
        #[serde(rename = "correlationId")]
        correlation_id: CorrelationId,
        /// The request body.
        payload: Value,
    },

    /// A successful answer to a request.
    Response {
        /// Id of the request being answered.
        #[serde(rename = "correlationId")]
        correlation_id: CorrelationId,
        /// The response body.
        response: Value,
    },

    /// A failed answer to a request.
    Error {
        /// Id of the request being answered.
        #[serde(rename = "correlationId")]
        correlation_id: CorrelationId,
        /// Description of the failure.
        error: String,
    },
}

impl ChannelMessage {
    /// The correlation id carried by this envelope.
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            ChannelMessage::Request { correlation_id, .. }
            | ChannelMessage::Response { correlation_id, .. }
            | ChannelMessage::Error { correlation_id, .. } => *correlation_id,
        }
    }

    /// Whether this envelope answers a request (response or error).
    pub fn is_reply(&self) -> bool {
        !matches!(self, ChannelMessage::Request { .. })
    }
}

//! Structured error types for the adapter client.
//!
//! Each concern gets its own enum so callers can pattern-match instead of
//! string-matching:
//!
//! - [`ConnectError`] - establishing a session failed
//! - [`SessionError`] - asking for a session that is absent or failed
//! - [`TransportError`] - the channel primitive refused a publish
//! - [`RequestError`] - a correlated request settled without a response
//! - [`ClientError`] - a model client operation failed at either layer
//! - [`ClockSkew`] - an outcome was stamped before its attempt
//!
//! Operation-level failures (a topic that could not be created, a poll that
//! errored) are NOT errors here. They are ordinary outcomes recorded by the
//! event model, see [`crate::events`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::core::CorrelationId;
use crate::events::Timestamp;

/// Failure to establish a session with the adapter's server.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// The server could not be reached.
    #[error("failed to reach {endpoint}: {reason}")]
    Unreachable {
        /// The endpoint that was dialled.
        endpoint: String,
        /// Why the connection attempt failed.
        reason: String,
    },

    /// The server was reached but refused the session.
    #[error("session rejected by {endpoint}: {reason}")]
    Rejected {
        /// The endpoint that refused the session.
        endpoint: String,
        /// The rejection reason reported by the server.
        reason: String,
    },
}

/// Failure to obtain a session handle from a session provider.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// No session has been established (or the last one was invalidated).
    #[error("no session")]
    NoSession,

    /// Establishing the session failed.
    ///
    /// The error is shared: every caller that waited on the same
    /// establishment attempt observes the same `Arc`.
    #[error("session establishment failed: {0}")]
    Connect(Arc<ConnectError>),
}

/// Failure reported by the channel primitive.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The session is no longer connected.
    #[error("session is not connected")]
    NotConnected,

    /// The message could not be published.
    ///
    /// Raised by network transports when the server refuses or drops a
    /// publish. The in-process broker never fails a publish while connected.
    #[error("failed to publish on {channel}: {reason}")]
    PublishFailed {
        /// The channel the message was addressed to.
        channel: String,
        /// The underlying failure.
        reason: String,
    },
}

/// Why a correlated request settled without a response body.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The session terminated while the request was pending, or the channel
    /// was already closed when the request was issued.
    #[error("connection lost while request was pending")]
    ConnectionLost,

    /// The responder answered with an error envelope.
    #[error("remote error: {message}")]
    Remote {
        /// The error carried by the envelope.
        message: String,
    },

    /// No response arrived within the configured timeout.
    #[error("request timed out after {duration:?}")]
    Timeout {
        /// How long we waited.
        duration: Duration,
    },

    /// A waiter is already registered under this correlation id.
    #[error("correlation id {id} is already pending")]
    DuplicateCorrelation {
        /// The colliding id.
        id: CorrelationId,
    },

    /// The request could not be handed to the transport.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The request or response body could not be (de)serialized.
    #[error("message encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Failure of a model client operation.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No usable session could be established.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The request reached the channel but did not succeed.
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// An outcome timestamp that precedes its attempt timestamp.
///
/// Latency is never clamped to zero; a negative interval means the clock
/// feeding the event model is not monotonic.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("outcome at {settled_at}ms precedes attempt at {started_at}ms")]
pub struct ClockSkew {
    /// When the attempt was stamped.
    pub started_at: Timestamp,
    /// When the outcome was stamped.
    pub settled_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_display() {
        let err = ConnectError::Unreachable {
            endpoint: "ws://localhost:8080".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to reach ws://localhost:8080: connection refused"
        );
    }

    #[test]
    fn test_session_error_wraps_connect_error() {
        let err = SessionError::Connect(Arc::new(ConnectError::Rejected {
            endpoint: "ws://localhost:8080".into(),
            reason: "bad credentials".into(),
        }));
        assert!(err.to_string().contains("bad credentials"));
    }

    #[test]
    fn test_transport_error_is_transparent_in_request_error() {
        let err: RequestError = TransportError::NotConnected.into();
        assert_eq!(err.to_string(), "session is not connected");
    }

    #[test]
    fn test_publish_failure_display() {
        let err: RequestError = TransportError::PublishFailed {
            channel: "adapter/rest/model/store".into(),
            reason: "message too large".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "failed to publish on adapter/rest/model/store: message too large"
        );
    }

    #[test]
    fn test_clock_skew_display() {
        let skew = ClockSkew {
            started_at: 2000,
            settled_at: 1990,
        };
        assert_eq!(
            skew.to_string(),
            "outcome at 1990ms precedes attempt at 2000ms"
        );
    }
}

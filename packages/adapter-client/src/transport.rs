//! The publish/subscribe primitive carried by a session.
//!
//! A [`Transport`] can publish a message on a named channel and hand out
//! subscriptions that receive every [`Delivery`] on every channel. It has no
//! notion of requests or responses; [`crate::channel::RequestChannel`] adds
//! that on top.
//!
//! # Guarantees expected from implementations
//!
//! - **Fan-out**: every subscriber sees every delivery made after it
//!   subscribed
//! - **Termination is observable**: [`Transport::closed`] resolves once the
//!   session is gone, and subscriptions eventually report `Closed`
//!
//! Lagging subscribers may miss deliveries; a missed response leaves its
//! request pending until the channel's timeout fires.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::TransportError;

/// One message received on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// The channel the message was published on.
    pub channel: String,
    /// The message body.
    pub message: String,
}

impl Delivery {
    /// Create a delivery.
    pub fn new(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            message: message.into(),
        }
    }
}

/// Channel primitive exposed by an established session.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publish `message` to every subscriber of `channel`.
    async fn publish(&self, channel: &str, message: String) -> Result<(), TransportError>;

    /// Subscribe to deliveries on all channels.
    ///
    /// Deliveries made before the call are not received.
    fn subscribe(&self) -> broadcast::Receiver<Delivery>;

    /// Resolves once the session has terminated.
    ///
    /// Resolves immediately if it already has.
    async fn closed(&self);
}

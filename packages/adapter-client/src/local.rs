//! In-process broker, sessions, and responders.
//!
//! [`LocalBroker`] is a broadcast bus of [`Delivery`] values. Sessions
//! attached to it implement [`Transport`], so a
//! [`RequestChannel`](crate::channel::RequestChannel) can run against it
//! exactly as it would against a remote server. [`serve`] plays the server
//! side: it answers request envelopes on a channel with a [`Responder`].
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: slow subscribers may miss deliveries
//! - **In-memory only**: nothing is persisted or replayed
//!
//! # Example
//!
//! ```ignore
//! let broker = LocalBroker::new();
//! let _server = serve(broker.clone(), "adapter/rest/model/store", ModelController::new());
//!
//! let establisher = SessionEstablisher::new(LocalConnector::new(broker));
//! let session = establisher.establish().await?;
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::core::ChannelMessage;
use crate::error::{ConnectError, TransportError};
use crate::session::{Connector, SessionHandle};
use crate::transport::{Delivery, Transport};

/// Default buffer size before slow subscribers start lagging.
const DEFAULT_CAPACITY: usize = 1024;

/// Endpoint name reported by local connect errors.
const LOCAL_ENDPOINT: &str = "local";

/// Broadcast bus shared by every local session.
#[derive(Clone)]
pub struct LocalBroker {
    sender: broadcast::Sender<Delivery>,
}

impl LocalBroker {
    /// Create a broker with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a broker that buffers `capacity` deliveries per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish `message` on `channel`.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, channel: &str, message: impl Into<String>) -> usize {
        self.sender
            .send(Delivery::new(channel, message))
            .unwrap_or(0)
    }

    /// Subscribe to every channel. Earlier deliveries are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<Delivery> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBroker")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

/// A session attached to a [`LocalBroker`].
pub struct LocalSession {
    broker: LocalBroker,
    connected: watch::Sender<bool>,
}

impl LocalSession {
    /// Attach a new, connected session to `broker`.
    pub fn new(broker: &LocalBroker) -> Self {
        let (connected, _) = watch::channel(true);
        Self {
            broker: broker.clone(),
            connected,
        }
    }

    /// Attach a new session and share it.
    pub fn attach(broker: &LocalBroker) -> Arc<Self> {
        Arc::new(Self::new(broker))
    }

    /// Terminate the session. Channels bound to it close.
    pub fn disconnect(&self) {
        if self.connected.send_replace(false) {
            debug!("local session disconnected");
        }
    }
}

impl SessionHandle for LocalSession {
    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }
}

#[async_trait]
impl Transport for LocalSession {
    async fn publish(&self, channel: &str, message: String) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let receivers = self.broker.publish(channel, message);
        trace!(channel, receivers, "published");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Delivery> {
        self.broker.subscribe()
    }

    async fn closed(&self) {
        let mut connected = self.connected.subscribe();
        // Only fails if the sender is gone, which outlives `self`.
        let _ = connected.wait_for(|connected| !*connected).await;
    }
}

impl std::fmt::Debug for LocalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSession")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Opens [`LocalSession`]s, or refuses to.
pub struct LocalConnector {
    broker: LocalBroker,
    refusal: Mutex<Option<String>>,
}

impl LocalConnector {
    /// A connector that accepts every connect.
    pub fn new(broker: LocalBroker) -> Self {
        Self {
            broker,
            refusal: Mutex::new(None),
        }
    }

    fn lock_refusal(&self) -> MutexGuard<'_, Option<String>> {
        self.refusal.lock().unwrap_or_else(|poisoned| {
            warn!("connector mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Reject subsequent connects with `reason`.
    pub fn refuse(&self, reason: impl Into<String>) {
        *self.lock_refusal() = Some(reason.into());
    }

    /// Accept subsequent connects again.
    pub fn accept(&self) {
        *self.lock_refusal() = None;
    }

    /// The broker sessions attach to.
    pub fn broker(&self) -> &LocalBroker {
        &self.broker
    }
}

#[async_trait]
impl Connector for LocalConnector {
    type Session = LocalSession;

    async fn connect(&self) -> Result<LocalSession, ConnectError> {
        if let Some(reason) = self.lock_refusal().clone() {
            return Err(ConnectError::Rejected {
                endpoint: LOCAL_ENDPOINT.to_string(),
                reason,
            });
        }
        Ok(LocalSession::new(&self.broker))
    }
}

/// Answers request payloads received on a served channel.
#[async_trait]
pub trait Responder: Send + Sync + 'static {
    /// Produce a response, or an error message for the requester.
    async fn respond(&self, payload: Value) -> Result<Value, String>;
}

#[async_trait]
impl<R: Responder> Responder for Arc<R> {
    async fn respond(&self, payload: Value) -> Result<Value, String> {
        (**self).respond(payload).await
    }
}

/// Answer every request envelope published on `channel` until the returned
/// task is aborted or the broker goes away.
///
/// Requests are answered one at a time, in arrival order.
pub fn serve<R: Responder>(
    broker: LocalBroker,
    channel: impl Into<String>,
    responder: R,
) -> JoinHandle<()> {
    let channel = channel.into();
    let mut receiver = broker.subscribe();

    tokio::spawn(async move {
        loop {
            let delivery = match receiver.recv().await {
                Ok(delivery) => delivery,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(channel = %channel, lagged = n, "responder lagged, requests dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if delivery.channel != channel {
                continue;
            }

            let (correlation_id, payload) = match serde_json::from_str(&delivery.message) {
                Ok(ChannelMessage::Request {
                    correlation_id,
                    payload,
                }) => (correlation_id, payload),
                Ok(_) => continue,
                Err(error) => {
                    debug!(channel = %channel, error = %error, "ignoring malformed request");
                    continue;
                }
            };

            let reply = match responder.respond(payload).await {
                Ok(response) => ChannelMessage::Response {
                    correlation_id,
                    response,
                },
                Err(error) => ChannelMessage::Error {
                    correlation_id,
                    error,
                },
            };

            match serde_json::to_string(&reply) {
                Ok(message) => {
                    broker.publish(&channel, message);
                }
                Err(error) => warn!(cid = %correlation_id, error = %error, "failed to encode reply"),
            }
        }
    })
}

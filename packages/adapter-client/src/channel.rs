//! Request/response calls over a publish/subscribe channel.
//!
//! A [`RequestChannel`] turns a fire-and-forget [`Transport`] into a
//! promise-style call. Each request gets a fresh [`CorrelationId`]; a
//! listener task routes every reply on the channel to the waiter registered
//! under that id.
//!
//! ```text
//! request(payload)
//!   ├─ register waiter[cid]          (before publishing: no send/receive race)
//!   ├─ publish {request, cid, payload}
//!   └─ await waiter[cid]
//!
//! listener task
//!   ├─ {response, cid, body} ─► waiter[cid].resolve(body)   remove entry
//!   ├─ {error, cid, msg}     ─► waiter[cid].reject(msg)     remove entry
//!   ├─ no waiter for cid     ─► discard (stale or unsolicited)
//!   └─ session terminated    ─► reject every waiter with ConnectionLost
//! ```
//!
//! # Guarantees
//!
//! - **One waiter per id**: registration fails rather than overwriting
//! - **Exactly one settlement** per request: response, remote error,
//!   timeout, or connection lost
//! - **Order independent**: ids, not arrival order, decide matching
//!
//! A request whose future is dropped deregisters its waiter; a reply that
//! arrives afterwards is discarded like any other unsolicited message.
//!
//! # Example
//!
//! ```ignore
//! let channel = RequestChannel::open(session, "adapter/rest/model/store", ChannelOptions::default());
//! let services: Vec<ServiceConfig> = channel.call(&ModelRequest::ListServices).await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::core::{ChannelMessage, CorrelationId};
use crate::error::RequestError;
use crate::transport::{Delivery, Transport};

/// Default time a request may stay pending before it is rejected.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Waiter = oneshot::Sender<Result<Value, RequestError>>;
type PendingMap = DashMap<CorrelationId, Waiter>;

/// Options for a [`RequestChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    /// How long a request may wait for its reply. `None` waits until the
    /// reply arrives or the session terminates.
    pub request_timeout: Option<Duration>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }
}

impl ChannelOptions {
    /// Options that never time a request out.
    pub fn unbounded() -> Self {
        Self {
            request_timeout: None,
        }
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

/// Correlated request/response calls on one named channel of one session.
pub struct RequestChannel {
    name: Arc<str>,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
    options: ChannelOptions,
    listener: JoinHandle<()>,
}

impl RequestChannel {
    /// Bind a channel to an established session.
    ///
    /// Subscribes before returning, so replies to requests issued right
    /// after `open` are never missed. Must be called inside a tokio runtime.
    pub fn open(
        transport: Arc<dyn Transport>,
        name: impl Into<String>,
        options: ChannelOptions,
    ) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let pending = Arc::new(PendingMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let receiver = transport.subscribe();
        let listener = tokio::spawn(listen(
            transport.clone(),
            receiver,
            name.clone(),
            pending.clone(),
            closed.clone(),
        ));

        debug!(channel = %name, "request channel opened");

        Self {
            name,
            transport,
            pending,
            closed,
            options,
            listener,
        }
    }

    /// Send `payload` and wait for the correlated reply.
    ///
    /// Not idempotent: every call is an independent request.
    pub async fn request(&self, payload: Value) -> Result<Value, RequestError> {
        self.request_with_id(CorrelationId::new(), payload).await
    }

    /// Serialize `request`, send it, and deserialize the reply.
    pub async fn call<Req, Res>(&self, request: &Req) -> Result<Res, RequestError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let payload = serde_json::to_value(request)?;
        let response = self.request(payload).await?;
        Ok(serde_json::from_value(response)?)
    }

    pub(crate) async fn request_with_id(
        &self,
        cid: CorrelationId,
        payload: Value,
    ) -> Result<Value, RequestError> {
        if self.is_closed() {
            return Err(RequestError::ConnectionLost);
        }

        let message = serde_json::to_string(&ChannelMessage::Request {
            correlation_id: cid,
            payload,
        })?;

        let (receiver, registration) = self.register(cid)?;

        // The listener sets `closed` before draining, so a waiter registered
        // after the drain is caught here.
        if self.is_closed() {
            return Err(RequestError::ConnectionLost);
        }

        trace!(channel = %self.name, cid = %cid, "publishing request");
        self.transport.publish(&self.name, message).await?;

        let settled = match self.options.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(settled) => settled,
                Err(_) => {
                    warn!(channel = %self.name, cid = %cid, timeout = ?limit, "request timed out");
                    return Err(RequestError::Timeout { duration: limit });
                }
            },
            None => receiver.await,
        };
        drop(registration);

        match settled {
            Ok(result) => result,
            // Waiter dropped without settling: the pending map went away.
            Err(_) => Err(RequestError::ConnectionLost),
        }
    }

    /// Register a waiter for `cid`, refusing to replace an existing one.
    fn register(
        &self,
        cid: CorrelationId,
    ) -> Result<(oneshot::Receiver<Result<Value, RequestError>>, Registration), RequestError> {
        match self.pending.entry(cid) {
            Entry::Occupied(_) => Err(RequestError::DuplicateCorrelation { id: cid }),
            Entry::Vacant(vacant) => {
                let (sender, receiver) = oneshot::channel();
                vacant.insert(sender);
                Ok((
                    receiver,
                    Registration {
                        pending: self.pending.clone(),
                        cid,
                    },
                ))
            }
        }
    }

    /// The channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Whether the underlying session has terminated or the channel was
    /// closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop listening and reject every pending request.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(channel = %self.name, "closing request channel");
        }
        self.listener.abort();
        reject_all(&self.pending);
    }
}

impl Drop for RequestChannel {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl std::fmt::Debug for RequestChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestChannel")
            .field("name", &self.name)
            .field("pending_requests", &self.pending_requests())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Removes a waiter from the pending map when its request stops waiting,
/// whether it settled, timed out, or was dropped by the caller.
struct Registration {
    pending: Arc<PendingMap>,
    cid: CorrelationId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.pending.remove(&self.cid);
    }
}

async fn listen(
    transport: Arc<dyn Transport>,
    mut receiver: broadcast::Receiver<Delivery>,
    name: Arc<str>,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
) {
    let terminated = transport.closed();
    tokio::pin!(terminated);

    loop {
        tokio::select! {
            received = receiver.recv() => match received {
                Ok(delivery) if delivery.channel == *name => route(&name, &pending, &delivery.message),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(channel = %name, lagged = n, "request channel lagged, replies may be missed");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut terminated => break,
        }
    }

    closed.store(true, Ordering::SeqCst);
    let rejected = reject_all(&pending);
    info!(channel = %name, rejected, "session terminated, request channel closed");
}

/// Hand a reply to its waiter, or discard it.
fn route(name: &str, pending: &PendingMap, raw: &str) {
    let message: ChannelMessage = match serde_json::from_str(raw) {
        Ok(message) => message,
        Err(error) => {
            debug!(channel = %name, error = %error, "discarding malformed message");
            return;
        }
    };

    let (cid, result) = match message {
        ChannelMessage::Request { .. } => return,
        ChannelMessage::Response {
            correlation_id,
            response,
        } => (correlation_id, Ok(response)),
        ChannelMessage::Error {
            correlation_id,
            error,
        } => (correlation_id, Err(RequestError::Remote { message: error })),
    };

    match pending.remove(&cid) {
        Some((_, waiter)) => {
            trace!(channel = %name, cid = %cid, "routing reply");
            // The requester may have stopped waiting in the meantime.
            let _ = waiter.send(result);
        }
        None => debug!(channel = %name, cid = %cid, "discarding unsolicited reply"),
    }
}

/// Reject every pending waiter with `ConnectionLost`. Returns how many.
fn reject_all(pending: &PendingMap) -> usize {
    let ids: Vec<CorrelationId> = pending.iter().map(|entry| *entry.key()).collect();
    let mut rejected = 0;
    for cid in ids {
        if let Some((_, waiter)) = pending.remove(&cid) {
            let _ = waiter.send(Err(RequestError::ConnectionLost));
            rejected += 1;
        }
    }
    rejected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{serve, LocalBroker, LocalSession, Responder};
    use async_trait::async_trait;
    use serde_json::json;

    const CHANNEL: &str = "adapter/rest/model/store";

    struct Doubler;

    #[async_trait]
    impl Responder for Doubler {
        async fn respond(&self, payload: Value) -> Result<Value, String> {
            match payload.get("value").and_then(Value::as_i64) {
                Some(v) => Ok(json!({ "result": v * 2 })),
                None => Err("missing value".into()),
            }
        }
    }

    fn open(session: &Arc<LocalSession>, options: ChannelOptions) -> RequestChannel {
        RequestChannel::open(session.clone(), CHANNEL, options)
    }

    /// Publish a raw reply envelope as if a responder had sent it.
    async fn reply(broker: &LocalBroker, message: ChannelMessage) {
        broker.publish(CHANNEL, serde_json::to_string(&message).unwrap());
    }

    /// Wait until `channel` has `n` pending requests.
    async fn until_pending(channel: &RequestChannel, n: usize) {
        while channel.pending_requests() < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_request_resolves_with_response() {
        let broker = LocalBroker::new();
        let _server = serve(broker.clone(), CHANNEL, Doubler);
        let session = LocalSession::attach(&broker);
        let channel = open(&session, ChannelOptions::default());

        let response = channel.request(json!({ "value": 21 })).await.unwrap();

        assert_eq!(response, json!({ "result": 42 }));
        assert_eq!(channel.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_error_envelope_rejects_request() {
        let broker = LocalBroker::new();
        let _server = serve(broker.clone(), CHANNEL, Doubler);
        let session = LocalSession::attach(&broker);
        let channel = open(&session, ChannelOptions::default());

        let result = channel.request(json!({})).await;

        match result {
            Err(RequestError::Remote { message }) => assert_eq!(message, "missing value"),
            other => panic!("expected remote error, got {:?}", other),
        }
        assert_eq!(channel.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_typed_call() {
        #[derive(serde::Deserialize)]
        struct Doubled {
            result: i64,
        }

        let broker = LocalBroker::new();
        let _server = serve(broker.clone(), CHANNEL, Doubler);
        let session = LocalSession::attach(&broker);
        let channel = open(&session, ChannelOptions::default());

        let doubled: Doubled = channel.call(&json!({ "value": 5 })).await.unwrap();
        assert_eq!(doubled.result, 10);
    }

    #[tokio::test]
    async fn test_out_of_order_replies_reach_their_requests() {
        const N: i64 = 16;

        let broker = LocalBroker::new();
        let mut requests = broker.subscribe();
        let session = LocalSession::attach(&broker);
        let channel = Arc::new(open(&session, ChannelOptions::unbounded()));

        let callers: Vec<_> = (0..N)
            .map(|i| {
                let channel = channel.clone();
                tokio::spawn(async move { (i, channel.request(json!(i)).await) })
            })
            .collect();

        let mut received = Vec::new();
        while received.len() < N as usize {
            let delivery = requests.recv().await.unwrap();
            if let Ok(ChannelMessage::Request {
                correlation_id,
                payload,
            }) = serde_json::from_str(&delivery.message)
            {
                received.push((correlation_id, payload));
            }
        }

        fastrand::shuffle(&mut received);
        for (correlation_id, payload) in received {
            let echoed = payload.as_i64().unwrap() * 10;
            reply(
                &broker,
                ChannelMessage::Response {
                    correlation_id,
                    response: json!(echoed),
                },
            )
            .await;
        }

        for caller in callers {
            let (i, result) = caller.await.unwrap();
            assert_eq!(result.unwrap(), json!(i * 10));
        }
        assert_eq!(channel.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_unsolicited_reply_is_discarded() {
        let broker = LocalBroker::new();
        let session = LocalSession::attach(&broker);
        let channel = Arc::new(open(&session, ChannelOptions::unbounded()));

        let cid = CorrelationId::new();
        let pending = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request_with_id(cid, json!("ping")).await }
        });
        until_pending(&channel, 1).await;

        reply(
            &broker,
            ChannelMessage::Response {
                correlation_id: CorrelationId::new(),
                response: json!("not yours"),
            },
        )
        .await;
        broker.publish(CHANNEL, "not even json");
        reply(
            &broker,
            ChannelMessage::Response {
                correlation_id: cid,
                response: json!("pong"),
            },
        )
        .await;

        assert_eq!(pending.await.unwrap().unwrap(), json!("pong"));
        assert_eq!(channel.pending_requests(), 0);
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn test_replies_on_other_channels_are_ignored() {
        let broker = LocalBroker::new();
        let session = LocalSession::attach(&broker);
        let channel = Arc::new(open(&session, ChannelOptions::unbounded()));

        let cid = CorrelationId::new();
        let pending = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request_with_id(cid, json!(1)).await }
        });
        until_pending(&channel, 1).await;

        let wrong_channel = ChannelMessage::Response {
            correlation_id: cid,
            response: json!("wrong"),
        };
        broker.publish("some/other/channel", serde_json::to_string(&wrong_channel).unwrap());
        reply(
            &broker,
            ChannelMessage::Response {
                correlation_id: cid,
                response: json!("right"),
            },
        )
        .await;

        assert_eq!(pending.await.unwrap().unwrap(), json!("right"));
    }

    #[tokio::test]
    async fn test_duplicate_correlation_id_is_refused() {
        let broker = LocalBroker::new();
        let session = LocalSession::attach(&broker);
        let channel = Arc::new(open(&session, ChannelOptions::unbounded()));

        let cid = CorrelationId::new();
        let first = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request_with_id(cid, json!(1)).await }
        });
        until_pending(&channel, 1).await;

        let second = channel.request_with_id(cid, json!(2)).await;
        assert!(matches!(
            second,
            Err(RequestError::DuplicateCorrelation { id }) if id == cid
        ));

        // The original waiter is untouched and still answerable.
        assert_eq!(channel.pending_requests(), 1);
        reply(
            &broker,
            ChannelMessage::Response {
                correlation_id: cid,
                response: json!("first"),
            },
        )
        .await;
        assert_eq!(first.await.unwrap().unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn test_timeout_rejects_and_deregisters() {
        let broker = LocalBroker::new();
        let session = LocalSession::attach(&broker);
        let channel = open(
            &session,
            ChannelOptions::default().with_request_timeout(Duration::from_millis(30)),
        );

        let result = channel.request(json!("anyone?")).await;

        assert!(matches!(
            result,
            Err(RequestError::Timeout { duration }) if duration == Duration::from_millis(30)
        ));
        assert_eq!(channel.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_dropped_request_deregisters() {
        let broker = LocalBroker::new();
        let session = LocalSession::attach(&broker);
        let channel = Arc::new(open(&session, ChannelOptions::unbounded()));

        let abandoned = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request(json!("never answered")).await }
        });
        until_pending(&channel, 1).await;

        abandoned.abort();
        let _ = abandoned.await;

        assert_eq!(channel.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_session_termination_rejects_all_pending() {
        let broker = LocalBroker::new();
        let session = LocalSession::attach(&broker);
        let channel = Arc::new(open(&session, ChannelOptions::unbounded()));

        let first = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request(json!(1)).await }
        });
        let second = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request(json!(2)).await }
        });
        until_pending(&channel, 2).await;

        session.disconnect();

        assert!(matches!(
            first.await.unwrap(),
            Err(RequestError::ConnectionLost)
        ));
        assert!(matches!(
            second.await.unwrap(),
            Err(RequestError::ConnectionLost)
        ));
        assert_eq!(channel.pending_requests(), 0);
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_request_after_termination_fails_fast() {
        let broker = LocalBroker::new();
        let session = LocalSession::attach(&broker);
        let channel = open(&session, ChannelOptions::unbounded());

        session.disconnect();
        while !channel.is_closed() {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            channel.request(json!(1)).await,
            Err(RequestError::ConnectionLost)
        ));
        assert_eq!(channel.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_close_rejects_pending() {
        let broker = LocalBroker::new();
        let session = LocalSession::attach(&broker);
        let channel = Arc::new(open(&session, ChannelOptions::unbounded()));

        let pending = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request(json!(1)).await }
        });
        until_pending(&channel, 1).await;

        channel.close();

        assert!(matches!(
            pending.await.unwrap(),
            Err(RequestError::ConnectionLost)
        ));
        assert!(channel.is_closed());
    }

    #[test]
    fn test_default_options() {
        assert_eq!(
            ChannelOptions::default().request_timeout,
            Some(DEFAULT_REQUEST_TIMEOUT)
        );
        assert_eq!(ChannelOptions::unbounded().request_timeout, None);
    }
}

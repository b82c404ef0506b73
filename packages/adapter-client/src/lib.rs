//! # Adapter Client
//!
//! Administrative client core for a REST-to-topic adapter.
//!
//! The adapter polls REST services and publishes what it reads to topics on
//! a pub/sub server. This crate is the client side of administering it:
//!
//! - an **event model** that turns every topic creation and every poll into
//!   an attempt/outcome pair, from which latency is derived;
//! - a **session gate** that decides whether calls needing a live session
//!   may proceed, plus memoized lazy session establishment;
//! - a **request channel** that layers correlated request/response calls
//!   over the session's publish/subscribe primitive.
//!
//! ## Architecture
//!
//! ```text
//! ModelClient ─────────────┐
//!     │ list/create/delete │ lazily
//!     ▼                    ▼
//! RequestChannel     SessionEstablisher ◄── SessionGate::can_proceed()
//!     │ publish           │ connect (once)
//!     │ subscribe         ▼
//!     └──────────►  Transport (session) ◄──► server / LocalBroker
//!
//! MetricsRecorder ─► MetricsDispatcher ─► counters, collectors, reporter
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One outcome per attempt** - completing an attempt consumes it
//! 2. **Latency is derived** - `request_time = outcome.timestamp - attempt.timestamp`
//! 3. **One connect at a time** - concurrent establishers share one attempt
//! 4. **One settlement per request** - response, remote error, timeout, or
//!    connection lost, and the waiter is always deregistered
//! 5. **Matching by id** - replies may arrive in any order
//!
//! ## Example
//!
//! ```ignore
//! use adapter_client::{ChannelOptions, LocalBroker, LocalConnector, ModelClient, SessionEstablisher};
//! use std::sync::Arc;
//!
//! let establisher = Arc::new(SessionEstablisher::new(LocalConnector::new(broker)));
//! let client = ModelClient::new(establisher.clone(), ChannelOptions::default());
//!
//! let gate = SessionGate::new(establisher, || redirect_to_login());
//! if gate.can_proceed().await {
//!     for service in client.list_services().await? {
//!         println!("{} -> {}", service.name, service.topic_path_root);
//!     }
//! }
//! ```

pub mod channel;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod gate;
pub mod local;
pub mod metrics;
pub mod model;
pub mod session;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


pub use channel::{ChannelOptions, RequestChannel, DEFAULT_REQUEST_TIMEOUT};
pub use config::ClientConfig;
pub use crate::core::{ChannelMessage, CorrelationId};
pub use error::{ClientError, ClockSkew, ConnectError, RequestError, SessionError, TransportError};
pub use events::{
    complete_outcome, start_attempt, Attempt, Clock, ManualClock, Outcome, PollAttempt,
    PollFailure, PollOutcome, PollRequest, PollSuccess, Settlement, SystemClock, Timestamp,
    TopicAddFailReason, TopicCreationAttempt, TopicCreationOutcome, TopicCreationRequest,
    TopicType,
};
pub use gate::{Remediation, SessionGate, SessionStatus};
pub use local::{serve, LocalBroker, LocalConnector, LocalSession, Responder};
pub use metrics::{
    BoundedEventCollector, BoundedPollEventCollector, BoundedTopicCreationEventCollector,
    EventCountReporter, MetricsDispatcher, MetricsRecorder, PollEventCounter, PollEventListener,
    TopicCreationEventCounter, TopicCreationEventListener,
};
pub use model::{
    EndpointConfig, Model, ModelClient, ModelController, ModelRequest, ServiceConfig,
    DEFAULT_MODEL_CHANNEL,
};
pub use session::{
    Connector, EstablishmentState, SessionEstablisher, SessionHandle, SessionProvider,
};
pub use transport::{Delivery, Transport};

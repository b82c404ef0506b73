//! Attempt/outcome events for operation latency.
//!
//! Every instrumented operation produces exactly two immutable records:
//!
//! ```text
//! start_attempt(key, t0) ──► Attempt ──complete_outcome(t1, settlement)──► Outcome
//!                                                                           │
//!                                               request_time() = t1 - t0 ◄──┘
//! ```
//!
//! Two operations are instrumented today:
//!
//! | Operation      | Key                      | Success         | Failure                |
//! |----------------|--------------------------|-----------------|------------------------|
//! | Topic creation | [`TopicCreationRequest`] | `()`            | [`TopicAddFailReason`] |
//! | HTTP poll      | [`PollRequest`]          | [`PollSuccess`] | [`PollFailure`]        |
//!
//! The model never reads a clock. Callers pass timestamps in, which keeps
//! latency deterministic for fixed inputs. Use a [`Clock`] at the call site
//! (see [`crate::metrics::MetricsRecorder`]).
//!
//! Completing an attempt consumes it, so a given attempt value settles at
//! most once. Success and failure are equally ordinary results; nothing in
//! this module returns an error except [`Outcome::elapsed`], which refuses
//! to hide clock skew.

use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ClockSkew;

/// Milliseconds on a single clock. Attempt and outcome of one operation must
/// be stamped by the same clock.
pub type Timestamp = i64;

// =============================================================================
// Clocks
// =============================================================================

/// Source of timestamps for instrumented call sites.
pub trait Clock: Send + Sync {
    /// The current time in milliseconds.
    fn now(&self) -> Timestamp;
}

/// Wall clock, milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Create a clock reading `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Jump to an absolute time. Jumping backwards is allowed so tests can
    /// provoke [`ClockSkew`].
    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move forward by `millis`.
    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

// =============================================================================
// Generic attempt / outcome
// =============================================================================

/// The start of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt<K> {
    key: K,
    started_at: Timestamp,
}

/// How an operation settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement<S, F> {
    /// The operation completed.
    Success(S),
    /// The operation failed.
    Failure(F),
}

/// The settlement of a previously started [`Attempt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome<K, S, F> {
    attempt: Attempt<K>,
    settlement: Settlement<S, F>,
    settled_at: Timestamp,
}

/// Record that an operation identified by `key` was dispatched at `timestamp`.
pub fn start_attempt<K>(key: K, timestamp: Timestamp) -> Attempt<K> {
    Attempt {
        key,
        started_at: timestamp,
    }
}

/// Record that `attempt` settled at `timestamp`.
pub fn complete_outcome<K, S, F>(
    attempt: Attempt<K>,
    timestamp: Timestamp,
    settlement: Settlement<S, F>,
) -> Outcome<K, S, F> {
    Outcome {
        attempt,
        settlement,
        settled_at: timestamp,
    }
}

impl<K> Attempt<K> {
    /// The operation-specific key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// When the operation was dispatched.
    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// Settle this attempt successfully.
    pub fn succeed<S, F>(self, timestamp: Timestamp, metadata: S) -> Outcome<K, S, F> {
        complete_outcome(self, timestamp, Settlement::Success(metadata))
    }

    /// Settle this attempt with a failure.
    pub fn fail<S, F>(self, timestamp: Timestamp, reason: F) -> Outcome<K, S, F> {
        complete_outcome(self, timestamp, Settlement::Failure(reason))
    }
}

impl<K, S, F> Outcome<K, S, F> {
    /// The attempt this outcome settles.
    pub fn attempt(&self) -> &Attempt<K> {
        &self.attempt
    }

    /// Shortcut for `self.attempt().key()`.
    pub fn key(&self) -> &K {
        &self.attempt.key
    }

    /// How the operation settled.
    pub fn settlement(&self) -> &Settlement<S, F> {
        &self.settlement
    }

    /// When the operation settled.
    pub fn settled_at(&self) -> Timestamp {
        self.settled_at
    }

    /// Whether the operation succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self.settlement, Settlement::Success(_))
    }

    /// Success metadata, if the operation succeeded.
    pub fn success(&self) -> Option<&S> {
        match &self.settlement {
            Settlement::Success(s) => Some(s),
            Settlement::Failure(_) => None,
        }
    }

    /// Failure reason, if the operation failed.
    pub fn failure(&self) -> Option<&F> {
        match &self.settlement {
            Settlement::Success(_) => None,
            Settlement::Failure(f) => Some(f),
        }
    }

    /// Milliseconds between attempt and outcome.
    ///
    /// Derived on every call from the two timestamps. Negative when the
    /// clock went backwards. Saturates at the bounds of `i64`.
    pub fn request_time(&self) -> i64 {
        self.settled_at.saturating_sub(self.attempt.started_at)
    }

    /// The interval between attempt and outcome as a `Duration`, or
    /// [`ClockSkew`] if it is negative.
    pub fn elapsed(&self) -> Result<Duration, ClockSkew> {
        let millis = i128::from(self.settled_at) - i128::from(self.attempt.started_at);
        u64::try_from(millis)
            .map(Duration::from_millis)
            .map_err(|_| ClockSkew {
                started_at: self.attempt.started_at,
                settled_at: self.settled_at,
            })
    }
}

// =============================================================================
// Topic creation
// =============================================================================

/// Value type of a topic, which is also the adapter's endpoint type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicType {
    /// JSON values.
    Json,
    /// Plain text values.
    String,
    /// Opaque bytes.
    Binary,
}

impl TopicType {
    /// Resolve an endpoint type from its name or a supported media type.
    pub fn from_identifier(identifier: &str) -> Option<Self> {
        match identifier {
            "json" | "application/json" | "text/json" => Some(TopicType::Json),
            "string" | "text/plain" => Some(TopicType::String),
            "binary" | "application/octet-stream" => Some(TopicType::Binary),
            _ => None,
        }
    }

    /// Best guess for the topic type of an HTTP `Content-Type`.
    pub fn infer_from_content_type(content_type: Option<&str>) -> Self {
        match content_type {
            Some(ct) if ct.starts_with("application/json") || ct.starts_with("text/json") => {
                TopicType::Json
            }
            Some(ct) if ct.starts_with("text/plain") => TopicType::String,
            _ => TopicType::Binary,
        }
    }

    /// The canonical identifier for this type.
    pub fn identifier(&self) -> &'static str {
        match self {
            TopicType::Json => "json",
            TopicType::String => "string",
            TopicType::Binary => "binary",
        }
    }
}

impl fmt::Display for TopicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

/// Key of a topic creation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicCreationRequest {
    /// Path of the topic to create.
    pub path: String,
    /// Declared type of the topic.
    pub topic_type: TopicType,
    /// Length in bytes of the initial value, zero when there is none.
    pub initial_value_length: usize,
}

/// Why the server refused to create a topic.
///
/// The set is owned by the server; this client only reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicAddFailReason {
    /// A topic already exists at the path with the same details.
    Exists,
    /// A topic already exists at the path with different details.
    ExistsMismatch,
    /// The path is not valid.
    InvalidPath,
    /// The topic details are not valid.
    InvalidDetails,
    /// The session lacks permission to create the topic.
    PermissionsFailure,
    /// The server's license does not allow more topics.
    ExceededLicenseLimit,
    /// The parent topic does not allow children of this type.
    IncompatibleParent,
    /// The topic could not be initialised with its initial value.
    InitialiseError,
    /// User supplied code on the server failed.
    UserCodeError,
    /// The cluster was repartitioning.
    ClusterRepartition,
    /// Any other server-side failure.
    UnexpectedError,
}

impl fmt::Display for TopicAddFailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TopicAddFailReason::Exists => "exists",
            TopicAddFailReason::ExistsMismatch => "exists_mismatch",
            TopicAddFailReason::InvalidPath => "invalid_path",
            TopicAddFailReason::InvalidDetails => "invalid_details",
            TopicAddFailReason::PermissionsFailure => "permissions_failure",
            TopicAddFailReason::ExceededLicenseLimit => "exceeded_license_limit",
            TopicAddFailReason::IncompatibleParent => "incompatible_parent",
            TopicAddFailReason::InitialiseError => "initialise_error",
            TopicAddFailReason::UserCodeError => "user_code_error",
            TopicAddFailReason::ClusterRepartition => "cluster_repartition",
            TopicAddFailReason::UnexpectedError => "unexpected_error",
        };
        f.write_str(name)
    }
}

/// A topic creation attempt.
pub type TopicCreationAttempt = Attempt<TopicCreationRequest>;

/// A settled topic creation.
pub type TopicCreationOutcome = Outcome<TopicCreationRequest, (), TopicAddFailReason>;

// =============================================================================
// Polling
// =============================================================================

/// Key of a poll attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PollRequest {
    /// The polled resource.
    pub uri: String,
}

/// Metadata of a completed poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSuccess {
    /// HTTP status code of the response.
    pub status_code: u16,
    /// Length in bytes of the response body.
    pub response_length: u64,
}

/// Opaque failure of a poll.
///
/// Polls fail inside an HTTP stack this crate does not control, so the
/// failure keeps whatever error it was given and exposes only its message
/// and source chain.
#[derive(Clone)]
pub struct PollFailure {
    inner: Arc<dyn StdError + Send + Sync>,
}

#[derive(Debug, Error)]
#[error("{0}")]
struct MessageError(String);

impl PollFailure {
    /// Wrap an arbitrary error.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(error),
        }
    }

    /// A failure described only by a message.
    pub fn from_message(message: impl Into<String>) -> Self {
        Self::new(MessageError(message.into()))
    }

    /// Human readable description of the failure.
    pub fn message(&self) -> String {
        self.inner.to_string()
    }
}

impl fmt::Debug for PollFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PollFailure").field(&self.message()).finish()
    }
}

impl fmt::Display for PollFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl StdError for PollFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source()
    }
}

/// A poll attempt.
pub type PollAttempt = Attempt<PollRequest>;

/// A settled poll.
pub type PollOutcome = Outcome<PollRequest, PollSuccess, PollFailure>;

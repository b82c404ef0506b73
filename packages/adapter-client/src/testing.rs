//! Test doubles for sessions, gates and metrics.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! adapter-client = { version = "0.1", features = ["testing"] }
//! ```
//!
//! | Double                   | Stands in for          | Observes                    |
//! |--------------------------|------------------------|-----------------------------|
//! | [`StaticSession`]        | a session handle       | connectivity you set        |
//! | [`StaticProvider`]       | a session provider     | always the same answer      |
//! | [`CountingConnector`]    | a connector            | number of connects          |
//! | [`RecordingRemediation`] | a login redirect       | number of remediations      |
//! | [`RecordingListener`]    | a metrics sink         | every event, in order       |
//!
//! # Example
//!
//! ```ignore
//! use adapter_client::testing::{RecordingRemediation, StaticProvider, StaticSession};
//!
//! let remediation = RecordingRemediation::new();
//! let gate = SessionGate::new(
//!     StaticProvider::with_session(StaticSession::disconnected()),
//!     remediation.clone(),
//! );
//!
//! assert!(!gate.can_proceed().await);
//! assert_eq!(remediation.count(), 1);
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ConnectError, SessionError};
use crate::events::{PollAttempt, PollOutcome, TopicCreationAttempt, TopicCreationOutcome};
use crate::gate::Remediation;
use crate::metrics::{PollEventListener, TopicCreationEventListener};
use crate::session::{Connector, SessionHandle, SessionProvider};

// =============================================================================
// Sessions
// =============================================================================

/// A session whose connectivity is set by the test.
///
/// Clones share state, so a test can keep one clone and flip the other.
#[derive(Debug, Clone)]
pub struct StaticSession {
    connected: Arc<AtomicBool>,
}

impl StaticSession {
    pub fn connected() -> Self {
        Self {
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl SessionHandle for StaticSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// A provider that always gives the same answer.
#[derive(Debug, Clone)]
pub struct StaticProvider {
    session: Option<StaticSession>,
}

impl StaticProvider {
    /// Every lookup fails with [`SessionError::NoSession`].
    pub fn no_session() -> Self {
        Self { session: None }
    }

    /// Every lookup returns a handle sharing `session`'s state.
    pub fn with_session(session: StaticSession) -> Self {
        Self {
            session: Some(session),
        }
    }
}

#[async_trait]
impl SessionProvider for StaticProvider {
    type Session = StaticSession;

    async fn get_session(&self) -> Result<Arc<StaticSession>, SessionError> {
        self.session
            .clone()
            .map(Arc::new)
            .ok_or(SessionError::NoSession)
    }
}

/// A connector that counts its connects.
pub struct CountingConnector {
    connects: AtomicUsize,
    delay: Option<Duration>,
    refusal: Option<String>,
}

impl CountingConnector {
    /// Every connect succeeds with a connected session.
    pub fn connected() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            delay: None,
            refusal: None,
        }
    }

    /// Every connect is rejected with `reason`.
    pub fn refusing(reason: impl Into<String>) -> Self {
        Self {
            refusal: Some(reason.into()),
            ..Self::connected()
        }
    }

    /// Take `delay` to answer each connect.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Connects started so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for CountingConnector {
    type Session = StaticSession;

    async fn connect(&self) -> Result<StaticSession, ConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.refusal {
            Some(reason) => Err(ConnectError::Rejected {
                endpoint: "test".to_string(),
                reason: reason.clone(),
            }),
            None => Ok(StaticSession::connected()),
        }
    }
}

// =============================================================================
// Gate
// =============================================================================

/// Counts remediations. Clones share the count.
#[derive(Debug, Clone, Default)]
pub struct RecordingRemediation {
    count: Arc<AtomicUsize>,
}

impl RecordingRemediation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Remediation for RecordingRemediation {
    fn remediate(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Metrics
// =============================================================================

#[derive(Default)]
struct Recorded {
    poll_requests: Vec<PollAttempt>,
    poll_successes: Vec<PollOutcome>,
    poll_failures: Vec<PollOutcome>,
    topic_creation_requests: Vec<TopicCreationAttempt>,
    topic_creation_successes: Vec<TopicCreationOutcome>,
    topic_creation_failures: Vec<TopicCreationOutcome>,
}

/// Records every event it is given.
#[derive(Default)]
pub struct RecordingListener {
    recorded: Mutex<Recorded>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn poll_requests(&self) -> Vec<PollAttempt> {
        self.lock().poll_requests.clone()
    }

    pub fn poll_successes(&self) -> Vec<PollOutcome> {
        self.lock().poll_successes.clone()
    }

    pub fn poll_failures(&self) -> Vec<PollOutcome> {
        self.lock().poll_failures.clone()
    }

    pub fn topic_creation_requests(&self) -> Vec<TopicCreationAttempt> {
        self.lock().topic_creation_requests.clone()
    }

    pub fn topic_creation_successes(&self) -> Vec<TopicCreationOutcome> {
        self.lock().topic_creation_successes.clone()
    }

    pub fn topic_creation_failures(&self) -> Vec<TopicCreationOutcome> {
        self.lock().topic_creation_failures.clone()
    }
}

impl PollEventListener for RecordingListener {
    fn on_poll_request(&self, attempt: &PollAttempt) {
        self.lock().poll_requests.push(attempt.clone());
    }

    fn on_poll_success(&self, outcome: &PollOutcome) {
        self.lock().poll_successes.push(outcome.clone());
    }

    fn on_poll_failed(&self, outcome: &PollOutcome) {
        self.lock().poll_failures.push(outcome.clone());
    }
}

impl TopicCreationEventListener for RecordingListener {
    fn on_topic_creation_request(&self, attempt: &TopicCreationAttempt) {
        self.lock().topic_creation_requests.push(attempt.clone());
    }

    fn on_topic_creation_success(&self, outcome: &TopicCreationOutcome) {
        self.lock().topic_creation_successes.push(outcome.clone());
    }

    fn on_topic_creation_failed(&self, outcome: &TopicCreationOutcome) {
        self.lock().topic_creation_failures.push(outcome.clone());
    }
}

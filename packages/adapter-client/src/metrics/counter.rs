//! Running totals of events.

use std::sync::atomic::{AtomicU64, Ordering};

use super::{PollEventListener, TopicCreationEventListener};
use crate::events::{PollAttempt, PollOutcome, TopicCreationAttempt, TopicCreationOutcome};

/// Counts poll events and the bytes received by successful polls.
#[derive(Debug, Default)]
pub struct PollEventCounter {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    response_bytes: AtomicU64,
}

impl PollEventCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Sum of the response lengths of every successful poll.
    pub fn total_response_bytes(&self) -> u64 {
        self.response_bytes.load(Ordering::Relaxed)
    }
}

impl PollEventListener for PollEventCounter {
    fn on_poll_request(&self, _attempt: &PollAttempt) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    fn on_poll_success(&self, outcome: &PollOutcome) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        if let Some(success) = outcome.success() {
            self.response_bytes
                .fetch_add(success.response_length, Ordering::Relaxed);
        }
    }

    fn on_poll_failed(&self, _outcome: &PollOutcome) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counts topic creation events.
#[derive(Debug, Default)]
pub struct TopicCreationEventCounter {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl TopicCreationEventCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl TopicCreationEventListener for TopicCreationEventCounter {
    fn on_topic_creation_request(&self, _attempt: &TopicCreationAttempt) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    fn on_topic_creation_success(&self, _outcome: &TopicCreationOutcome) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    fn on_topic_creation_failed(&self, _outcome: &TopicCreationOutcome) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

//! Sinks for attempt/outcome events.
//!
//! Instrumented call sites go through a [`MetricsRecorder`], which stamps
//! events with its clock and hands them to a [`MetricsDispatcher`]. The
//! dispatcher fans every event out to the registered listeners:
//!
//! ```text
//! call site ─► MetricsRecorder ─► MetricsDispatcher ─┬─► PollEventCounter
//!              (clock, events)                       ├─► BoundedEventCollector
//!                                                    └─► …any listener
//! ```
//!
//! | Listener                      | Keeps                                       |
//! |-------------------------------|---------------------------------------------|
//! | [`PollEventCounter`]          | request/success/failure counts, bytes read  |
//! | [`TopicCreationEventCounter`] | request/success/failure counts              |
//! | [`BoundedEventCollector`]     | the most recent N events of each kind       |
//!
//! [`EventCountReporter`] periodically logs the counters.
//!
//! Listeners observe; they cannot fail the operation being measured, so the
//! callbacks return nothing.

mod collector;
mod counter;
mod recorder;
mod reporter;

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

use crate::events::{PollAttempt, PollOutcome, TopicCreationAttempt, TopicCreationOutcome};

pub use collector::{
    BoundedEventCollector, BoundedPollEventCollector, BoundedTopicCreationEventCollector,
    DEFAULT_EVENT_LIMIT,
};
pub use counter::{PollEventCounter, TopicCreationEventCounter};
pub use recorder::MetricsRecorder;
pub use reporter::{EventCountReporter, DEFAULT_REPORT_INTERVAL};

/// Observes poll events.
pub trait PollEventListener: Send + Sync {
    /// A poll was dispatched.
    fn on_poll_request(&self, _attempt: &PollAttempt) {}

    /// A poll completed with a response.
    fn on_poll_success(&self, _outcome: &PollOutcome) {}

    /// A poll failed.
    fn on_poll_failed(&self, _outcome: &PollOutcome) {}
}

/// Observes topic creation events.
pub trait TopicCreationEventListener: Send + Sync {
    /// A topic creation was requested.
    fn on_topic_creation_request(&self, _attempt: &TopicCreationAttempt) {}

    /// The topic was created.
    fn on_topic_creation_success(&self, _outcome: &TopicCreationOutcome) {}

    /// The server refused to create the topic.
    fn on_topic_creation_failed(&self, _outcome: &TopicCreationOutcome) {}
}

/// Fans events out to every registered listener.
///
/// Listeners can be added at any time; an event is delivered to the
/// listeners registered when it was dispatched, in registration order.
#[derive(Default)]
pub struct MetricsDispatcher {
    poll_listeners: RwLock<Vec<Arc<dyn PollEventListener>>>,
    topic_creation_listeners: RwLock<Vec<Arc<dyn TopicCreationEventListener>>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!("listener registry was poisoned, recovering");
        poisoned.into_inner()
    })
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!("listener registry was poisoned, recovering");
        poisoned.into_inner()
    })
}

impl MetricsDispatcher {
    /// A dispatcher with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a poll listener.
    pub fn add_poll_listener(&self, listener: Arc<dyn PollEventListener>) {
        write(&self.poll_listeners).push(listener);
    }

    /// Register a topic creation listener.
    pub fn add_topic_creation_listener(&self, listener: Arc<dyn TopicCreationEventListener>) {
        write(&self.topic_creation_listeners).push(listener);
    }

    /// Number of registered listeners, poll and topic creation combined.
    pub fn listener_count(&self) -> usize {
        read(&self.poll_listeners).len() + read(&self.topic_creation_listeners).len()
    }

    fn poll_listeners(&self) -> Vec<Arc<dyn PollEventListener>> {
        read(&self.poll_listeners).clone()
    }

    fn topic_creation_listeners(&self) -> Vec<Arc<dyn TopicCreationEventListener>> {
        read(&self.topic_creation_listeners).clone()
    }
}

// Listeners are called outside the registry lock so a listener may register
// further listeners.

impl PollEventListener for MetricsDispatcher {
    fn on_poll_request(&self, attempt: &PollAttempt) {
        for listener in self.poll_listeners() {
            listener.on_poll_request(attempt);
        }
    }

    fn on_poll_success(&self, outcome: &PollOutcome) {
        for listener in self.poll_listeners() {
            listener.on_poll_success(outcome);
        }
    }

    fn on_poll_failed(&self, outcome: &PollOutcome) {
        for listener in self.poll_listeners() {
            listener.on_poll_failed(outcome);
        }
    }
}

impl TopicCreationEventListener for MetricsDispatcher {
    fn on_topic_creation_request(&self, attempt: &TopicCreationAttempt) {
        for listener in self.topic_creation_listeners() {
            listener.on_topic_creation_request(attempt);
        }
    }

    fn on_topic_creation_success(&self, outcome: &TopicCreationOutcome) {
        for listener in self.topic_creation_listeners() {
            listener.on_topic_creation_success(outcome);
        }
    }

    fn on_topic_creation_failed(&self, outcome: &TopicCreationOutcome) {
        for listener in self.topic_creation_listeners() {
            listener.on_topic_creation_failed(outcome);
        }
    }
}

impl std::fmt::Debug for MetricsDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsDispatcher")
            .field("poll_listeners", &read(&self.poll_listeners).len())
            .field(
                "topic_creation_listeners",
                &read(&self.topic_creation_listeners).len(),
            )
            .finish()
    }
}

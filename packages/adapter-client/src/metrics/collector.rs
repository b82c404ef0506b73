//! Bounded in-memory history of recent events.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tracing::warn;

use super::{PollEventListener, TopicCreationEventListener};
use crate::events::{
    Attempt, Outcome, PollAttempt, PollFailure, PollOutcome, PollRequest, PollSuccess,
    TopicAddFailReason, TopicCreationAttempt, TopicCreationOutcome, TopicCreationRequest,
};

/// Events of each kind kept by default.
pub const DEFAULT_EVENT_LIMIT: usize = 100;

struct History<K, S, F> {
    requests: VecDeque<Attempt<K>>,
    successes: VecDeque<Outcome<K, S, F>>,
    failures: VecDeque<Outcome<K, S, F>>,
}

fn push_bounded<T>(events: &mut VecDeque<T>, limit: usize, event: T) {
    if limit == 0 {
        return;
    }
    if events.len() >= limit {
        events.pop_front();
    }
    events.push_back(event);
}

/// Keeps the most recent `limit` requests, successes and failures.
///
/// Each kind is bounded separately, so a burst of failures does not push
/// out the successes latency is computed from.
pub struct BoundedEventCollector<K, S, F> {
    limit: usize,
    history: Mutex<History<K, S, F>>,
}

/// Collects poll events.
pub type BoundedPollEventCollector = BoundedEventCollector<PollRequest, PollSuccess, PollFailure>;

/// Collects topic creation events.
pub type BoundedTopicCreationEventCollector =
    BoundedEventCollector<TopicCreationRequest, (), TopicAddFailReason>;

impl<K, S, F> BoundedEventCollector<K, S, F>
where
    K: Clone,
    S: Clone,
    F: Clone,
{
    /// A collector keeping [`DEFAULT_EVENT_LIMIT`] events of each kind.
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_EVENT_LIMIT)
    }

    /// A collector keeping `limit` events of each kind.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            history: Mutex::new(History {
                requests: VecDeque::with_capacity(limit),
                successes: VecDeque::with_capacity(limit),
                failures: VecDeque::with_capacity(limit),
            }),
        }
    }

    fn lock_history(&self) -> MutexGuard<'_, History<K, S, F>> {
        self.history.lock().unwrap_or_else(|poisoned| {
            warn!("event history was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Events of each kind retained.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Record an attempt.
    pub fn record_request(&self, attempt: &Attempt<K>) {
        let mut history = self.lock_history();
        push_bounded(&mut history.requests, self.limit, attempt.clone());
    }

    /// Record an outcome, as a success or a failure.
    pub fn record_outcome(&self, outcome: &Outcome<K, S, F>) {
        let mut history = self.lock_history();
        let events = if outcome.is_success() {
            &mut history.successes
        } else {
            &mut history.failures
        };
        push_bounded(events, self.limit, outcome.clone());
    }

    /// Retained attempts, oldest first.
    pub fn requests(&self) -> Vec<Attempt<K>> {
        self.lock_history().requests.iter().cloned().collect()
    }

    /// Retained successful outcomes, oldest first.
    pub fn successes(&self) -> Vec<Outcome<K, S, F>> {
        self.lock_history().successes.iter().cloned().collect()
    }

    /// Retained failed outcomes, oldest first.
    pub fn failures(&self) -> Vec<Outcome<K, S, F>> {
        self.lock_history().failures.iter().cloned().collect()
    }

    /// The `percentile`th request time of the retained successes, by the
    /// nearest-rank method. `None` when no success is retained.
    ///
    /// `percentile` is clamped to `0.0..=100.0`; `0` gives the fastest.
    pub fn successful_request_time_percentile(&self, percentile: f64) -> Option<i64> {
        let mut times: Vec<i64> = self
            .lock_history()
            .successes
            .iter()
            .map(Outcome::request_time)
            .collect();
        if times.is_empty() {
            return None;
        }
        times.sort_unstable();

        let percentile = if percentile.is_nan() {
            0.0
        } else {
            percentile.clamp(0.0, 100.0)
        };
        let rank = (percentile / 100.0 * times.len() as f64).ceil() as usize;
        let index = rank.clamp(1, times.len()) - 1;
        Some(times[index])
    }

    /// The 90th percentile request time of the retained successes.
    pub fn successful_request_time_90th_percentile(&self) -> Option<i64> {
        self.successful_request_time_percentile(90.0)
    }
}

impl<K: Clone, S: Clone, F: Clone> Default for BoundedEventCollector<K, S, F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, S, F> std::fmt::Debug for BoundedEventCollector<K, S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedEventCollector")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl PollEventListener for BoundedPollEventCollector {
    fn on_poll_request(&self, attempt: &PollAttempt) {
        self.record_request(attempt);
    }

    fn on_poll_success(&self, outcome: &PollOutcome) {
        self.record_outcome(outcome);
    }

    fn on_poll_failed(&self, outcome: &PollOutcome) {
        self.record_outcome(outcome);
    }
}

impl TopicCreationEventListener for BoundedTopicCreationEventCollector {
    fn on_topic_creation_request(&self, attempt: &TopicCreationAttempt) {
        self.record_request(attempt);
    }

    fn on_topic_creation_success(&self, outcome: &TopicCreationOutcome) {
        self.record_outcome(outcome);
    }

    fn on_topic_creation_failed(&self, outcome: &TopicCreationOutcome) {
        self.record_outcome(outcome);
    }
}

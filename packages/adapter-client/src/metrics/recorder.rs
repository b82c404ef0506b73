//! Stamps events with a clock and dispatches them.

use std::sync::Arc;

use tracing::debug;

use super::{MetricsDispatcher, PollEventListener, TopicCreationEventListener};
use crate::events::{
    start_attempt, Clock, PollAttempt, PollFailure, PollOutcome, PollRequest, PollSuccess,
    TopicAddFailReason, TopicCreationAttempt, TopicCreationOutcome, TopicCreationRequest,
    TopicType,
};

/// Instrumentation helper for call sites.
///
/// Each `begin_*` reads the clock once and returns the attempt; the matching
/// completion consumes it, reads the clock again and returns the outcome.
/// Both are dispatched before being returned.
///
/// ```ignore
/// let attempt = recorder.begin_poll(uri);
/// match http.get(uri).await {
///     Ok(resp) => recorder.poll_succeeded(attempt, resp.status, resp.len),
///     Err(e) => recorder.poll_failed(attempt, PollFailure::new(e)),
/// };
/// ```
pub struct MetricsRecorder<C: Clock> {
    clock: C,
    dispatcher: Arc<MetricsDispatcher>,
}

impl<C: Clock> MetricsRecorder<C> {
    /// A recorder reading `clock` and dispatching to `dispatcher`.
    pub fn new(clock: C, dispatcher: Arc<MetricsDispatcher>) -> Self {
        Self { clock, dispatcher }
    }

    /// The dispatcher events go to.
    pub fn dispatcher(&self) -> &Arc<MetricsDispatcher> {
        &self.dispatcher
    }

    /// The clock events are stamped with.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// A poll of `uri` is about to be dispatched.
    pub fn begin_poll(&self, uri: impl Into<String>) -> PollAttempt {
        let attempt = start_attempt(PollRequest { uri: uri.into() }, self.clock.now());
        self.dispatcher.on_poll_request(&attempt);
        attempt
    }

    /// The poll received a response.
    pub fn poll_succeeded(
        &self,
        attempt: PollAttempt,
        status_code: u16,
        response_length: u64,
    ) -> PollOutcome {
        let outcome = attempt.succeed(
            self.clock.now(),
            PollSuccess {
                status_code,
                response_length,
            },
        );
        debug!(
            uri = %outcome.key().uri,
            status_code,
            request_time = outcome.request_time(),
            "poll succeeded"
        );
        self.dispatcher.on_poll_success(&outcome);
        outcome
    }

    /// The poll failed.
    pub fn poll_failed(&self, attempt: PollAttempt, failure: PollFailure) -> PollOutcome {
        let outcome = attempt.fail(self.clock.now(), failure);
        debug!(
            uri = %outcome.key().uri,
            request_time = outcome.request_time(),
            "poll failed"
        );
        self.dispatcher.on_poll_failed(&outcome);
        outcome
    }

    /// A topic is about to be created.
    pub fn begin_topic_creation(
        &self,
        path: impl Into<String>,
        topic_type: TopicType,
        initial_value_length: usize,
    ) -> TopicCreationAttempt {
        let request = TopicCreationRequest {
            path: path.into(),
            topic_type,
            initial_value_length,
        };
        let attempt = start_attempt(request, self.clock.now());
        self.dispatcher.on_topic_creation_request(&attempt);
        attempt
    }

    /// The topic was created.
    pub fn topic_created(&self, attempt: TopicCreationAttempt) -> TopicCreationOutcome {
        let outcome = attempt.succeed(self.clock.now(), ());
        self.dispatcher.on_topic_creation_success(&outcome);
        outcome
    }

    /// The server refused to create the topic.
    pub fn topic_creation_failed(
        &self,
        attempt: TopicCreationAttempt,
        reason: TopicAddFailReason,
    ) -> TopicCreationOutcome {
        let outcome = attempt.fail(self.clock.now(), reason);
        debug!(
            path = %outcome.key().path,
            reason = %reason,
            "topic creation failed"
        );
        self.dispatcher.on_topic_creation_failed(&outcome);
        outcome
    }
}

//! Periodic logging of event counts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{PollEventCounter, TopicCreationEventCounter};

/// Time between reports unless configured otherwise.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Logs the counters every interval, the first time one interval after
/// [`start`](Self::start).
pub struct EventCountReporter {
    inner: Arc<ReporterInner>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct ReporterInner {
    polls: Arc<PollEventCounter>,
    topic_creations: Arc<TopicCreationEventCounter>,
    reports: AtomicU64,
}

impl ReporterInner {
    fn report(&self) {
        info!(
            requests = self.polls.requests(),
            successes = self.polls.successes(),
            failures = self.polls.failures(),
            received_bytes = self.polls.total_response_bytes(),
            "poll events"
        );
        info!(
            requests = self.topic_creations.requests(),
            successes = self.topic_creations.successes(),
            failures = self.topic_creations.failures(),
            "topic creation events"
        );
        self.reports.fetch_add(1, Ordering::Relaxed);
    }
}

impl EventCountReporter {
    /// A stopped reporter over the given counters.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    pub fn new(
        polls: Arc<PollEventCounter>,
        topic_creations: Arc<TopicCreationEventCounter>,
        interval: Duration,
    ) -> Self {
        assert!(!interval.is_zero(), "report interval must be non-zero");
        Self {
            inner: Arc::new(ReporterInner {
                polls,
                topic_creations,
                reports: AtomicU64::new(0),
            }),
            interval,
            task: Mutex::new(None),
        }
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|poisoned| {
            warn!("reporter mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Begin reporting. Does nothing if already started.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(&self) {
        let mut task = self.lock_task();
        if task.is_some() {
            return;
        }

        let inner = self.inner.clone();
        let period = self.interval;
        debug!(interval = ?period, "starting event count reporter");
        *task = Some(tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                inner.report();
            }
        }));
    }

    /// Log the counters now, outside the schedule.
    pub fn report(&self) {
        self.inner.report();
    }

    /// Whether reporting is scheduled.
    pub fn is_running(&self) -> bool {
        self.lock_task().is_some()
    }

    /// How many reports have been logged.
    pub fn reports(&self) -> u64 {
        self.inner.reports.load(Ordering::Relaxed)
    }

    /// Stop reporting. Can be started again.
    pub fn close(&self) {
        if let Some(task) = self.lock_task().take() {
            debug!("stopping event count reporter");
            task.abort();
        }
    }
}

impl Drop for EventCountReporter {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for EventCountReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCountReporter")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .field("reports", &self.reports())
            .finish()
    }
}

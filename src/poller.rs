//! Status reconciliation poller.
//!
//! One tokio task per subscribed job. A task fetches immediately, then
//! sleeps `interval_ms` after each fetch resolves, so fetches for a job
//! never overlap. Each job has at most one live subscription; subscribing
//! again replaces (and cancels) the previous one.
//!
//! Cancellation and emission are serialized through the subscription's
//! own lock: once [`StatusPoller::cancel`] returns, the sink receives
//! nothing more, and a fetch that was in flight is discarded.

use crate::{
    JobRef, JobStatus, PartnerApi, PollerConfig, StatusClass, StatusClassification, StatusEvent,
    WorkflowStats,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Live state of one polling subscription
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollSubscription {
    /// Job being polled
    pub job_ref: JobRef,
    /// Fetches made so far
    pub attempts_made: u32,
    /// Last status fetched
    pub last_observed_status: Option<JobStatus>,
    /// Pause between fetches
    pub interval_ms: u64,
    /// Fetch budget before timing out
    pub max_attempts: u32,
    /// No further events will be emitted
    pub cancelled: bool,
}

/// Terminal error delivered through [`StatusSink::on_error`]
#[derive(Clone, Debug, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum PollError {
    /// Job reached a failure status
    #[error("partner reported terminal failure `{status}`")]
    PartnerFailure {
        /// Failure status
        status: JobStatus,
    },
    /// Fetch budget spent without a terminal status
    #[error("no terminal status after {attempts} attempts")]
    Timeout {
        /// Fetches made
        attempts: u32,
        /// Last status seen, if any fetch succeeded
        last_status: Option<JobStatus>,
    },
}

/// Receiver of poll results.
///
/// Callbacks run on the polling task while the subscription lock is held.
/// They must not call back into the poller; hand work off to a channel or
/// task instead.
pub trait StatusSink: Send + Sync + 'static {
    /// Fetched status differs from the previous one
    fn on_update(&self, job_ref: &JobRef, previous: Option<&JobStatus>, current: &JobStatus);
    /// Job reached a success status; last callback
    fn on_complete(&self, job_ref: &JobRef, status: &JobStatus);
    /// Job failed or polling timed out; last callback
    fn on_error(&self, job_ref: &JobRef, error: &PollError);
}

/// Forwards every callback as a [`StatusEvent`] on an unbounded channel
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelSink {
    /// Sink plus the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: StatusEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

impl StatusSink for ChannelSink {
    fn on_update(&self, job_ref: &JobRef, previous: Option<&JobStatus>, current: &JobStatus) {
        self.send(StatusEvent::StatusChanged {
            job_ref: job_ref.clone(),
            previous: previous.cloned(),
            current: current.clone(),
        });
    }

    fn on_complete(&self, job_ref: &JobRef, status: &JobStatus) {
        self.send(StatusEvent::Completed {
            job_ref: job_ref.clone(),
            status: status.clone(),
        });
    }

    fn on_error(&self, job_ref: &JobRef, error: &PollError) {
        self.send(error_event(job_ref, error));
    }
}

fn error_event(job_ref: &JobRef, error: &PollError) -> StatusEvent {
    match error {
        PollError::PartnerFailure { status } => StatusEvent::Failed {
            job_ref: job_ref.clone(),
            status: status.clone(),
        },
        PollError::Timeout {
            attempts,
            last_status,
        } => StatusEvent::TimedOut {
            job_ref: job_ref.clone(),
            attempts: *attempts,
            last_status: last_status.clone(),
        },
    }
}

/// Adapts a closure taking [`StatusEvent`]s
pub struct CallbackSink {
    callback: Box<dyn Fn(StatusEvent) + Send + Sync>,
}

impl CallbackSink {
    /// Call `callback` for every event
    pub fn new(callback: impl Fn(StatusEvent) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl StatusSink for CallbackSink {
    fn on_update(&self, job_ref: &JobRef, previous: Option<&JobStatus>, current: &JobStatus) {
        (self.callback)(StatusEvent::StatusChanged {
            job_ref: job_ref.clone(),
            previous: previous.cloned(),
            current: current.clone(),
        });
    }

    fn on_complete(&self, job_ref: &JobRef, status: &JobStatus) {
        (self.callback)(StatusEvent::Completed {
            job_ref: job_ref.clone(),
            status: status.clone(),
        });
    }

    fn on_error(&self, job_ref: &JobRef, error: &PollError) {
        (self.callback)(error_event(job_ref, error));
    }
}

/// Delivers every callback to several sinks in order
pub struct FanOutSink {
    sinks: Vec<Arc<dyn StatusSink>>,
}

impl FanOutSink {
    /// Deliver to `sinks` in the given order
    pub fn new(sinks: Vec<Arc<dyn StatusSink>>) -> Self {
        Self { sinks }
    }
}

impl StatusSink for FanOutSink {
    fn on_update(&self, job_ref: &JobRef, previous: Option<&JobStatus>, current: &JobStatus) {
        for sink in &self.sinks {
            sink.on_update(job_ref, previous, current);
        }
    }

    fn on_complete(&self, job_ref: &JobRef, status: &JobStatus) {
        for sink in &self.sinks {
            sink.on_complete(job_ref, status);
        }
    }

    fn on_error(&self, job_ref: &JobRef, error: &PollError) {
        for sink in &self.sinks {
            sink.on_error(job_ref, error);
        }
    }
}

struct ActiveSubscription {
    generation: u64,
    record: Arc<Mutex<PollSubscription>>,
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ActiveSubscription {
    /// Stop emission, then stop the task
    fn stop(self) {
        if let Ok(mut record) = self.record.lock() {
            record.cancelled = true;
        }
        let _ = self.cancel_tx.send(true);
        self.task.abort();
    }
}

type Registry = Arc<Mutex<HashMap<JobRef, ActiveSubscription>>>;

/// Polls partner job status for any number of jobs at once
pub struct StatusPoller {
    partner: Arc<dyn PartnerApi>,
    classification: Arc<StatusClassification>,
    defaults: PollerConfig,
    stats: Arc<WorkflowStats>,
    active: Registry,
    next_generation: AtomicU64,
}

impl StatusPoller {
    /// Poller over `partner` with default timing `defaults`
    pub fn new(
        partner: Arc<dyn PartnerApi>,
        classification: StatusClassification,
        defaults: PollerConfig,
        stats: Arc<WorkflowStats>,
    ) -> Self {
        Self {
            partner,
            classification: Arc::new(classification),
            defaults,
            stats,
            active: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Table used to classify fetched statuses
    pub fn classification(&self) -> &StatusClassification {
        &self.classification
    }

    /// Subscribe with the poller's default timing
    pub fn subscribe(&self, job_ref: JobRef, sink: Arc<dyn StatusSink>) -> u64 {
        self.subscribe_with(job_ref, sink, self.defaults)
    }

    /// Start polling `job_ref`, replacing any existing subscription for it.
    ///
    /// Returns the subscription generation. Must be called inside a tokio
    /// runtime.
    pub fn subscribe_with(
        &self,
        job_ref: JobRef,
        sink: Arc<dyn StatusSink>,
        config: PollerConfig,
    ) -> u64 {
        let mut active = self.registry();
        self.start(&mut active, job_ref, sink, config, 0)
    }

    /// Swap the sink of the live subscription for `job_ref`.
    ///
    /// The replacement keeps the attempts already spent, so the job still
    /// times out on schedule. Returns `None` when nothing is subscribed.
    pub fn resubscribe(&self, job_ref: JobRef, sink: Arc<dyn StatusSink>) -> Option<u64> {
        let mut active = self.registry();
        let previous = active.get(&job_ref)?;
        let (spent, config) = match previous.record.lock() {
            Ok(record) => (
                record.attempts_made,
                PollerConfig {
                    interval_ms: record.interval_ms,
                    max_attempts: record.max_attempts,
                },
            ),
            Err(_) => (0, self.defaults),
        };
        Some(self.start(&mut active, job_ref, sink, config, spent))
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<JobRef, ActiveSubscription>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn start(
        &self,
        active: &mut HashMap<JobRef, ActiveSubscription>,
        job_ref: JobRef,
        sink: Arc<dyn StatusSink>,
        config: PollerConfig,
        attempts_made: u32,
    ) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(Mutex::new(PollSubscription {
            job_ref: job_ref.clone(),
            attempts_made,
            last_observed_status: None,
            interval_ms: config.interval_ms,
            max_attempts: config.max_attempts.max(1),
            cancelled: false,
        }));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        if let Some(previous) = active.remove(&job_ref) {
            tracing::debug!(job_ref = %job_ref, generation = previous.generation, "Replacing status subscription");
            previous.stop();
        }

        let task = PollTask {
            partner: self.partner.clone(),
            classification: self.classification.clone(),
            stats: self.stats.clone(),
            active: self.active.clone(),
            sink,
            record: record.clone(),
            generation,
            job_ref: job_ref.clone(),
            interval: config.interval(),
        };
        let handle = tokio::spawn(task.run(cancel_rx));

        active.insert(
            job_ref.clone(),
            ActiveSubscription {
                generation,
                record,
                cancel_tx,
                task: handle,
            },
        );
        tracing::debug!(job_ref = %job_ref, generation, attempts_made, "Status subscription started");
        generation
    }

    /// Stop polling `job_ref`. Returns `false` if nothing was subscribed.
    pub fn cancel(&self, job_ref: &JobRef) -> bool {
        let removed = self.registry().remove(job_ref);
        match removed {
            Some(subscription) => {
                subscription.stop();
                tracing::debug!(job_ref = %job_ref, "Status subscription cancelled");
                true
            }
            None => false,
        }
    }

    /// Whether `job_ref` has a live subscription
    pub fn is_active(&self, job_ref: &JobRef) -> bool {
        self.active
            .lock()
            .map(|active| active.contains_key(job_ref))
            .unwrap_or(false)
    }

    /// Number of live subscriptions
    pub fn active_count(&self) -> usize {
        self.active.lock().map(|active| active.len()).unwrap_or(0)
    }

    /// Snapshot of the live subscription for `job_ref`
    pub fn subscription(&self, job_ref: &JobRef) -> Option<PollSubscription> {
        let record = self.active.lock().ok()?.get(job_ref)?.record.clone();
        let snapshot = record.lock().ok()?.clone();
        Some(snapshot)
    }

    /// Cancel every subscription
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.registry().drain().map(|(_, sub)| sub).collect();
        for subscription in drained {
            subscription.stop();
        }
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct PollTask {
    partner: Arc<dyn PartnerApi>,
    classification: Arc<StatusClassification>,
    stats: Arc<WorkflowStats>,
    active: Registry,
    sink: Arc<dyn StatusSink>,
    record: Arc<Mutex<PollSubscription>>,
    generation: u64,
    job_ref: JobRef,
    interval: std::time::Duration,
}

impl PollTask {
    async fn run(self, mut cancel_rx: watch::Receiver<bool>) {
        loop {
            if *cancel_rx.borrow() {
                return;
            }

            let fetched = self.partner.get_status(&self.job_ref).await;
            WorkflowStats::bump(&self.stats.status_fetches);

            match self.observe(fetched) {
                Step::Continue => {}
                Step::Finished => {
                    self.deregister();
                    return;
                }
                Step::Discarded => return,
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Apply one fetch result and notify the sink, all under the record lock
    fn observe(&self, fetched: Result<JobStatus, crate::PartnerCallError>) -> Step {
        let Ok(mut sub) = self.record.lock() else {
            return Step::Discarded;
        };
        if sub.cancelled {
            return Step::Discarded;
        }
        sub.attempts_made += 1;

        match fetched {
            Ok(status) => {
                let previous = sub.last_observed_status.clone();
                if previous.as_ref() != Some(&status) {
                    sub.last_observed_status = Some(status.clone());
                    self.sink.on_update(&self.job_ref, previous.as_ref(), &status);
                }
                match self.classification.classify(&status) {
                    StatusClass::TerminalSuccess => {
                        sub.cancelled = true;
                        self.sink.on_complete(&self.job_ref, &status);
                        return Step::Finished;
                    }
                    StatusClass::TerminalFailure => {
                        sub.cancelled = true;
                        self.sink
                            .on_error(&self.job_ref, &PollError::PartnerFailure { status });
                        return Step::Finished;
                    }
                    StatusClass::InFlight => {}
                }
            }
            Err(err) => {
                tracing::warn!(
                    job_ref = %self.job_ref,
                    attempt = sub.attempts_made,
                    error = %err,
                    "Status fetch failed"
                );
            }
        }

        if sub.attempts_made >= sub.max_attempts {
            sub.cancelled = true;
            WorkflowStats::bump(&self.stats.poll_timeouts);
            let error = PollError::Timeout {
                attempts: sub.attempts_made,
                last_status: sub.last_observed_status.clone(),
            };
            tracing::warn!(job_ref = %self.job_ref, attempts = sub.attempts_made, "Status polling timed out");
            self.sink.on_error(&self.job_ref, &error);
            return Step::Finished;
        }
        Step::Continue
    }

    fn deregister(&self) {
        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if active
            .get(&self.job_ref)
            .is_some_and(|sub| sub.generation == self.generation)
        {
            active.remove(&self.job_ref);
        }
    }
}

enum Step {
    Continue,
    Finished,
    Discarded,
}

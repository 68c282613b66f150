//! # Poll Scheduler
//!
//! One driver task owns every target's timer and committed [`PollState`].
//! Fetches run in separately spawned tick tasks so a slow origin never holds
//! up another target's timer.
//!
//! ## Tick lifecycle
//!
//! 1.  A timer expires, a manual trigger arrives, or a coalesced re-check is
//!     due. The driver claims the target's busy flag; if the target is already
//!     busy the tick is folded into one pending re-check.
//! 2.  The tick task waits for a global fetch permit (FIFO), then fetches
//!     under a hard timeout. The permit is released as soon as the fetch
//!     returns.
//! 3.  The outcome is folded into a copy of the poll state. A novel result is
//!     persisted (bounded by a store timeout) and then published whether or
//!     not persistence succeeded.
//! 4.  The driver receives the new state and cadence, clears the busy flag
//!     and arms the next timer, or runs the pending re-check immediately.
//!
//! Catalogue edits bump a target's generation and cancel its in-flight tick;
//! results from an older generation are discarded.

use futures_util::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::future::poll_fn;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};

use crate::core::cadence::{Cadence, CadencePolicy};
use crate::core::clock::{Clock, DriftCalibrator, SystemClock};
use crate::core::dispatcher::EventFanout;
use crate::core::governor::{GovernorStats, PollGovernor};
use crate::core::metrics::{PollMetrics, PollMetricsSnapshot, StatusBoard, TargetStatus};
use crate::core::poll_state::{Phase, PollState, TickSignal};
use crate::core::ports::{FetchCapability, ResultStore, SaveOutcome};
use crate::core::target::{CatalogueDiff, Target, TargetRegistry};
use crate::error::{FetchError, SchedulerError};

/// Scheduler-wide settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Global cap on concurrent fetches.
    pub max_concurrent_fetches: usize,
    /// Hard timeout for one fetch.
    pub fetch_timeout: Duration,
    /// Upper bound on one store write.
    pub store_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 8,
            fetch_timeout: Duration::from_secs(10),
            store_timeout: Duration::from_secs(5),
        }
    }
}

/// Reply to [`SchedulerHandle::trigger_now`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerAck {
    /// A tick was started.
    Started,
    /// A tick was already in flight; a re-check will follow it.
    Coalesced,
}

/// Counters and gauges exposed by the scheduler.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerMetrics {
    /// Poll counters.
    #[serde(flatten)]
    pub polls: PollMetricsSnapshot,
    /// Concurrency gauges.
    pub governor: GovernorStats,
    /// Current clock drift.
    pub drift_ms: i64,
    /// Target that supplied the drift.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift_source: Option<String>,
}

/// State shared between the driver, tick tasks and handles.
struct Shared {
    config: SchedulerConfig,
    targets: Arc<TargetRegistry>,
    fetcher: Arc<dyn FetchCapability>,
    store: Arc<dyn ResultStore>,
    fanout: Arc<EventFanout>,
    clock: Arc<dyn Clock>,
    calibrator: DriftCalibrator,
    governor: PollGovernor,
    metrics: PollMetrics,
    status: StatusBoard,
}

/// Builder for the scheduler.
pub struct PollScheduler {
    config: SchedulerConfig,
    targets: Arc<TargetRegistry>,
    fetcher: Arc<dyn FetchCapability>,
    store: Arc<dyn ResultStore>,
    fanout: Arc<EventFanout>,
    clock: Arc<dyn Clock>,
    calibrator: DriftCalibrator,
}

impl PollScheduler {
    /// Wires the scheduler to its collaborators.
    pub fn new(
        targets: Arc<TargetRegistry>,
        fetcher: Arc<dyn FetchCapability>,
        store: Arc<dyn ResultStore>,
        fanout: Arc<EventFanout>,
    ) -> Self {
        Self {
            config: SchedulerConfig::default(),
            targets,
            fetcher,
            store,
            fanout,
            clock: Arc::new(SystemClock),
            calibrator: DriftCalibrator::default(),
        }
    }

    /// Replaces the settings.
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the drift calibrator.
    pub fn with_calibrator(mut self, calibrator: DriftCalibrator) -> Self {
        self.calibrator = calibrator;
        self
    }

    /// Starts the driver. Every enabled automatic target ticks once right away.
    pub fn spawn(self) -> SchedulerHandle {
        let shared = Arc::new(Shared {
            governor: PollGovernor::new(self.config.max_concurrent_fetches),
            config: self.config,
            targets: self.targets,
            fetcher: self.fetcher,
            store: self.store,
            fanout: self.fanout,
            clock: self.clock,
            calibrator: self.calibrator,
            metrics: PollMetrics::default(),
            status: StatusBoard::default(),
        });

        let (tx, rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let mut driver = Driver {
            shared: shared.clone(),
            slots: HashMap::new(),
            timers: DelayQueue::new(),
            tasks: JoinSet::new(),
            commands: rx,
            shutdown: shutdown.clone(),
            generations: 0,
        };
        for target in shared.targets.list() {
            driver.add_target(target);
        }
        tracing::info!(
            targets = driver.slots.len(),
            max_concurrent = shared.config.max_concurrent_fetches,
            "poll scheduler started"
        );

        let join = tokio::spawn(driver.run());
        SchedulerHandle {
            commands: tx,
            shared,
            shutdown,
            join: std::sync::Mutex::new(Some(join)),
        }
    }
}

enum Command {
    Trigger {
        target_id: String,
        ack: oneshot::Sender<Result<TriggerAck, SchedulerError>>,
    },
    Reconcile {
        diff: CatalogueDiff,
        ack: oneshot::Sender<()>,
    },
}

/// Control surface of a running scheduler. Cheap to share behind an `Arc`.
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    join: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerHandle {
    /// Runs a tick for `target_id` immediately. A tick already in flight
    /// absorbs the trigger as a single re-check.
    pub async fn trigger_now(&self, target_id: &str) -> Result<TriggerAck, SchedulerError> {
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(Command::Trigger {
                target_id: target_id.to_string(),
                ack,
            })
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)?
    }

    /// Applies a catalogue difference. The caller has already swapped the
    /// new catalogue into the target registry.
    pub async fn reconcile(&self, diff: CatalogueDiff) -> Result<(), SchedulerError> {
        if diff.is_empty() {
            return Ok(());
        }
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(Command::Reconcile { diff, ack })
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Status of every catalogued target.
    pub fn status(&self) -> Vec<TargetStatus> {
        self.shared.status.snapshot()
    }

    /// Status of one target.
    pub fn target_status(&self, target_id: &str) -> Option<TargetStatus> {
        self.shared.status.get(target_id)
    }

    /// Counters and gauges.
    pub fn metrics(&self) -> SchedulerMetrics {
        SchedulerMetrics {
            polls: self.shared.metrics.snapshot(),
            governor: self.shared.governor.stats(),
            drift_ms: self.shared.calibrator.drift_ms(),
            drift_source: self.shared.calibrator.source(),
        }
    }

    /// Drift-corrected current time.
    pub fn now_ms(&self) -> i64 {
        self.shared.calibrator.adjusted_now(self.shared.clock.as_ref())
    }

    /// The catalogue the scheduler reads.
    pub fn targets(&self) -> &Arc<TargetRegistry> {
        &self.shared.targets
    }

    /// Token cancelled when the scheduler shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops scheduling, cancels in-flight ticks and waits for the driver.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let join = self
            .join
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "scheduler driver ended abnormally");
            }
        }
    }
}

struct Slot {
    target: Arc<Target>,
    policy: Arc<CadencePolicy>,
    state: PollState,
    timer: Option<delay_queue::Key>,
    generation: u64,
    cancel: CancellationToken,
}

struct TickJob {
    target: Arc<Target>,
    policy: Arc<CadencePolicy>,
    state: PollState,
    generation: u64,
    cancel: CancellationToken,
}

struct TickDone {
    target_id: String,
    generation: u64,
    /// `None` when the tick was cancelled before it produced anything.
    outcome: Option<(PollState, Cadence)>,
}

#[derive(Debug, Clone, Copy)]
enum TickReason {
    Timer,
    Manual,
    Recheck,
}

enum Event {
    Command(Command),
    Done(Result<TickDone, JoinError>),
    Timer(String),
}

struct Driver {
    shared: Arc<Shared>,
    slots: HashMap<String, Slot>,
    timers: DelayQueue<String>,
    tasks: JoinSet<TickDone>,
    commands: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
    /// Source of slot generations; never reused, even across removal and re-adding.
    generations: u64,
}

impl Driver {
    fn next_generation(&mut self) -> u64 {
        self.generations += 1;
        self.generations
    }

    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => Event::Done(joined),
                Some(cmd) = self.commands.recv() => Event::Command(cmd),
                Some(expired) = poll_fn(|cx| self.timers.poll_expired(cx)), if !self.timers.is_empty() => {
                    Event::Timer(expired.into_inner())
                }
            };

            match event {
                Event::Command(Command::Trigger { target_id, ack }) => {
                    let reply = self.trigger(&target_id);
                    let _ = ack.send(reply);
                }
                Event::Command(Command::Reconcile { diff, ack }) => {
                    self.reconcile(diff);
                    let _ = ack.send(());
                }
                Event::Done(Ok(done)) => self.on_done(done),
                Event::Done(Err(e)) => {
                    tracing::error!(error = %e, "tick task failed");
                }
                Event::Timer(target_id) => {
                    if let Some(slot) = self.slots.get_mut(&target_id) {
                        slot.timer = None;
                        self.start_tick(&target_id, TickReason::Timer);
                    }
                }
            }
        }

        tracing::info!(in_flight = self.tasks.len(), "poll scheduler stopping");
        for slot in self.slots.values() {
            slot.cancel.cancel();
        }
        while let Some(joined) = self.tasks.join_next().await {
            if let Ok(done) = joined {
                self.shared.governor.finish(&done.target_id);
            }
        }
        tracing::info!("poll scheduler stopped");
    }

    fn add_target(&mut self, target: Arc<Target>) {
        let policy = Arc::new(CadencePolicy::for_target(&target));
        self.shared.status.put(TargetStatus::pending(
            &target.id,
            target.timing.label(),
            target.enabled,
        ));
        if !target.enabled {
            tracing::info!(target_id = %target.id, "target disabled; not scheduled");
            return;
        }

        let timer = if policy.is_manual() {
            None
        } else {
            Some(self.timers.insert(target.id.clone(), Duration::ZERO))
        };
        let id = target.id.clone();
        let generation = self.next_generation();
        self.slots.insert(
            id,
            Slot {
                target,
                policy,
                state: PollState::default(),
                timer,
                generation,
                cancel: self.shutdown.child_token(),
            },
        );
    }

    fn remove_target(&mut self, target_id: &str) {
        if let Some(slot) = self.slots.remove(target_id) {
            slot.cancel.cancel();
            if let Some(key) = slot.timer {
                self.timers.try_remove(&key);
            }
        }
    }

    fn reconcile(&mut self, diff: CatalogueDiff) {
        for id in &diff.removed {
            self.remove_target(id);
            self.shared.status.remove(id);
            self.shared.fanout.forget(id);
            tracing::info!(target_id = %id, "target removed");
        }

        for id in &diff.added {
            if let Some(target) = self.shared.targets.get(id) {
                tracing::info!(target_id = %id, timing = target.timing.label(), "target added");
                self.add_target(target);
            }
        }

        for id in &diff.changed {
            let Some(target) = self.shared.targets.get(id) else {
                continue;
            };
            let previous = self.slots.remove(id);
            let Some(mut slot) = previous else {
                // Was disabled; treat as new.
                self.add_target(target);
                continue;
            };

            slot.cancel.cancel();
            if let Some(key) = slot.timer.take() {
                self.timers.try_remove(&key);
            }

            self.shared.status.update(id, |s| {
                s.timing = target.timing.label();
                s.enabled = target.enabled;
            });
            if !target.enabled {
                tracing::info!(target_id = %id, "target disabled");
                continue;
            }

            slot.policy = Arc::new(CadencePolicy::for_target(&target));
            slot.target = target;
            slot.generation = self.next_generation();
            slot.cancel = self.shutdown.child_token();
            let manual = slot.policy.is_manual();
            self.slots.insert(id.clone(), slot);
            tracing::info!(target_id = %id, "target changed; rescheduling");
            if !manual {
                self.start_tick(id, TickReason::Recheck);
            }
        }
    }

    fn trigger(&mut self, target_id: &str) -> Result<TriggerAck, SchedulerError> {
        if !self.slots.contains_key(target_id) {
            return match self.shared.targets.get(target_id) {
                Some(_) => Err(SchedulerError::Disabled(target_id.to_string())),
                None => Err(SchedulerError::UnknownTarget(target_id.to_string())),
            };
        }
        Ok(self.start_tick(target_id, TickReason::Manual))
    }

    fn start_tick(&mut self, target_id: &str, reason: TickReason) -> TriggerAck {
        let Some(slot) = self.slots.get_mut(target_id) else {
            return TriggerAck::Coalesced;
        };
        if !self.shared.governor.try_begin(target_id) {
            self.shared.metrics.coalesced_ticks();
            tracing::debug!(target_id, ?reason, "tick coalesced into pending re-check");
            return TriggerAck::Coalesced;
        }
        if let Some(key) = slot.timer.take() {
            self.timers.try_remove(&key);
        }

        let job = TickJob {
            target: slot.target.clone(),
            policy: slot.policy.clone(),
            state: slot.state.clone(),
            generation: slot.generation,
            cancel: slot.cancel.clone(),
        };
        tracing::trace!(target_id, ?reason, "tick started");
        self.tasks.spawn(run_tick(self.shared.clone(), job));
        TriggerAck::Started
    }

    fn on_done(&mut self, done: TickDone) {
        let recheck = self.shared.governor.finish(&done.target_id);
        let Some(slot) = self.slots.get_mut(&done.target_id) else {
            self.shared.metrics.discarded_ticks();
            return;
        };

        let mut cadence = None;
        match done.outcome {
            Some((state, next)) if done.generation == slot.generation => {
                slot.state = state;
                cadence = Some(next);
            }
            _ => {
                self.shared.metrics.discarded_ticks();
                tracing::debug!(target_id = %done.target_id, "stale tick result discarded");
            }
        }

        if recheck {
            self.start_tick(&done.target_id, TickReason::Recheck);
            return;
        }

        let Some(slot) = self.slots.get_mut(&done.target_id) else {
            return;
        };
        let cadence = cadence.unwrap_or_else(|| {
            let now = self.shared.calibrator.adjusted_now(self.shared.clock.as_ref());
            slot.policy.compute_next_delay(&slot.state, now).cadence
        });
        if let Some(delay) = cadence.delay() {
            if let Some(key) = slot.timer.take() {
                self.timers.try_remove(&key);
            }
            slot.timer = Some(self.timers.insert(done.target_id.clone(), delay));
        }
    }
}

/// Runs one tick. A panic anywhere in the tick, including in the store or the
/// fanout, still reports back so the busy flag is cleared and the target is
/// rescheduled from its last committed state.
async fn run_tick(shared: Arc<Shared>, job: TickJob) -> TickDone {
    let target_id = job.target.id.clone();
    let generation = job.generation;
    match AssertUnwindSafe(tick(shared.clone(), job)).catch_unwind().await {
        Ok(done) => done,
        Err(_) => {
            shared.metrics.tick_panics();
            tracing::error!(target_id = %target_id, "tick panicked; state left unchanged");
            TickDone {
                target_id,
                generation,
                outcome: None,
            }
        }
    }
}

async fn tick(shared: Arc<Shared>, job: TickJob) -> TickDone {
    let TickJob {
        target,
        policy,
        mut state,
        generation,
        cancel,
    } = job;
    let target_id = target.id.clone();
    let discarded = |target_id: &str| TickDone {
        target_id: target_id.to_string(),
        generation,
        outcome: None,
    };

    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return discarded(&target_id),
        permit = shared.governor.acquire(&target_id) => match permit {
            Ok(permit) => permit,
            Err(_) => return discarded(&target_id),
        },
    };

    let timeout = shared.config.fetch_timeout;
    let fetch = AssertUnwindSafe(shared.fetcher.fetch(&target_id)).catch_unwind();
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return discarded(&target_id),
        r = tokio::time::timeout(timeout, fetch) => match r {
            Err(_) => Err(FetchError::Timeout(timeout.as_millis() as u64)),
            Ok(Err(_)) => Err(FetchError::Failed("fetch capability panicked".to_string())),
            Ok(Ok(outcome)) => outcome,
        },
    };
    drop(permit);

    let received_at = shared.clock.now_ms();
    shared.metrics.poll();
    if cancel.is_cancelled() {
        return discarded(&target_id);
    }

    if let Ok(observation) = &outcome {
        if let Some(server_time) = observation.server_time_ms {
            shared
                .calibrator
                .observe(&target_id, server_time, received_at, shared.clock.now_ms());
        }
    }

    let now = shared.calibrator.adjusted_now(shared.clock.as_ref());
    let previous_phase = state.phase;
    let decision = state.apply(&policy, &target.tuning, outcome, now);

    let mut last_error = None;
    match &decision.signal {
        TickSignal::New => shared.metrics.new_results(),
        TickSignal::Stale { retrying } => {
            shared.metrics.stale_responses();
            if *retrying {
                tracing::debug!(
                    target_id = %target_id,
                    attempt = state.consecutive_stale_responses,
                    "origin has not published yet; retrying"
                );
            }
        }
        TickSignal::Failed(err) => {
            shared.metrics.fetch_errors();
            if matches!(err, FetchError::Timeout(_)) {
                shared.metrics.fetch_timeouts();
            }
            tracing::warn!(
                target_id = %target_id,
                failures = state.consecutive_failures,
                error = %err,
                "fetch failed"
            );
            last_error = Some(err.to_string());
        }
    }
    if state.phase == Phase::Degraded && previous_phase != Phase::Degraded {
        tracing::warn!(
            target_id = %target_id,
            failures = state.consecutive_failures,
            "target entered DEGRADED"
        );
    }
    if decision.recovered {
        tracing::info!(target_id = %target_id, phase = state.phase.as_str(), "target recovered");
    }

    shared.status.update(&target_id, |s| {
        s.absorb(&state);
        s.last_error = last_error;
    });

    if let Some(result) = decision.novel {
        tracing::info!(
            target_id = %target_id,
            sequence = %result.sequence,
            phase = state.phase.as_str(),
            "new result detected"
        );

        match tokio::time::timeout(shared.config.store_timeout, shared.store.save(&result)).await {
            Ok(SaveOutcome::Inserted) => {}
            Ok(SaveOutcome::Duplicate) => {
                shared.metrics.duplicates();
                tracing::debug!(target_id = %target_id, sequence = %result.sequence, "result already stored");
            }
            Ok(SaveOutcome::Failed(e)) => {
                shared.metrics.persistence_failures();
                tracing::error!(target_id = %target_id, error = %e, "failed to persist result");
            }
            Err(_) => {
                shared.metrics.persistence_failures();
                tracing::error!(target_id = %target_id, "result store timed out");
            }
        }

        shared.fanout.publish(&result);
    }

    TickDone {
        target_id,
        generation,
        outcome: Some((state, decision.cadence)),
    }
}

//! # Per-Target Poll State
//!
//! The mutable bookkeeping the scheduler keeps for each target and the pure
//! transition applied after every fetch. [`PollState::apply`] folds a fetch
//! outcome into the state and decides the next cadence; it performs no I/O so
//! the whole decision table is testable without a runtime.

use serde::Serialize;
use std::time::Duration;

use crate::core::cadence::{Cadence, CadencePolicy};
use crate::core::model::{DrawResult, Observation};
use crate::core::target::PollTuning;
use crate::error::FetchError;

/// Scheduling phase of a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Far from the next draw.
    #[default]
    Waiting,
    /// Inside the near bands.
    Approaching,
    /// A draw is due; waiting for the origin to publish it.
    Verifying,
    /// Repeated failures; polling at a fixed slow cadence.
    Degraded,
}

impl Phase {
    /// Upper-case label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Waiting => "WAITING",
            Phase::Approaching => "APPROACHING",
            Phase::Verifying => "VERIFYING",
            Phase::Degraded => "DEGRADED",
        }
    }
}

/// Bookkeeping for one target.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollState {
    /// Sequence of the last result seen.
    pub last_observed_sequence: Option<String>,
    /// When that result was detected (epoch ms, drift-corrected). The
    /// countdown baseline.
    pub last_observed_at_ms: Option<i64>,
    /// Origin-reported next draw epoch, when the origin supplies one.
    pub next_draw_at_ms: Option<i64>,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Unchanged responses while a draw is due.
    pub consecutive_stale_responses: u32,
    /// Current phase.
    pub phase: Phase,
    /// Epoch ms of the next scheduled tick.
    pub next_poll_at_ms: Option<i64>,
}

/// What a tick produced, for logging and metrics.
#[derive(Debug, Clone, PartialEq)]
pub enum TickSignal {
    /// A new sequence was detected.
    New,
    /// Same sequence as before.
    Stale {
        /// A short stale retry was scheduled.
        retrying: bool,
    },
    /// The fetch failed.
    Failed(FetchError),
}

/// Outcome of [`PollState::apply`].
#[derive(Debug, Clone, PartialEq)]
pub struct TickDecision {
    /// When to tick next.
    pub cadence: Cadence,
    /// The novel result to persist and publish.
    pub novel: Option<DrawResult>,
    /// Classification of the tick.
    pub signal: TickSignal,
    /// The target left DEGRADED on this tick.
    pub recovered: bool,
}

impl PollState {
    /// Folds one fetch outcome into the state.
    ///
    /// `now_ms` is the drift-corrected current time.
    pub fn apply(
        &mut self,
        policy: &CadencePolicy,
        tuning: &PollTuning,
        outcome: Result<Observation, FetchError>,
        now_ms: i64,
    ) -> TickDecision {
        let observation = match outcome {
            Ok(observation) => observation,
            Err(err) => return self.apply_failure(policy, tuning, err, now_ms),
        };

        let recovered = self.phase == Phase::Degraded;
        self.consecutive_failures = 0;
        if let Some(next_draw) = observation.next_draw_at_ms {
            self.next_draw_at_ms = Some(next_draw);
        }

        let result = observation.result;
        let is_new = self.last_observed_sequence.as_deref() != Some(result.sequence.as_str());

        if is_new {
            let bootstrap = self.last_observed_sequence.is_none();
            // At bootstrap the origin's own timestamp is the better baseline.
            let baseline = match result.observed_at {
                Some(at) if bootstrap && at <= now_ms => at,
                _ => now_ms,
            };
            self.last_observed_sequence = Some(result.sequence.clone());
            self.last_observed_at_ms = Some(baseline);
            self.consecutive_stale_responses = 0;

            let estimate = policy.compute_next_delay(self, now_ms);
            self.phase = if recovered { Phase::Waiting } else { estimate.phase };
            let cadence = self.finish(policy, estimate.cadence, now_ms);
            return TickDecision {
                cadence,
                novel: Some(result),
                signal: TickSignal::New,
                recovered,
            };
        }

        let estimate = policy.compute_next_delay(self, now_ms);
        self.phase = estimate.phase;
        let retrying = if estimate.draw_due {
            self.consecutive_stale_responses += 1;
            self.consecutive_stale_responses <= tuning.stale_retry_budget
        } else {
            // Unchanged results before a draw is due carry no signal.
            self.consecutive_stale_responses = 0;
            false
        };

        let cadence = if retrying {
            self.phase = Phase::Verifying;
            Cadence::Poll(Duration::from_millis(tuning.stale_retry_interval_ms))
        } else {
            estimate.cadence
        };
        // The first success after DEGRADED lands in WAITING whatever the
        // countdown says; the next tick re-derives the phase.
        if recovered {
            self.phase = Phase::Waiting;
        }
        let cadence = self.finish(policy, cadence, now_ms);

        TickDecision {
            cadence,
            novel: None,
            signal: TickSignal::Stale { retrying },
            recovered,
        }
    }

    fn apply_failure(
        &mut self,
        policy: &CadencePolicy,
        tuning: &PollTuning,
        err: FetchError,
        now_ms: i64,
    ) -> TickDecision {
        self.consecutive_failures += 1;
        let cadence = if self.consecutive_failures >= tuning.failure_threshold {
            self.phase = Phase::Degraded;
            Cadence::Poll(Duration::from_secs(tuning.degraded_interval_secs))
        } else {
            Cadence::Poll(Duration::from_millis(tuning.failure_retry_ms))
        };
        let cadence = self.finish(policy, cadence, now_ms);
        TickDecision {
            cadence,
            novel: None,
            signal: TickSignal::Failed(err),
            recovered: false,
        }
    }

    /// Manual targets never get an automatic tick; everyone else records the
    /// epoch of the next one.
    fn finish(&mut self, policy: &CadencePolicy, cadence: Cadence, now_ms: i64) -> Cadence {
        if policy.is_manual() {
            self.next_poll_at_ms = None;
            return Cadence::Manual;
        }
        self.next_poll_at_ms = cadence
            .delay()
            .map(|d| now_ms + d.as_millis() as i64);
        cadence
    }
}

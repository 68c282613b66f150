//! # Metrics
//!
//! Lock-free counters for the scheduler and the fanout, plus a status board
//! holding the last known state of every target for the admin surface.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::core::poll_state::{Phase, PollState};

/// Scheduler counters.
#[derive(Debug, Default)]
pub struct PollMetrics {
    polls: AtomicU64,
    new_results: AtomicU64,
    stale_responses: AtomicU64,
    fetch_errors: AtomicU64,
    fetch_timeouts: AtomicU64,
    duplicates: AtomicU64,
    persistence_failures: AtomicU64,
    discarded_ticks: AtomicU64,
    coalesced_ticks: AtomicU64,
    tick_panics: AtomicU64,
}

/// Serializable copy of [`PollMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollMetricsSnapshot {
    /// Completed fetch attempts.
    pub polls: u64,
    /// Ticks that detected a new sequence.
    pub new_results: u64,
    /// Ticks that saw an unchanged sequence.
    pub stale_responses: u64,
    /// Failed fetches (timeouts included).
    pub fetch_errors: u64,
    /// Fetches cut off by the hard timeout.
    pub fetch_timeouts: u64,
    /// Saves the store reported as already present.
    pub duplicates: u64,
    /// Saves that failed.
    pub persistence_failures: u64,
    /// Results dropped because the target was removed or changed mid-flight.
    pub discarded_ticks: u64,
    /// Ticks folded into a pending re-check.
    pub coalesced_ticks: u64,
    /// Ticks that panicked; each is also counted as discarded.
    pub tick_panics: u64,
}

macro_rules! counter {
    ($name:ident) => {
        #[doc = concat!("Increments `", stringify!($name), "`.")]
        pub fn $name(&self) {
            self.$name.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl PollMetrics {
    /// Records a completed fetch.
    pub fn poll(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    counter!(new_results);
    counter!(stale_responses);
    counter!(fetch_errors);
    counter!(fetch_timeouts);
    counter!(duplicates);
    counter!(persistence_failures);
    counter!(discarded_ticks);
    counter!(coalesced_ticks);
    counter!(tick_panics);

    /// Copies every counter.
    pub fn snapshot(&self) -> PollMetricsSnapshot {
        PollMetricsSnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            new_results: self.new_results.load(Ordering::Relaxed),
            stale_responses: self.stale_responses.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            fetch_timeouts: self.fetch_timeouts.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            discarded_ticks: self.discarded_ticks.load(Ordering::Relaxed),
            coalesced_ticks: self.coalesced_ticks.load(Ordering::Relaxed),
            tick_panics: self.tick_panics.load(Ordering::Relaxed),
        }
    }
}

/// Fanout counters.
#[derive(Debug, Default)]
pub struct FanoutMetrics {
    published: AtomicU64,
    compressed: AtomicU64,
    delivered: AtomicU64,
    dropped_full: AtomicU64,
    closed_subscribers: AtomicU64,
    broker_failures: AtomicU64,
}

/// Serializable copy of [`FanoutMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutMetricsSnapshot {
    /// Results published.
    pub published: u64,
    /// Published frames whose payload was gzip-compressed.
    pub compressed: u64,
    /// Frames enqueued to subscribers.
    pub delivered: u64,
    /// Frames dropped because a subscriber queue was full.
    pub dropped_full: u64,
    /// Subscribers reclaimed after their queue closed.
    pub closed_subscribers: u64,
    /// Failed broker publishes.
    pub broker_failures: u64,
}

impl FanoutMetrics {
    counter!(published);
    counter!(compressed);
    counter!(dropped_full);
    counter!(closed_subscribers);
    counter!(broker_failures);

    /// Adds `n` delivered frames.
    pub fn delivered(&self, n: u64) {
        self.delivered.fetch_add(n, Ordering::Relaxed);
    }

    /// Copies every counter.
    pub fn snapshot(&self) -> FanoutMetricsSnapshot {
        FanoutMetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            compressed: self.compressed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_full: self.dropped_full.load(Ordering::Relaxed),
            closed_subscribers: self.closed_subscribers.load(Ordering::Relaxed),
            broker_failures: self.broker_failures.load(Ordering::Relaxed),
        }
    }
}

/// Last known state of one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    /// Target id.
    pub id: String,
    /// Timing class label.
    pub timing: &'static str,
    /// Disabled targets are listed but never scheduled.
    pub enabled: bool,
    /// Current phase.
    pub phase: Phase,
    /// Last detected sequence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sequence: Option<String>,
    /// When it was detected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_observed_at_ms: Option<i64>,
    /// Next scheduled tick.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_poll_at_ms: Option<i64>,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Unchanged responses while due.
    pub consecutive_stale_responses: u32,
    /// Last fetch error text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl TargetStatus {
    /// Status of a target that has not ticked yet.
    pub fn pending(id: &str, timing: &'static str, enabled: bool) -> Self {
        Self {
            id: id.to_string(),
            timing,
            enabled,
            phase: Phase::Waiting,
            last_sequence: None,
            last_observed_at_ms: None,
            next_poll_at_ms: None,
            consecutive_failures: 0,
            consecutive_stale_responses: 0,
            last_error: None,
        }
    }

    /// Copies the fields mirrored from a poll state.
    pub fn absorb(&mut self, state: &PollState) {
        self.phase = state.phase;
        self.last_sequence = state.last_observed_sequence.clone();
        self.last_observed_at_ms = state.last_observed_at_ms;
        self.next_poll_at_ms = state.next_poll_at_ms;
        self.consecutive_failures = state.consecutive_failures;
        self.consecutive_stale_responses = state.consecutive_stale_responses;
    }
}

/// Per-target status table.
#[derive(Debug, Default)]
pub struct StatusBoard {
    entries: RwLock<HashMap<String, TargetStatus>>,
}

impl StatusBoard {
    /// Inserts or replaces an entry.
    pub fn put(&self, status: TargetStatus) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(status.id.clone(), status);
    }

    /// Mutates an entry in place, if present.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut TargetStatus)) {
        if let Some(status) = self
            .entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(id)
        {
            f(status);
        }
    }

    /// Drops an entry.
    pub fn remove(&self, id: &str) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    /// One entry.
    pub fn get(&self, id: &str) -> Option<TargetStatus> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Every entry, sorted by id.
    pub fn snapshot(&self) -> Vec<TargetStatus> {
        let mut all: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

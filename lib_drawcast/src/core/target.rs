//! # Target Registry
//!
//! The catalogue of watched sources. A [`Target`] carries the timing metadata
//! the cadence policies need; the [`TargetRegistry`] is the shared, read-mostly
//! view of the current catalogue used by the fanout (to validate subscriptions)
//! and by the admin surface. Catalogue edits replace targets in place; the
//! scheduler is told about the difference through [`CatalogueDiff`].

use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::CatalogueError;

/// Per-target scheduling tunables. Stale-retry budgets differ between origin
/// families, so every knob can be overridden per target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollTuning {
    /// Maximum number of short retries after an unchanged sequence.
    pub stale_retry_budget: u32,
    /// Delay between stale retries.
    pub stale_retry_interval_ms: u64,
    /// Consecutive failures that push the target into DEGRADED.
    pub failure_threshold: u32,
    /// Retry delay after a failure below the threshold.
    pub failure_retry_ms: u64,
    /// Fixed cadence while DEGRADED.
    #[serde(rename = "degradedIntervalSeconds")]
    pub degraded_interval_secs: u64,
    /// Lower bound for the far-band wait of countdown classes.
    #[serde(rename = "zeroWaitFloorSeconds")]
    pub zero_wait_floor_secs: u64,
}

impl Default for PollTuning {
    fn default() -> Self {
        Self {
            stale_retry_budget: 8,
            stale_retry_interval_ms: 500,
            failure_threshold: 5,
            failure_retry_ms: 2_000,
            degraded_interval_secs: 30,
            zero_wait_floor_secs: 5,
        }
    }
}

/// Calendar description of a SCHEDULED_WINDOW target.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawWindow {
    /// Local draw times of day.
    pub draw_times: Vec<NaiveTime>,
    /// Days on which draws happen. Empty means every day.
    pub weekdays: Vec<Weekday>,
    /// Timezone the draw times are expressed in.
    pub timezone: Tz,
    /// Minutes before the draw at which polling starts.
    pub lead_minutes: u32,
    /// Minutes after the draw during which the origin may still publish.
    pub data_delay_minutes: u32,
    /// Cadence inside the lead-in.
    pub lead_cadence_secs: u64,
    /// Cadence after the nominal draw time.
    pub post_draw_cadence_secs: u64,
}

/// How a target publishes its draws.
#[derive(Debug, Clone, PartialEq)]
pub enum TimingClass {
    /// The draw happens when the origin countdown hits exactly zero.
    ZeroWait,
    /// The draw happens the instant the countdown is exhausted and may already
    /// show up in a fetch shortly before local arithmetic reaches zero.
    ImmediateDraw {
        /// Seconds after a draw during which the origin may still lag.
        late_window_secs: u64,
    },
    /// Calendar-anchored, infrequent draws.
    ScheduledWindow(DrawWindow),
    /// Never scheduled automatically.
    Manual,
}

impl TimingClass {
    /// Short name used in logs and status output.
    pub fn label(&self) -> &'static str {
        match self {
            TimingClass::ZeroWait => "zero_wait",
            TimingClass::ImmediateDraw { .. } => "immediate_draw",
            TimingClass::ScheduledWindow(_) => "scheduled_window",
            TimingClass::Manual => "manual",
        }
    }
}

/// One watched source.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// Stable identifier, unique in the catalogue.
    pub id: String,
    /// Nominal seconds between draws.
    pub nominal_interval_secs: u64,
    /// Publication behaviour.
    pub timing: TimingClass,
    /// Seconds by which the far-band wait is shortened.
    pub early_fetch_offset_secs: u64,
    /// Disabled targets stay in the catalogue but are never scheduled.
    pub enabled: bool,
    /// Scheduling knobs.
    pub tuning: PollTuning,
}

impl Target {
    /// Creates an enabled target with default tuning.
    pub fn new(id: impl Into<String>, nominal_interval_secs: u64, timing: TimingClass) -> Self {
        Self {
            id: id.into(),
            nominal_interval_secs,
            timing,
            early_fetch_offset_secs: 0,
            enabled: true,
            tuning: PollTuning::default(),
        }
    }

    /// Replaces the tuning block.
    pub fn with_tuning(mut self, tuning: PollTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Sets the early fetch offset.
    pub fn with_early_offset(mut self, secs: u64) -> Self {
        self.early_fetch_offset_secs = secs;
        self
    }

    /// Marks the target disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Checks the invariants a target needs before it may be scheduled.
    pub fn validate(&self) -> Result<(), CatalogueError> {
        let invalid = |reason: &str| CatalogueError::Invalid {
            id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        match &self.timing {
            TimingClass::ZeroWait | TimingClass::ImmediateDraw { .. } => {
                if self.nominal_interval_secs == 0 {
                    return Err(invalid("nominalIntervalSeconds must be positive"));
                }
            }
            TimingClass::ScheduledWindow(window) => {
                if window.draw_times.is_empty() {
                    return Err(invalid("drawTimes must list at least one time"));
                }
                if window.lead_cadence_secs == 0 || window.post_draw_cadence_secs == 0 {
                    return Err(invalid("window cadences must be positive"));
                }
            }
            TimingClass::Manual => {}
        }
        let tuning = &self.tuning;
        if tuning.failure_threshold == 0 {
            return Err(invalid("failureThreshold must be at least 1"));
        }
        // Each of these is a re-poll delay; zero would spin against the origin.
        for (name, value) in [
            ("staleRetryIntervalMs", tuning.stale_retry_interval_ms),
            ("failureRetryMs", tuning.failure_retry_ms),
            ("degradedIntervalSeconds", tuning.degraded_interval_secs),
        ] {
            if value == 0 {
                return Err(invalid(&format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

/// Difference between two catalogue generations.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CatalogueDiff {
    /// Ids that were not present before.
    pub added: Vec<String>,
    /// Ids whose definition changed.
    pub changed: Vec<String>,
    /// Ids that disappeared.
    pub removed: Vec<String>,
}

impl CatalogueDiff {
    /// True when the new catalogue is identical to the previous one.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Shared view of the current catalogue.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: RwLock<HashMap<String, Arc<Target>>>,
}

impl TargetRegistry {
    /// Builds a registry from an initial catalogue.
    pub fn new(targets: Vec<Target>) -> Self {
        let registry = Self::default();
        registry.replace_all(targets);
        registry
    }

    /// Swaps in a new catalogue and reports what changed.
    pub fn replace_all(&self, targets: Vec<Target>) -> CatalogueDiff {
        let mut next: HashMap<String, Arc<Target>> = HashMap::with_capacity(targets.len());
        for target in targets {
            next.insert(target.id.clone(), Arc::new(target));
        }

        let mut guard = self.targets.write().unwrap_or_else(|e| e.into_inner());
        let mut diff = CatalogueDiff::default();
        for (id, target) in &next {
            match guard.get(id) {
                None => diff.added.push(id.clone()),
                Some(old) if old.as_ref() != target.as_ref() => diff.changed.push(id.clone()),
                Some(_) => {}
            }
        }
        for id in guard.keys() {
            if !next.contains_key(id) {
                diff.removed.push(id.clone());
            }
        }
        diff.added.sort();
        diff.changed.sort();
        diff.removed.sort();

        *guard = next;
        diff
    }

    /// Looks up one target.
    pub fn get(&self, id: &str) -> Option<Arc<Target>> {
        self.targets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// True if the id is part of the catalogue (enabled or not).
    pub fn contains(&self, id: &str) -> bool {
        self.targets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    /// Snapshot of every target, sorted by id.
    pub fn list(&self) -> Vec<Arc<Target>> {
        let mut all: Vec<_> = self
            .targets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Number of catalogued targets.
    pub fn len(&self) -> usize {
        self.targets.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// True when the catalogue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

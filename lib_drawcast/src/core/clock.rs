//! # Clocks and Drift Calibration
//!
//! Countdown arithmetic is timestamp-sensitive. Every downstream computation
//! reads "now" as `local clock + drift`, where `drift` is a single
//! process-wide offset opportunistically refreshed from whichever target last
//! reported a timely origin timestamp.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Source of wall-clock epoch milliseconds.
pub trait Clock: Send + Sync + 'static {
    /// Current epoch time in milliseconds.
    fn now_ms(&self) -> i64;
}

/// The operating system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Epoch clock that advances with the tokio runtime's notion of time.
///
/// With `tokio::time::pause()` this clock moves only when the runtime
/// auto-advances, which keeps scheduler tests deterministic.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeClock {
    base_epoch_ms: i64,
    base: tokio::time::Instant,
}

impl RuntimeClock {
    /// Anchors the clock so that "now" equals `base_epoch_ms`.
    pub fn starting_at(base_epoch_ms: i64) -> Self {
        Self {
            base_epoch_ms,
            base: tokio::time::Instant::now(),
        }
    }
}

impl Clock for RuntimeClock {
    fn now_ms(&self) -> i64 {
        let elapsed = tokio::time::Instant::now().duration_since(self.base);
        self.base_epoch_ms + elapsed.as_millis() as i64
    }
}

/// A clock moved by hand.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    /// Starts at the given epoch.
    pub fn new(epoch_ms: i64) -> Self {
        Self(AtomicI64::new(epoch_ms))
    }

    /// Jumps to an absolute epoch.
    pub fn set(&self, epoch_ms: i64) {
        self.0.store(epoch_ms, Ordering::SeqCst);
    }

    /// Moves forward.
    pub fn advance(&self, ms: i64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Timestamps older (or newer) than this are data timestamps, not clock readings.
pub const DRIFT_MAX_AGE_MS: i64 = 30_000;
/// Changes smaller than this are noise.
pub const DRIFT_MIN_ADJUST_MS: i64 = 2_000;

/// Reconciles the local clock against origin-reported timestamps.
#[derive(Debug)]
pub struct DriftCalibrator {
    drift_ms: AtomicI64,
    source: Mutex<Option<String>>,
    max_age_ms: i64,
    min_adjust_ms: i64,
}

impl Default for DriftCalibrator {
    fn default() -> Self {
        Self::new(DRIFT_MAX_AGE_MS, DRIFT_MIN_ADJUST_MS)
    }
}

impl DriftCalibrator {
    /// Creates a calibrator with explicit thresholds.
    pub fn new(max_age_ms: i64, min_adjust_ms: i64) -> Self {
        Self {
            drift_ms: AtomicI64::new(0),
            source: Mutex::new(None),
            max_age_ms,
            min_adjust_ms,
        }
    }

    /// Current offset to add to local time.
    pub fn drift_ms(&self) -> i64 {
        self.drift_ms.load(Ordering::Relaxed)
    }

    /// Target that supplied the current offset, if any.
    pub fn source(&self) -> Option<String> {
        self.source.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Local time corrected by the current drift.
    pub fn adjusted_now(&self, clock: &dyn Clock) -> i64 {
        clock.now_ms() + self.drift_ms()
    }

    /// Feeds one origin timestamp. Returns the new drift when it was adopted.
    ///
    /// `received_at_ms` is the local time the response arrived; `local_now_ms`
    /// is the local time of this call.
    pub fn observe(
        &self,
        target_id: &str,
        server_time_ms: i64,
        received_at_ms: i64,
        local_now_ms: i64,
    ) -> Option<i64> {
        let since_fetch = local_now_ms - received_at_ms;
        let raw = server_time_ms + since_fetch - local_now_ms;
        if raw.abs() > self.max_age_ms {
            return None;
        }

        let current = self.drift_ms();
        if (raw - current).abs() <= self.min_adjust_ms {
            return None;
        }

        self.drift_ms.store(raw, Ordering::Relaxed);
        *self.source.lock().unwrap_or_else(|e| e.into_inner()) = Some(target_id.to_string());
        tracing::info!(target_id, drift_ms = raw, previous_ms = current, "clock drift adjusted");
        Some(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_offsets_are_ignored() {
        let calibrator = DriftCalibrator::default();
        assert_eq!(calibrator.observe("a", 101_500, 100_000, 100_000), None);
        assert_eq!(calibrator.drift_ms(), 0);
    }

    #[test]
    fn timely_offset_beyond_threshold_is_adopted() {
        let calibrator = DriftCalibrator::default();
        // Origin is 5 s ahead; the response arrived 200 ms before this call.
        let adopted = calibrator.observe("a", 105_000, 100_000, 100_200);
        assert_eq!(adopted, Some(5_000));
        assert_eq!(calibrator.drift_ms(), 5_000);
        assert_eq!(calibrator.source().as_deref(), Some("a"));

        let clock = ManualClock::new(200_000);
        assert_eq!(calibrator.adjusted_now(&clock), 205_000);
    }

    #[test]
    fn stale_server_timestamps_are_not_clock_readings() {
        let calibrator = DriftCalibrator::default();
        assert_eq!(calibrator.observe("a", 10_000, 100_000, 100_000), None);
        assert_eq!(calibrator.drift_ms(), 0);
    }

    #[test]
    fn refresh_needs_a_material_change() {
        let calibrator = DriftCalibrator::default();
        calibrator.observe("a", 105_000, 100_000, 100_000);
        assert_eq!(calibrator.observe("b", 106_000, 100_000, 100_000), None);
        assert_eq!(calibrator.observe("b", 97_000, 100_000, 100_000), Some(-3_000));
        assert_eq!(calibrator.source().as_deref(), Some("b"));
    }
}

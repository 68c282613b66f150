//! # Cadence Policies
//!
//! The interval function of the scheduler. Each target's timing class is
//! resolved once, at load time, into a [`CadencePolicy`]; every tick then asks
//! the policy for the next delay through the uniform
//! [`CadencePolicy::compute_next_delay`] call instead of re-branching on the
//! class.
//!
//! Countdown classes share the same band table:
//!
//! | countdown `c` (s) | cadence |
//! |---|---|
//! | `c ≤ 0` (due) | 1 s |
//! | `c ≤ 20` | 1 s |
//! | `21..=40` | 2 s |
//! | `41..=60` | 3 s |
//! | `> 60` | sleep until the 60 s band, clamped to `[floor, nominal]` |

use chrono::{Datelike, Duration as ChronoDuration, TimeZone, Utc};
use std::time::Duration;

use crate::core::poll_state::{Phase, PollState};
use crate::core::target::{DrawWindow, Target, TimingClass};

const SECOND_MS: i64 = 1_000;
const DAY_MS: i64 = 86_400_000;
/// How far ahead the calendar search for the next window looks.
const WINDOW_SEARCH_DAYS: i64 = 8;

/// What the driver should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Poll again after the delay.
    Poll(Duration),
    /// Polling suspended; one wake-up after the delay.
    Suspend(Duration),
    /// Never scheduled automatically.
    Manual,
}

impl Cadence {
    /// Delay until the next automatic tick, if any.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Cadence::Poll(d) | Cadence::Suspend(d) => Some(*d),
            Cadence::Manual => None,
        }
    }
}

/// Output of the interval function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Estimate {
    /// Next action.
    pub cadence: Cadence,
    /// Phase implied by the countdown.
    pub phase: Phase,
    /// A draw is due (or just happened) and the origin may simply lag.
    pub draw_due: bool,
    /// Countdown in whole seconds, for countdown classes.
    pub countdown_secs: Option<i64>,
}

impl Estimate {
    fn poll(delay_ms: i64, phase: Phase, draw_due: bool, countdown_secs: Option<i64>) -> Self {
        Self {
            cadence: Cadence::Poll(millis(delay_ms)),
            phase,
            draw_due,
            countdown_secs,
        }
    }
}

/// Timing strategy resolved from a target's class.
#[derive(Debug, Clone, PartialEq)]
pub enum CadencePolicy {
    /// Draw exactly when the countdown reaches zero.
    ZeroWait(CountdownParams),
    /// Draw as soon as the countdown is exhausted; origin may lag by up to
    /// `late_window_ms`.
    ImmediateDraw {
        /// Shared countdown parameters.
        countdown: CountdownParams,
        /// Publication lag tolerated after a draw.
        late_window_ms: i64,
    },
    /// Calendar-anchored windows.
    ScheduledWindow(DrawWindow),
    /// Explicit triggers only.
    Manual,
}

/// Parameters shared by the countdown classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountdownParams {
    /// Nominal interval between draws.
    pub nominal_ms: i64,
    /// Shortens the far-band wait.
    pub early_offset_ms: i64,
    /// Minimum far-band wait.
    pub floor_ms: i64,
}

impl CadencePolicy {
    /// Resolves the policy for a target.
    pub fn for_target(target: &Target) -> Self {
        let countdown = CountdownParams {
            nominal_ms: target.nominal_interval_secs as i64 * SECOND_MS,
            early_offset_ms: target.early_fetch_offset_secs as i64 * SECOND_MS,
            floor_ms: target.tuning.zero_wait_floor_secs as i64 * SECOND_MS,
        };
        match &target.timing {
            TimingClass::ZeroWait => CadencePolicy::ZeroWait(countdown),
            TimingClass::ImmediateDraw { late_window_secs } => CadencePolicy::ImmediateDraw {
                countdown,
                late_window_ms: *late_window_secs as i64 * SECOND_MS,
            },
            TimingClass::ScheduledWindow(window) => CadencePolicy::ScheduledWindow(window.clone()),
            TimingClass::Manual => CadencePolicy::Manual,
        }
    }

    /// True for explicitly triggered targets.
    pub fn is_manual(&self) -> bool {
        matches!(self, CadencePolicy::Manual)
    }

    /// The interval function: next delay and phase for `state` at `now_ms`
    /// (drift-corrected epoch milliseconds).
    pub fn compute_next_delay(&self, state: &PollState, now_ms: i64) -> Estimate {
        match self {
            CadencePolicy::ZeroWait(params) => match state.last_observed_at_ms {
                Some(anchor) => band(countdown_from_anchor(anchor, params.nominal_ms, now_ms), params),
                None => Estimate::poll(SECOND_MS, Phase::Waiting, false, None),
            },
            CadencePolicy::ImmediateDraw {
                countdown,
                late_window_ms,
            } => immediate_draw(state, now_ms, countdown, *late_window_ms),
            CadencePolicy::ScheduledWindow(window) => scheduled_window(window, state, now_ms),
            CadencePolicy::Manual => Estimate {
                cadence: Cadence::Manual,
                phase: Phase::Waiting,
                draw_due: false,
                countdown_secs: None,
            },
        }
    }
}

fn millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

/// Seconds until the next draw, measured from the last detected draw. A
/// baseline older than two nominal intervals is considered lost and the
/// countdown is re-derived modulo the interval.
fn countdown_from_anchor(anchor_ms: i64, nominal_ms: i64, now_ms: i64) -> i64 {
    let mut elapsed = (now_ms - anchor_ms).max(0);
    if elapsed > 2 * nominal_ms {
        elapsed %= nominal_ms;
    }
    (nominal_ms - elapsed).div_euclid(SECOND_MS)
}

fn band(c: i64, params: &CountdownParams) -> Estimate {
    let countdown = Some(c);
    match c {
        c if c <= 0 => Estimate::poll(SECOND_MS, Phase::Verifying, true, countdown),
        c if c <= 20 => Estimate::poll(SECOND_MS, Phase::Approaching, false, countdown),
        c if c <= 40 => Estimate::poll(2 * SECOND_MS, Phase::Approaching, false, countdown),
        c if c <= 60 => Estimate::poll(3 * SECOND_MS, Phase::Approaching, false, countdown),
        c => {
            let until_band = (c - 60) * SECOND_MS - params.early_offset_ms;
            let upper = params.nominal_ms.max(params.floor_ms);
            let wait = until_band.clamp(params.floor_ms, upper);
            Estimate::poll(wait, Phase::Waiting, false, countdown)
        }
    }
}

fn immediate_draw(
    state: &PollState,
    now_ms: i64,
    params: &CountdownParams,
    late_window_ms: i64,
) -> Estimate {
    let c = match (state.next_draw_at_ms, state.last_observed_at_ms) {
        (Some(next_draw), _) => (next_draw - now_ms).div_euclid(SECOND_MS),
        (None, Some(anchor)) => countdown_from_anchor(anchor, params.nominal_ms, now_ms),
        (None, None) => return Estimate::poll(SECOND_MS, Phase::Waiting, false, None),
    };

    // The origin restarted its countdown but the result of the draw that just
    // happened has not been observed yet.
    if let Some(next_draw) = state.next_draw_at_ms {
        let cycle_start = next_draw - params.nominal_ms;
        let nominal_secs = params.nominal_ms / SECOND_MS;
        let late_secs = late_window_ms / SECOND_MS;
        let seen_this_cycle = state.last_observed_at_ms.is_some_and(|at| at >= cycle_start);
        if !seen_this_cycle && c >= nominal_secs - late_secs && c <= nominal_secs {
            return Estimate::poll(SECOND_MS, Phase::Verifying, true, Some(c));
        }
    }

    band(c, params)
}

/// Start of every draw occurrence in `[now - 1 day, now + WINDOW_SEARCH_DAYS]`, ascending.
fn occurrences(window: &DrawWindow, now_ms: i64) -> Vec<i64> {
    let Some(now_utc) = Utc.timestamp_millis_opt(now_ms).single() else {
        return Vec::new();
    };
    let today = now_utc.with_timezone(&window.timezone).date_naive();

    let mut out = Vec::new();
    for offset in -1..=WINDOW_SEARCH_DAYS {
        let day = today + ChronoDuration::days(offset);
        if !window.weekdays.is_empty() && !window.weekdays.contains(&day.weekday()) {
            continue;
        }
        for time in &window.draw_times {
            let local = day.and_time(*time);
            if let Some(at) = window.timezone.from_local_datetime(&local).earliest() {
                out.push(at.timestamp_millis());
            }
        }
    }
    out.sort_unstable();
    out
}

fn scheduled_window(window: &DrawWindow, state: &PollState, now_ms: i64) -> Estimate {
    let lead_ms = window.lead_minutes as i64 * 60 * SECOND_MS;
    let delay_ms = window.data_delay_minutes as i64 * 60 * SECOND_MS;

    let mut next_start: Option<i64> = None;
    for occurrence in occurrences(window, now_ms) {
        let start = occurrence - lead_ms;
        let end = occurrence + delay_ms;

        if start <= now_ms && now_ms < end {
            let already_seen = state.last_observed_at_ms.is_some_and(|at| at >= occurrence);
            if already_seen {
                continue;
            }
            return if now_ms < occurrence {
                Estimate::poll(
                    window.lead_cadence_secs as i64 * SECOND_MS,
                    Phase::Approaching,
                    false,
                    Some((occurrence - now_ms).div_euclid(SECOND_MS)),
                )
            } else {
                Estimate::poll(
                    window.post_draw_cadence_secs as i64 * SECOND_MS,
                    Phase::Verifying,
                    true,
                    Some((occurrence - now_ms).div_euclid(SECOND_MS)),
                )
            };
        }

        if start > now_ms && next_start.map_or(true, |s| start < s) {
            next_start = Some(start);
        }
    }

    let wake_in = next_start.map(|s| s - now_ms).unwrap_or(DAY_MS);
    Estimate {
        cadence: Cadence::Suspend(millis(wake_in)),
        phase: Phase::Waiting,
        draw_due: false,
        countdown_secs: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::target::PollTuning;
    use chrono::{NaiveDate, NaiveTime};

    fn zero_wait(nominal: u64) -> CadencePolicy {
        CadencePolicy::for_target(&Target::new("fast-5", nominal, TimingClass::ZeroWait))
    }

    fn observed_at(at_ms: i64) -> PollState {
        let mut state = PollState::default();
        state.last_observed_sequence = Some("100".into());
        state.last_observed_at_ms = Some(at_ms);
        state
    }

    #[test]
    fn zero_wait_near_band_is_one_second() {
        let policy = zero_wait(75);
        let state = observed_at(0);
        // t = 56 s gives c = 19.
        let est = policy.compute_next_delay(&state, 56_000);
        assert_eq!(est.countdown_secs, Some(19));
        assert_eq!(est.cadence, Cadence::Poll(Duration::from_millis(1_000)));
        assert_eq!(est.phase, Phase::Approaching);

        for t in [55_000, 60_000, 74_999] {
            assert_eq!(
                policy.compute_next_delay(&state, t).cadence,
                Cadence::Poll(Duration::from_millis(1_000)),
                "t = {}",
                t
            );
        }
    }

    #[test]
    fn zero_wait_middle_bands() {
        let policy = zero_wait(120);
        let state = observed_at(0);
        // c = 30
        assert_eq!(
            policy.compute_next_delay(&state, 90_000).cadence,
            Cadence::Poll(Duration::from_secs(2))
        );
        // c = 50
        assert_eq!(
            policy.compute_next_delay(&state, 70_000).cadence,
            Cadence::Poll(Duration::from_secs(3))
        );
    }

    #[test]
    fn zero_wait_far_band_sleeps_until_near_band_with_floor() {
        let policy = zero_wait(300);
        let state = observed_at(0);
        // c = 300 -> sleep 240 s
        let est = policy.compute_next_delay(&state, 0);
        assert_eq!(est.cadence, Cadence::Poll(Duration::from_secs(240)));
        assert_eq!(est.phase, Phase::Waiting);
        // c = 62 -> 2 s, floored at 5 s
        assert_eq!(
            policy.compute_next_delay(&state, 238_000).cadence,
            Cadence::Poll(Duration::from_secs(5))
        );
    }

    #[test]
    fn early_offset_shortens_far_wait() {
        let target = Target::new("e", 300, TimingClass::ZeroWait).with_early_offset(30);
        let policy = CadencePolicy::for_target(&target);
        let est = policy.compute_next_delay(&observed_at(0), 0);
        assert_eq!(est.cadence, Cadence::Poll(Duration::from_secs(210)));
    }

    #[test]
    fn overdue_countdown_is_due() {
        let policy = zero_wait(75);
        let est = policy.compute_next_delay(&observed_at(0), 80_000);
        assert!(est.draw_due);
        assert_eq!(est.phase, Phase::Verifying);
        assert_eq!(est.cadence, Cadence::Poll(Duration::from_secs(1)));
    }

    #[test]
    fn lost_anchor_rederives_countdown() {
        let policy = zero_wait(100);
        // elapsed 250 s > 2 * nominal -> 250 mod 100 = 50 -> c = 50
        let est = policy.compute_next_delay(&observed_at(0), 250_000);
        assert_eq!(est.countdown_secs, Some(50));
        assert!(!est.draw_due);
    }

    #[test]
    fn immediate_draw_uses_reported_epoch_and_late_window() {
        let target = Target::new(
            "imm",
            180,
            TimingClass::ImmediateDraw {
                late_window_secs: 10,
            },
        );
        let policy = CadencePolicy::for_target(&target);

        let mut state = observed_at(0);
        state.next_draw_at_ms = Some(180_000);
        // c = 15 -> 1 s
        let est = policy.compute_next_delay(&state, 165_000);
        assert_eq!(est.cadence, Cadence::Poll(Duration::from_secs(1)));
        assert!(!est.draw_due);

        // The origin now reports the following draw; we are 5 s into the new
        // cycle and have not seen its result.
        state.next_draw_at_ms = Some(360_000);
        let est = policy.compute_next_delay(&state, 185_000);
        assert_eq!(est.countdown_secs, Some(175));
        assert!(est.draw_due);
        assert_eq!(est.phase, Phase::Verifying);
        assert_eq!(est.cadence, Cadence::Poll(Duration::from_secs(1)));

        // Once the result of that draw is observed the far band applies.
        state.last_observed_at_ms = Some(185_000);
        let est = policy.compute_next_delay(&state, 185_000);
        assert!(!est.draw_due);
        assert_eq!(est.phase, Phase::Waiting);
    }

    fn evening_window() -> DrawWindow {
        DrawWindow {
            draw_times: vec![NaiveTime::from_hms_opt(21, 30, 0).unwrap()],
            weekdays: Vec::new(),
            timezone: chrono_tz::UTC,
            lead_minutes: 3,
            data_delay_minutes: 10,
            lead_cadence_secs: 5,
            post_draw_cadence_secs: 30,
        }
    }

    fn at(h: u32, m: u32) -> i64 {
        NaiveDate::from_ymd_opt(2024, 3, 14)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis()
    }

    #[test]
    fn scheduled_window_suspends_until_lead_in() {
        let policy = CadencePolicy::ScheduledWindow(evening_window());
        let est = policy.compute_next_delay(&PollState::default(), at(21, 0));
        assert_eq!(est.cadence, Cadence::Suspend(Duration::from_secs(27 * 60)));
        assert_eq!(est.phase, Phase::Waiting);
    }

    #[test]
    fn scheduled_window_lead_and_post_draw_cadence() {
        let policy = CadencePolicy::ScheduledWindow(evening_window());
        let lead = policy.compute_next_delay(&PollState::default(), at(21, 28));
        assert_eq!(lead.cadence, Cadence::Poll(Duration::from_secs(5)));
        assert_eq!(lead.phase, Phase::Approaching);

        let post = policy.compute_next_delay(&PollState::default(), at(21, 32));
        assert_eq!(post.cadence, Cadence::Poll(Duration::from_secs(30)));
        assert!(post.draw_due);
    }

    #[test]
    fn scheduled_window_after_data_delay_waits_for_next_day() {
        let policy = CadencePolicy::ScheduledWindow(evening_window());
        let est = policy.compute_next_delay(&PollState::default(), at(21, 41));
        let expected = at(21, 27) + DAY_MS - at(21, 41);
        assert_eq!(est.cadence, Cadence::Suspend(Duration::from_millis(expected as u64)));
    }

    #[test]
    fn scheduled_window_suspends_once_result_seen() {
        let policy = CadencePolicy::ScheduledWindow(evening_window());
        let mut state = PollState::default();
        state.last_observed_sequence = Some("2024-071".into());
        state.last_observed_at_ms = Some(at(21, 33));
        let est = policy.compute_next_delay(&state, at(21, 34));
        assert!(matches!(est.cadence, Cadence::Suspend(_)));
    }

    #[test]
    fn weekday_filter_skips_days() {
        let mut window = evening_window();
        // 2024-03-14 is a Thursday; only Saturday draws.
        window.weekdays = vec![chrono::Weekday::Sat];
        let policy = CadencePolicy::ScheduledWindow(window);
        let est = policy.compute_next_delay(&PollState::default(), at(21, 0));
        let expected = at(21, 27) + 2 * DAY_MS - at(21, 0);
        assert_eq!(est.cadence, Cadence::Suspend(Duration::from_millis(expected as u64)));
    }

    #[test]
    fn manual_never_schedules() {
        let policy = CadencePolicy::for_target(&Target::new("m", 0, TimingClass::Manual));
        assert_eq!(policy.compute_next_delay(&PollState::default(), 0).cadence, Cadence::Manual);
        assert!(policy.is_manual());
    }

    #[test]
    fn floor_above_nominal_does_not_panic() {
        let tuning = PollTuning {
            zero_wait_floor_secs: 600,
            ..PollTuning::default()
        };
        let target = Target::new("slow", 300, TimingClass::ZeroWait).with_tuning(tuning);
        let est = CadencePolicy::for_target(&target).compute_next_delay(&observed_at(0), 0);
        assert_eq!(est.cadence, Cadence::Poll(Duration::from_secs(600)));
    }
}

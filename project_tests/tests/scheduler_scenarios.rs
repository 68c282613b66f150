//! End-to-end timing scenarios: scheduler, fake origin and fanout on a
//! paused runtime clock.

use chrono::NaiveTime;
use lib_drawcast::{
    Clock, DrawResult, DrawWindow, FetchError, Observation, Phase, RuntimeClock, SubscriberSession, Target,
    TimingClass,
};
use project_tests::{advance_to, periodic, utc_ms, ClockedOrigin, RigBuilder};
use serde_json::{json, Value};
use std::sync::Arc;

const MINUTE: i64 = 60_000;

fn drain(session: &mut SubscriberSession) -> Vec<String> {
    let mut sequences = Vec::new();
    while let Some(frame) = session.try_next_frame() {
        sequences.push(frame.sequence.clone());
    }
    sequences
}

#[tokio::test(start_paused = true)]
async fn zero_wait_polls_every_second_near_the_draw_and_publishes_once() {
    let clock = RuntimeClock::starting_at(0);
    let origin = Arc::new(ClockedOrigin::new(clock, periodic(100, 75_000)));
    let rig = RigBuilder::new(
        vec![Target::new("fast-5", 75, TimingClass::ZeroWait)],
        origin.clone(),
        clock,
    )
    .spawn();
    let mut session = SubscriberSession::open(rig.fanout.clone()).unwrap();
    session
        .handle_text(r#"{"type":"subscribe","targets":["fast-5"]}"#)
        .await;

    advance_to(&clock, 80_000).await;

    let times = origin.fetch_times("fast-5");
    assert_eq!(times[0], 0);
    assert!(
        times.iter().any(|t| (56_000..57_010).contains(t)),
        "no poll around t=56s: {:?}",
        times
    );
    for pair in times.windows(2) {
        if (56_000..74_000).contains(&pair[0]) {
            let gap = pair[1] - pair[0];
            assert!((1_000..=1_010).contains(&gap), "gap {} after {}", gap, pair[0]);
        }
    }

    let detected = times.iter().copied().find(|t| *t >= 75_000).unwrap();
    assert!(detected < 76_010, "detected at {}", detected);

    let status = rig.handle.target_status("fast-5").unwrap();
    assert_eq!(status.last_sequence.as_deref(), Some("101"));
    assert_eq!(status.last_observed_at_ms, Some(detected));

    let seen = drain(&mut session);
    assert_eq!(seen.iter().filter(|s| *s == "101").count(), 1);
    assert_eq!(rig.handle.metrics().polls.new_results, 2);

    rig.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn scheduled_window_suspends_outside_the_window() {
    let start = utc_ms(2026, 3, 2, 21, 0);
    let draw = start + 30 * MINUTE;
    let clock = RuntimeClock::starting_at(start);
    let origin = Arc::new(ClockedOrigin::new(
        clock,
        Box::new(move |id, now| {
            let result = if now < draw + 3 * MINUTE {
                DrawResult::new(id, "d1", json!({"day": 1})).observed_at(draw - 1_440 * MINUTE)
            } else {
                DrawResult::new(id, "d2", json!({"day": 2})).observed_at(draw + 3 * MINUTE)
            };
            Ok(Observation::of(result))
        }),
    ));
    let window = DrawWindow {
        draw_times: vec![NaiveTime::from_hms_opt(21, 30, 0).unwrap()],
        weekdays: vec![],
        timezone: chrono_tz::UTC,
        lead_minutes: 3,
        data_delay_minutes: 10,
        lead_cadence_secs: 5,
        post_draw_cadence_secs: 30,
    };
    let rig = RigBuilder::new(
        vec![Target::new("sched-1", 0, TimingClass::ScheduledWindow(window))],
        origin.clone(),
        clock,
    )
    .spawn();

    // 21:00 bootstrap, then nothing until the lead-in at 21:27.
    advance_to(&clock, start + 27 * MINUTE - 1).await;
    assert_eq!(origin.fetch_times("sched-1"), vec![start]);
    let status = rig.handle.target_status("sched-1").unwrap();
    assert_eq!(status.next_poll_at_ms, Some(start + 27 * MINUTE));

    // 21:32 is inside the post-draw part of the window.
    advance_to(&clock, start + 32 * MINUTE).await;
    let times = origin.fetch_times("sched-1");
    let lead_in = times
        .iter()
        .filter(|t| (start + 27 * MINUTE..draw).contains(t))
        .count();
    assert_eq!(lead_in, 36);
    assert_eq!(
        rig.handle.target_status("sched-1").unwrap().phase,
        Phase::Verifying
    );

    // 21:45: d2 was found shortly after 21:33 and the target went back to sleep.
    advance_to(&clock, start + 45 * MINUTE).await;
    let times = origin.fetch_times("sched-1");
    let last = *times.last().unwrap();
    assert!(last >= draw + 3 * MINUTE && last < draw + 3 * MINUTE + 31_000, "last poll {}", last);
    let status = rig.handle.target_status("sched-1").unwrap();
    assert_eq!(status.last_sequence.as_deref(), Some("d2"));
    assert_eq!(status.next_poll_at_ms, Some(start + 1_440 * MINUTE + 27 * MINUTE));
    assert_eq!(status.phase, Phase::Waiting);

    rig.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn subscriber_gets_a_snapshot_before_any_push() {
    let clock = RuntimeClock::starting_at(0);
    let origin = Arc::new(ClockedOrigin::new(clock, periodic(100, 75_000)));
    let rig = RigBuilder::new(
        vec![Target::new("fast-5", 75, TimingClass::ZeroWait)],
        origin,
        clock,
    )
    .spawn();

    advance_to(&clock, 5_000).await;

    let mut session = SubscriberSession::open(rig.fanout.clone()).unwrap();
    let replies = session
        .handle_text(r#"{"type":"subscribe","targets":["fast-5"]}"#)
        .await;
    assert_eq!(replies.len(), 2);
    let ack: Value = serde_json::from_str(&replies[0]).unwrap();
    let snapshot: Value = serde_json::from_str(&replies[1]).unwrap();
    assert_eq!(ack["type"], "subscribed");
    assert_eq!(snapshot["type"], "update");
    assert_eq!(snapshot["sequence"], "100");
    assert!(session.try_next_frame().is_none());

    rig.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failing_origin_degrades_then_recovers() {
    let clock = RuntimeClock::starting_at(0);
    let healthy = periodic(100, 75_000);
    let origin = Arc::new(ClockedOrigin::new(
        clock,
        Box::new(move |id, now| {
            if now < 30_000 {
                Err(FetchError::Failed("origin down".to_string()))
            } else {
                healthy(id, now)
            }
        }),
    ));
    let rig = RigBuilder::new(
        vec![Target::new("fast-5", 75, TimingClass::ZeroWait)],
        origin.clone(),
        clock,
    )
    .spawn();

    advance_to(&clock, 20_000).await;
    assert_eq!(
        origin.fetch_times("fast-5"),
        vec![0, 2_000, 4_000, 6_000, 8_000]
    );
    let status = rig.handle.target_status("fast-5").unwrap();
    assert_eq!(status.phase, Phase::Degraded);
    assert_eq!(status.consecutive_failures, 5);
    assert_eq!(status.next_poll_at_ms, Some(38_000));
    assert!(status.last_error.is_some());

    // One success at 38 s is enough; the 2 s band picks up from there.
    advance_to(&clock, 39_000).await;
    let status = rig.handle.target_status("fast-5").unwrap();
    assert_eq!(status.phase, Phase::Waiting);
    assert_eq!(status.next_poll_at_ms, Some(40_000));
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.last_sequence.as_deref(), Some("100"));
    assert_eq!(rig.handle.metrics().polls.fetch_errors, 5);

    rig.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stale_retries_stop_after_the_budget() {
    let clock = RuntimeClock::starting_at(0);
    // The origin never publishes a second draw.
    let origin = Arc::new(ClockedOrigin::new(clock, periodic(100, 1_000_000_000)));
    let rig = RigBuilder::new(
        vec![Target::new("fast-5", 75, TimingClass::ZeroWait)],
        origin.clone(),
        clock,
    )
    .spawn();

    advance_to(&clock, 82_000).await;
    let times = origin.fetch_times("fast-5");
    let overdue: Vec<i64> = times.iter().copied().filter(|t| *t >= 75_000).collect();
    let gaps: Vec<i64> = overdue.windows(2).map(|p| p[1] - p[0]).collect();

    let default_budget = 8;
    assert!(gaps.len() > default_budget + 1, "{:?}", overdue);
    assert!(gaps[..default_budget].iter().all(|g| *g == 500), "{:?}", gaps);
    assert!(gaps[default_budget..].iter().all(|g| *g >= 1_000), "{:?}", gaps);

    let status = rig.handle.target_status("fast-5").unwrap();
    assert!(status.consecutive_stale_responses as usize > default_budget);
    assert_eq!(rig.handle.metrics().polls.new_results, 1);

    rig.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn origin_clock_ahead_shifts_the_countdown() {
    let clock = RuntimeClock::starting_at(0);
    // The origin's clock runs 5 s ahead and it draws every 75 s of its own time.
    let origin = Arc::new(ClockedOrigin::new(
        clock,
        Box::new(|id, now| {
            let origin_now = now + 5_000;
            let n = origin_now.div_euclid(75_000);
            let result = DrawResult::new(id, (100 + n).to_string(), json!({ "draw": n }))
                .observed_at(n * 75_000);
            let mut observation = Observation::of(result);
            observation.server_time_ms = Some(origin_now);
            Ok(observation)
        }),
    ));
    let rig = RigBuilder::new(
        vec![Target::new("fast-5", 75, TimingClass::ZeroWait)],
        origin.clone(),
        clock,
    )
    .spawn();

    advance_to(&clock, 71_500).await;

    let metrics = rig.handle.metrics();
    assert_eq!(metrics.drift_ms, 5_000);
    assert_eq!(metrics.drift_source.as_deref(), Some("fast-5"));
    assert_eq!(rig.handle.now_ms(), 76_500);

    // Without the offset the far-band wait would end at 15 s local.
    let times = origin.fetch_times("fast-5");
    assert_eq!(&times[..2], &[0, 10_000]);
    for pair in times.windows(2) {
        if (51_000..70_000).contains(&pair[0]) {
            assert_eq!(pair[1] - pair[0], 1_000, "after {}", pair[0]);
        }
    }

    // The origin's 75 s draw is 70 s local; the baseline is origin time.
    let status = rig.handle.target_status("fast-5").unwrap();
    assert_eq!(status.last_sequence.as_deref(), Some("101"));
    assert!(times.contains(&70_000), "{:?}", times);
    assert!(!times.iter().any(|t| (70_001..71_000).contains(t)), "{:?}", times);
    assert_eq!(status.last_observed_at_ms, Some(75_000));

    rig.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn clock_reads_follow_the_runtime() {
    let clock = RuntimeClock::starting_at(1_000);
    advance_to(&clock, 61_000).await;
    assert_eq!(clock.now_ms(), 61_000);
}

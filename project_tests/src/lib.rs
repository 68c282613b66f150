//! # Pipeline Test Harness
//!
//! Shared fixtures for the integration tests under `tests/`: a clocked fake
//! origin whose answers are a function of the (paused) runtime clock, stores
//! that misbehave on purpose, and a helper that wires the scheduler, the
//! fanout and a store together.

use async_trait::async_trait;
use lib_drawcast::{
    Clock, DrawResult, EventFanout, FetchCapability, FetchError, MemoryResultStore, Observation,
    PersistenceError, PollScheduler, ResultStore, RuntimeClock, SaveOutcome, SchedulerConfig,
    SchedulerHandle, SubscriberLimits, SubscriberRegistry, Target, TargetRegistry,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Computes the origin's answer for a target at an epoch.
pub type Script = Box<dyn Fn(&str, i64) -> Result<Observation, FetchError> + Send + Sync>;

/// A fake origin driven by the runtime clock.
pub struct ClockedOrigin {
    clock: RuntimeClock,
    script: Script,
    latency: Duration,
    calls: Mutex<Vec<(String, i64)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    per_target: Mutex<HashMap<String, (usize, usize)>>,
}

impl ClockedOrigin {
    pub fn new(clock: RuntimeClock, script: Script) -> Self {
        Self {
            clock,
            script,
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            per_target: Mutex::new(HashMap::new()),
        }
    }

    /// Every fetch takes `latency` of runtime time.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Epochs at which `target_id` was fetched.
    pub fn fetch_times(&self, target_id: &str) -> Vec<i64> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == target_id)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of fetches in flight at once, all targets.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Highest number of fetches in flight at once for one target.
    pub fn peak_in_flight_of(&self, target_id: &str) -> usize {
        self.per_target
            .lock()
            .unwrap()
            .get(target_id)
            .map(|(_, peak)| *peak)
            .unwrap_or(0)
    }
}

#[async_trait]
impl FetchCapability for ClockedOrigin {
    async fn fetch(&self, target_id: &str) -> Result<Observation, FetchError> {
        let now = self.clock.now_ms();
        self.calls.lock().unwrap().push((target_id.to_string(), now));
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        {
            let mut per_target = self.per_target.lock().unwrap();
            let entry = per_target.entry(target_id.to_string()).or_insert((0, 0));
            entry.0 += 1;
            entry.1 = entry.1.max(entry.0);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let answer = (self.script)(target_id, now);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(entry) = self.per_target.lock().unwrap().get_mut(target_id) {
            entry.0 -= 1;
        }
        answer
    }
}

/// Origin that draws every `interval_ms` starting at epoch 0, sequence
/// `first + n` for the n-th draw, and reports the draw time as `observedAt`.
pub fn periodic(first: u64, interval_ms: i64) -> Script {
    Box::new(move |target_id, now| {
        let n = now.div_euclid(interval_ms);
        let result = DrawResult::new(target_id, (first as i64 + n).to_string(), json!({ "draw": n }))
            .observed_at(n * interval_ms);
        Ok(Observation::of(result))
    })
}

/// A store that always fails.
pub struct BrokenStore;

#[async_trait]
impl ResultStore for BrokenStore {
    async fn save(&self, _result: &DrawResult) -> SaveOutcome {
        SaveOutcome::Failed(PersistenceError("store offline".to_string()))
    }

    async fn latest(&self, _target_id: &str) -> Result<Option<DrawResult>, PersistenceError> {
        Err(PersistenceError("store offline".to_string()))
    }
}

/// A store whose writes never complete.
pub struct HangingStore;

#[async_trait]
impl ResultStore for HangingStore {
    async fn save(&self, _result: &DrawResult) -> SaveOutcome {
        std::future::pending::<SaveOutcome>().await
    }

    async fn latest(&self, _target_id: &str) -> Result<Option<DrawResult>, PersistenceError> {
        Ok(None)
    }
}

/// A store whose first write panics; later writes land in memory.
#[derive(Default)]
pub struct PanicOnceStore {
    tripped: AtomicBool,
    inner: MemoryResultStore,
}

impl PanicOnceStore {
    /// Sequences stored after the panic, in order.
    pub fn stored(&self) -> Vec<String> {
        self.inner.history().into_iter().map(|r| r.sequence).collect()
    }
}

#[async_trait]
impl ResultStore for PanicOnceStore {
    async fn save(&self, result: &DrawResult) -> SaveOutcome {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            panic!("store bug while saving {}", result.sequence);
        }
        self.inner.save(result).await
    }

    async fn latest(&self, target_id: &str) -> Result<Option<DrawResult>, PersistenceError> {
        self.inner.latest(target_id).await
    }
}

/// A scheduler wired to a fanout and a store.
pub struct Rig {
    pub handle: SchedulerHandle,
    pub fanout: Arc<EventFanout>,
    pub targets: Arc<TargetRegistry>,
}

/// Builder for [`Rig`].
pub struct RigBuilder {
    targets: Vec<Target>,
    origin: Arc<dyn FetchCapability>,
    store: Arc<dyn ResultStore>,
    clock: RuntimeClock,
    config: SchedulerConfig,
}

impl RigBuilder {
    pub fn new(targets: Vec<Target>, origin: Arc<dyn FetchCapability>, clock: RuntimeClock) -> Self {
        Self {
            targets,
            origin,
            store: Arc::new(MemoryResultStore::new()),
            clock,
            config: SchedulerConfig::default(),
        }
    }

    pub fn store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = store;
        self
    }

    pub fn max_concurrent_fetches(mut self, limit: usize) -> Self {
        self.config.max_concurrent_fetches = limit;
        self
    }

    pub fn spawn(self) -> Rig {
        let targets = Arc::new(TargetRegistry::new(self.targets));
        let registry = Arc::new(SubscriberRegistry::new(targets.clone(), SubscriberLimits::default()));
        let fanout = Arc::new(EventFanout::new(registry).with_store(self.store.clone()));
        let handle = PollScheduler::new(targets.clone(), self.origin, self.store, fanout.clone())
            .with_config(self.config)
            .with_clock(Arc::new(self.clock))
            .spawn();
        Rig {
            handle,
            fanout,
            targets,
        }
    }
}

/// Epoch milliseconds of a UTC wall-clock time.
pub fn utc_ms(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> i64 {
    use chrono::TimeZone;
    chrono::Utc
        .with_ymd_and_hms(y, m, d, hh, mm, 0)
        .single()
        .map(|t| t.timestamp_millis())
        .unwrap_or_default()
}

/// Sleeps on the runtime clock until `clock` reads `epoch_ms`.
pub async fn advance_to(clock: &RuntimeClock, epoch_ms: i64) {
    let now = clock.now_ms();
    if epoch_ms > now {
        tokio::time::sleep(Duration::from_millis((epoch_ms - now) as u64)).await;
    }
}

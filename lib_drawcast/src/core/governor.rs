//! # Poll Governor
//!
//! Two independent limits on fetch work:
//!
//! * **Per-target busy flag.** At most one tick per target is in flight. A
//!   tick that arrives while the target is busy is coalesced into a single
//!   pending re-check that runs right after the current tick completes.
//! * **Global concurrency cap.** At most `K` fetches run at once across all
//!   targets. Ready ticks beyond the cap wait in FIFO order on a fair
//!   semaphore; nothing is dropped.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Point-in-time gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernorStats {
    /// Configured cap.
    pub limit: usize,
    /// Fetches currently holding a permit.
    pub in_flight: usize,
    /// Ticks waiting for a permit.
    pub queued: usize,
    /// Highest `in_flight` ever observed.
    pub peak_in_flight: usize,
}

#[derive(Debug, Default)]
struct Gauges {
    in_flight: AtomicUsize,
    queued: AtomicUsize,
    peak: AtomicUsize,
}

/// Busy flags plus the global fetch semaphore.
#[derive(Debug)]
pub struct PollGovernor {
    limit: usize,
    semaphore: Arc<Semaphore>,
    /// Busy targets; the value records a coalesced re-check.
    busy: Mutex<HashMap<String, bool>>,
    gauges: Arc<Gauges>,
}

/// Slot in the global cap. Releasing it (by drop) admits the next waiter.
#[derive(Debug)]
pub struct FetchPermit {
    _permit: OwnedSemaphorePermit,
    gauges: Arc<Gauges>,
}

impl Drop for FetchPermit {
    fn drop(&mut self) {
        self.gauges.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct QueuedGuard(Arc<Gauges>);

impl Drop for QueuedGuard {
    fn drop(&mut self) {
        self.0.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PollGovernor {
    /// Creates a governor admitting at most `limit` concurrent fetches.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
            busy: Mutex::new(HashMap::new()),
            gauges: Arc::new(Gauges::default()),
        }
    }

    /// Marks `target_id` busy. Returns `false` (and records a pending
    /// re-check) when a tick is already in flight.
    pub fn try_begin(&self, target_id: &str) -> bool {
        let mut busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        match busy.get_mut(target_id) {
            Some(pending) => {
                *pending = true;
                false
            }
            None => {
                busy.insert(target_id.to_string(), false);
                true
            }
        }
    }

    /// Clears the busy flag. Returns `true` when a re-check was coalesced
    /// while the tick ran.
    pub fn finish(&self, target_id: &str) -> bool {
        self.busy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(target_id)
            .unwrap_or(false)
    }

    /// True while a tick for `target_id` is in flight.
    pub fn is_busy(&self, target_id: &str) -> bool {
        self.busy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(target_id)
    }

    /// Waits for a slot in the global cap. Waiters are served first come,
    /// first served; dropping the future leaves the queue.
    pub async fn acquire(&self, target_id: &str) -> Result<FetchPermit, AcquireError> {
        if self.semaphore.available_permits() == 0 {
            tracing::trace!(target_id, "fetch queued behind concurrency cap");
        }
        self.gauges.queued.fetch_add(1, Ordering::SeqCst);
        let queued = QueuedGuard(self.gauges.clone());
        let permit = self.semaphore.clone().acquire_owned().await?;
        drop(queued);

        let now = self.gauges.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauges.peak.fetch_max(now, Ordering::SeqCst);
        Ok(FetchPermit {
            _permit: permit,
            gauges: self.gauges.clone(),
        })
    }

    /// Current gauges.
    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            limit: self.limit,
            in_flight: self.gauges.in_flight.load(Ordering::SeqCst),
            queued: self.gauges.queued.load(Ordering::SeqCst),
            peak_in_flight: self.gauges.peak.load(Ordering::SeqCst),
        }
    }
}

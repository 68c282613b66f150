//! # Subscriber Registry
//!
//! Two indices kept under one lock:
//!
//! * forward: subscriber -> interest set (plus its outbound queue)
//! * reverse: target -> subscribers
//!
//! Every mutation updates both sides before the lock is released, so a
//! reader never observes a subscriber in one index but not the other.
//! Delivery happens under the same lock, which is what makes
//! [`SubscriberRegistry::disconnect`] and closed-queue reclamation atomic
//! with respect to fanout.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::core::dispatcher::Frame;
use crate::core::target::TargetRegistry;
use crate::error::RegistryError;

/// Identifier handed out at connect time.
pub type SubscriberId = u64;

/// Size limits enforced by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberLimits {
    /// Process-wide cap on connected subscribers.
    pub max_subscribers: usize,
    /// Cap on one subscriber's interest set.
    pub max_targets_per_subscriber: usize,
    /// Capacity of each outbound queue.
    pub queue_capacity: usize,
}

impl Default for SubscriberLimits {
    fn default() -> Self {
        Self {
            max_subscribers: 10_000,
            max_targets_per_subscriber: 64,
            queue_capacity: 256,
        }
    }
}

struct Entry {
    sender: mpsc::Sender<Arc<Frame>>,
    targets: HashSet<String>,
}

#[derive(Default)]
struct Indices {
    forward: HashMap<SubscriberId, Entry>,
    reverse: HashMap<String, HashSet<SubscriberId>>,
}

impl Indices {
    fn drop_subscriber(&mut self, id: SubscriberId) -> bool {
        let Some(entry) = self.forward.remove(&id) else {
            return false;
        };
        for target in entry.targets {
            if let Some(subs) = self.reverse.get_mut(&target) {
                subs.remove(&id);
                if subs.is_empty() {
                    self.reverse.remove(&target);
                }
            }
        }
        true
    }
}

/// Result of fanning one frame out to a target's subscribers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Frames enqueued.
    pub delivered: usize,
    /// Subscribers whose queue was full.
    pub dropped_full: Vec<SubscriberId>,
    /// Subscribers reclaimed because their queue was closed.
    pub closed: Vec<SubscriberId>,
}

/// Forward and reverse subscription indices.
pub struct SubscriberRegistry {
    indices: Mutex<Indices>,
    targets: Arc<TargetRegistry>,
    limits: SubscriberLimits,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    /// Creates an empty registry validating targets against `targets`.
    pub fn new(targets: Arc<TargetRegistry>, limits: SubscriberLimits) -> Self {
        Self {
            indices: Mutex::new(Indices::default()),
            targets,
            limits,
            next_id: AtomicU64::new(1),
        }
    }

    /// Configured limits.
    pub fn limits(&self) -> SubscriberLimits {
        self.limits
    }

    /// Registers a new subscriber with an empty interest set.
    pub fn connect(&self) -> Result<(SubscriberId, mpsc::Receiver<Arc<Frame>>), RegistryError> {
        let mut idx = self.indices.lock().unwrap_or_else(|e| e.into_inner());
        if idx.forward.len() >= self.limits.max_subscribers {
            return Err(RegistryError::TooManySubscribers(self.limits.max_subscribers));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.limits.queue_capacity.max(1));
        idx.forward.insert(
            id,
            Entry {
                sender,
                targets: HashSet::new(),
            },
        );
        tracing::debug!(subscriber = id, "subscriber connected");
        Ok((id, receiver))
    }

    /// Adds targets to an interest set. The request is applied whole or not
    /// at all; it is never truncated to fit the limit. Returns the targets
    /// that were not already present, in request order.
    pub fn subscribe(
        &self,
        id: SubscriberId,
        requested: &[String],
    ) -> Result<Vec<String>, RegistryError> {
        if let Some(unknown) = requested.iter().find(|t| !self.targets.contains(t)) {
            return Err(RegistryError::UnknownTarget(unknown.clone()));
        }

        let mut idx = self.indices.lock().unwrap_or_else(|e| e.into_inner());
        let entry = idx
            .forward
            .get_mut(&id)
            .ok_or(RegistryError::UnknownSubscriber(id))?;

        let mut added = Vec::new();
        let mut seen = BTreeSet::new();
        for target in requested {
            if !entry.targets.contains(target) && seen.insert(target.as_str()) {
                added.push(target.clone());
            }
        }

        let requested_size = entry.targets.len() + added.len();
        if requested_size > self.limits.max_targets_per_subscriber {
            return Err(RegistryError::InterestSetTooLarge {
                limit: self.limits.max_targets_per_subscriber,
                requested: requested_size,
            });
        }

        entry.targets.extend(added.iter().cloned());
        for target in &added {
            idx.reverse.entry(target.clone()).or_default().insert(id);
        }
        Ok(added)
    }

    /// Removes targets from an interest set. Returns those actually removed.
    pub fn unsubscribe(
        &self,
        id: SubscriberId,
        requested: &[String],
    ) -> Result<Vec<String>, RegistryError> {
        let mut idx = self.indices.lock().unwrap_or_else(|e| e.into_inner());
        let entry = idx
            .forward
            .get_mut(&id)
            .ok_or(RegistryError::UnknownSubscriber(id))?;

        let removed: Vec<String> = requested
            .iter()
            .filter(|t| entry.targets.remove(t.as_str()))
            .cloned()
            .collect();

        for target in &removed {
            if let Some(subs) = idx.reverse.get_mut(target) {
                subs.remove(&id);
                if subs.is_empty() {
                    idx.reverse.remove(target);
                }
            }
        }
        Ok(removed)
    }

    /// Removes a subscriber from both indices. Returns `false` if it was
    /// already gone.
    pub fn disconnect(&self, id: SubscriberId) -> bool {
        let removed = self
            .indices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drop_subscriber(id);
        if removed {
            tracing::debug!(subscriber = id, "subscriber disconnected");
        }
        removed
    }

    /// Enqueues `frame` for every subscriber of `target_id` without
    /// blocking. Full queues drop the frame; closed queues are reclaimed.
    pub fn deliver(&self, target_id: &str, frame: &Arc<Frame>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut idx = self.indices.lock().unwrap_or_else(|e| e.into_inner());

        let Some(subs) = idx.reverse.get(target_id) else {
            return report;
        };
        for sub in subs {
            let Some(entry) = idx.forward.get(sub) else {
                continue;
            };
            match entry.sender.try_send(Arc::clone(frame)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => report.dropped_full.push(*sub),
                Err(TrySendError::Closed(_)) => report.closed.push(*sub),
            }
        }

        for sub in &report.closed {
            idx.drop_subscriber(*sub);
        }
        report
    }

    /// Current interest set of a subscriber, sorted.
    pub fn interest_of(&self, id: SubscriberId) -> Option<Vec<String>> {
        let idx = self.indices.lock().unwrap_or_else(|e| e.into_inner());
        idx.forward.get(&id).map(|entry| {
            let mut targets: Vec<_> = entry.targets.iter().cloned().collect();
            targets.sort();
            targets
        })
    }

    /// Subscribers of a target, sorted.
    pub fn subscribers_of(&self, target_id: &str) -> Vec<SubscriberId> {
        let idx = self.indices.lock().unwrap_or_else(|e| e.into_inner());
        let mut subs: Vec<_> = idx
            .reverse
            .get(target_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        subs.sort_unstable();
        subs
    }

    /// Connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.indices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .forward
            .len()
    }

    /// Checks that `t ∈ forward[s]` iff `s ∈ reverse[t]` and that no
    /// reverse set is empty.
    pub fn indices_consistent(&self) -> bool {
        let idx = self.indices.lock().unwrap_or_else(|e| e.into_inner());
        let forward_ok = idx.forward.iter().all(|(sub, entry)| {
            entry
                .targets
                .iter()
                .all(|t| idx.reverse.get(t).is_some_and(|s| s.contains(sub)))
        });
        let reverse_ok = idx.reverse.iter().all(|(target, subs)| {
            !subs.is_empty()
                && subs.iter().all(|s| {
                    idx.forward
                        .get(s)
                        .is_some_and(|entry| entry.targets.contains(target))
                })
        });
        forward_ok && reverse_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::target::{Target, TimingClass};

    fn registry(limits: SubscriberLimits) -> SubscriberRegistry {
        let targets = Arc::new(TargetRegistry::new(vec![
            Target::new("fast-5", 75, TimingClass::ZeroWait),
            Target::new("sched-1", 86_400, TimingClass::Manual),
            Target::new("imm-3", 180, TimingClass::ImmediateDraw { late_window_secs: 10 }),
        ]));
        SubscriberRegistry::new(targets, limits)
    }

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn subscribe_and_unsubscribe_keep_indices_symmetric() {
        let reg = registry(SubscriberLimits::default());
        let (a, _rx_a) = reg.connect().unwrap();
        let (b, _rx_b) = reg.connect().unwrap();

        assert_eq!(reg.subscribe(a, &ids(&["fast-5", "sched-1", "fast-5"])).unwrap(), ids(&["fast-5", "sched-1"]));
        assert_eq!(reg.subscribe(b, &ids(&["fast-5"])).unwrap(), ids(&["fast-5"]));
        assert!(reg.indices_consistent());
        assert_eq!(reg.subscribers_of("fast-5"), vec![a, b]);

        assert_eq!(reg.unsubscribe(a, &ids(&["fast-5", "imm-3"])).unwrap(), ids(&["fast-5"]));
        assert_eq!(reg.subscribers_of("fast-5"), vec![b]);
        assert!(reg.indices_consistent());

        assert!(reg.disconnect(a));
        assert!(!reg.disconnect(a));
        assert!(reg.subscribers_of("sched-1").is_empty());
        assert!(reg.indices_consistent());
    }

    #[test]
    fn unknown_targets_are_rejected_whole() {
        let reg = registry(SubscriberLimits::default());
        let (a, _rx) = reg.connect().unwrap();
        let err = reg.subscribe(a, &ids(&["fast-5", "nope"])).unwrap_err();
        assert_eq!(err, RegistryError::UnknownTarget("nope".into()));
        assert_eq!(reg.interest_of(a), Some(vec![]));
    }

    #[test]
    fn limits_reject_rather_than_truncate() {
        let reg = registry(SubscriberLimits {
            max_subscribers: 1,
            max_targets_per_subscriber: 2,
            queue_capacity: 4,
        });
        let (a, _rx) = reg.connect().unwrap();
        assert_eq!(reg.connect().unwrap_err(), RegistryError::TooManySubscribers(1));

        reg.subscribe(a, &ids(&["fast-5"])).unwrap();
        let err = reg.subscribe(a, &ids(&["sched-1", "imm-3"])).unwrap_err();
        assert_eq!(
            err,
            RegistryError::InterestSetTooLarge {
                limit: 2,
                requested: 3
            }
        );
        assert_eq!(reg.interest_of(a), Some(ids(&["fast-5"])));
    }

    #[test]
    fn closed_queues_are_reclaimed_during_delivery() {
        let reg = registry(SubscriberLimits::default());
        let (a, rx_a) = reg.connect().unwrap();
        let (b, mut rx_b) = reg.connect().unwrap();
        reg.subscribe(a, &ids(&["fast-5"])).unwrap();
        reg.subscribe(b, &ids(&["fast-5"])).unwrap();
        drop(rx_a);

        let frame = Arc::new(Frame::text("fast-5", "1", String::from("{}")));
        let report = reg.deliver("fast-5", &frame);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.closed, vec![a]);
        assert_eq!(reg.subscriber_count(), 1);
        assert!(reg.indices_consistent());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn full_queues_drop_without_blocking() {
        let reg = registry(SubscriberLimits {
            queue_capacity: 1,
            ..SubscriberLimits::default()
        });
        let (a, _rx) = reg.connect().unwrap();
        reg.subscribe(a, &ids(&["fast-5"])).unwrap();
        let frame = Arc::new(Frame::text("fast-5", "1", String::from("{}")));
        assert_eq!(reg.deliver("fast-5", &frame).delivered, 1);
        let report = reg.deliver("fast-5", &frame);
        assert_eq!(report.dropped_full, vec![a]);
        assert_eq!(reg.subscriber_count(), 1);
    }
}

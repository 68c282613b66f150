//! # Event Fanout
//!
//! Pushes each newly detected result to every subscriber interested in its
//! target.
//!
//! ## Core Design Principles:
//!
//! 1.  **Encode once, share everywhere**: a published result is serialized
//!     into a single [`Frame`] holding the final wire text. Subscribers receive
//!     an `Arc` pointer to that frame; nothing is re-encoded per recipient.
//!     Payloads over the compression threshold are gzip-compressed and
//!     base64-encoded once, at publish time.
//!
//! 2.  **Never block the publisher**: delivery uses `try_send` on each
//!     subscriber's bounded queue. A full queue drops the frame for that
//!     subscriber only and is counted; a closed queue reclaims the subscriber.
//!
//! 3.  **Snapshot on subscribe**: the fanout caches the latest frame per
//!     target. A new subscription is registered first and the snapshot read
//!     second, so an update racing with the subscribe may arrive twice but is
//!     never missed.
//!
//! 4.  **One broker writer**: results bound for the broker go through a single
//!     queue drained by one task, so the broker sees them in publish order.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use crate::core::metrics::{FanoutMetrics, FanoutMetricsSnapshot};
use crate::core::model::{DrawResult, ServerMessage, UpdateBody};
use crate::core::ports::{ResultBroker, ResultStore};
use crate::core::registry::{SubscriberId, SubscriberRegistry};
use crate::error::RegistryError;

/// Payloads whose JSON text exceeds this many bytes are compressed.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 8 * 1024;

/// Value of the `encoding` field on compressed updates.
pub const GZIP_BASE64: &str = "gzip+base64";

/// Results waiting for the broker before new ones are dropped.
const BROKER_QUEUE: usize = 1024;

/// One encoded `update` message, shared by all recipients.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Target the update belongs to.
    pub target_id: String,
    /// Result sequence.
    pub sequence: String,
    /// Complete wire text.
    pub text: Arc<str>,
    /// Payload was compressed.
    pub compressed: bool,
}

impl Frame {
    /// Wraps pre-built wire text.
    pub fn text(target_id: &str, sequence: &str, text: String) -> Self {
        Self {
            target_id: target_id.to_string(),
            sequence: sequence.to_string(),
            text: Arc::from(text),
            compressed: false,
        }
    }

    /// Encodes a result, compressing its payload above `threshold` bytes.
    pub fn encode(result: &DrawResult, threshold: usize) -> Self {
        let raw = result.payload.to_string();
        let compressed = if raw.len() > threshold {
            gzip_base64(raw.as_bytes())
        } else {
            None
        };

        let (payload, encoding) = match compressed {
            Some(b64) => (Value::String(b64), Some(GZIP_BASE64)),
            None => (result.payload.clone(), None),
        };
        let is_compressed = encoding.is_some();
        let text = ServerMessage::Update(UpdateBody {
            target_id: &result.target_id,
            sequence: &result.sequence,
            payload,
            observed_at: result.observed_at,
            encoding,
        })
        .to_text();

        Self {
            target_id: result.target_id.clone(),
            sequence: result.sequence.clone(),
            text: Arc::from(text),
            compressed: is_compressed,
        }
    }
}

fn gzip_base64(bytes: &[u8]) -> Option<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    if let Err(e) = encoder.write_all(bytes) {
        tracing::warn!(error = %e, "payload compression failed; sending uncompressed");
        return None;
    }
    match encoder.finish() {
        Ok(gz) => Some(STANDARD.encode(gz)),
        Err(e) => {
            tracing::warn!(error = %e, "payload compression failed; sending uncompressed");
            None
        }
    }
}

/// Reply to a subscribe request.
#[derive(Debug, Clone, Default)]
pub struct Subscription {
    /// Targets newly added to the interest set.
    pub added: Vec<String>,
    /// Latest known frame of each added target that has one.
    pub snapshot: Vec<Arc<Frame>>,
}

/// Subscriber fanout for published results.
pub struct EventFanout {
    registry: Arc<SubscriberRegistry>,
    latest: RwLock<HashMap<String, Arc<Frame>>>,
    store: Option<Arc<dyn ResultStore>>,
    broker: Option<mpsc::Sender<DrawResult>>,
    compress_threshold: usize,
    metrics: Arc<FanoutMetrics>,
}

impl EventFanout {
    /// Creates a fanout over `registry`.
    pub fn new(registry: Arc<SubscriberRegistry>) -> Self {
        Self {
            registry,
            latest: RwLock::new(HashMap::new()),
            store: None,
            broker: None,
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            metrics: Arc::new(FanoutMetrics::default()),
        }
    }

    /// Falls back to `store` for snapshots the cache does not hold.
    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Forwards every published result to `broker`, in publish order.
    ///
    /// Spawns the forwarding task, so it must be called inside a Tokio
    /// runtime. The task ends when the fanout is dropped.
    pub fn with_broker(mut self, broker: Arc<dyn ResultBroker>) -> Self {
        let (tx, rx) = mpsc::channel(BROKER_QUEUE);
        tokio::spawn(forward_to_broker(broker, rx, Arc::clone(&self.metrics)));
        self.broker = Some(tx);
        self
    }

    /// Overrides the compression threshold.
    pub fn with_compress_threshold(mut self, bytes: usize) -> Self {
        self.compress_threshold = bytes;
        self
    }

    /// Underlying registry.
    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Publishes a result to local subscribers and, when configured, to the
    /// broker. Never blocks on a subscriber.
    pub fn publish(&self, result: &DrawResult) {
        self.publish_local(result);

        if let Some(queue) = &self.broker {
            if let Err(e) = queue.try_send(result.clone()) {
                self.metrics.broker_failures();
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "forwarder stopped",
                };
                tracing::warn!(target_id = %result.target_id, reason, "broker publish skipped");
            }
        }
    }

    /// Publishes to local subscribers only. Used by broker relays.
    pub fn publish_local(&self, result: &DrawResult) {
        let frame = Arc::new(Frame::encode(result, self.compress_threshold));
        self.latest
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(result.target_id.clone(), Arc::clone(&frame));

        let report = self.registry.deliver(&result.target_id, &frame);
        self.metrics.published();
        if frame.compressed {
            self.metrics.compressed();
        }
        self.metrics.delivered(report.delivered as u64);
        for sub in &report.dropped_full {
            self.metrics.dropped_full();
            tracing::warn!(
                subscriber = sub,
                target_id = %result.target_id,
                sequence = %result.sequence,
                "subscriber queue full, update dropped"
            );
        }
        for _ in &report.closed {
            self.metrics.closed_subscribers();
        }
        tracing::debug!(
            target_id = %result.target_id,
            sequence = %result.sequence,
            delivered = report.delivered,
            compressed = frame.compressed,
            "result published"
        );
    }

    /// Registers a subscriber.
    pub fn connect(&self) -> Result<(SubscriberId, mpsc::Receiver<Arc<Frame>>), RegistryError> {
        self.registry.connect()
    }

    /// Adds targets to an interest set and returns their latest frames.
    pub async fn subscribe(
        &self,
        id: SubscriberId,
        targets: &[String],
    ) -> Result<Subscription, RegistryError> {
        let added = self.registry.subscribe(id, targets)?;
        let mut snapshot = Vec::with_capacity(added.len());
        for target in &added {
            if let Some(frame) = self.latest_frame(target).await {
                snapshot.push(frame);
            }
        }
        Ok(Subscription { added, snapshot })
    }

    /// Removes targets from an interest set.
    pub fn unsubscribe(
        &self,
        id: SubscriberId,
        targets: &[String],
    ) -> Result<Vec<String>, RegistryError> {
        self.registry.unsubscribe(id, targets)
    }

    /// Removes a subscriber.
    pub fn disconnect(&self, id: SubscriberId) -> bool {
        self.registry.disconnect(id)
    }

    /// Cached latest frame, loading it from the store on a miss.
    pub async fn latest_frame(&self, target_id: &str) -> Option<Arc<Frame>> {
        if let Some(frame) = self.cached(target_id) {
            return Some(frame);
        }

        let store = self.store.as_ref()?;
        let result = match store.latest(target_id).await {
            Ok(Some(result)) => result,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(target_id, error = %e, "snapshot lookup failed");
                return None;
            }
        };

        let frame = Arc::new(Frame::encode(&result, self.compress_threshold));
        // A live publish may have landed while the store was queried.
        let mut latest = self.latest.write().unwrap_or_else(|e| e.into_inner());
        Some(Arc::clone(
            latest.entry(target_id.to_string()).or_insert(frame),
        ))
    }

    fn cached(&self, target_id: &str) -> Option<Arc<Frame>> {
        self.latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(target_id)
            .cloned()
    }

    /// Drops the cached frame of a target removed from the catalogue.
    pub fn forget(&self, target_id: &str) {
        self.latest
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(target_id);
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> FanoutMetricsSnapshot {
        self.metrics.snapshot()
    }
}

async fn forward_to_broker(
    broker: Arc<dyn ResultBroker>,
    mut queue: mpsc::Receiver<DrawResult>,
    metrics: Arc<FanoutMetrics>,
) {
    while let Some(result) = queue.recv().await {
        if let Err(e) = broker.publish(&result).await {
            metrics.broker_failures();
            tracing::warn!(target_id = %result.target_id, error = %e, "broker publish failed");
        }
    }
    tracing::debug!("broker forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::SubscriberLimits;
    use crate::core::store::MemoryResultStore;
    use crate::core::target::{Target, TargetRegistry, TimingClass};
    use crate::core::ports::ResultStore;
    use flate2::read::GzDecoder;
    use serde_json::json;
    use std::io::Read;

    fn fanout() -> Arc<EventFanout> {
        let targets = Arc::new(TargetRegistry::new(vec![
            Target::new("fast-5", 75, TimingClass::ZeroWait),
            Target::new("sched-1", 86_400, TimingClass::Manual),
        ]));
        let registry = Arc::new(SubscriberRegistry::new(targets, SubscriberLimits::default()));
        Arc::new(EventFanout::new(registry))
    }

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn only_interested_subscribers_receive_updates() {
        let fanout = fanout();
        let (a, mut rx_a) = fanout.connect().unwrap();
        let (b, mut rx_b) = fanout.connect().unwrap();
        fanout.subscribe(a, &ids(&["fast-5"])).await.unwrap();
        fanout.subscribe(b, &ids(&["sched-1"])).await.unwrap();

        fanout.publish(&DrawResult::new("fast-5", "101", json!({"n": [4, 8]})));

        let frame = rx_a.try_recv().unwrap();
        assert_eq!(frame.sequence, "101");
        let value: Value = serde_json::from_str(&frame.text).unwrap();
        assert_eq!(value["type"], "update");
        assert_eq!(value["payload"]["n"][1], 8);
        assert!(rx_b.try_recv().is_err());
        assert_eq!(fanout.metrics().delivered, 1);
    }

    #[tokio::test]
    async fn subscribe_returns_snapshot_of_latest() {
        let fanout = fanout();
        fanout.publish(&DrawResult::new("fast-5", "100", json!(1)));
        fanout.publish(&DrawResult::new("fast-5", "101", json!(2)));

        let (a, _rx) = fanout.connect().unwrap();
        let sub = fanout.subscribe(a, &ids(&["fast-5", "sched-1"])).await.unwrap();
        assert_eq!(sub.added, ids(&["fast-5", "sched-1"]));
        assert_eq!(sub.snapshot.len(), 1);
        assert_eq!(sub.snapshot[0].sequence, "101");
    }

    #[tokio::test]
    async fn snapshot_falls_back_to_store() {
        let store = Arc::new(MemoryResultStore::new());
        store.save(&DrawResult::new("sched-1", "2024-071", json!({"n": 7}))).await;

        let targets = Arc::new(TargetRegistry::new(vec![Target::new("sched-1", 0, TimingClass::Manual)]));
        let registry = Arc::new(SubscriberRegistry::new(targets, SubscriberLimits::default()));
        let fanout = EventFanout::new(registry).with_store(store);

        let (a, _rx) = fanout.connect().unwrap();
        let sub = fanout.subscribe(a, &ids(&["sched-1"])).await.unwrap();
        assert_eq!(sub.snapshot[0].sequence, "2024-071");
    }

    #[test]
    fn large_payloads_are_compressed_once() {
        let payload = json!({"blob": "x".repeat(200)});
        let frame = Frame::encode(&DrawResult::new("fast-5", "9", payload.clone()), 64);
        assert!(frame.compressed);

        let value: Value = serde_json::from_str(&frame.text).unwrap();
        assert_eq!(value["encoding"], GZIP_BASE64);
        let gz = STANDARD.decode(value["payload"].as_str().unwrap()).unwrap();
        let mut text = String::new();
        GzDecoder::new(gz.as_slice()).read_to_string(&mut text).unwrap();
        assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), payload);

        let small = Frame::encode(&DrawResult::new("fast-5", "9", json!(1)), 64);
        assert!(!small.compressed);
    }

    struct SlowFirstBroker {
        seen: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ResultBroker for SlowFirstBroker {
        async fn publish(&self, result: &DrawResult) -> Result<(), crate::error::BrokerError> {
            if result.sequence == "100" {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            self.seen.lock().unwrap().push(result.sequence.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn broker_sees_results_in_publish_order() {
        let broker = Arc::new(SlowFirstBroker {
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let targets = Arc::new(TargetRegistry::new(vec![Target::new("fast-5", 75, TimingClass::ZeroWait)]));
        let registry = Arc::new(SubscriberRegistry::new(targets, SubscriberLimits::default()));
        let fanout = EventFanout::new(registry).with_broker(broker.clone());

        fanout.publish(&DrawResult::new("fast-5", "100", json!(1)));
        fanout.publish(&DrawResult::new("fast-5", "101", json!(2)));
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        assert_eq!(*broker.seen.lock().unwrap(), ids(&["100", "101"]));
        assert_eq!(fanout.metrics().broker_failures, 0);
    }

    #[test]
    fn compressed_publishes_are_counted() {
        let targets = Arc::new(TargetRegistry::new(vec![Target::new("fast-5", 60, TimingClass::ZeroWait)]));
        let fanout = EventFanout::new(Arc::new(SubscriberRegistry::new(
            targets,
            SubscriberLimits::default(),
        )))
        .with_compress_threshold(64);

        fanout.publish_local(&DrawResult::new("fast-5", "1", json!({"blob": "x".repeat(200)})));
        fanout.publish_local(&DrawResult::new("fast-5", "2", json!(2)));

        let metrics = fanout.metrics();
        assert_eq!(metrics.published, 2);
        assert_eq!(metrics.compressed, 1);
    }
}

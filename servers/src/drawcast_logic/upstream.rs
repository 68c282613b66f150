use anyhow::{bail, Context, Result};
use lib_drawcast::configs::{Catalogue, CatalogueWatcher, ConfigSource, FileCatalogue};
use lib_drawcast::connections::{run_relay, RedisBroker, RedisResultStore};
use lib_drawcast::ingestors::HttpJsonFetcher;
use lib_drawcast::{
    EventFanout, MemoryResultStore, PollScheduler, ResultStore, SchedulerHandle, SubscriberRegistry,
    TargetRegistry, TimingClass,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::drawcast_logic::config::{BrokerMode, Config};

/// Everything the downstream side and the shutdown path need.
pub struct Pipeline {
    pub fanout: Arc<EventFanout>,
    pub scheduler: Option<Arc<SchedulerHandle>>,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Loads the catalogue and starts the polling side (or the relay).
///
/// Only an unloadable catalogue and a relay without a Redis URL are fatal;
/// an unreachable store or broker degrades to local operation.
pub async fn start(config: &Config, shutdown: CancellationToken) -> Result<Pipeline> {
    let catalogue_path = config
        .catalogue_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("targets.json5"));
    let source = Arc::new(FileCatalogue::new(&catalogue_path));
    let revision = source.revision().await;
    let catalogue = source
        .load()
        .await
        .with_context(|| format!("Failed to load target catalogue {}", catalogue_path.display()))?;
    let Catalogue {
        targets: initial,
        endpoints,
        rejected,
    } = catalogue;
    tracing::info!(
        loaded = initial.len(),
        rejected = rejected.len(),
        "Target catalogue loaded from {}",
        catalogue_path.display()
    );

    let unrouted: Vec<&str> = initial
        .iter()
        .filter(|t| t.enabled && t.timing != TimingClass::Manual)
        .filter(|t| !endpoints.iter().any(|(id, _)| id == &t.id))
        .map(|t| t.id.as_str())
        .collect();
    if !unrouted.is_empty() {
        tracing::warn!(targets = ?unrouted, "Targets without an endpoint will fail every fetch");
    }

    let targets = Arc::new(TargetRegistry::new(initial));
    let store = open_store(config).await;
    let subscribers = Arc::new(SubscriberRegistry::new(targets.clone(), config.subscriber_limits()));
    let mut fanout = EventFanout::new(subscribers).with_store(store.clone());
    if let Some(threshold) = config.compress_threshold_bytes {
        fanout = fanout.with_compress_threshold(threshold);
    }

    let mode = config.broker_mode();
    if mode == BrokerMode::Publish {
        match config.redis_url.as_deref() {
            Some(url) => {
                let channel = broker_channel(config);
                match RedisBroker::connect(url, &channel).await {
                    Ok(broker) => fanout = fanout.with_broker(Arc::new(broker)),
                    Err(e) => tracing::warn!(error = %e, "Broker unavailable, publishing locally only"),
                }
            }
            None => tracing::warn!("Broker mode 'publish' needs a Redis URL, publishing locally only"),
        }
    }
    let fanout = Arc::new(fanout);

    let reload_interval = Duration::from_secs(config.reload_interval_seconds.unwrap_or(10).max(1));
    let mut watcher = CatalogueWatcher::new(source, reload_interval, targets.clone(), revision);
    let mut tasks = Vec::new();

    let scheduler = if mode == BrokerMode::Relay {
        let Some(url) = config.redis_url.clone() else {
            bail!("Broker mode 'relay' needs a Redis URL");
        };
        tasks.push(tokio::spawn(run_relay(
            url,
            broker_channel(config),
            fanout.clone(),
            shutdown.clone(),
        )));
        None
    } else {
        let scheduler_config = config.scheduler();
        let fetcher = Arc::new(HttpJsonFetcher::new(
            scheduler_config.fetch_timeout,
            config.fetch_retries.unwrap_or(2),
        ));
        for (id, reason) in fetcher.replace_all(&endpoints) {
            tracing::warn!(target_id = %id, reason = %reason, "Endpoint rejected");
        }

        let handle = Arc::new(
            PollScheduler::new(targets, fetcher.clone(), store, fanout.clone())
                .with_config(scheduler_config)
                .spawn(),
        );
        watcher = watcher
            .with_scheduler(handle.clone())
            .with_hook(Box::new(move |catalogue: &Catalogue| {
                fetcher.replace_all(&catalogue.endpoints);
            }));
        Some(handle)
    };

    tasks.push(tokio::spawn(watcher.run(shutdown)));

    Ok(Pipeline {
        fanout,
        scheduler,
        tasks,
    })
}

fn broker_channel(config: &Config) -> String {
    config
        .broker_channel
        .clone()
        .unwrap_or_else(|| lib_drawcast::connections::redis_broker::DEFAULT_CHANNEL.to_string())
}

async fn open_store(config: &Config) -> Arc<dyn ResultStore> {
    let Some(url) = config.redis_url.as_deref() else {
        return Arc::new(MemoryResultStore::new());
    };
    let prefix = config
        .redis_prefix
        .clone()
        .unwrap_or_else(|| lib_drawcast::connections::cache_redis::DEFAULT_KEY_PREFIX.to_string());
    match RedisResultStore::connect(url, &prefix).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(error = %e, "Redis store unavailable, keeping results in memory");
            Arc::new(MemoryResultStore::new())
        }
    }
}

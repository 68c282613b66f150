use clap::{Parser, ValueEnum};
use lib_drawcast::{SchedulerConfig, SubscriberLimits, DEFAULT_COMPRESS_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How this instance takes part in the external broker path.
#[derive(ValueEnum, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerMode {
    /// Poll and publish locally only.
    Off,
    /// Poll, publish locally and forward every result to the broker channel.
    Publish,
    /// Do not poll; fan out whatever arrives on the broker channel.
    Relay,
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Adaptive polling gateway for draw result feeds", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "DRAWCAST_PORT", help = "Port to listen on for subscribers and admin requests.")]
    pub port: Option<u16>,

    #[clap(long, env = "DRAWCAST_CONFIG_PATH", help = "Path to the JSON server configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "DRAWCAST_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "DRAWCAST_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "DRAWCAST_LOG_JSON", help = "Write the log file as JSON lines.")]
    pub log_json: Option<bool>,

    #[clap(long, env = "DRAWCAST_LOG_KEEP", help = "Number of log files kept at startup.")]
    pub log_keep: Option<usize>,

    #[clap(long, env = "DRAWCAST_CATALOGUE_PATH", help = "Path to the JSON5 target catalogue.")]
    pub catalogue_path: Option<PathBuf>,

    #[clap(long, env = "DRAWCAST_RELOAD_INTERVAL_SECONDS", help = "Seconds between catalogue change checks.")]
    pub reload_interval_seconds: Option<u64>,

    #[clap(long, env = "DRAWCAST_MAX_CONCURRENT_FETCHES", help = "Global cap on in-flight origin fetches.")]
    pub max_concurrent_fetches: Option<usize>,

    #[clap(long, env = "DRAWCAST_FETCH_TIMEOUT_MS", help = "Hard timeout of one origin fetch in milliseconds.")]
    pub fetch_timeout_ms: Option<u64>,

    #[clap(long, env = "DRAWCAST_FETCH_RETRIES", help = "Transient HTTP retries inside one fetch.")]
    pub fetch_retries: Option<u32>,

    #[clap(long, env = "DRAWCAST_STORE_TIMEOUT_MS", help = "Upper bound of one result store write in milliseconds.")]
    pub store_timeout_ms: Option<u64>,

    #[clap(long, env = "DRAWCAST_COMPRESS_THRESHOLD_BYTES", help = "Payload size above which updates are gzip+base64 encoded.")]
    pub compress_threshold_bytes: Option<usize>,

    #[clap(long, env = "DRAWCAST_MAX_SUBSCRIBERS", help = "Maximum number of connected subscribers.")]
    pub max_subscribers: Option<usize>,

    #[clap(long, env = "DRAWCAST_MAX_TARGETS_PER_SUBSCRIBER", help = "Maximum interest set size per subscriber.")]
    pub max_targets_per_subscriber: Option<usize>,

    #[clap(long, env = "DRAWCAST_QUEUE_CAPACITY", help = "Outbound queue length per subscriber.")]
    pub queue_capacity: Option<usize>,

    #[clap(long, env = "DRAWCAST_PING_INTERVAL_SECONDS", help = "Seconds between server liveness pings.")]
    pub ping_interval_seconds: Option<u64>,

    #[clap(long, env = "DRAWCAST_LIVENESS_TIMEOUT_SECONDS", help = "Seconds of subscriber silence before the connection is closed.")]
    pub liveness_timeout_seconds: Option<u64>,

    #[clap(long, env = "DRAWCAST_REDIS_URL", help = "Redis URL for the result store and broker.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "DRAWCAST_REDIS_PREFIX", help = "Key prefix of the Redis result store.")]
    pub redis_prefix: Option<String>,

    #[clap(long, value_enum, env = "DRAWCAST_BROKER_MODE", help = "Broker participation (off, publish, relay).")]
    pub broker_mode: Option<BrokerMode>,

    #[clap(long, env = "DRAWCAST_BROKER_CHANNEL", help = "Redis channel of the broker path.")]
    pub broker_channel: Option<String>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            log_json: other.log_json.or(self.log_json),
            log_keep: other.log_keep.or(self.log_keep),
            catalogue_path: other.catalogue_path.or(self.catalogue_path),
            reload_interval_seconds: other.reload_interval_seconds.or(self.reload_interval_seconds),
            max_concurrent_fetches: other.max_concurrent_fetches.or(self.max_concurrent_fetches),
            fetch_timeout_ms: other.fetch_timeout_ms.or(self.fetch_timeout_ms),
            fetch_retries: other.fetch_retries.or(self.fetch_retries),
            store_timeout_ms: other.store_timeout_ms.or(self.store_timeout_ms),
            compress_threshold_bytes: other.compress_threshold_bytes.or(self.compress_threshold_bytes),
            max_subscribers: other.max_subscribers.or(self.max_subscribers),
            max_targets_per_subscriber: other.max_targets_per_subscriber.or(self.max_targets_per_subscriber),
            queue_capacity: other.queue_capacity.or(self.queue_capacity),
            ping_interval_seconds: other.ping_interval_seconds.or(self.ping_interval_seconds),
            liveness_timeout_seconds: other.liveness_timeout_seconds.or(self.liveness_timeout_seconds),
            redis_url: other.redis_url.or(self.redis_url),
            redis_prefix: other.redis_prefix.or(self.redis_prefix),
            broker_mode: other.broker_mode.or(self.broker_mode),
            broker_channel: other.broker_channel.or(self.broker_channel),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    pub fn defaults() -> Config {
        let scheduler = SchedulerConfig::default();
        let limits = SubscriberLimits::default();
        Config {
            port: Some(9010),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            log_json: Some(true),
            log_keep: Some(7),
            catalogue_path: Some(PathBuf::from("targets.json5")),
            reload_interval_seconds: Some(10),
            max_concurrent_fetches: Some(scheduler.max_concurrent_fetches),
            fetch_timeout_ms: Some(scheduler.fetch_timeout.as_millis() as u64),
            fetch_retries: Some(2),
            store_timeout_ms: Some(scheduler.store_timeout.as_millis() as u64),
            compress_threshold_bytes: Some(DEFAULT_COMPRESS_THRESHOLD),
            max_subscribers: Some(limits.max_subscribers),
            max_targets_per_subscriber: Some(limits.max_targets_per_subscriber),
            queue_capacity: Some(limits.queue_capacity),
            ping_interval_seconds: Some(20),
            liveness_timeout_seconds: Some(60),
            redis_prefix: Some(lib_drawcast::connections::cache_redis::DEFAULT_KEY_PREFIX.to_string()),
            broker_mode: Some(BrokerMode::Off),
            broker_channel: Some(lib_drawcast::connections::redis_broker::DEFAULT_CHANNEL.to_string()),
            ..Default::default()
        }
    }

    /// Layers a JSON config file over `self`. Unreadable or malformed files
    /// are reported and skipped.
    pub fn merge_file(self, path: &Path) -> Config {
        if !path.exists() {
            tracing::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
            return self;
        }
        match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<Config>(&text) {
                Ok(file_config) => self.merge(file_config),
                Err(e) => {
                    tracing::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                    self
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
                self
            }
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        let base = SchedulerConfig::default();
        SchedulerConfig {
            max_concurrent_fetches: self.max_concurrent_fetches.unwrap_or(base.max_concurrent_fetches).max(1),
            fetch_timeout: self.fetch_timeout_ms.map(Duration::from_millis).unwrap_or(base.fetch_timeout),
            store_timeout: self.store_timeout_ms.map(Duration::from_millis).unwrap_or(base.store_timeout),
        }
    }

    pub fn subscriber_limits(&self) -> SubscriberLimits {
        let base = SubscriberLimits::default();
        SubscriberLimits {
            max_subscribers: self.max_subscribers.unwrap_or(base.max_subscribers),
            max_targets_per_subscriber: self.max_targets_per_subscriber.unwrap_or(base.max_targets_per_subscriber),
            queue_capacity: self.queue_capacity.unwrap_or(base.queue_capacity),
        }
    }

    pub fn broker_mode(&self) -> BrokerMode {
        self.broker_mode.unwrap_or(BrokerMode::Off)
    }
}

pub fn load_config() -> Config {
    // 1. Defaults
    let mut current_config = Config::defaults();

    // 2. Config file, path overridable from CLI/env
    let cli_args = Config::parse();
    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_drawcast.conf"));
    current_config = current_config.merge_file(&config_file_path);

    // 3. Environment variables and CLI arguments win
    current_config.merge(cli_args)
}

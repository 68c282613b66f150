//! # Redis Broker Path
//!
//! Lets several gateway instances share one canonical publish. A polling
//! instance forwards every detected result to a Redis channel
//! ([`RedisBroker`]); relay instances run no scheduler and feed whatever
//! arrives on the channel into their local fanout ([`run_relay`]).

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::dispatcher::EventFanout;
use crate::core::model::DrawResult;
use crate::core::ports::ResultBroker;
use crate::error::BrokerError;

/// Default channel name.
pub const DEFAULT_CHANNEL: &str = "drawcast:results";

const RELAY_BACKOFF_START: Duration = Duration::from_secs(1);
const RELAY_BACKOFF_MAX: Duration = Duration::from_secs(60);

fn transport(e: redis::RedisError) -> BrokerError {
    BrokerError::Transport(e.to_string())
}

/// Publishes results as JSON on a Redis channel.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    channel: String,
}

impl RedisBroker {
    /// Connects to `url` and publishes on `channel`.
    pub async fn connect(url: &str, channel: &str) -> Result<Self, BrokerError> {
        let client = Client::open(url).map_err(transport)?;
        let conn = ConnectionManager::new(client).await.map_err(transport)?;
        tracing::info!(channel, "redis broker connected");
        Ok(Self {
            conn,
            channel: channel.to_string(),
        })
    }
}

#[async_trait]
impl ResultBroker for RedisBroker {
    async fn publish(&self, result: &DrawResult) -> Result<(), BrokerError> {
        let body = serde_json::to_string(result)?;
        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(body)
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        tracing::trace!(
            target_id = %result.target_id,
            sequence = %result.sequence,
            receivers,
            "result forwarded to broker"
        );
        Ok(())
    }
}

/// Decodes one channel message.
pub fn decode_message(payload: &str) -> Result<DrawResult, BrokerError> {
    Ok(serde_json::from_str(payload)?)
}

/// Feeds results received on `channel` into `fanout` until `shutdown` fires.
/// Lost connections are re-established with exponential backoff.
pub async fn run_relay(
    url: String,
    channel: String,
    fanout: Arc<EventFanout>,
    shutdown: CancellationToken,
) {
    let mut backoff = RELAY_BACKOFF_START;
    loop {
        match relay_once(&url, &channel, &fanout, &shutdown).await {
            Ok(()) => break,
            Err(e) => {
                tracing::warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "broker relay lost");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(RELAY_BACKOFF_MAX);
            }
        }
    }
    tracing::info!("broker relay stopped");
}

async fn relay_once(
    url: &str,
    channel: &str,
    fanout: &EventFanout,
    shutdown: &CancellationToken,
) -> Result<(), BrokerError> {
    let client = Client::open(url).map_err(transport)?;
    let mut pubsub = client.get_async_pubsub().await.map_err(transport)?;
    pubsub.subscribe(channel).await.map_err(transport)?;
    tracing::info!(channel, "broker relay subscribed");

    let mut messages = pubsub.on_message();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            msg = messages.next() => {
                let Some(msg) = msg else {
                    return Err(BrokerError::Transport("pub/sub stream ended".to_string()));
                };
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "unreadable broker message");
                        continue;
                    }
                };
                match decode_message(&payload) {
                    Ok(result) => fanout.publish_local(&result),
                    Err(e) => tracing::warn!(error = %e, "undecodable broker message"),
                }
            }
        }
    }
}

//! # Redis Result Store
//!
//! Idempotent persistence on Redis. Every result is written once under
//! `{prefix}:result:{target}:{sequence}` with `SET NX`; the newest result of
//! each target is mirrored under `{prefix}:latest:{target}` for snapshots.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;

use crate::core::model::DrawResult;
use crate::core::ports::{ResultStore, SaveOutcome};
use crate::error::PersistenceError;

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "drawcast";

/// A [`ResultStore`] backed by a multiplexed, auto-reconnecting Redis
/// connection.
#[derive(Clone)]
pub struct RedisResultStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisResultStore {
    /// Opens the connection manager.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    /// * `prefix` - Namespace for every key.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, PersistenceError> {
        let client = Client::open(url).map_err(|e| PersistenceError(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| PersistenceError(e.to_string()))?;
        tracing::info!(url, prefix, "redis result store connected");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    /// Key of one stored result.
    pub fn result_key(&self, target_id: &str, sequence: &str) -> String {
        format!("{}:result:{}:{}", self.prefix, target_id, sequence)
    }

    /// Key of a target's latest result.
    pub fn latest_key(&self, target_id: &str) -> String {
        format!("{}:latest:{}", self.prefix, target_id)
    }
}

#[async_trait]
impl ResultStore for RedisResultStore {
    async fn save(&self, result: &DrawResult) -> SaveOutcome {
        let body = match serde_json::to_string(result) {
            Ok(body) => body,
            Err(e) => return SaveOutcome::Failed(PersistenceError(e.to_string())),
        };

        let mut conn = self.conn.clone();
        let inserted: Option<String> = match redis::cmd("SET")
            .arg(self.result_key(&result.target_id, &result.sequence))
            .arg(&body)
            .arg("NX")
            .query_async(&mut conn)
            .await
        {
            Ok(reply) => reply,
            Err(e) => return SaveOutcome::Failed(PersistenceError(e.to_string())),
        };
        if inserted.is_none() {
            return SaveOutcome::Duplicate;
        }

        let latest: redis::RedisResult<()> = redis::cmd("SET")
            .arg(self.latest_key(&result.target_id))
            .arg(&body)
            .query_async(&mut conn)
            .await;
        match latest {
            Ok(()) => SaveOutcome::Inserted,
            Err(e) => SaveOutcome::Failed(PersistenceError(e.to_string())),
        }
    }

    async fn latest(&self, target_id: &str) -> Result<Option<DrawResult>, PersistenceError> {
        let mut conn = self.conn.clone();
        let body: Option<String> = redis::cmd("GET")
            .arg(self.latest_key(target_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| PersistenceError(e.to_string()))?;
        body.map(|b| serde_json::from_str(&b).map_err(|e| PersistenceError(e.to_string())))
            .transpose()
    }
}

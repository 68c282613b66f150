//! # HTTP/JSON Fetch Capability
//!
//! A generic [`FetchCapability`] for origins that expose their latest result
//! as a JSON document. Each target is described by an [`HttpEndpoint`]: a URL
//! plus JSON pointers locating the sequence, the payload and the optional
//! timing hints inside the response.
//!
//! When the document carries no server time, the HTTP `Date` header is used
//! instead so the drift calibrator still gets a clock reading.

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::Duration;

use crate::core::model::{DrawResult, Observation};
use crate::core::ports::FetchCapability;
use crate::error::FetchError;
use crate::retrieve::OriginClient;

/// Unit of numeric timestamps in the origin's documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// Epoch milliseconds.
    #[default]
    Millis,
    /// Epoch seconds.
    Seconds,
}

fn default_sequence_pointer() -> String {
    "/sequence".to_string()
}

/// Where and how to fetch one target.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpEndpoint {
    /// Absolute URL returning the latest result.
    pub url: String,
    /// JSON pointer to the sequence (string or number).
    #[serde(default = "default_sequence_pointer")]
    pub sequence_pointer: String,
    /// JSON pointer to the payload. The whole document when absent.
    #[serde(default)]
    pub payload_pointer: Option<String>,
    /// JSON pointer to the origin's observation time of the result.
    #[serde(default)]
    pub observed_at_pointer: Option<String>,
    /// JSON pointer to the origin's current time.
    #[serde(default)]
    pub server_time_pointer: Option<String>,
    /// JSON pointer to the absolute epoch of the next draw.
    #[serde(default)]
    pub next_draw_pointer: Option<String>,
    /// Unit of numeric timestamps.
    #[serde(default)]
    pub time_unit: TimeUnit,
    /// Extra request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

struct Route {
    endpoint: HttpEndpoint,
    client: OriginClient,
}

/// Fetches targets over HTTP and maps their JSON with pointers.
pub struct HttpJsonFetcher {
    routes: RwLock<HashMap<String, Route>>,
    timeout: Duration,
    max_retries: u32,
}

impl HttpJsonFetcher {
    /// Creates a fetcher with no routes. `timeout` bounds each attempt;
    /// `max_retries` is the number of transient retries.
    pub fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            timeout,
            max_retries,
        }
    }

    /// Adds or replaces the endpoint of a target.
    pub fn register(&self, target_id: &str, endpoint: HttpEndpoint) -> anyhow::Result<()> {
        let mut headers = HeaderMap::new();
        for (name, value) in &endpoint.headers {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(value)?,
            );
        }
        let client = OriginClient::new(&endpoint.url, headers, self.timeout, self.max_retries)?;
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                target_id.to_string(),
                Route { endpoint, client },
            );
        Ok(())
    }

    /// Replaces every route. Targets whose endpoint fails to build are
    /// skipped and reported.
    pub fn replace_all(&self, endpoints: &[(String, HttpEndpoint)]) -> Vec<(String, String)> {
        let mut failed = Vec::new();
        let keep: Vec<&str> = endpoints.iter().map(|(id, _)| id.as_str()).collect();
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|id, _| keep.contains(&id.as_str()));
        for (id, endpoint) in endpoints {
            if let Err(e) = self.register(id, endpoint.clone()) {
                tracing::warn!(target_id = %id, error = %e, "endpoint rejected");
                failed.push((id.clone(), e.to_string()));
            }
        }
        failed
    }

    /// Targets with a route.
    pub fn routed(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn route(&self, target_id: &str) -> Option<(HttpEndpoint, OriginClient)> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(target_id)
            .map(|r| (r.endpoint.clone(), r.client.clone()))
    }
}

#[async_trait]
impl FetchCapability for HttpJsonFetcher {
    async fn fetch(&self, target_id: &str) -> Result<Observation, FetchError> {
        let (endpoint, client) = self
            .route(target_id)
            .ok_or_else(|| FetchError::Failed(format!("no endpoint configured for '{}'", target_id)))?;

        let reply = client
            .get_json::<Value>()
            .await
            .map_err(|e| FetchError::Failed(e.to_string()))?;

        if !reply.is_success() {
            return Err(FetchError::Failed(format!(
                "origin returned HTTP {}: {}",
                reply.status.as_u16(),
                reply.error_text.as_deref().unwrap_or_default()
            )));
        }
        let received = reply.received_at;
        let origin_now = reply.origin_now_ms();

        let mut observation = map_document(target_id, &endpoint, reply.body.unwrap_or(Value::Null))?;
        match observation.server_time_ms.as_mut() {
            // Age the document's clock reading to the moment it is handed back.
            Some(server_time) => *server_time += received.elapsed().as_millis() as i64,
            None => observation.server_time_ms = origin_now,
        }
        Ok(observation)
    }
}

/// Maps one JSON document to an observation.
pub fn map_document(
    target_id: &str,
    endpoint: &HttpEndpoint,
    body: Value,
) -> Result<Observation, FetchError> {
    let sequence = match body.pointer(&endpoint.sequence_pointer) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            return Err(FetchError::Failed(format!(
                "no sequence at '{}'",
                endpoint.sequence_pointer
            )))
        }
    };

    let timestamp = |pointer: &Option<String>| {
        pointer
            .as_deref()
            .and_then(|p| body.pointer(p))
            .and_then(|v| epoch_ms(v, endpoint.time_unit))
    };
    let observed_at = timestamp(&endpoint.observed_at_pointer);
    let server_time_ms = timestamp(&endpoint.server_time_pointer);
    let next_draw_at_ms = timestamp(&endpoint.next_draw_pointer);

    let payload = match endpoint.payload_pointer.as_deref() {
        Some(p) => body.pointer(p).cloned().unwrap_or(Value::Null),
        None => body.clone(),
    };

    let mut result = DrawResult::new(target_id, sequence, payload);
    result.observed_at = observed_at;
    Ok(Observation {
        result,
        server_time_ms,
        next_draw_at_ms,
    })
}

fn epoch_ms(value: &Value, unit: TimeUnit) -> Option<i64> {
    match value {
        Value::Number(n) => {
            let raw = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Some(match unit {
                TimeUnit::Millis => raw,
                TimeUnit::Seconds => raw * 1_000,
            })
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| d.timestamp_millis()),
        _ => None,
    }
}

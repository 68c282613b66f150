//! # Data Model and Wire Protocol
//!
//! The immutable [`DrawResult`] that flows from the scheduler to the fanout,
//! the [`Observation`] a fetch capability returns, and the JSON messages of the
//! subscriber push protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One published result. Identity is `(target_id, sequence)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawResult {
    /// Target this result belongs to.
    pub target_id: String,
    /// Opaque identifier, only compared for equality.
    pub sequence: String,
    /// Parsed origin payload.
    pub payload: Value,
    /// Origin-reported observation time (epoch ms), when the origin supplies one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<i64>,
}

impl DrawResult {
    /// Convenience constructor.
    pub fn new(target_id: impl Into<String>, sequence: impl Into<String>, payload: Value) -> Self {
        Self {
            target_id: target_id.into(),
            sequence: sequence.into(),
            payload,
            observed_at: None,
        }
    }

    /// Sets the origin observation time.
    pub fn observed_at(mut self, epoch_ms: i64) -> Self {
        self.observed_at = Some(epoch_ms);
        self
    }
}

/// What a fetch capability hands back: the latest result plus the timing
/// hints the origin attached to the response.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Latest result known to the origin.
    pub result: DrawResult,
    /// Origin clock at response time (epoch ms), used for drift calibration.
    pub server_time_ms: Option<i64>,
    /// Absolute epoch (ms) of the next draw, when the origin reports one.
    pub next_draw_at_ms: Option<i64>,
}

impl Observation {
    /// Wraps a result without timing hints.
    pub fn of(result: DrawResult) -> Self {
        Self {
            result,
            server_time_ms: None,
            next_draw_at_ms: None,
        }
    }
}

/// Messages a subscriber may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Add targets to the interest set.
    Subscribe(Vec<String>),
    /// Remove targets from the interest set.
    Unsubscribe(Vec<String>),
    /// Liveness probe.
    Ping,
}

/// Why an inbound frame could not be understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    /// Machine-readable code (`bad_json`, `missing_type`, `unknown_type`, `bad_targets`).
    pub code: &'static str,
    /// Detail for humans.
    pub message: String,
}

#[derive(Deserialize)]
struct TargetsBody {
    targets: Vec<String>,
}

impl ClientMessage {
    /// Parses one text frame. Unknown types are reported, never dropped.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|e| ProtocolError {
            code: "bad_json",
            message: e.to_string(),
        })?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError {
                code: "missing_type",
                message: "message has no string 'type' field".to_string(),
            })?;

        let targets = |value: Value| {
            serde_json::from_value::<TargetsBody>(value)
                .map(|body| body.targets)
                .map_err(|e| ProtocolError {
                    code: "bad_targets",
                    message: e.to_string(),
                })
        };

        match kind {
            "subscribe" => Ok(ClientMessage::Subscribe(targets(value)?)),
            "unsubscribe" => Ok(ClientMessage::Unsubscribe(targets(value)?)),
            "ping" => Ok(ClientMessage::Ping),
            other => Err(ProtocolError {
                code: "unknown_type",
                message: format!("unknown message type '{}'", other),
            }),
        }
    }
}

/// Body of an `update` push.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBody<'a> {
    /// Target the result belongs to.
    pub target_id: &'a str,
    /// Result sequence.
    pub sequence: &'a str,
    /// Either the JSON payload or, when compressed, its base64 text.
    pub payload: Value,
    /// Origin observation time; `null` when the origin gave none.
    pub observed_at: Option<i64>,
    /// Set to `gzip+base64` for compressed payloads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<&'static str>,
}

/// Messages the server sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage<'a> {
    /// Acknowledges a subscribe.
    Subscribed {
        /// Targets now in the interest set.
        targets: Vec<String>,
    },
    /// Acknowledges an unsubscribe.
    Unsubscribed {
        /// Targets removed from the interest set.
        targets: Vec<String>,
    },
    /// Reply to `ping`.
    Pong,
    /// A new (or snapshot) result.
    Update(UpdateBody<'a>),
    /// Explicit rejection of a client message.
    Error {
        /// Machine-readable code.
        code: &'a str,
        /// Detail for humans.
        message: String,
    },
}

impl ServerMessage<'_> {
    /// Serializes to the text frame sent on the wire.
    pub fn to_text(&self) -> String {
        // Every variant is plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"type\":\"error\"}"))
    }
}

//! Read-only status surface and the manual trigger.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use lib_drawcast::{FanoutMetricsSnapshot, SchedulerError, SchedulerMetrics, TargetStatus, TriggerAck};
use serde::Serialize;
use serde_json::json;

use crate::drawcast_logic::config::BrokerMode;
use crate::drawcast_logic::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub mode: BrokerMode,
    pub subscribers: usize,
    pub targets: Vec<TargetStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerMetrics>,
    pub fanout: FanoutMetricsSnapshot,
}

pub fn status_report(state: &AppState) -> StatusReport {
    StatusReport {
        mode: state.mode,
        subscribers: state.fanout.registry().subscriber_count(),
        targets: state.scheduler.as_ref().map(|s| s.status()).unwrap_or_default(),
        scheduler: state.scheduler.as_ref().map(|s| s.metrics()),
        fanout: state.fanout.metrics(),
    }
}

pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

pub async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(status_report(&state))
}

pub async fn trigger_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Some(scheduler) = state.scheduler.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "this instance runs no scheduler"})),
        );
    };

    let outcome = scheduler.trigger_now(&id).await;
    tracing::info!(target_id = %id, outcome = ?outcome, "Manual trigger");
    trigger_response(outcome)
}

fn trigger_response(
    outcome: Result<TriggerAck, SchedulerError>,
) -> (StatusCode, Json<serde_json::Value>) {
    match outcome {
        Ok(ack) => (StatusCode::ACCEPTED, Json(json!({ "result": ack }))),
        Err(e) => {
            let status = match e {
                SchedulerError::UnknownTarget(_) => StatusCode::NOT_FOUND,
                SchedulerError::Disabled(_) => StatusCode::CONFLICT,
                SchedulerError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, Json(json!({ "error": e.to_string() })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_drawcast::{EventFanout, SubscriberLimits, SubscriberRegistry, TargetRegistry};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn trigger_errors_map_to_http_statuses() {
        assert_eq!(trigger_response(Ok(TriggerAck::Coalesced)).0, StatusCode::ACCEPTED);
        assert_eq!(
            trigger_response(Err(SchedulerError::UnknownTarget("x".into()))).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            trigger_response(Err(SchedulerError::Disabled("x".into()))).0,
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn relay_status_has_no_scheduler_section() {
        let targets = Arc::new(TargetRegistry::default());
        let fanout = Arc::new(EventFanout::new(Arc::new(SubscriberRegistry::new(
            targets,
            SubscriberLimits::default(),
        ))));
        let state = AppState::new(
            fanout,
            None,
            BrokerMode::Relay,
            Duration::from_secs(20),
            Duration::from_secs(60),
        );
        let value = serde_json::to_value(status_report(&state)).unwrap();
        assert_eq!(value["mode"], "relay");
        assert_eq!(value["subscribers"], 0);
        assert!(value.get("scheduler").is_none());
    }
}

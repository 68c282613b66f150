use lib_drawcast::{EventFanout, SchedulerHandle};
use std::sync::Arc;
use std::time::Duration;

use crate::drawcast_logic::config::BrokerMode;

/// Shared by every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub fanout: Arc<EventFanout>,
    // None on relay instances
    pub scheduler: Option<Arc<SchedulerHandle>>,
    pub mode: BrokerMode,
    pub ping_interval: Duration,
    pub liveness_timeout: Duration,
}

impl AppState {
    pub fn new(
        fanout: Arc<EventFanout>,
        scheduler: Option<Arc<SchedulerHandle>>,
        mode: BrokerMode,
        ping_interval: Duration,
        liveness_timeout: Duration,
    ) -> Self {
        Self {
            fanout,
            scheduler,
            mode,
            ping_interval,
            liveness_timeout,
        }
    }
}

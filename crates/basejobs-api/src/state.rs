//! Application state.

use std::sync::Arc;

use basejobs_queue::SharedQueue;

use crate::config::ApiConfig;
use crate::gateway::LiveGateway;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub queue: SharedQueue,
    pub gateway: Arc<LiveGateway>,
}

impl AppState {
    pub fn new(config: ApiConfig, queue: SharedQueue) -> Self {
        let gateway = Arc::new(LiveGateway::new());
        Self {
            config,
            queue,
            gateway,
        }
    }
}

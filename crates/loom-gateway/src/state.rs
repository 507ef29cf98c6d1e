//! Shared, immutable per-process state handed to every handler.

use loom_core::{Broadcaster, LlmProvider, LoomConfig, Persistence};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<LoomConfig>,
    pub provider: Arc<dyn LlmProvider>,
    pub rpc: Arc<dyn Persistence>,
    pub broadcaster: Arc<dyn Broadcaster>,
}

impl AppState {
    pub fn new(
        config: LoomConfig,
        provider: Arc<dyn LlmProvider>,
        rpc: Arc<dyn Persistence>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            provider,
            rpc,
            broadcaster,
        }
    }
}

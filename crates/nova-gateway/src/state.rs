use std::sync::Arc;
use std::time::Instant;

use nova_agents::TurnPipeline;
use nova_config::AppConfig;

/// State shared by every handler.
pub struct AppState {
    pub config: AppConfig,
    pub pipeline: Arc<TurnPipeline>,
    pub started_at: Instant,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: AppConfig, pipeline: Arc<TurnPipeline>) -> Self {
        Self {
            config,
            pipeline,
            started_at: Instant::now(),
        }
    }

    /// State with an empty pipeline built from `config`. Handy for tests.
    pub fn from_config(config: AppConfig) -> Self {
        let pipeline = Arc::new(TurnPipeline::new(&config));
        Self::new(config, pipeline)
    }
}

pub mod loader;
pub mod model;

pub use loader::ConfigLoader;
pub use model::{
    AgentConfig, AppConfig, DedupeConfig, FastPathConfig, GatewayConfig, IdempotencyConfig,
    LlmProviderConfig, PromptBudgetConfig, RefineConfig, SecurityConfig, StorageConfig,
    ToolLoopConfig,
};

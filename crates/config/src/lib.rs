pub mod loader;
pub mod model;

pub use loader::ConfigLoader;
pub use model::{
    AgentConfig, AppConfig, CapacityConfig, DatabaseConfig, ExecutorConfig, ObservabilityConfig,
    SchedulerConfig, SessionPoolConfig, WebhookConfig,
};

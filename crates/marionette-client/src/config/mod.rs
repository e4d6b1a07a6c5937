pub mod agent_config;
pub mod engine_config;
pub mod marionette_config;
pub mod paths;
pub mod walk_config;

pub use agent_config::AgentConfig;
pub use engine_config::EngineConfig;
pub use marionette_config::{ConfigLoadError, LoggingConfig, MarionetteConfig};
pub use paths::ProjectPaths;
pub use walk_config::WalkConfig;

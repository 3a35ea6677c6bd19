//! Configuration module.
//!
//! Provides `AppConfig` (top-level settings), one sub-config per runtime
//! service, `AppPaths` for cross-platform locations, and TOML persistence
//! via `AppConfig::load` / `AppConfig::save`.

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{
    AppConfig, BackendConfig, CacheConfig, ClassConfig, PipelineConfig, PoolConfig, QueueConfig,
};

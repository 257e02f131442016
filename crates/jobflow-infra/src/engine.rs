//! Engine wiring: configuration in, ready `JobEngine` out.

use std::path::Path;
use std::sync::Arc;

use jobflow_core::job::dispatch::HandlerRegistry;
use jobflow_core::job::engine::JobEngine;
use jobflow_core::job::executor::JobExecutor;
use jobflow_core::job::registry::JobRegistry;

use crate::config::{EngineConfig, load_engine_config};
use crate::store::FileRunStore;

/// A configured engine plus the pieces callers manage directly.
pub struct EngineHandle {
    pub config: EngineConfig,
    /// Shared with the engine; invalidate it after editing definition files.
    pub registry: Arc<JobRegistry>,
    pub engine: JobEngine<FileRunStore>,
}

impl EngineHandle {
    /// Load `{data_dir}/jobflow.toml` and wire an engine over it.
    pub async fn open(data_dir: &Path, handlers: HandlerRegistry) -> Self {
        let config = load_engine_config(data_dir).await;
        let registry = open_registry(&config, data_dir);
        let engine = build_engine(&config, data_dir, registry.clone(), handlers);
        Self {
            config,
            registry,
            engine,
        }
    }
}

/// Job registry over the configured definitions directory.
pub fn open_registry(config: &EngineConfig, data_dir: &Path) -> Arc<JobRegistry> {
    Arc::new(JobRegistry::new(config.definitions_root(data_dir)))
}

/// Engine over a file run store at the configured store root.
pub fn build_engine(
    config: &EngineConfig,
    data_dir: &Path,
    registry: Arc<JobRegistry>,
    handlers: HandlerRegistry,
) -> JobEngine<FileRunStore> {
    let store_root = config.store_root(data_dir);
    let executor_config = config.executor_config();
    tracing::info!(
        definitions_root = %registry.root().display(),
        store_root = %store_root.display(),
        max_attempts = executor_config.max_attempts,
        enforce_timeouts = executor_config.enforce_timeouts,
        backends = ?handlers.backends(),
        "building job engine"
    );
    let executor =
        JobExecutor::new(FileRunStore::new(store_root), handlers).with_config(executor_config);
    JobEngine::new(registry, executor)
}

/// Install the global tracing subscriber from the `[logging]` section.
pub fn init_logging(config: &EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    jobflow_observe::init_tracing(&config.logging)
}

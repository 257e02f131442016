//! Engine configuration loader.
//!
//! Reads `jobflow.toml` from the data directory (`~/.jobflow/` by default) and
//! deserializes it into [`EngineConfig`]. Falls back to defaults when the file
//! is missing or malformed.
//!
//! ```toml
//! definitions_root = "jobs"
//! store_root = "/var/lib/jobflow/store"
//!
//! [executor]
//! max_attempts = 3
//! enforce_timeouts = true
//!
//! [logging]
//! filter = "info,jobflow_core=debug"
//! format = "json"
//! otel = false
//! ```

use std::path::{Path, PathBuf};

use jobflow_core::job::executor::{DEFAULT_MAX_ATTEMPTS, ExecutorConfig};
use jobflow_observe::LoggingConfig;
use serde::Deserialize;

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE: &str = "jobflow.toml";

/// Environment variable overriding the data directory.
pub const HOME_ENV: &str = "JOBFLOW_HOME";

/// The `[executor]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub max_attempts: u32,
    pub enforce_timeouts: bool,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            enforce_timeouts: true,
        }
    }
}

impl From<&ExecutorSection> for ExecutorConfig {
    fn from(section: &ExecutorSection) -> Self {
        ExecutorConfig {
            max_attempts: section.max_attempts,
            enforce_timeouts: section.enforce_timeouts,
        }
    }
}

/// Contents of `jobflow.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory of job definition files. Defaults to `{data_dir}/jobs`.
    pub definitions_root: Option<PathBuf>,
    /// Root of the file run store. Defaults to `{data_dir}/store`.
    pub store_root: Option<PathBuf>,
    pub executor: ExecutorSection,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Definitions directory; relative paths are taken from `data_dir`.
    pub fn definitions_root(&self, data_dir: &Path) -> PathBuf {
        resolve_dir(data_dir, self.definitions_root.as_deref(), "jobs")
    }

    /// Run store root; relative paths are taken from `data_dir`.
    pub fn store_root(&self, data_dir: &Path) -> PathBuf {
        resolve_dir(data_dir, self.store_root.as_deref(), "store")
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::from(&self.executor)
    }
}

fn resolve_dir(data_dir: &Path, configured: Option<&Path>, default: &str) -> PathBuf {
    match configured {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => data_dir.join(path),
        None => data_dir.join(default),
    }
}

/// Resolve the data directory.
///
/// Priority:
/// 1. `JOBFLOW_HOME` environment variable
/// 2. `~/.jobflow`
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(HOME_ENV) {
        return PathBuf::from(dir);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".jobflow");
    }
    PathBuf::from(".jobflow")
}

/// Load engine configuration from `{data_dir}/jobflow.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE} found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_observe::LogFormat;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.executor.max_attempts, 1);
        assert!(config.executor.enforce_timeouts);
        assert_eq!(config.logging.filter, "info");
    }

    #[tokio::test]
    async fn valid_toml_is_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"
definitions_root = "defs"
store_root = "/srv/jobflow/store"

[executor]
max_attempts = 3

[logging]
format = "json"
otel = true
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.executor.max_attempts, 3);
        assert!(config.executor.enforce_timeouts);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.logging.otel);
        assert_eq!(config.logging.filter, "info");
        assert_eq!(config.definitions_root(tmp.path()), tmp.path().join("defs"));
        assert_eq!(
            config.store_root(tmp.path()),
            PathBuf::from("/srv/jobflow/store")
        );
    }

    #[tokio::test]
    async fn invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE), "this is not { valid toml !!!")
            .await
            .unwrap();
        assert_eq!(load_engine_config(tmp.path()).await, EngineConfig::default());
    }

    #[test]
    fn default_dirs_hang_off_data_dir() {
        let data_dir = PathBuf::from("/home/user/.jobflow");
        let config = EngineConfig::default();
        assert_eq!(
            config.definitions_root(&data_dir),
            PathBuf::from("/home/user/.jobflow/jobs")
        );
        assert_eq!(
            config.store_root(&data_dir),
            PathBuf::from("/home/user/.jobflow/store")
        );
    }

    #[test]
    fn executor_section_converts() {
        let section = ExecutorSection {
            max_attempts: 4,
            enforce_timeouts: false,
        };
        let config = ExecutorConfig::from(&section);
        assert_eq!(config.max_attempts, 4);
        assert!(!config.enforce_timeouts);
    }

    #[test]
    fn data_dir_from_env() {
        // SAFETY: This test is single-threaded and restores the env var immediately.
        unsafe {
            std::env::set_var(HOME_ENV, "/tmp/test-jobflow");
        }
        let dir = default_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-jobflow"));
        unsafe {
            std::env::remove_var(HOME_ENV);
        }
    }
}

//! Configuration Loader
//!
//! Environment-aware loading: TOML file discovery, environment detection and
//! `VERITY__SECTION__KEY` overrides, merged through the `config` crate.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::{Config, Environment, File, FileFormat};
use tracing::{debug, info};

use super::error::ConfigResult;
use super::VerityConfig;

const ENV_PREFIX: &str = "VERITY";
const BASE_FILE_STEM: &str = "verity";

/// Loaded, validated configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: VerityConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    /// Useful in tests that must not touch process-wide variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            environment = environment,
            directory = %config_directory.display(),
            "Loading configuration"
        );

        let mut config = Self::build(&config_directory, environment)?;
        config.environment = environment.to_string();
        config.validate()?;

        info!(
            environment = environment,
            database_configured = config.database.url.is_some(),
            batch_size = config.orchestration.batch_size,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration (tests, embedding)
    pub fn from_config(config: VerityConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        let environment = config.environment.clone();
        Ok(Arc::new(ConfigManager {
            config,
            environment,
            config_directory: Self::default_config_directory(),
        }))
    }

    pub fn config(&self) -> &VerityConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// `VERITY_ENV`, falling back to `development`
    pub fn detect_environment() -> String {
        env::var("VERITY_ENV")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("VERITY_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn build(directory: &Path, environment: &str) -> ConfigResult<VerityConfig> {
        let base = directory.join(format!("{BASE_FILE_STEM}.toml"));
        let overlay = directory.join(format!("{BASE_FILE_STEM}.{environment}.toml"));

        let settings = Config::builder()
            .add_source(File::from(base).format(FileFormat::Toml).required(false))
            .add_source(File::from(overlay).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize::<VerityConfig>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigurationError;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_missing_files_fall_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
                .unwrap();

        assert_eq!(manager.environment(), "test");
        assert_eq!(manager.config().environment, "test");
        assert_eq!(manager.config().orchestration.batch_size, 25);
        assert_eq!(manager.config().rate_limiter.release_retry.max_attempts, 3);
    }

    #[test]
    fn test_environment_file_overrides_base() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("verity.toml"),
            r#"
[orchestration]
batch_size = 10
max_filter_retries = 4

[circuit_breakers.default]
failure_threshold = 7
timeout_seconds = 45
"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("verity.staging.toml"),
            r#"
[orchestration]
batch_size = 50

[circuit_breakers.components.scorer]
failure_threshold = 2
timeout_seconds = 5
"#,
        )
        .unwrap();

        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "staging")
                .unwrap();
        let config = manager.config();

        assert_eq!(config.orchestration.batch_size, 50);
        assert_eq!(config.orchestration.max_filter_retries, 4);
        assert_eq!(config.circuit_breakers.default.failure_threshold, 7);
        assert_eq!(
            config
                .circuit_breakers
                .config_for_component("scorer")
                .failure_threshold,
            2
        );
    }

    #[test]
    fn test_invalid_file_values_fail_validation() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("verity.toml"),
            "[rate_limiter]\ndefault_capacity = 0\n",
        )
        .unwrap();

        let err = ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { .. }));
    }

    #[test]
    fn test_malformed_file_is_a_load_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("verity.toml"), "[orchestration\nbatch_size = ").unwrap();

        let err = ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::LoadFailed { .. }));
    }
}

//! Configuration Loader
//!
//! Environment-aware configuration loading: YAML file discovery, environment section
//! merging, and a `FLEET__SECTION__KEY` environment-variable overlay.

use super::error::{ConfigResult, ConfigurationError};
use super::FleetConfig;
use serde_yaml::Value as YamlValue;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Configuration file name looked up inside the configuration directory
pub const CONFIG_FILE_NAME: &str = "fleet-config.yaml";

/// Largest configuration file the loader will read
const MAX_CONFIG_FILE_BYTES: u64 = 1024 * 1024;

const ENVIRONMENT_SECTIONS: [&str; 3] = ["development", "test", "production"];

/// Loaded, validated configuration plus the context it was loaded from
#[derive(Debug)]
pub struct ConfigManager {
    config: FleetConfig,
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

    /// Load configuration from a specific directory with explicit environment
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_directory.display()
        );

        let mut config = Self::load_and_merge_config(&config_directory, environment)?;
        config.environment = environment.to_string();
        config.validate()?;

        info!(
            environment = %environment,
            batch_size = config.scheduler.batch_size,
            viewers_per_box = config.fleet.viewers_per_box,
            persistent_store = config.database.url.is_some(),
            "⚙️ CONFIG: Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an in-memory configuration, validating it first
    pub fn from_config(config: FleetConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        let environment = if config.environment.is_empty() {
            Self::detect_environment()
        } else {
            config.environment.clone()
        };

        Ok(Arc::new(ConfigManager {
            config,
            environment,
            config_directory: Self::default_config_directory(),
        }))
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    fn detect_environment() -> String {
        env::var("FLEET_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("FLEET_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn find_config_file(config_directory: &Path) -> ConfigResult<PathBuf> {
        let candidate = config_directory.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            Ok(candidate)
        } else {
            Err(ConfigurationError::config_file_not_found(vec![candidate]))
        }
    }

    /// Read a configuration file, refusing anything unreasonably large
    fn read_config_file_safely(path: &Path) -> ConfigResult<String> {
        let metadata = std::fs::metadata(path)
            .map_err(|e| ConfigurationError::file_read_error(path.display().to_string(), e))?;

        if metadata.len() > MAX_CONFIG_FILE_BYTES {
            return Err(ConfigurationError::file_read_error(
                path.display().to_string(),
                format!(
                    "file is {} bytes, limit is {MAX_CONFIG_FILE_BYTES}",
                    metadata.len()
                ),
            ));
        }

        std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::file_read_error(path.display().to_string(), e))
    }

    /// Load and merge configuration with environment-specific overrides
    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
    ) -> ConfigResult<FleetConfig> {
        let config_file = Self::find_config_file(config_directory)?;
        let yaml_content = Self::read_config_file_safely(&config_file)?;

        let mut yaml_data: YamlValue = serde_yaml::from_str(&yaml_content)
            .map_err(|e| ConfigurationError::invalid_yaml(config_file.display().to_string(), e))?;

        if let Some(env_overrides) = yaml_data
            .get(YamlValue::String(environment.to_string()))
            .cloned()
        {
            debug!("Applying environment-specific overrides for: {}", environment);
            Self::merge_yaml_values(&mut yaml_data, env_overrides);
        }

        if let YamlValue::Mapping(ref mut map) = yaml_data {
            for section in ENVIRONMENT_SECTIONS {
                map.remove(YamlValue::String(section.to_string()));
            }
        }

        let merged = serde_yaml::to_string(&yaml_data)
            .map_err(|e| ConfigurationError::invalid_yaml(config_file.display().to_string(), e))?;

        Self::apply_environment_overlay(&merged)
    }

    /// Layer `FLEET__SECTION__KEY` variables over the merged YAML document
    fn apply_environment_overlay(merged_yaml: &str) -> ConfigResult<FleetConfig> {
        ::config::Config::builder()
            .add_source(::config::File::from_str(merged_yaml, ::config::FileFormat::Yaml))
            .add_source(
                ::config::Environment::with_prefix("FLEET")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|layered| layered.try_deserialize::<FleetConfig>())
            .map_err(ConfigurationError::environment_override)
    }

    /// Recursively merge YAML values (environment overrides into base config)
    fn merge_yaml_values(base: &mut YamlValue, override_value: YamlValue) {
        match (&mut *base, override_value) {
            (YamlValue::Mapping(base_map), YamlValue::Mapping(override_map)) => {
                for (key, value) in override_map {
                    if let Some(existing_value) = base_map.get_mut(&key) {
                        Self::merge_yaml_values(existing_value, value);
                    } else {
                        base_map.insert(key, value);
                    }
                }
            }
            (base_ref, override_val) => {
                *base_ref = override_val;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TEST_CONFIG_YAML: &str = r#"
fleet:
  viewers_per_box: 4
  max_tabs: 4
  default_tabs: 2
scheduler:
  batch_size: 2
  inter_batch_delay_ms: 1000
monitor:
  idle_timeout_ms: 60000
test:
  scheduler:
    batch_size: 5
  monitor:
    sample_interval_ms: 50
production:
  fleet:
    viewers_per_box: 20
"#;

    fn setup_test_config_dir(contents: &str) -> TempDir {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), contents).expect("write config");
        dir
    }

    #[test]
    fn test_basic_config_loading() {
        let dir = setup_test_config_dir(TEST_CONFIG_YAML);
        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "development")
                .expect("config loads");

        let config = manager.config();
        assert_eq!(config.fleet.viewers_per_box, 4);
        assert_eq!(config.fleet.default_tabs, 2);
        assert_eq!(config.scheduler.batch_size, 2);
        assert_eq!(config.scheduler.inter_batch_delay_ms, 1000);
        // Unspecified values keep their defaults
        assert_eq!(config.scheduler.intra_batch_stagger_ms, 500);
        assert_eq!(config.persistence.max_attempts, 5);
        assert_eq!(manager.environment(), "development");
    }

    #[test]
    fn test_environment_specific_overrides() {
        let dir = setup_test_config_dir(TEST_CONFIG_YAML);

        let test_manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
                .expect("config loads");
        assert_eq!(test_manager.config().scheduler.batch_size, 5);
        assert_eq!(test_manager.config().scheduler.inter_batch_delay_ms, 1000);
        assert_eq!(test_manager.config().monitor.sample_interval_ms, 50);
        assert_eq!(test_manager.config().monitor.idle_timeout_ms, 60000);

        let prod_manager = ConfigManager::load_from_directory_with_env(
            Some(dir.path().to_path_buf()),
            "production",
        )
        .expect("config loads");
        assert_eq!(prod_manager.config().fleet.viewers_per_box, 20);
        assert_eq!(prod_manager.config().scheduler.batch_size, 2);
    }

    #[test]
    fn test_config_file_not_found() {
        let dir = TempDir::new().expect("temp dir");
        let result =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test");
        assert!(matches!(
            result,
            Err(ConfigurationError::ConfigFileNotFound { .. })
        ));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = setup_test_config_dir("scheduler:\n  batch_size: 0\n");
        let result =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test");
        assert!(matches!(result, Err(ConfigurationError::InvalidValue { .. })));
    }

    #[test]
    fn test_invalid_yaml_is_reported() {
        let dir = setup_test_config_dir("fleet: [unclosed");
        let result =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test");
        assert!(matches!(result, Err(ConfigurationError::InvalidYaml { .. })));
    }
}

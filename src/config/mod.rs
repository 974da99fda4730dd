mod init;
pub mod predicate;
mod schema;
pub mod validation;

pub use init::write_starter_config;
pub use predicate::OutcomeRange;
pub use schema::*;
pub use validation::validate_config;

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use crate::error::EngineError;

/// Starter configuration written by `accountability-engine init`
pub const STARTER_CONFIG: &str = include_str!("starter.yaml");

/// Get the config directory path (~/.config/accountability-engine/)
pub fn get_config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join("accountability-engine"))
}

/// Get the default config file path (~/.config/accountability-engine/config.yaml)
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.yaml"))
}

/// Load configuration from a YAML file
///
/// # Arguments
///
/// * `path` - Optional path to config file. If None, uses default path
///   (~/.config/accountability-engine/config.yaml)
///
/// # Errors
///
/// Returns an error if:
/// - The config file does not exist
/// - The config file cannot be read
/// - The YAML cannot be parsed
pub fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let config_path = match path {
        Some(p) => p,
        None => get_config_path()?,
    };

    if !config_path.exists() {
        anyhow::bail!(
            "Config file not found at {}. Run `accountability-engine init` to create one",
            config_path.display()
        );
    }

    let config_content = fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;

    parse_config(&config_content)
        .with_context(|| format!("Failed to parse config: invalid YAML in {}", config_path.display()))
}

/// Parse configuration from YAML text without validating it
pub fn parse_config(yaml: &str) -> Result<Config> {
    let config: Config = serde_saphyr::from_str(yaml)?;
    Ok(config)
}

/// Check a parsed configuration, collecting every problem into one error
pub fn ensure_valid(config: &Config) -> Result<(), EngineError> {
    validate_config(config).map_err(EngineError::Configuration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_load_missing_file() {
        let path = env::temp_dir().join("accountability_engine_missing_config.yaml");
        let _ = fs::remove_file(&path);
        let err = load_config(Some(path)).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_load_starter_from_disk() {
        let path = env::temp_dir().join("accountability_engine_load_starter.yaml");
        fs::write(&path, STARTER_CONFIG).unwrap();

        let config = load_config(Some(path.clone())).unwrap();
        assert_eq!(config.n_count, 10);
        assert!(config.models.contains_key("k-8"));
        assert!(ensure_valid(&config).is_ok());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_invalid_yaml_reports_path() {
        let path = env::temp_dir().join("accountability_engine_bad_config.yaml");
        fs::write(&path, "indicators: [").unwrap();
        let err = load_config(Some(path.clone())).unwrap_err();
        assert!(format!("{:#}", err).contains("invalid YAML"));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_ensure_valid_wraps_errors() {
        let mut config = parse_config(STARTER_CONFIG).unwrap();
        config.n_count = 0;
        match ensure_valid(&config) {
            Err(EngineError::Configuration(errors)) => assert_eq!(errors.len(), 1),
            other => panic!("expected configuration error, got {:?}", other),
        }
    }
}

use super::expand_tilde;
use super::types::Config;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml_string = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;

    config.storage.path = expand_tilde(&config.storage.path);
    config.durability.queue_path = expand_tilde(&config.durability.queue_path);

    validate_config(&config)?;

    Ok(config)
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.durability.max_entries == 0 {
        return Err(ConfigError::Validation(
            "durability.max_entries must be greater than 0".to_string(),
        ));
    }
    if config.durability.max_bytes == 0 {
        return Err(ConfigError::Validation(
            "durability.max_bytes must be greater than 0".to_string(),
        ));
    }
    if config.durability.reconcile_batch_size == 0 {
        return Err(ConfigError::Validation(
            "durability.reconcile_batch_size must be greater than 0".to_string(),
        ));
    }
    if config.durability.probe_interval_seconds == 0 {
        return Err(ConfigError::Validation(
            "durability.probe_interval_seconds must be greater than 0".to_string(),
        ));
    }
    if config.aggregation.hourly_offset_minutes >= 60 {
        return Err(ConfigError::Validation(
            "aggregation.hourly_offset_minutes must be below 60".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(yaml: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_minimal_config_applies_defaults() {
        let file = write_config(
            r#"
storage:
  path: /tmp/logtide.duckdb
durability:
  queue_path: /tmp/overflow.json
web:
  listen: 127.0.0.1:8460
"#,
        );

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.durability.max_entries, 10_000);
        assert_eq!(config.durability.max_bytes, 50 * 1024 * 1024);
        assert_eq!(config.durability.probe_interval_seconds, 30);
        assert_eq!(config.durability.reconcile_batch_size, 100);
        assert_eq!(config.aggregation.hourly_offset_minutes, 0);
    }

    #[test]
    fn test_load_config_rejects_zero_bounds() {
        let file = write_config(
            r#"
storage:
  path: /tmp/logtide.duckdb
durability:
  queue_path: /tmp/overflow.json
  max_entries: 0
web:
  listen: 127.0.0.1:8460
"#,
        );

        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_sample_yaml_parses() {
        let config: Config = serde_yaml::from_str(Config::sample_yaml()).unwrap();
        assert_eq!(config.durability.max_entries, 10_000);
        assert_eq!(config.web.listen, "127.0.0.1:8460");
    }
}

//! Configuration module for refract
//!
//! Supports YAML and TOML configuration files with validation. Most options
//! can also be supplied (and overridden) on the command line.

mod types;
mod validation;

pub use types::*;
pub use validation::{parse_limiter, validate_config};

use crate::error::{RefractError, Result};
use std::path::Path;
use tracing::info;

/// Load configuration from a file, picking the format by extension.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        RefractError::Config(format!("Failed to read config file {:?}: {}", path, e))
    })?;

    let config = parse_config(&content, path)?;
    validate_config(&config)?;

    info!("Configuration loaded successfully from {:?}", path);
    Ok(config)
}

fn parse_config(content: &str, path: &Path) -> Result<Config> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("yaml");

    match extension {
        "yaml" | "yml" => serde_yaml::from_str(content).map_err(|e| e.into()),
        "toml" => toml::from_str(content).map_err(|e| e.into()),
        _ => Err(RefractError::Config(format!(
            "Unsupported config format: {}",
            extension
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_yaml_config() {
        let config_content = r#"
input:
  listen: "eth0:8080"

output:
  targets:
    - "http://staging.internal"
  workers: 2
  stats: true
"#;
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        file.write_all(config_content.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.input.listen, "eth0:8080");
        assert_eq!(config.output.targets.len(), 1);
        assert_eq!(config.output.workers, 2);
        assert!(config.output.stats);
    }

    #[test]
    fn test_load_toml_config() {
        let config_content = r#"
[input]
listen = "lo:9000"

[output]
targets = ["http://staging.internal"]
preserve_host = true
"#;
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        file.write_all(config_content.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.input.listen, "lo:9000");
        assert!(config.output.preserve_host);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config_content = r#"
input:
  listen: "eth0:8080"

output:
  targets: []
"#;
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        file.write_all(config_content.as_bytes()).unwrap();

        assert!(load_config(file.path()).is_err());
    }
}

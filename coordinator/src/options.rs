//! Coordinator configuration file support.
//!
//! All settings have working defaults; a TOML file passed via `--config`
//! overrides them, and command-line flags override the file.

use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use brokerage_core::error::{BrokerageError, Result};
use brokerage_core::protocol::COORDINATOR_PORT;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorOptions {
    /// Port to listen on.
    pub port: u16,
    /// Log level filter (trace, debug, info, warn, error).
    pub log_level: String,
    /// Seconds without a refresh before a worker is dropped from the
    /// registry.
    pub worker_timeout: u64,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            port: COORDINATOR_PORT,
            log_level: "info".to_string(),
            worker_timeout: 60,
        }
    }
}

impl FromStr for CoordinatorOptions {
    type Err = BrokerageError;

    fn from_str(s: &str) -> Result<Self> {
        let options: Self = toml::from_str(s)
            .map_err(|e| BrokerageError::config_with_source("failed to parse TOML config", e))?;
        options.validate()?;
        Ok(options)
    }
}

impl CoordinatorOptions {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BrokerageError::filesystem_with_source(path, "failed to read config file", e)
        })?;
        content.parse()
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_timeout == 0 {
            return Err(BrokerageError::config(
                "worker_timeout must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = CoordinatorOptions::default();
        assert_eq!(options.port, COORDINATOR_PORT);
        assert_eq!(options.log_level, "info");
        assert_eq!(options.worker_timeout, 60);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_from_str_partial() {
        let options: CoordinatorOptions = "port = 4100".parse().unwrap();
        assert_eq!(options.port, 4100);
        assert_eq!(options.log_level, "info");
    }

    #[test]
    fn test_from_str_full() {
        let toml = r#"
            port = 4100
            log_level = "debug"
            worker_timeout = 120
        "#;
        let options: CoordinatorOptions = toml.parse().unwrap();
        assert_eq!(options.port, 4100);
        assert_eq!(options.log_level, "debug");
        assert_eq!(options.worker_timeout, 120);
    }

    #[test]
    fn test_invalid_toml() {
        let result: std::result::Result<CoordinatorOptions, _> = "port = [".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result: std::result::Result<CoordinatorOptions, _> =
            "worker_timeout = 0".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file_not_found() {
        assert!(CoordinatorOptions::from_file("/nonexistent/coordinator.toml").is_err());
    }
}

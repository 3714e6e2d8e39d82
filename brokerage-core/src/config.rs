// brokerage-core/src/config.rs

//! Brokerage configuration.
//!
//! The brokerage reads three environment variables, all optional:
//!
//! - `FASTBUILD_WORKERS`: semicolon-separated literal worker list; when
//!   non-empty, discovery returns it verbatim and no transport is used.
//! - `FASTBUILD_COORDINATOR`: `host[:port]` of the coordinator service.
//! - `FASTBUILD_BROKERAGE_PATH`: semicolon-separated folder roots; the first
//!   is the write root, all are read roots.
//!
//! A coordinator address takes precedence over brokerage roots when both are
//! set.

use std::path::PathBuf;

use serde::Deserialize;

use crate::protocol::COORDINATOR_PORT;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BrokerageConfig {
    /// Explicit worker list; bypasses brokerage entirely when non-empty.
    pub workers: Vec<String>,
    /// Coordinator `host[:port]`.
    pub coordinator: Option<String>,
    /// Folder transport roots; first is the write root.
    pub brokerage_roots: Vec<PathBuf>,
}

impl BrokerageConfig {
    /// Builds a configuration from the environment.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("FASTBUILD_WORKERS") {
            let workers = split_list(&val);
            if !workers.is_empty() {
                self.workers = workers;
            }
        }
        if let Ok(val) = std::env::var("FASTBUILD_COORDINATOR") {
            if !val.trim().is_empty() {
                self.coordinator = Some(val.trim().to_string());
            }
        }
        if let Ok(val) = std::env::var("FASTBUILD_BROKERAGE_PATH") {
            let roots: Vec<PathBuf> = split_list(&val).into_iter().map(PathBuf::from).collect();
            if !roots.is_empty() {
                self.brokerage_roots = roots;
            }
        }
        self
    }

    /// Whether any worker source is configured.
    pub fn has_source(&self) -> bool {
        !self.workers.is_empty() || self.coordinator.is_some() || !self.brokerage_roots.is_empty()
    }

    /// Splits the coordinator setting into host and port, defaulting to the
    /// well-known coordinator port.
    pub fn coordinator_host_port(&self) -> Option<(String, u16)> {
        let address = self.coordinator.as_deref()?;
        match address.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) if !host.is_empty() => Some((host.to_string(), port)),
                // Not a port suffix; treat the whole string as a host
                _ => Some((address.to_string(), COORDINATOR_PORT)),
            },
            None => Some((address.to_string(), COORDINATOR_PORT)),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// brokerage-core/src/presence.rs

//! Presence file contents for the folder transport.
//!
//! A worker's availability is signalled by a file named after its host (or
//! IPv4 string) under the brokerage root. The file body is a human-readable
//! descriptor so operators can inspect a brokerage share with plain tools:
//!
//! ```text
//! Version: 0.4.0
//! User: buildfarm
//! Host Name: builder01
//! Domain Name: corp.example
//! FQDN: builder01.corp.example
//! IPv4 Address: 10.0.0.5
//! CPUs: 15/16
//! Memory: 16384
//! Mode: idle @ 20%
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::{BrokerageError, Result};
use crate::net::HostIdentity;

/// Worker scheduling mode, published for operator visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    Disabled,
    /// Accept work only when local CPU usage is below the threshold.
    WhenIdle { threshold_percent: u32 },
    Dedicated,
    Proportional,
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerMode::Disabled => write!(f, "disabled"),
            WorkerMode::WhenIdle { threshold_percent } => {
                write!(f, "idle @ {threshold_percent}%")
            }
            WorkerMode::Dedicated => write!(f, "dedicated"),
            WorkerMode::Proportional => write!(f, "proportional"),
        }
    }
}

impl FromStr for WorkerMode {
    type Err = BrokerageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "disabled" => Ok(WorkerMode::Disabled),
            "dedicated" => Ok(WorkerMode::Dedicated),
            "proportional" => Ok(WorkerMode::Proportional),
            other => {
                // "idle @ N%"
                let rest = other
                    .strip_prefix("idle @")
                    .and_then(|r| r.trim().strip_suffix('%'))
                    .ok_or_else(|| {
                        BrokerageError::config(format!("unknown worker mode '{other}'"))
                    })?;
                let threshold_percent = rest.trim().parse::<u32>().map_err(|e| {
                    BrokerageError::config_with_source(
                        format!("bad idle threshold in mode '{other}'"),
                        e,
                    )
                })?;
                Ok(WorkerMode::WhenIdle { threshold_percent })
            }
        }
    }
}

/// What a worker publishes about itself. Produced by the worker's local
/// policy; the brokerage treats it as opaque apart from change detection
/// via `settings_write_time`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDescriptor {
    pub version: String,
    pub user: String,
    /// CPUs offered to remote clients.
    pub cpu_limit: u32,
    /// CPUs present on the machine.
    pub cpu_count: u32,
    /// Minimum free memory (MiB) required to accept work.
    pub min_free_memory_mib: u32,
    pub mode: WorkerMode,
    /// Opaque token identifying the settings revision; a change forces the
    /// presence file to be rewritten.
    pub settings_write_time: u64,
}

impl Default for WorkerDescriptor {
    fn default() -> Self {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            user: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_else(|_| "unknown".to_string()),
            cpu_limit: cpu_count,
            cpu_count,
            min_free_memory_mib: 0,
            mode: WorkerMode::Dedicated,
            settings_write_time: 0,
        }
    }
}

impl WorkerDescriptor {
    /// Renders the presence file body for this descriptor and host identity.
    pub fn render(&self, identity: &HostIdentity) -> String {
        let mut out = String::with_capacity(256);
        out.push_str(&format!("Version: {}\n", self.version));
        out.push_str(&format!("User: {}\n", self.user));
        out.push_str(&format!("Host Name: {}\n", identity.host_name));
        if let Some(domain) = &identity.domain_name {
            out.push_str(&format!("Domain Name: {domain}\n"));
            if let Some(fqdn) = identity.fqdn() {
                out.push_str(&format!("FQDN: {fqdn}\n"));
            }
        }
        if let Some(ip) = identity.ipv4 {
            out.push_str(&format!("IPv4 Address: {ip}\n"));
        }
        out.push_str(&format!("CPUs: {}/{}\n", self.cpu_limit, self.cpu_count));
        out.push_str(&format!("Memory: {}\n", self.min_free_memory_mib));
        out.push_str(&format!("Mode: {}\n", self.mode));
        out
    }

    /// Parses a presence file body back into a descriptor. Unknown keys are
    /// ignored so newer workers stay readable.
    pub fn parse(body: &str) -> Result<Self> {
        let mut descriptor = Self {
            version: String::new(),
            user: String::new(),
            cpu_limit: 0,
            cpu_count: 0,
            min_free_memory_mib: 0,
            mode: WorkerMode::Disabled,
            settings_write_time: 0,
        };

        for line in body.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "Version" => descriptor.version = value.to_string(),
                "User" => descriptor.user = value.to_string(),
                "CPUs" => {
                    let (limit, count) = value.split_once('/').ok_or_else(|| {
                        BrokerageError::config(format!("bad CPUs line '{value}'"))
                    })?;
                    descriptor.cpu_limit = limit.trim().parse().map_err(|e| {
                        BrokerageError::config_with_source("bad CPU limit", e)
                    })?;
                    descriptor.cpu_count = count.trim().parse().map_err(|e| {
                        BrokerageError::config_with_source("bad CPU count", e)
                    })?;
                }
                "Memory" => {
                    descriptor.min_free_memory_mib = value.parse().map_err(|e| {
                        BrokerageError::config_with_source("bad Memory line", e)
                    })?;
                }
                "Mode" => descriptor.mode = value.parse()?,
                _ => {}
            }
        }

        Ok(descriptor)
    }
}

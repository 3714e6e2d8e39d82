// brokerage-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerageError {

    #[error("failed to bind port {port}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("another coordinator is already running (lock file '{path}')")]
    AlreadyRunning {
        path: PathBuf,
    },

    #[error("connection to '{address}' failed: {message}")]
    Connect {
        address: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("protocol error: {message}")]
    Protocol {
        message: String,
    },

    #[error("filesystem error at '{path}': {message}")]
    Filesystem {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("no worker source configured; set FASTBUILD_COORDINATOR or FASTBUILD_BROKERAGE_PATH")]
    ConfigMissing,

    #[error("configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

pub type Result<T> = std::result::Result<T, BrokerageError>;

// Convenience constructors
impl BrokerageError {

    pub fn bind(port: u16, source: std::io::Error) -> Self {
        Self::Bind { port, source }
    }

    pub fn connect(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connect {
            address: address.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn connect_with_source(
        address: impl Into<String>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Connect {
            address: address.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn filesystem(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Filesystem {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn filesystem_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Filesystem {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

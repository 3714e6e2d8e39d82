//! Worker Brokerage Coordinator
//!
//! This binary provides the centralized rendezvous service for distributed
//! builds: workers register their availability over TCP and build clients
//! query for the current worker list.
//!
//! # Usage
//!
//! ```bash
//! # Start the coordinator on the well-known port
//! fbb-coordinator
//!
//! # Start with a custom port
//! fbb-coordinator --port 4100
//!
//! # Start with a configuration file
//! fbb-coordinator --config coordinator.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use brokerage_core::protocol::wire_to_ipv4;

use coordinator::options::CoordinatorOptions;
use coordinator::service::Server;
use coordinator::singleton;
use coordinator::state::CoordinatorState;

// Exit codes shared with the build tooling around this binary.
const EXIT_OK: i32 = 0;
const EXIT_BAD_ARGS: i32 = -1;
const EXIT_ALREADY_RUNNING: i32 = -2;
const EXIT_LISTEN_FAILED: i32 = -3;

/// Name of the lock file enforcing one coordinator per host.
const INSTANCE_LOCK_NAME: &str = "fbb-coordinator.lock";

/// How long a second instance waits for the previous one to shut down.
const INSTANCE_LOCK_RETRY: Duration = Duration::from_secs(5);

/// Worker Brokerage Coordinator
#[derive(Parser, Debug)]
#[command(name = "fbb-coordinator")]
#[command(about = "Rendezvous service for distributed build workers")]
struct Args {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Seconds without a refresh before a worker is dropped
    #[arg(long)]
    worker_timeout: Option<u64>,
}

impl Args {
    /// Resolves the effective options: defaults, then the config file, then
    /// explicit flags.
    fn resolve(&self) -> brokerage_core::Result<CoordinatorOptions> {
        let mut options = match &self.config {
            Some(path) => CoordinatorOptions::from_file(path)?,
            None => CoordinatorOptions::default(),
        };
        if let Some(port) = self.port {
            options.port = port;
        }
        if let Some(log_level) = &self.log_level {
            options.log_level = log_level.clone();
        }
        if let Some(worker_timeout) = self.worker_timeout {
            options.worker_timeout = worker_timeout;
        }
        options.validate()?;
        Ok(options)
    }
}

#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(EXIT_BAD_ARGS);
        }
    };

    let options = match args.resolve() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(EXIT_BAD_ARGS);
        }
    };

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&options.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Only one coordinator per host.
    let _instance_lock = match singleton::acquire(INSTANCE_LOCK_NAME, INSTANCE_LOCK_RETRY).await {
        Ok(lock) => lock,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(EXIT_ALREADY_RUNNING);
        }
    };

    tracing::info!("Starting worker brokerage coordinator");
    tracing::info!("  Worker timeout: {}s", options.worker_timeout);

    let server = match Server::bind(options.port).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("{e}; check the port is not in use");
            std::process::exit(EXIT_LISTEN_FAILED);
        }
    };
    tracing::info!("Listening on port {}", options.port);

    let state = Arc::new(CoordinatorState::new());

    // Drop workers that stopped refreshing their registration.
    let bg_state = state.clone();
    let worker_timeout = Duration::from_secs(options.worker_timeout);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            for address in bg_state.expire_stale(worker_timeout).await {
                tracing::warn!("worker {} timed out", wire_to_ipv4(address));
            }
        }
    });

    server
        .run(state, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to install CTRL+C handler: {e}");
            }
        })
        .await;

    std::process::exit(EXIT_OK);
}

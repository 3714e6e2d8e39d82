// brokerage-core/src/brokerage/mod.rs

//! Worker brokerage: availability publishing and worker discovery.
//!
//! `WorkerBrokerage` hides the transport choice behind two operations:
//! [`WorkerBrokerage::find_workers`] resolves the set of candidate worker
//! addresses, and [`WorkerBrokerage::set_availability`] advertises or
//! withdraws this host's willingness to accept jobs.
//!
//! Transport selection, in order of precedence:
//!
//! 1. An explicit `FASTBUILD_WORKERS` list bypasses the brokerage entirely.
//! 2. A configured coordinator address selects the TCP coordinator transport.
//! 3. Configured brokerage roots select the shared-folder transport.
//!
//! With no source configured, discovery returns empty and publishing is a
//! no-op, each after a single warning.

mod folder;

pub use folder::{FolderTransport, PublishOutcome};

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::BrokerageConfig;
use crate::error::{BrokerageError, Result};
use crate::net::HostIdentity;
use crate::presence::WorkerDescriptor;
use crate::protocol::{wire_to_ipv4, Message, Platform, PROTOCOL_VERSION_MAJOR};
use crate::transport::Connection;

/// Cadence and timeout knobs. The defaults mirror production behavior; tests
/// tighten them.
#[derive(Debug, Clone)]
pub struct BrokerageTimings {
    /// Minimum interval between availability publishes.
    pub publish_interval: Duration,
    /// How often the host identity (DNS, addresses) is re-resolved.
    pub identity_refresh_interval: Duration,
    /// How often the stale-file sweep runs. The first sweep runs on the
    /// first availability call.
    pub sweep_interval: Duration,
    /// Presence files older than this are garbage-collected by the sweep.
    pub stale_presence_age: Duration,
    /// Dial timeout for the coordinator transport.
    pub connect_timeout_ms: u64,
    /// How long to wait for the coordinator's worker-list reply.
    pub response_timeout: Duration,
}

impl Default for BrokerageTimings {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_secs(10),
            identity_refresh_interval: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(12 * 60 * 60),
            stale_presence_age: Duration::from_secs(24 * 60 * 60),
            connect_timeout_ms: 2000,
            response_timeout: Duration::from_secs(10),
        }
    }
}

enum Transport {
    Coordinator { host: String, port: u16 },
    Folder(FolderTransport),
    Unconfigured,
}

pub struct WorkerBrokerage {
    config: BrokerageConfig,
    timings: BrokerageTimings,
    initialized: bool,
    identity: Option<HostIdentity>,
    transport: Transport,
    available: bool,
    warned_unconfigured: bool,
    last_publish: Option<Instant>,
    last_identity_refresh: Option<Instant>,
    last_sweep: Option<Instant>,
    last_settings_write_time: Option<u64>,
    worker_list_update: Vec<u32>,
    worker_list_ready: bool,
}

impl WorkerBrokerage {
    pub fn new(config: BrokerageConfig) -> Self {
        Self::with_timings(config, BrokerageTimings::default())
    }

    pub fn with_timings(config: BrokerageConfig, timings: BrokerageTimings) -> Self {
        Self {
            config,
            timings,
            initialized: false,
            identity: None,
            transport: Transport::Unconfigured,
            available: false,
            warned_unconfigured: false,
            last_publish: None,
            last_identity_refresh: None,
            last_sweep: None,
            last_settings_write_time: None,
            worker_list_update: Vec::new(),
            worker_list_ready: false,
        }
    }

    /// Builds a brokerage from the `FASTBUILD_*` environment variables.
    pub fn from_env() -> Self {
        Self::new(BrokerageConfig::from_env())
    }

    /// This host's resolved name; available after the first operation.
    pub fn host_name(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.host_name.as_str())
    }

    /// The presence file path on the folder transport.
    pub fn presence_path(&self) -> Option<&Path> {
        match &self.transport {
            Transport::Folder(folder) => Some(folder.presence_path()),
            _ => None,
        }
    }

    /// Resolves the list of candidate worker addresses.
    ///
    /// Failures are reported through logging and produce an empty result;
    /// a coordinator dial failure does not fall back to the folder
    /// transport within a single call.
    pub async fn find_workers(&mut self) -> Vec<String> {
        // Explicit worker list bypasses the brokerage entirely.
        if !self.config.workers.is_empty() {
            return self.config.workers.clone();
        }

        self.ensure_init().await;

        let coordinator = match &self.transport {
            Transport::Coordinator { host, port } => Some((host.clone(), *port)),
            _ => None,
        };
        if let Some((host, port)) = coordinator {
            return self.find_via_coordinator(&host, port).await;
        }

        if let Transport::Folder(folder) = &self.transport {
            let Some(identity) = &self.identity else {
                return Vec::new();
            };
            return folder.discover(identity).await;
        }

        self.warn_unconfigured();
        Vec::new()
    }

    /// Advertises (`true`) or withdraws (`false`) this host's availability.
    ///
    /// Meant to be called periodically from the worker's main loop; actual
    /// I/O is rate-limited to one publish per `publish_interval`.
    pub async fn set_availability(&mut self, descriptor: &WorkerDescriptor, available: bool) {
        self.ensure_init().await;

        if matches!(self.transport, Transport::Unconfigured) {
            self.warn_unconfigured();
            self.available = available;
            return;
        }

        if available {
            let due = self
                .last_publish
                .map_or(true, |t| t.elapsed() >= self.timings.publish_interval);
            if due {
                self.publish_available(descriptor).await;
                self.last_publish = Some(Instant::now());
            }
        } else if self.available {
            self.publish_withdrawal().await;
            self.last_publish = Some(Instant::now());
        }

        self.available = available;
        self.maybe_sweep().await;
    }

    /// Stores a worker list received from the coordinator and marks it
    /// ready for the pending `find_workers` call.
    fn update_worker_list(&mut self, workers: Vec<u32>) {
        self.worker_list_update = workers;
        self.worker_list_ready = true;
    }

    async fn ensure_init(&mut self) {
        if self.initialized {
            return;
        }

        let identity = HostIdentity::resolve().await;

        self.transport = if let Some((host, port)) = self.config.coordinator_host_port() {
            info!("using coordinator at {host}:{port}");
            Transport::Coordinator { host, port }
        } else if !self.config.brokerage_roots.is_empty() {
            info!("using brokerage folder");
            Transport::Folder(FolderTransport::new(
                &self.config.brokerage_roots,
                PROTOCOL_VERSION_MAJOR,
                Platform::current(),
                &identity,
            ))
        } else {
            Transport::Unconfigured
        };

        self.identity = Some(identity);
        self.last_identity_refresh = Some(Instant::now());
        self.initialized = true;
    }

    async fn find_via_coordinator(&mut self, host: &str, port: u16) -> Vec<String> {
        self.worker_list_ready = false;
        self.worker_list_update.clear();

        if let Err(e) = self.query_worker_list(host, port).await {
            warn!("failed to query coordinator at {host}:{port}: {e}");
            return Vec::new();
        }

        let workers = std::mem::take(&mut self.worker_list_update);
        self.worker_list_ready = false;
        debug!("worker list received: {} workers", workers.len());

        let Some(identity) = &self.identity else {
            return Vec::new();
        };
        filter_worker_addresses(&workers, identity)
    }

    /// Dials the coordinator, sends the query, and pumps the connection
    /// until `update_worker_list` has run.
    async fn query_worker_list(&mut self, host: &str, port: u16) -> Result<()> {
        let mut conn = Connection::connect(host, port, self.timings.connect_timeout_ms).await?;
        debug!("connected to coordinator, requesting worker list");

        conn.send(&Message::RequestWorkerList {
            protocol_version: PROTOCOL_VERSION_MAJOR,
            platform: Platform::current().as_wire(),
        })
        .await?;

        let response_timeout = self.timings.response_timeout;
        let wait = async {
            while !self.worker_list_ready {
                match conn.receive().await? {
                    Some(Message::WorkerList { workers }) => self.update_worker_list(workers),
                    Some(other) => {
                        debug!("ignoring unexpected message kind {}", other.kind());
                    }
                    None => {
                        return Err(BrokerageError::protocol(
                            "connection closed before worker list arrived",
                        ));
                    }
                }
            }
            Ok(())
        };
        match tokio::time::timeout(response_timeout, wait).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(BrokerageError::connect(
                    format!("{host}:{port}"),
                    "timed out waiting for worker list",
                ));
            }
        }

        conn.shutdown().await;
        Ok(())
    }

    async fn publish_available(&mut self, descriptor: &WorkerDescriptor) {
        let coordinator = match &self.transport {
            Transport::Coordinator { host, port } => Some((host.clone(), *port)),
            _ => None,
        };

        if let Some((host, port)) = coordinator {
            if let Err(e) =
                send_status(&host, port, true, self.timings.connect_timeout_ms).await
            {
                warn!("failed to publish availability: {e}");
            }
        } else {
            self.publish_folder(descriptor).await;
        }
    }

    async fn publish_folder(&mut self, descriptor: &WorkerDescriptor) {
        // Host names and addresses drift; re-resolve periodically and move
        // the presence file when the identity changed.
        let refresh_due = self
            .last_identity_refresh
            .map_or(true, |t| t.elapsed() >= self.timings.identity_refresh_interval);
        if refresh_due {
            let identity = HostIdentity::resolve().await;
            self.last_identity_refresh = Some(Instant::now());
            if self.identity.as_ref() != Some(&identity) {
                if let Transport::Folder(folder) = &mut self.transport {
                    if let Some(old_path) = folder.update_presence_path(&identity) {
                        match tokio::fs::remove_file(&old_path).await {
                            Ok(()) => info!("moved presence file to '{}'", folder.presence_path().display()),
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                            Err(e) => warn!("failed to remove old presence file '{}': {e}", old_path.display()),
                        }
                    }
                }
                self.identity = Some(identity);
            }
        }

        let Some(identity) = &self.identity else {
            return;
        };
        let settings_changed =
            self.last_settings_write_time != Some(descriptor.settings_write_time);
        let body = descriptor.render(identity);

        if let Transport::Folder(folder) = &self.transport {
            match folder.publish(&body, settings_changed).await {
                Ok(PublishOutcome::Written) => {
                    debug!("presence file written to '{}'", folder.presence_path().display());
                }
                Ok(PublishOutcome::Refreshed) => {}
                Err(e) => {
                    warn!("failed to publish availability: {e}");
                    return;
                }
            }
        }

        self.last_settings_write_time = Some(descriptor.settings_write_time);
    }

    async fn publish_withdrawal(&mut self) {
        let coordinator = match &self.transport {
            Transport::Coordinator { host, port } => Some((host.clone(), *port)),
            _ => None,
        };

        if let Some((host, port)) = coordinator {
            if let Err(e) =
                send_status(&host, port, false, self.timings.connect_timeout_ms).await
            {
                warn!("failed to withdraw availability: {e}");
            }
        } else if let Transport::Folder(folder) = &self.transport {
            if let Err(e) = folder.withdraw().await {
                warn!("failed to withdraw availability: {e}");
            }
        }
    }

    async fn maybe_sweep(&mut self) {
        if !matches!(self.transport, Transport::Folder(_)) {
            return;
        }
        let due = self
            .last_sweep
            .map_or(true, |t| t.elapsed() >= self.timings.sweep_interval);
        if !due {
            return;
        }

        let stale_age = self.timings.stale_presence_age;
        if let Transport::Folder(folder) = &self.transport {
            let removed = folder.sweep(stale_age).await;
            if removed > 0 {
                info!("swept {removed} stale presence files");
            }
        }
        self.last_sweep = Some(Instant::now());
    }

    fn warn_unconfigured(&mut self) {
        if !self.warned_unconfigured {
            warn!("{}", BrokerageError::ConfigMissing);
            self.warned_unconfigured = true;
        }
    }
}

impl Drop for WorkerBrokerage {
    /// A cleanly shut down worker must not linger in the folder registry.
    fn drop(&mut self) {
        if self.available {
            if let Transport::Folder(folder) = &self.transport {
                let _ = std::fs::remove_file(folder.presence_path());
            }
        }
    }
}

/// Sends one availability update to the coordinator over a fresh connection.
async fn send_status(host: &str, port: u16, available: bool, connect_timeout_ms: u64) -> Result<()> {
    let mut conn = Connection::connect(host, port, connect_timeout_ms).await?;
    conn.send(&Message::SetWorkerStatus {
        available,
        protocol_version: PROTOCOL_VERSION_MAJOR,
        platform: Platform::current().as_wire(),
    })
    .await?;
    conn.shutdown().await;
    Ok(())
}

/// Converts wire addresses to dotted-quad strings, dropping this host and
/// loopback.
fn filter_worker_addresses(workers: &[u32], identity: &HostIdentity) -> Vec<String> {
    let mut list = Vec::with_capacity(workers.len());
    for &addr in workers {
        let name = wire_to_ipv4(addr).to_string();
        if identity.is_self(&name) {
            debug!("skipping worker {name}");
            continue;
        }
        list.push(name);
    }
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn folder_config(root: &TempDir) -> BrokerageConfig {
        BrokerageConfig {
            workers: Vec::new(),
            coordinator: None,
            brokerage_roots: vec![root.path().to_path_buf()],
        }
    }

    fn fast_timings() -> BrokerageTimings {
        BrokerageTimings {
            publish_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_explicit_worker_list_shortcut() {
        let config = BrokerageConfig {
            workers: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            coordinator: Some("unreachable".to_string()),
            brokerage_roots: vec![PathBuf::from("/nonexistent")],
        };
        let mut brokerage = WorkerBrokerage::new(config);

        // No network or disk access: the list comes back verbatim, and the
        // brokerage never initializes a transport.
        assert_eq!(brokerage.find_workers().await, vec!["a", "b", "c"]);
        assert!(!brokerage.initialized);
    }

    #[tokio::test]
    async fn test_unconfigured_returns_empty() {
        let mut brokerage = WorkerBrokerage::new(BrokerageConfig::default());
        assert!(brokerage.find_workers().await.is_empty());
        assert!(brokerage.warned_unconfigured);

        // publishing is a no-op
        brokerage
            .set_availability(&WorkerDescriptor::default(), true)
            .await;
    }

    #[tokio::test]
    async fn test_folder_publish_and_withdraw() {
        let root = TempDir::new().unwrap();
        let mut brokerage =
            WorkerBrokerage::with_timings(folder_config(&root), fast_timings());
        let descriptor = WorkerDescriptor::default();

        brokerage.set_availability(&descriptor, true).await;
        let path = brokerage.presence_path().unwrap().to_path_buf();
        assert!(path.exists());

        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("Mode: dedicated"));

        brokerage.set_availability(&descriptor, false).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_publish_throttled_within_window() {
        let root = TempDir::new().unwrap();
        // default 10 s publish interval
        let mut brokerage = WorkerBrokerage::new(folder_config(&root));
        let descriptor = WorkerDescriptor::default();

        brokerage.set_availability(&descriptor, true).await;
        let path = brokerage.presence_path().unwrap().to_path_buf();
        assert!(path.exists());

        // Deleting the file and re-publishing inside the throttle window must
        // not touch the filesystem.
        std::fs::remove_file(&path).unwrap();
        brokerage.set_availability(&descriptor, true).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_settings_change_rewrites_file() {
        let root = TempDir::new().unwrap();
        let mut brokerage =
            WorkerBrokerage::with_timings(folder_config(&root), fast_timings());

        let mut descriptor = WorkerDescriptor::default();
        descriptor.settings_write_time = 1;
        brokerage.set_availability(&descriptor, true).await;

        let path = brokerage.presence_path().unwrap().to_path_buf();
        let before = std::fs::read_to_string(&path).unwrap();

        descriptor.cpu_limit = 1;
        descriptor.settings_write_time = 2;
        brokerage.set_availability(&descriptor, true).await;
        let after = std::fs::read_to_string(&path).unwrap();

        assert_ne!(before, after);
        assert!(after.contains(&format!("CPUs: 1/{}", descriptor.cpu_count)));
    }

    #[tokio::test]
    async fn test_sweep_removes_stale_presence_files() {
        let root = TempDir::new().unwrap();
        let mut brokerage =
            WorkerBrokerage::with_timings(folder_config(&root), fast_timings());
        let descriptor = WorkerDescriptor::default();

        // Seed a presence file from a worker that died two days ago.
        let versioned = FolderTransport::versioned_root(
            root.path(),
            PROTOCOL_VERSION_MAJOR,
            Platform::current(),
        );
        std::fs::create_dir_all(&versioned).unwrap();
        let stale = versioned.join("crashed-worker");
        std::fs::write(&stale, "").unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&stale)
            .unwrap()
            .set_modified(std::time::SystemTime::now() - Duration::from_secs(48 * 60 * 60))
            .unwrap();

        // First availability call runs the sweep immediately.
        brokerage.set_availability(&descriptor, true).await;
        assert!(!stale.exists());
        assert!(brokerage.presence_path().unwrap().exists());
    }

    #[tokio::test]
    async fn test_drop_deletes_presence_file() {
        let root = TempDir::new().unwrap();
        let path;
        {
            let mut brokerage =
                WorkerBrokerage::with_timings(folder_config(&root), fast_timings());
            brokerage
                .set_availability(&WorkerDescriptor::default(), true)
                .await;
            path = brokerage.presence_path().unwrap().to_path_buf();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_filter_worker_addresses() {
        let identity = HostIdentity {
            host_name: "builder01".to_string(),
            domain_name: None,
            ipv4: Some(Ipv4Addr::new(10, 0, 0, 5)),
        };

        let workers = vec![
            0x0500_000A, // 10.0.0.5 - ourselves
            0x0600_000A, // 10.0.0.6
            0x0100_007F, // 127.0.0.1 - loopback
        ];
        assert_eq!(filter_worker_addresses(&workers, &identity), vec!["10.0.0.6"]);
    }
}

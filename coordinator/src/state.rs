//! In-memory worker registry for the coordinator service.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use brokerage_core::protocol::wire_to_ipv4;

/// One registered worker. Keyed by the wire address of its TCP peer; at most
/// one entry exists per address at any instant.
#[derive(Debug, Clone)]
pub struct WorkerEntry {
    pub address: u32,
    pub protocol_version: u32,
    pub platform: u8,
    pub last_refresh: Instant,
}

/// Outcome of a status update, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Added,
    Refreshed,
    Removed,
    Absent,
}

/// Registry of currently-available workers.
///
/// All state is in memory; a coordinator restart invalidates every
/// registration and workers rebuild presence on their next availability
/// tick.
pub struct CoordinatorState {
    workers: RwLock<HashMap<u32, WorkerEntry>>,
}

impl CoordinatorState {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Applies a `SetWorkerStatus` message from the worker at `address`.
    ///
    /// Registration is idempotent; the advertised version and platform are
    /// authoritative and overwrite any previous entry at the same address.
    /// Withdrawing an absent worker silently succeeds.
    pub async fn set_worker_status(
        &self,
        address: u32,
        available: bool,
        protocol_version: u32,
        platform: u8,
    ) -> StatusChange {
        let mut workers = self.workers.write().await;

        if available {
            let previous = workers.insert(
                address,
                WorkerEntry {
                    address,
                    protocol_version,
                    platform,
                    last_refresh: Instant::now(),
                },
            );
            match previous {
                Some(_) => StatusChange::Refreshed,
                None => {
                    tracing::info!("new worker available: {}", wire_to_ipv4(address));
                    StatusChange::Added
                }
            }
        } else {
            match workers.remove(&address) {
                Some(_) => {
                    tracing::info!("worker withdrawn: {}", wire_to_ipv4(address));
                    StatusChange::Removed
                }
                None => StatusChange::Absent,
            }
        }
    }

    /// Snapshot of the addresses matching a query, taken atomically under
    /// the registry lock. Strict equality on both version and platform; no
    /// cross-version fallback.
    pub async fn matching_workers(&self, protocol_version: u32, platform: u8) -> Vec<u32> {
        let workers = self.workers.read().await;
        workers
            .values()
            .filter(|w| w.protocol_version == protocol_version && w.platform == platform)
            .map(|w| w.address)
            .collect()
    }

    /// Removes workers that have not refreshed their registration within
    /// `timeout`. Workers publish every ~10 s while available, so a silent
    /// worker has crashed or lost connectivity.
    pub async fn expire_stale(&self, timeout: Duration) -> Vec<u32> {
        let mut workers = self.workers.write().await;
        let expired: Vec<u32> = workers
            .values()
            .filter(|w| w.last_refresh.elapsed() > timeout)
            .map(|w| w.address)
            .collect();
        for address in &expired {
            workers.remove(address);
        }
        expired
    }

    pub async fn worker_count(&self) -> usize {
        let workers = self.workers.read().await;
        workers.len()
    }
}

impl Default for CoordinatorState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR_A: u32 = 0x0500_000A; // 10.0.0.5
    const ADDR_B: u32 = 0x0600_000A; // 10.0.0.6

    #[tokio::test]
    async fn test_registration_is_idempotent() {
        let state = CoordinatorState::new();

        let change = state.set_worker_status(ADDR_A, true, 42, 1).await;
        assert_eq!(change, StatusChange::Added);

        for _ in 0..3 {
            let change = state.set_worker_status(ADDR_A, true, 42, 1).await;
            assert_eq!(change, StatusChange::Refreshed);
        }

        assert_eq!(state.worker_count().await, 1);
        assert_eq!(state.matching_workers(42, 1).await, vec![ADDR_A]);
    }

    #[tokio::test]
    async fn test_reregistration_overwrites_version_and_platform() {
        let state = CoordinatorState::new();

        state.set_worker_status(ADDR_A, true, 42, 1).await;
        state.set_worker_status(ADDR_A, true, 43, 2).await;

        assert_eq!(state.worker_count().await, 1);
        assert!(state.matching_workers(42, 1).await.is_empty());
        assert_eq!(state.matching_workers(43, 2).await, vec![ADDR_A]);
    }

    #[tokio::test]
    async fn test_matchmaking_filters_on_version_and_platform() {
        let state = CoordinatorState::new();

        state.set_worker_status(ADDR_A, true, 42, 1).await;
        state.set_worker_status(ADDR_B, true, 42, 2).await;

        assert_eq!(state.matching_workers(42, 1).await, vec![ADDR_A]);
        assert_eq!(state.matching_workers(42, 2).await, vec![ADDR_B]);
        assert!(state.matching_workers(43, 1).await.is_empty());
        assert!(state.matching_workers(42, 3).await.is_empty());
    }

    #[tokio::test]
    async fn test_withdrawal() {
        let state = CoordinatorState::new();

        state.set_worker_status(ADDR_A, true, 42, 1).await;
        state.set_worker_status(ADDR_B, true, 42, 1).await;

        let change = state.set_worker_status(ADDR_A, false, 0, 0).await;
        assert_eq!(change, StatusChange::Removed);
        assert_eq!(state.matching_workers(42, 1).await, vec![ADDR_B]);

        // Withdrawing an absent worker silently succeeds.
        let change = state.set_worker_status(ADDR_A, false, 0, 0).await;
        assert_eq!(change, StatusChange::Absent);
    }

    #[tokio::test]
    async fn test_expire_stale() {
        let state = CoordinatorState::new();

        state.set_worker_status(ADDR_A, true, 42, 1).await;
        state.set_worker_status(ADDR_B, true, 42, 1).await;

        // Nothing expires with a generous timeout.
        assert!(state.expire_stale(Duration::from_secs(60)).await.is_empty());

        // Everything expires with a zero timeout.
        let mut expired = state.expire_stale(Duration::ZERO).await;
        expired.sort_unstable();
        assert_eq!(expired, vec![ADDR_A, ADDR_B]);
        assert_eq!(state.worker_count().await, 0);
    }

    #[tokio::test]
    async fn test_refresh_resets_expiry() {
        let state = CoordinatorState::new();

        state.set_worker_status(ADDR_A, true, 42, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        state.set_worker_status(ADDR_A, true, 42, 1).await;

        assert!(state
            .expire_stale(Duration::from_millis(15))
            .await
            .is_empty());
    }
}

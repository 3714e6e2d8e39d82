//! Single-instance enforcement.
//!
//! Only one coordinator may run per host. An advisory lock on a well-known
//! file in the system temp directory stands in for a named system mutex; the
//! lock is released by the OS even if the process dies without cleanup.

use std::path::PathBuf;
use std::time::Duration;

use fs4::fs_std::FileExt;
use tokio::time::Instant;

use brokerage_core::error::{BrokerageError, Result};

/// Held for the lifetime of the process; dropping it releases the lock.
#[derive(Debug)]
pub struct InstanceLock {
    file: std::fs::File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Tries to become the single coordinator instance, retrying for
/// `retry_window` to allow a previous instance time to shut down.
pub async fn acquire(name: &str, retry_window: Duration) -> Result<InstanceLock> {
    let path = std::env::temp_dir().join(name);
    let deadline = Instant::now() + retry_window;

    loop {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                BrokerageError::filesystem_with_source(&path, "failed to open lock file", e)
            })?;

        match file.try_lock_exclusive() {
            Ok(true) => return Ok(InstanceLock { file, path }),
            Ok(false) | Err(_) => {
                if Instant::now() >= deadline {
                    return Err(BrokerageError::AlreadyRunning { path });
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

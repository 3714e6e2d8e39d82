// brokerage-core/src/brokerage/folder.rs

//! Folder transport: filesystem rendezvous under a shared brokerage root.
//!
//! Availability is the existence of a presence file; discovery is a
//! directory listing. The protocol major version and OS tag are embedded in
//! the directory path so incompatible peers never see each other:
//! `<root>/main/<version>.<os>/<host-or-ip>`.
//!
//! The share is intentionally racy: multiple workers create and delete files
//! with no coordination, so transient `NotFound` errors are tolerated
//! everywhere.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tracing::{debug, warn};

use crate::error::{BrokerageError, Result};
use crate::net::HostIdentity;
use crate::protocol::Platform;

/// What `publish` ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The presence file was created or rewritten.
    Written,
    /// Only the mtime of the existing file was bumped.
    Refreshed,
}

pub struct FolderTransport {
    /// Versioned read roots, in configured order. The first is the write root.
    roots: Vec<PathBuf>,
    /// This host's presence file under the write root.
    presence_path: PathBuf,
}

impl FolderTransport {
    pub fn new(
        configured_roots: &[PathBuf],
        protocol_version: u32,
        platform: Platform,
        identity: &HostIdentity,
    ) -> Self {
        let roots: Vec<PathBuf> = configured_roots
            .iter()
            .map(|root| Self::versioned_root(root, protocol_version, platform))
            .collect();
        let presence_path = roots[0].join(identity.presence_file_name());
        Self {
            roots,
            presence_path,
        }
    }

    /// The effective directory for one configured root:
    /// `<root>/main/<version>.<os>`.
    pub fn versioned_root(root: &Path, protocol_version: u32, platform: Platform) -> PathBuf {
        root.join("main")
            .join(format!("{protocol_version}.{}", platform.os_tag()))
    }

    pub fn presence_path(&self) -> &Path {
        &self.presence_path
    }

    /// Points the presence file at a new identity. Returns the previous path
    /// when it changed, so the caller can delete the stale file.
    pub fn update_presence_path(&mut self, identity: &HostIdentity) -> Option<PathBuf> {
        let new_path = self.roots[0].join(identity.presence_file_name());
        if new_path == self.presence_path {
            return None;
        }
        Some(std::mem::replace(&mut self.presence_path, new_path))
    }

    /// Publishes availability.
    ///
    /// When the settings are unchanged and the file exists, only its mtime is
    /// bumped; the file is (re)written when the settings changed, the file is
    /// missing, or the bump failed.
    pub async fn publish(&self, body: &str, settings_changed: bool) -> Result<PublishOutcome> {
        if !settings_changed && self.bump_mtime().await.is_ok() {
            return Ok(PublishOutcome::Refreshed);
        }

        if let Some(parent) = self.presence_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                BrokerageError::filesystem_with_source(
                    parent,
                    "failed to create brokerage root",
                    e,
                )
            })?;
        }

        fs::write(&self.presence_path, body).await.map_err(|e| {
            BrokerageError::filesystem_with_source(
                &self.presence_path,
                "failed to write presence file",
                e,
            )
        })?;

        Ok(PublishOutcome::Written)
    }

    /// Withdraws availability by deleting the presence file. A missing file
    /// already means "withdrawn".
    pub async fn withdraw(&self) -> Result<()> {
        match fs::remove_file(&self.presence_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BrokerageError::filesystem_with_source(
                &self.presence_path,
                "failed to delete presence file",
                e,
            )),
        }
    }

    /// Enumerates worker names across all read roots, excluding this host.
    pub async fn discover(&self, identity: &HostIdentity) -> Vec<String> {
        let mut names = BTreeSet::new();

        for root in &self.roots {
            let mut entries = match fs::read_dir(root).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("no workers found in '{}': {e}", root.display());
                    continue;
                }
            };

            let before = names.len();
            while let Ok(Some(entry)) = entries.next_entry().await {
                let is_file = entry
                    .file_type()
                    .await
                    .map(|t| t.is_file())
                    .unwrap_or(false);
                if !is_file {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if identity.is_self(&name) {
                    debug!("skipping own presence file '{name}'");
                    continue;
                }
                names.insert(name);
            }
            debug!("{} workers found in '{}'", names.len() - before, root.display());
        }

        names.into_iter().collect()
    }

    /// Deletes presence files in the write root whose mtime is older than
    /// `older_than`. Returns the number of files removed.
    pub async fn sweep(&self, older_than: Duration) -> usize {
        let root = &self.roots[0];
        let mut entries = match fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("brokerage root '{}' inaccessible: {e}", root.display());
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let stale = now
                .duration_since(modified)
                .map(|age| age > older_than)
                .unwrap_or(false);
            if !stale {
                continue;
            }

            let path = entry.path();
            match fs::remove_file(&path).await {
                Ok(()) => {
                    warn!("removing '{}' (too old)", path.display());
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove '{}': {e}", path.display()),
            }
        }

        removed
    }

    async fn bump_mtime(&self) -> std::io::Result<()> {
        let path = self.presence_path.clone();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new().append(true).open(&path)?;
            file.set_modified(SystemTime::now())
        })
        .await
        .map_err(|e| std::io::Error::other(e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn identity(name: &str) -> HostIdentity {
        HostIdentity {
            host_name: name.to_string(),
            domain_name: None,
            ipv4: None,
        }
    }

    fn transport(root: &TempDir, host: &str) -> FolderTransport {
        FolderTransport::new(
            &[root.path().to_path_buf()],
            42,
            Platform::Linux,
            &identity(host),
        )
    }

    #[test]
    fn test_versioned_root_layout() {
        let path = FolderTransport::versioned_root(Path::new("/mnt/brokerage"), 42, Platform::Linux);
        assert_eq!(path, PathBuf::from("/mnt/brokerage/main/42.linux"));

        let path = FolderTransport::versioned_root(Path::new("/mnt/brokerage"), 43, Platform::MacOs);
        assert_eq!(path, PathBuf::from("/mnt/brokerage/main/43.osx"));
    }

    #[tokio::test]
    async fn test_publish_and_withdraw() {
        let dir = TempDir::new().unwrap();
        let transport = transport(&dir, "builder01");

        let outcome = transport.publish("Mode: dedicated\n", false).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Written);
        assert!(transport.presence_path().exists());
        assert_eq!(
            std::fs::read_to_string(transport.presence_path()).unwrap(),
            "Mode: dedicated\n"
        );

        transport.withdraw().await.unwrap();
        assert!(!transport.presence_path().exists());

        // withdrawing again is fine
        transport.withdraw().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_refreshes_existing_file() {
        let dir = TempDir::new().unwrap();
        let transport = transport(&dir, "builder01");

        transport.publish("v1\n", false).await.unwrap();
        let outcome = transport.publish("v2\n", false).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Refreshed);
        // content untouched by a refresh
        assert_eq!(
            std::fs::read_to_string(transport.presence_path()).unwrap(),
            "v1\n"
        );

        // settings change forces a rewrite
        let outcome = transport.publish("v2\n", true).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Written);
        assert_eq!(
            std::fs::read_to_string(transport.presence_path()).unwrap(),
            "v2\n"
        );
    }

    #[tokio::test]
    async fn test_discover_excludes_self() {
        let dir = TempDir::new().unwrap();
        let me = transport(&dir, "builder01");
        me.publish("", false).await.unwrap();

        for other in ["builder02", "builder03"] {
            FolderTransport::new(
                &[dir.path().to_path_buf()],
                42,
                Platform::Linux,
                &identity(other),
            )
            .publish("", false)
            .await
            .unwrap();
        }

        let workers = me.discover(&identity("builder01")).await;
        assert_eq!(workers, vec!["builder02", "builder03"]);
    }

    #[tokio::test]
    async fn test_discover_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let transport = transport(&dir, "builder01");
        // versioned root never created
        assert!(transport.discover(&identity("builder01")).await.is_empty());
    }

    #[tokio::test]
    async fn test_discover_unions_read_roots() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();

        FolderTransport::new(
            &[dir_a.path().to_path_buf()],
            42,
            Platform::Linux,
            &identity("worker-a"),
        )
        .publish("", false)
        .await
        .unwrap();
        FolderTransport::new(
            &[dir_b.path().to_path_buf()],
            42,
            Platform::Linux,
            &identity("worker-b"),
        )
        .publish("", false)
        .await
        .unwrap();

        let both = FolderTransport::new(
            &[dir_a.path().to_path_buf(), dir_b.path().to_path_buf()],
            42,
            Platform::Linux,
            &identity("client"),
        );
        assert_eq!(both.discover(&identity("client")).await, vec!["worker-a", "worker-b"]);
    }

    #[tokio::test]
    async fn test_version_bump_isolation() {
        let dir = TempDir::new().unwrap();

        let v42 = transport(&dir, "builder01");
        v42.publish("", false).await.unwrap();

        let v43 = FolderTransport::new(
            &[dir.path().to_path_buf()],
            43,
            Platform::Linux,
            &identity("client"),
        );
        assert!(v43.discover(&identity("client")).await.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_removes_stale_files() {
        let dir = TempDir::new().unwrap();
        let me = transport(&dir, "builder01");
        me.publish("", false).await.unwrap();

        // A presence file whose worker died two days ago.
        let stale_path = me.presence_path().parent().unwrap().join("crashed");
        std::fs::write(&stale_path, "").unwrap();
        let old = SystemTime::now() - Duration::from_secs(48 * 60 * 60);
        std::fs::OpenOptions::new()
            .append(true)
            .open(&stale_path)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let removed = me.sweep(Duration::from_secs(24 * 60 * 60)).await;
        assert_eq!(removed, 1);
        assert!(!stale_path.exists());
        assert!(me.presence_path().exists());
    }

    #[tokio::test]
    async fn test_update_presence_path() {
        let dir = TempDir::new().unwrap();
        let mut transport = transport(&dir, "builder01");
        let original = transport.presence_path().to_path_buf();

        // unchanged identity: no move
        assert!(transport.update_presence_path(&identity("builder01")).is_none());

        let new_identity = HostIdentity {
            host_name: "builder01".to_string(),
            domain_name: None,
            ipv4: Some(std::net::Ipv4Addr::new(10, 0, 0, 5)),
        };
        let old = transport.update_presence_path(&new_identity).unwrap();
        assert_eq!(old, original);
        assert!(transport.presence_path().ends_with("10.0.0.5"));
    }
}

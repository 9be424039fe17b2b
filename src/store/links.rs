use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, warn};

use super::content::{BlobLock, ContentStore};
use super::error::{StoreError, StoreResult};
use super::keys::{validate_segment, ContentHash, LogicalPathId};
use super::locks::KeyedLocks;

/// Proof that the caller holds the lock for one `(namespace, name)` pair.
pub struct NameLock {
    namespace: String,
    name: String,
    logical_id: LogicalPathId,
    _guard: OwnedMutexGuard<()>,
}

impl NameLock {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn logical_id(&self) -> &LogicalPathId {
        &self.logical_id
    }
}

/// A live link as reported by directory listings
#[derive(Debug, Clone, Serialize)]
pub struct LinkEntry {
    pub name: String,
    pub content_hash: ContentHash,
    pub byte_size: u64,
    pub linked_at: DateTime<Utc>,
}

/// Statistics from reconciling markers against links
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub markers_checked: u64,
    pub stale_markers_removed: u64,
    pub blobs_removed: u64,
}

/// Owner of the user-visible namespace directories.
///
/// Each namespace is a directory under `root`; each link is a symlink inside it
/// whose target is the blob's storage path. Lock order is always name, then hash.
pub struct LinkManager {
    root: PathBuf,
    store: Arc<ContentStore>,
    locks: KeyedLocks,
    #[cfg(test)]
    symlink_failure: std::sync::Mutex<Option<io::ErrorKind>>,
}

impl LinkManager {
    pub fn new<P: AsRef<Path>>(root: P, store: Arc<ContentStore>) -> StoreResult<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(StoreError::NotFound(format!(
                "link directory {}",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
            store,
            locks: KeyedLocks::new(),
            #[cfg(test)]
            symlink_failure: std::sync::Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    fn link_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.namespace_dir(namespace).join(name)
    }

    /// Acquire the per-name lock. Validates both segments first.
    pub async fn lock_name(&self, namespace: &str, name: &str) -> StoreResult<NameLock> {
        validate_segment("namespace", namespace)?;
        validate_segment("name", name)?;
        let logical_id = LogicalPathId::new(namespace, name);
        let guard = self.locks.acquire(logical_id.as_str()).await;
        Ok(NameLock {
            namespace: namespace.to_string(),
            name: name.to_string(),
            logical_id,
            _guard: guard,
        })
    }

    // ========================================================================
    // Link operations
    // ========================================================================

    /// Create `namespace/name` pointing at an existing blob.
    pub async fn link(
        &self,
        namespace: &str,
        name: &str,
        hash: &ContentHash,
    ) -> StoreResult<LogicalPathId> {
        let name_lock = self.lock_name(namespace, name).await?;
        let blob_lock = self.store.lock(hash).await;
        if !self.store.contains(hash).await? {
            return Err(StoreError::NotFound(hash.to_string()));
        }
        self.link_locked(&name_lock, &blob_lock).await
    }

    /// Add the reference marker, then the symlink. If the symlink cannot be
    /// created the marker is released again, so no marker outlives a failed link.
    pub(crate) async fn link_locked(
        &self,
        name_lock: &NameLock,
        blob_lock: &BlobLock,
    ) -> StoreResult<LogicalPathId> {
        let path = self.link_path(name_lock.namespace(), name_lock.name());
        if entry_exists(&path).await? {
            return Err(StoreError::NameCollision(display_path(name_lock)));
        }

        tokio::fs::create_dir_all(self.namespace_dir(name_lock.namespace())).await?;

        let logical_id = name_lock.logical_id();
        self.store.create_reference_locked(blob_lock, logical_id)?;

        let target = self.store.blob_path(blob_lock.hash());
        if let Err(e) = self.create_link(&target, &path).await {
            if let Err(rollback) = self.store.release_locked(blob_lock, logical_id).await {
                error!(
                    logical_id = %logical_id,
                    content_hash = %blob_lock.hash(),
                    error = %rollback,
                    "Failed to roll back reference after link failure"
                );
            }
            if e.kind() == io::ErrorKind::AlreadyExists {
                return Err(StoreError::NameCollision(display_path(name_lock)));
            }
            return Err(e.into());
        }

        debug!(
            namespace = %name_lock.namespace(),
            name = %name_lock.name(),
            content_hash = %blob_lock.hash(),
            "Created link"
        );
        Ok(logical_id.clone())
    }

    /// Remove `namespace/name` and release its reference.
    /// Returns the hash the link pointed at.
    pub async fn unlink(&self, namespace: &str, name: &str) -> StoreResult<ContentHash> {
        let name_lock = self.lock_name(namespace, name).await?;
        let hash = self.resolve_locked(&name_lock).await?;

        tokio::fs::remove_file(self.link_path(namespace, name)).await?;

        let blob_lock = self.store.lock(&hash).await;
        let blob_removed = self
            .store
            .release_locked(&blob_lock, name_lock.logical_id())
            .await?;

        debug!(
            namespace = %namespace,
            name = %name,
            content_hash = %hash,
            blob_removed,
            "Removed link"
        );
        Ok(hash)
    }

    pub async fn resolve(&self, namespace: &str, name: &str) -> StoreResult<ContentHash> {
        validate_segment("namespace", namespace)?;
        validate_segment("name", name)?;
        self.read_link(namespace, name).await
    }

    async fn resolve_locked(&self, name_lock: &NameLock) -> StoreResult<ContentHash> {
        self.read_link(name_lock.namespace(), name_lock.name()).await
    }

    pub async fn exists(&self, namespace: &str, name: &str) -> StoreResult<bool> {
        match self.resolve(namespace, name).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Names of every live link in `namespace`, sorted.
    pub async fn list(&self, namespace: &str) -> StoreResult<Vec<String>> {
        validate_segment("namespace", namespace)?;

        let mut entries = match tokio::fs::read_dir(self.namespace_dir(namespace)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_symlink() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_segment("name", &name).is_err() {
                continue;
            }
            match self.read_link(namespace, &name).await {
                Ok(_) => names.push(name),
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        names.sort();
        Ok(names)
    }

    /// Like [`LinkManager::list`], with hash, size and link time for each entry.
    pub async fn list_entries(&self, namespace: &str) -> StoreResult<Vec<LinkEntry>> {
        let mut entries = Vec::new();
        for name in self.list(namespace).await? {
            let path = self.link_path(namespace, &name);
            let hash = match self.read_link(namespace, &name).await {
                Ok(hash) => hash,
                // Removed since listing
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let byte_size = match self.store.size(&hash).await {
                Ok(size) => size,
                Err(StoreError::NotFound(_)) => {
                    warn!(namespace = %namespace, name = %name, content_hash = %hash, "Link points at a missing blob");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let linked_at = match tokio::fs::symlink_metadata(&path).await {
                Ok(meta) => meta.modified().map(DateTime::<Utc>::from)?,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            entries.push(LinkEntry {
                name,
                content_hash: hash,
                byte_size,
                linked_at,
            });
        }
        Ok(entries)
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Remove markers whose link is gone or points at a different blob.
    ///
    /// Such markers are left behind by a crash between adding a marker and
    /// creating its link, or between removing a link and releasing its marker.
    /// Blobs whose last reference goes with them are deleted.
    pub async fn reconcile(&self) -> StoreResult<ReconcileStats> {
        let mut stats = ReconcileStats::default();

        for (hash, logical_id) in self.store.all_references()? {
            stats.markers_checked += 1;

            let Some((namespace, name)) = logical_id.decode() else {
                warn!(logical_id = %logical_id, "Removing marker with undecodable path");
                if self.store.release(&hash, &logical_id).await? {
                    stats.blobs_removed += 1;
                }
                stats.stale_markers_removed += 1;
                continue;
            };

            let live = match self.lock_name(&namespace, &name).await {
                Ok(name_lock) => {
                    let blob_lock = self.store.lock(&hash).await;
                    if !self.store.has_reference(&hash, &logical_id)? {
                        // Released while we were waiting for the locks
                        continue;
                    }
                    let live = matches!(self.resolve_locked(&name_lock).await, Ok(h) if h == hash);
                    if !live && self.store.release_locked(&blob_lock, &logical_id).await? {
                        stats.blobs_removed += 1;
                    }
                    live
                }
                Err(StoreError::InvalidName(_)) => {
                    if self.store.release(&hash, &logical_id).await? {
                        stats.blobs_removed += 1;
                    }
                    false
                }
                Err(e) => return Err(e),
            };

            if !live {
                warn!(
                    namespace = %namespace,
                    name = %name,
                    content_hash = %hash,
                    "Removed stale reference marker"
                );
                stats.stale_markers_removed += 1;
            }
        }

        Ok(stats)
    }

    async fn create_link(&self, target: &Path, link: &Path) -> io::Result<()> {
        if let Some(e) = self.injected_symlink_failure() {
            return Err(e);
        }
        create_symlink(target, link).await
    }

    #[cfg(test)]
    fn injected_symlink_failure(&self) -> Option<io::Error> {
        let kind = self.symlink_failure.lock().unwrap().take()?;
        Some(io::Error::new(kind, "symlink creation failed"))
    }

    #[cfg(not(test))]
    fn injected_symlink_failure(&self) -> Option<io::Error> {
        None
    }

    /// Resolve a link path to the hash of the blob it targets. Anything that is
    /// not a symlink into the blob store counts as not found.
    async fn read_link(&self, namespace: &str, name: &str) -> StoreResult<ContentHash> {
        let not_found = || StoreError::NotFound(format!("{namespace}/{name}"));
        let target = match tokio::fs::read_link(self.link_path(namespace, name)).await {
            Ok(target) => target,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::InvalidInput
                ) =>
            {
                return Err(not_found())
            }
            Err(e) => return Err(e.into()),
        };

        let hash = target
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(ContentHash::parse)
            .ok_or_else(not_found)?;

        if target != self.store.blob_path(&hash) {
            return Err(not_found());
        }
        Ok(hash)
    }
}

fn display_path(name_lock: &NameLock) -> String {
    format!("{}/{}", name_lock.namespace(), name_lock.name())
}

/// True if anything, managed link or not, occupies `path`.
async fn entry_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
async fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
async fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    tokio::fs::symlink_file(target, link).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_stores;

    fn fail_next_symlink(links: &LinkManager, kind: io::ErrorKind) {
        *links.symlink_failure.lock().unwrap() = Some(kind);
    }

    #[tokio::test]
    async fn test_failed_symlink_releases_marker() {
        let dir = tempfile::tempdir().unwrap();
        let (store, links) = test_stores(&dir);
        let hash = store.put(b"content").await.unwrap();
        let logical_id = LogicalPathId::new("docs", "a.txt");

        fail_next_symlink(&links, io::ErrorKind::PermissionDenied);
        let result = links.link("docs", "a.txt", &hash).await;
        assert!(matches!(result, Err(StoreError::Io(_))));

        assert!(!store.has_reference(&hash, &logical_id).unwrap());
        assert_eq!(store.reference_count(&hash).unwrap(), 0);
        assert!(!links.exists("docs", "a.txt").await.unwrap());
        // The last reference went with the rollback
        assert!(!store.contains(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_symlink_keeps_shared_blob() {
        let dir = tempfile::tempdir().unwrap();
        let (store, links) = test_stores(&dir);
        let hash = store.put(b"shared").await.unwrap();
        links.link("docs", "a.txt", &hash).await.unwrap();

        fail_next_symlink(&links, io::ErrorKind::PermissionDenied);
        assert!(links.link("docs", "b.txt", &hash).await.is_err());

        assert_eq!(
            store.references(&hash).unwrap(),
            vec![LogicalPathId::new("docs", "a.txt")]
        );
        assert!(store.contains(&hash).await.unwrap());
        assert_eq!(links.list("docs").await.unwrap(), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn test_symlink_race_is_a_name_collision() {
        let dir = tempfile::tempdir().unwrap();
        let (store, links) = test_stores(&dir);
        let hash = store.put(b"content").await.unwrap();

        fail_next_symlink(&links, io::ErrorKind::AlreadyExists);
        let result = links.link("docs", "a.txt", &hash).await;
        assert!(matches!(result, Err(StoreError::NameCollision(_))));
        assert_eq!(store.reference_count(&hash).unwrap(), 0);

        // The hook fires once
        links.link("docs", "a.txt", &hash).await.unwrap();
        assert_eq!(store.reference_count(&hash).unwrap(), 1);
    }
}

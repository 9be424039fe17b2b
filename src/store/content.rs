use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, instrument, warn};

use super::error::{StoreError, StoreResult};
use super::keys::{ContentHash, LogicalPathId};
use super::locks::KeyedLocks;
use crate::storage::Database;

/// Staging directory for blobs being written. Lives inside the blob root so the
/// final rename never crosses a filesystem boundary.
const TMP_DIR: &str = "tmp";

/// Temp files younger than this are assumed to belong to an in-flight `put`.
pub const TEMP_FILE_GRACE: Duration = Duration::from_secs(15 * 60);

/// Proof that the caller holds the per-hash lock for `hash`.
pub struct BlobLock {
    hash: ContentHash,
    _guard: OwnedMutexGuard<()>,
}

impl BlobLock {
    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }
}

/// Statistics from a garbage collection pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GcStats {
    pub blobs_scanned: u64,
    pub blobs_removed: u64,
    pub bytes_freed: u64,
    pub temp_files_removed: u64,
}

/// Content-addressed blob store.
///
/// Blobs live at `<root>/<first two hex chars>/<hash>`. Liveness is tracked by
/// reference markers in the database; a blob is deleted when its last marker
/// is released. Every step that writes a blob, adds a marker, or removes one
/// runs under the per-hash lock.
pub struct ContentStore {
    root: PathBuf,
    tmp_dir: PathBuf,
    db: Database,
    locks: KeyedLocks,
}

impl ContentStore {
    pub fn open<P: AsRef<Path>>(root: P, db: Database) -> StoreResult<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        // Links store absolute targets, so the root must not depend on the cwd.
        let root = std::fs::canonicalize(root.as_ref())?;
        let tmp_dir = root.join(TMP_DIR);
        std::fs::create_dir_all(&tmp_dir)?;
        Ok(Self {
            root,
            tmp_dir,
            db,
            locks: KeyedLocks::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic storage path for a blob.
    pub fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.as_str();
        self.root.join(&hex[..2]).join(hex)
    }

    /// Acquire the per-hash lock.
    pub async fn lock(&self, hash: &ContentHash) -> BlobLock {
        let guard = self.locks.acquire(hash.as_str()).await;
        BlobLock {
            hash: hash.clone(),
            _guard: guard,
        }
    }

    // ========================================================================
    // Blobs
    // ========================================================================

    /// Store bytes and return their content hash. Existing content is not rewritten.
    pub async fn put(&self, data: &[u8]) -> StoreResult<ContentHash> {
        let hash = ContentHash::compute(data);
        let lock = self.lock(&hash).await;
        self.put_locked(&lock, data).await?;
        Ok(hash)
    }

    /// Write the blob for `lock.hash()` unless it already exists.
    /// Returns `true` if bytes were written.
    #[instrument(skip(self, lock, data), fields(content_hash = %lock.hash()), level = "debug")]
    pub(crate) async fn put_locked(&self, lock: &BlobLock, data: &[u8]) -> StoreResult<bool> {
        debug_assert_eq!(
            &ContentHash::compute(data),
            lock.hash(),
            "blob lock does not match payload"
        );

        let path = self.blob_path(lock.hash());
        if tokio::fs::try_exists(&path).await? {
            debug!("Blob already present, skipping write");
            return Ok(false);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_path = self
            .tmp_dir
            .join(format!("{}.{}.tmp", lock.hash(), uuid::Uuid::new_v4()));

        if let Err(e) = write_synced(&temp_path, data).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        debug!(byte_size = data.len(), "Stored blob");
        Ok(true)
    }

    pub async fn contains(&self, hash: &ContentHash) -> StoreResult<bool> {
        Ok(tokio::fs::try_exists(self.blob_path(hash)).await?)
    }

    /// Read a whole blob into memory.
    pub async fn read(&self, hash: &ContentHash) -> StoreResult<Bytes> {
        match tokio::fs::read(self.blob_path(hash)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Open a blob for streaming. Returns the handle and the blob's size.
    pub async fn open_blob(&self, hash: &ContentHash) -> StoreResult<(tokio::fs::File, u64)> {
        let file = match tokio::fs::File::open(self.blob_path(hash)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(hash.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        Ok((file, size))
    }

    pub async fn size(&self, hash: &ContentHash) -> StoreResult<u64> {
        match tokio::fs::metadata(self.blob_path(hash)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Every blob currently on disk, sorted by hash.
    pub async fn list_blobs(&self) -> StoreResult<Vec<ContentHash>> {
        let mut hashes = Vec::new();
        let mut shards = tokio::fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() || shard.path() == self.tmp_dir {
                continue;
            }
            let mut blobs = tokio::fs::read_dir(shard.path()).await?;
            while let Some(blob) = blobs.next_entry().await? {
                let name = blob.file_name();
                match name.to_str().and_then(ContentHash::parse) {
                    Some(hash) => hashes.push(hash),
                    None => warn!(path = %blob.path().display(), "Unexpected file in blob store"),
                }
            }
        }
        hashes.sort();
        Ok(hashes)
    }

    // ========================================================================
    // Reference markers
    // ========================================================================

    pub async fn create_reference(
        &self,
        hash: &ContentHash,
        logical_id: &LogicalPathId,
    ) -> StoreResult<()> {
        let lock = self.lock(hash).await;
        self.create_reference_locked(&lock, logical_id)
    }

    pub(crate) fn create_reference_locked(
        &self,
        lock: &BlobLock,
        logical_id: &LogicalPathId,
    ) -> StoreResult<()> {
        let hash = lock.hash();
        if !self
            .db
            .insert_reference(hash.as_str(), logical_id.as_str())?
        {
            return Err(StoreError::AlreadyReferenced {
                content_hash: hash.to_string(),
                logical_id: logical_id.to_string(),
            });
        }
        debug!(content_hash = %hash, logical_id = %logical_id, "Created reference");
        Ok(())
    }

    /// Drop one reference. Deletes the blob if it was the last one.
    /// Returns `true` if the blob was removed.
    pub async fn release(
        &self,
        hash: &ContentHash,
        logical_id: &LogicalPathId,
    ) -> StoreResult<bool> {
        let lock = self.lock(hash).await;
        self.release_locked(&lock, logical_id).await
    }

    pub(crate) async fn release_locked(
        &self,
        lock: &BlobLock,
        logical_id: &LogicalPathId,
    ) -> StoreResult<bool> {
        let hash = lock.hash();
        if !self
            .db
            .remove_reference(hash.as_str(), logical_id.as_str())?
        {
            warn!(content_hash = %hash, logical_id = %logical_id, "Released a reference that did not exist");
        }

        if self.db.has_references(hash.as_str())? {
            return Ok(false);
        }

        let removed = self.remove_blob_locked(lock).await?;
        if removed {
            debug!(content_hash = %hash, "Removed last reference, deleted blob");
        }
        Ok(removed)
    }

    pub fn has_reference(
        &self,
        hash: &ContentHash,
        logical_id: &LogicalPathId,
    ) -> StoreResult<bool> {
        Ok(self
            .db
            .reference_exists(hash.as_str(), logical_id.as_str())?)
    }

    /// Live references to `hash`, recomputed from the markers.
    pub fn reference_count(&self, hash: &ContentHash) -> StoreResult<usize> {
        Ok(self.db.references_for(hash.as_str())?.len())
    }

    pub fn references(&self, hash: &ContentHash) -> StoreResult<Vec<LogicalPathId>> {
        Ok(self
            .db
            .references_for(hash.as_str())?
            .into_iter()
            .map(LogicalPathId::from_encoded)
            .collect())
    }

    /// Every marker in the store.
    pub fn all_references(&self) -> StoreResult<Vec<(ContentHash, LogicalPathId)>> {
        let mut markers = Vec::new();
        for (hash, id) in self.db.all_references()? {
            match ContentHash::parse(&hash) {
                Some(hash) => markers.push((hash, LogicalPathId::from_encoded(id))),
                None => warn!(content_hash = %hash, logical_id = %id, "Skipping marker with malformed hash"),
            }
        }
        Ok(markers)
    }

    // ========================================================================
    // Garbage collection
    // ========================================================================

    pub async fn collect_garbage(&self) -> StoreResult<GcStats> {
        self.collect_garbage_older_than(TEMP_FILE_GRACE).await
    }

    /// Delete unreferenced blobs and temp files older than `temp_grace`.
    pub async fn collect_garbage_older_than(&self, temp_grace: Duration) -> StoreResult<GcStats> {
        let mut stats = GcStats::default();

        for hash in self.list_blobs().await? {
            stats.blobs_scanned += 1;
            let lock = self.lock(&hash).await;
            if self.db.has_references(hash.as_str())? {
                continue;
            }
            let size = match self.size(&hash).await {
                Ok(size) => size,
                Err(StoreError::NotFound(_)) => 0,
                Err(e) => return Err(e),
            };
            if self.remove_blob_locked(&lock).await? {
                stats.blobs_removed += 1;
                stats.bytes_freed += size;
                debug!(content_hash = %hash, "Collected unreferenced blob");
            }
        }

        let now = SystemTime::now();
        let mut temps = tokio::fs::read_dir(&self.tmp_dir).await?;
        while let Some(entry) = temps.next_entry().await? {
            let modified = entry.metadata().await?.modified()?;
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age < temp_grace {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => stats.temp_files_removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(stats)
    }

    /// Delete the blob if no marker references it.
    pub(crate) async fn discard_if_unreferenced_locked(
        &self,
        lock: &BlobLock,
    ) -> StoreResult<bool> {
        if self.db.has_references(lock.hash().as_str())? {
            return Ok(false);
        }
        self.remove_blob_locked(lock).await
    }

    async fn remove_blob_locked(&self, lock: &BlobLock) -> StoreResult<bool> {
        match tokio::fs::remove_file(self.blob_path(lock.hash())).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

async fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}

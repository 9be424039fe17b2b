//! The file manager facade used by the HTTP layer.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::info;

use crate::config::{StorageConfig, UploadPolicy};
use crate::scanner::Scanner;
use crate::storage::Database;
use crate::store::{
    ContentHash, ContentStore, GcStats, LinkEntry, LinkManager, ReconcileStats, StoreResult,
};
use crate::upload::{TransportStatus, UploadOutcome, UploadPipeline, UploadRequest};

/// Statistics from a startup recovery pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    pub reconcile: ReconcileStats,
    pub gc: GcStats,
}

/// Ties the blob store, the link namespace and the upload pipeline together.
pub struct FileManager {
    store: Arc<ContentStore>,
    links: Arc<LinkManager>,
    pipeline: UploadPipeline,
    policy: UploadPolicy,
}

impl FileManager {
    /// Open the database and blob store under `data_dir` and the link
    /// namespace at `target_dir`.
    pub fn open(
        storage: &StorageConfig,
        policy: UploadPolicy,
        scanner: Option<Arc<dyn Scanner>>,
    ) -> StoreResult<Self> {
        let db = Database::open(&storage.data_dir)?;
        let store = Arc::new(ContentStore::open(storage.blob_dir(), db)?);
        let links = Arc::new(LinkManager::new(&storage.target_dir, Arc::clone(&store))?);
        Ok(Self::new(store, links, policy, scanner))
    }

    pub fn new(
        store: Arc<ContentStore>,
        links: Arc<LinkManager>,
        policy: UploadPolicy,
        scanner: Option<Arc<dyn Scanner>>,
    ) -> Self {
        let pipeline = UploadPipeline::new(&policy, Arc::clone(&store), Arc::clone(&links), scanner);
        Self {
            store,
            links,
            pipeline,
            policy,
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    pub fn content_store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn link_manager(&self) -> &Arc<LinkManager> {
        &self.links
    }

    pub fn pipeline(&self) -> &UploadPipeline {
        &self.pipeline
    }

    // ========================================================================
    // File operations
    // ========================================================================

    pub async fn upload(
        &self,
        namespace: &str,
        name: &str,
        payload: &[u8],
        declared_size: Option<u64>,
        declared_status: Option<TransportStatus>,
    ) -> Result<ContentHash, UploadOutcome> {
        self.pipeline
            .run(&UploadRequest {
                namespace,
                name,
                payload,
                declared_size,
                declared_status,
            })
            .await
    }

    /// Remove a link. The blob goes with it if this was its last reference.
    pub async fn delete(&self, namespace: &str, name: &str) -> StoreResult<ContentHash> {
        self.links.unlink(namespace, name).await
    }

    pub async fn fetch(&self, namespace: &str, name: &str) -> StoreResult<Bytes> {
        let hash = self.links.resolve(namespace, name).await?;
        self.store.read(&hash).await
    }

    /// Open a linked file for streaming. Returns the handle and its size.
    pub async fn open_file(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<(tokio::fs::File, u64)> {
        let hash = self.links.resolve(namespace, name).await?;
        self.store.open_blob(&hash).await
    }

    pub async fn list(&self, namespace: &str) -> StoreResult<Vec<String>> {
        self.links.list(namespace).await
    }

    pub async fn list_entries(&self, namespace: &str) -> StoreResult<Vec<LinkEntry>> {
        self.links.list_entries(namespace).await
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Drop markers without a matching link, then collect unreferenced blobs.
    pub async fn recover(&self) -> StoreResult<RecoveryStats> {
        let reconcile = self.links.reconcile().await?;
        let gc = self.store.collect_garbage().await?;
        info!(
            markers_checked = reconcile.markers_checked,
            stale_markers_removed = reconcile.stale_markers_removed,
            blobs_removed = reconcile.blobs_removed + gc.blobs_removed,
            temp_files_removed = gc.temp_files_removed,
            "Recovery complete"
        );
        Ok(RecoveryStats { reconcile, gc })
    }

    pub async fn collect_garbage(&self) -> StoreResult<GcStats> {
        let stats = self.store.collect_garbage().await?;
        info!(
            blobs_scanned = stats.blobs_scanned,
            blobs_removed = stats.blobs_removed,
            bytes_freed = stats.bytes_freed,
            temp_files_removed = stats.temp_files_removed,
            "Garbage collection complete"
        );
        Ok(stats)
    }
}

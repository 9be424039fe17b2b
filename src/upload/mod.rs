//! Upload validation and commit.
//!
//! An upload runs through an ordered list of [`Stage`]s. The first stage that
//! rejects ends the run and nothing is written. Once every stage has passed,
//! the payload is stored and linked while holding the name lock and the hash
//! lock.

pub mod image;
pub mod outcome;
pub mod stages;

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::UploadPolicy;
use crate::scanner::Scanner;
use crate::store::{ContentHash, ContentStore, LinkManager};

pub use outcome::UploadOutcome;
pub use stages::Stage;

use stages::{
    ExtensionCheck, ImageCheck, NameCollisionCheck, SizeCheck, TransportSanity, VirusScan,
};

/// Status the transport attached to a received file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Ok,
    NoFile,
    SizeLimitExceeded,
    Partial,
    Other(u16),
}

/// One uploaded file as handed over by the transport.
#[derive(Debug, Clone, Copy)]
pub struct UploadRequest<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
    pub payload: &'a [u8],
    pub declared_size: Option<u64>,
    pub declared_status: Option<TransportStatus>,
}

pub struct UploadPipeline {
    stages: Vec<Box<dyn Stage>>,
    store: Arc<ContentStore>,
    links: Arc<LinkManager>,
}

impl UploadPipeline {
    /// Build the stage list for `policy`. Image and scan stages are only
    /// included when the policy asks for them.
    pub fn new(
        policy: &UploadPolicy,
        store: Arc<ContentStore>,
        links: Arc<LinkManager>,
        scanner: Option<Arc<dyn Scanner>>,
    ) -> Self {
        let mut stages: Vec<Box<dyn Stage>> = vec![
            Box::new(TransportSanity {
                max_file_size: policy.max_file_size(),
            }),
            Box::new(ExtensionCheck {
                allowed: policy.allowed_extensions().clone(),
            }),
        ];
        if policy.image_only() {
            stages.push(Box::new(ImageCheck));
        }
        stages.push(Box::new(NameCollisionCheck {
            links: Arc::clone(&links),
        }));
        stages.push(Box::new(SizeCheck {
            max_file_size: policy.max_file_size(),
        }));
        if policy.scan_enabled() {
            stages.push(Box::new(VirusScan { scanner }));
        }

        Self {
            stages,
            store,
            links,
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Validate and commit one upload. Returns the hash of the stored content.
    pub async fn run(&self, upload: &UploadRequest<'_>) -> Result<ContentHash, UploadOutcome> {
        for stage in &self.stages {
            if let Err(outcome) = stage.check(upload).await {
                if outcome.is_fault() {
                    error!(
                        stage = stage.name(),
                        namespace = %upload.namespace,
                        name = %upload.name,
                        error = %outcome,
                        "Upload stage failed"
                    );
                } else {
                    warn!(
                        stage = stage.name(),
                        namespace = %upload.namespace,
                        name = %upload.name,
                        reason = %outcome,
                        "Upload rejected"
                    );
                }
                return Err(outcome);
            }
        }

        match self.commit(upload).await {
            Ok(hash) => {
                info!(
                    namespace = %upload.namespace,
                    name = %upload.name,
                    content_hash = %hash,
                    byte_size = upload.payload.len(),
                    "Upload stored"
                );
                Ok(hash)
            }
            Err(outcome) => {
                if outcome.is_fault() {
                    error!(
                        namespace = %upload.namespace,
                        name = %upload.name,
                        error = %outcome,
                        "Upload commit failed"
                    );
                } else {
                    warn!(
                        namespace = %upload.namespace,
                        name = %upload.name,
                        reason = %outcome,
                        "Upload rejected at commit"
                    );
                }
                Err(outcome)
            }
        }
    }

    /// Store and link under the name lock, then the hash lock. A blob written
    /// here is discarded again if linking fails and nothing else references it;
    /// if even that fails it is left for garbage collection.
    async fn commit(&self, upload: &UploadRequest<'_>) -> Result<ContentHash, UploadOutcome> {
        let name_lock = self.links.lock_name(upload.namespace, upload.name).await?;

        let hash = ContentHash::compute(upload.payload);
        let blob_lock = self.store.lock(&hash).await;

        let written = self.store.put_locked(&blob_lock, upload.payload).await?;
        debug!(content_hash = %hash, written, "Blob ready for linking");

        if let Err(e) = self.links.link_locked(&name_lock, &blob_lock).await {
            if written {
                if let Err(discard) = self.store.discard_if_unreferenced_locked(&blob_lock).await {
                    warn!(content_hash = %hash, error = %discard, "Failed to discard unlinked blob");
                }
            }
            return Err(e.into());
        }
        Ok(hash)
    }
}

//! cas-file-manager - content-addressed file storage behind named links
//!
//! This crate provides file upload, listing, download and deletion with:
//! - Deduplicated blob storage keyed by SHA-256 content hash
//! - Human-readable `namespace/name` symlinks into the blob store
//! - redb reference markers deciding when a blob can be deleted
//! - An ordered upload pipeline (extension, image, size, virus scan checks)
//! - REST API with multipart upload support

pub mod api;
pub mod config;
pub mod manager;
pub mod scanner;
pub mod storage;
pub mod store;
pub mod upload;
#[cfg(test)]
pub mod testutil;

use config::Config;
use manager::FileManager;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub manager: FileManager,
}

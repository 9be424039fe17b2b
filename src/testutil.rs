//! Shared test helpers for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Config, NodeConfig, ScannerConfig, StorageConfig, UploadPolicy};
use crate::manager::FileManager;
use crate::scanner::{ScanVerdict, Scanner};
use crate::storage::Database;
use crate::store::{ContentStore, LinkManager};
use crate::AppState;

/// Scanner that always answers with the same verdict and counts its calls.
pub struct StubScanner {
    verdict: ScanVerdict,
    calls: AtomicUsize,
}

impl StubScanner {
    pub fn new(verdict: ScanVerdict) -> Self {
        Self {
            verdict,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scanner for StubScanner {
    async fn scan(&self, _data: &[u8]) -> ScanVerdict {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.verdict.clone()
    }
}

fn storage_config(temp_dir: &tempfile::TempDir) -> StorageConfig {
    let storage = StorageConfig {
        data_dir: temp_dir.path().join("data"),
        target_dir: temp_dir.path().join("files"),
    };
    std::fs::create_dir_all(&storage.target_dir).expect("Failed to create test link directory");
    storage
}

/// A content store and link manager rooted in `temp_dir`.
pub fn test_stores(temp_dir: &tempfile::TempDir) -> (Arc<ContentStore>, Arc<LinkManager>) {
    let storage = storage_config(temp_dir);
    let db = Database::open(&storage.data_dir).expect("Failed to open test database");
    let store =
        Arc::new(ContentStore::open(storage.blob_dir(), db).expect("Failed to open test store"));
    let links = Arc::new(
        LinkManager::new(&storage.target_dir, Arc::clone(&store))
            .expect("Failed to create test link manager"),
    );
    (store, links)
}

/// Create a test AppState with the given policy and scanner.
pub fn test_state_with(
    temp_dir: &tempfile::TempDir,
    policy: UploadPolicy,
    scanner: Option<Arc<dyn Scanner>>,
) -> Arc<AppState> {
    let storage = storage_config(temp_dir);
    let manager = FileManager::open(&storage, policy.clone(), scanner)
        .expect("Failed to open test file manager");

    let config = Config {
        node: NodeConfig {
            bind_address: "127.0.0.1:0".to_string(),
        },
        storage,
        policy,
        scanner: ScannerConfig::default(),
    };

    Arc::new(AppState { config, manager })
}

/// Create a test AppState with the default policy and no scanner.
pub fn test_state(temp_dir: &tempfile::TempDir) -> Arc<AppState> {
    test_state_with(temp_dir, UploadPolicy::default(), None)
}

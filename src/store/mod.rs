//! Content-addressed blob storage and the logical link namespace.
//!
//! - [`ContentStore`] owns blob bytes and reference markers
//! - [`LinkManager`] owns the namespace directories of symlinks into the store
//!
//! A blob is written once per distinct content hash and deleted when its last
//! reference marker is released. Markers and links are only ever changed under
//! the per-name lock followed by the per-hash lock.

mod content;
mod error;
mod keys;
mod links;
mod locks;

pub use content::{BlobLock, ContentStore, GcStats, TEMP_FILE_GRACE};
pub use error::{StoreError, StoreResult};
pub use keys::{validate_segment, ContentHash, LogicalPathId, MAX_SEGMENT_LEN};
pub use links::{LinkEntry, LinkManager, NameLock, ReconcileStats};
pub use locks::KeyedLocks;

use redb::ReadableTable;

use super::db::{Database, DatabaseError};
use super::tables::*;

/// Separator between the content hash and the logical path id in a marker key.
/// Content hashes are hex, so the first `/` always ends the hash.
const KEY_SEPARATOR: char = '/';

fn marker_key(content_hash: &str, logical_id: &str) -> String {
    format!("{content_hash}{KEY_SEPARATOR}{logical_id}")
}

/// Half-open key range covering every marker of `content_hash`.
/// `0` is the character directly after `/`.
fn prefix_range(content_hash: &str) -> (String, String) {
    (format!("{content_hash}/"), format!("{content_hash}0"))
}

impl Database {
    // ========================================================================
    // Reference markers
    // ========================================================================

    /// Insert a marker. Returns `false` (and writes nothing) if it already exists.
    pub fn insert_reference(
        &self,
        content_hash: &str,
        logical_id: &str,
    ) -> Result<bool, DatabaseError> {
        debug_assert!(!content_hash.is_empty(), "content hash must not be empty");
        debug_assert!(!logical_id.is_empty(), "logical id must not be empty");

        let key = marker_key(content_hash, logical_id);
        let write_txn = self.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(REFERENCES)?;
            let existed = table.get(key.as_str())?.is_some();
            if !existed {
                table.insert(key.as_str(), ())?;
            }
            existed
        };

        if existed {
            write_txn.abort()?;
            return Ok(false);
        }
        write_txn.commit()?;
        Ok(true)
    }

    /// Remove a marker. Returns `false` if there was nothing to remove.
    pub fn remove_reference(
        &self,
        content_hash: &str,
        logical_id: &str,
    ) -> Result<bool, DatabaseError> {
        let key = marker_key(content_hash, logical_id);
        let write_txn = self.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(REFERENCES)?;
            let removed = table.remove(key.as_str())?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Check whether a specific marker exists
    pub fn reference_exists(
        &self,
        content_hash: &str,
        logical_id: &str,
    ) -> Result<bool, DatabaseError> {
        let key = marker_key(content_hash, logical_id);
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(REFERENCES)?;
        Ok(table.get(key.as_str())?.is_some())
    }

    /// Check whether any marker remains for `content_hash`.
    /// Stops at the first key of the range.
    pub fn has_references(&self, content_hash: &str) -> Result<bool, DatabaseError> {
        let (start, end) = prefix_range(content_hash);
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(REFERENCES)?;
        let mut range = table.range::<&str>(start.as_str()..end.as_str())?;
        let found = range.next().transpose()?.is_some();
        Ok(found)
    }

    /// Logical path ids of every marker for `content_hash`, in key order
    pub fn references_for(&self, content_hash: &str) -> Result<Vec<String>, DatabaseError> {
        let (start, end) = prefix_range(content_hash);
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(REFERENCES)?;

        let mut ids = Vec::new();
        for result in table.range::<&str>(start.as_str()..end.as_str())? {
            let (key, _) = result?;
            if let Some((_, id)) = key.value().split_once(KEY_SEPARATOR) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    /// Every marker in the database as `(content_hash, logical_id)` pairs
    pub fn all_references(&self) -> Result<Vec<(String, String)>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(REFERENCES)?;

        let mut markers = Vec::new();
        for result in table.iter()? {
            let (key, _) = result?;
            if let Some((hash, id)) = key.value().split_once(KEY_SEPARATOR) {
                markers.push((hash.to_string(), id.to_string()));
            }
        }
        Ok(markers)
    }
}

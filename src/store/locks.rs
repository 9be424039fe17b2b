//! Per-key async mutual exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Entries are pruned once the table grows past this many keys.
const MIN_PRUNE_THRESHOLD: usize = 64;

/// A table of async mutexes keyed by string.
///
/// The table only holds weak handles: a key's mutex lives exactly as long as
/// someone holds or waits for it, and dead entries are swept out as the table grows.
#[derive(Debug)]
pub struct KeyedLocks {
    inner: Mutex<LockTable>,
}

#[derive(Debug)]
struct LockTable {
    entries: HashMap<String, Weak<AsyncMutex<()>>>,
    prune_at: usize,
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LockTable {
                entries: HashMap::new(),
                prune_at: MIN_PRUNE_THRESHOLD,
            }),
        }
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

            if table.entries.len() >= table.prune_at {
                table.entries.retain(|_, weak| weak.strong_count() > 0);
                table.prune_at = (table.entries.len() * 2).max(MIN_PRUNE_THRESHOLD);
            }

            match table.entries.get(key).and_then(Weak::upgrade) {
                Some(mutex) => mutex,
                None => {
                    let mutex = Arc::new(AsyncMutex::new(()));
                    table
                        .entries
                        .insert(key.to_string(), Arc::downgrade(&mutex));
                    mutex
                }
            }
        };

        mutex.lock_owned().await
    }

    /// Number of keys currently held or awaited.
    pub fn active(&self) -> usize {
        let table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        table
            .entries
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("same").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_idle_entries_are_pruned() {
        let locks = KeyedLocks::new();
        for i in 0..(MIN_PRUNE_THRESHOLD * 3) {
            let _guard = locks.acquire(&format!("key-{i}")).await;
        }
        assert_eq!(locks.active(), 0);

        let table = locks.inner.lock().unwrap();
        assert!(table.entries.len() <= MIN_PRUNE_THRESHOLD * 2);
    }
}

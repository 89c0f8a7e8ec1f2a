//! In-process keyed mutex registry with reference counting.
//!
//! Mirrors the original `nslock.py` module: a global namespace of locks
//! keyed by an arbitrary string (typically a cache path), used to
//! coalesce concurrent work on the same logical key. `dashmap` replaces
//! the original's single `threading.Lock`-guarded dict with a sharded
//! map, so the "registry mutex" the spec describes is, per shard, always
//! held only briefly (find-or-create, refcount bump) and never across a
//! suspension point.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use metrics::gauge;
use tokio::sync::Mutex;

struct Entry {
    mutex: Arc<Mutex<()>>,
    refcount: usize,
}

/// Process-wide registry of namespaced locks. There is exactly one
/// instance per process, shared via `Arc` by every component that needs
/// to coalesce on cache paths or block keys.
#[derive(Default)]
pub struct NamespaceLock {
    entries: DashMap<String, Entry>,
}

/// RAII guard for one `acquire`d namespace. Dropping it (on any exit
/// path, including a panic unwind) releases the per-key mutex and
/// decrements the registry refcount, removing the entry when it hits
/// zero.
pub struct NamespaceGuard<'a> {
    registry: &'a NamespaceLock,
    key: String,
    // Holds the per-key mutex permit; dropped before the registry
    // bookkeeping below runs in `Drop`.
    _permit: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl NamespaceLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, blocking until it is free. Registering
    /// the waiter (incrementing refcount) happens under a short-lived
    /// per-shard lock before the (potentially long) wait on the per-key
    /// mutex, so `list()` always reflects current waiters, not just
    /// current holders.
    pub async fn acquire(&self, key: &str) -> NamespaceGuard<'_> {
        let per_key = {
            let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
                mutex: Arc::new(Mutex::new(())),
                refcount: 0,
            });
            entry.refcount += 1;
            gauge!("tileproxy_namespace_lock_refcount", "key" => key.to_string()).set(entry.refcount as f64);
            Arc::clone(&entry.mutex)
        };

        let permit = per_key.lock_owned().await;

        NamespaceGuard {
            registry: self,
            key: key.to_string(),
            _permit: Some(permit),
        }
    }

    fn release(&self, key: &str) {
        let mut remove = false;
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.refcount -= 1;
            gauge!("tileproxy_namespace_lock_refcount", "key" => key.to_string()).set(entry.refcount as f64);
            if entry.refcount == 0 {
                remove = true;
            }
        }
        if remove {
            self.entries.remove(key);
        }
    }

    /// Snapshot of key -> refcount for every namespace currently held or
    /// waited on. When `sorted_by_refcount` is true, entries are ordered
    /// descending by refcount (ties broken by key for a stable order
    /// within one snapshot).
    pub fn list(&self, sorted_by_refcount: bool) -> Vec<(String, usize)> {
        let mut snapshot: Vec<(String, usize)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().refcount))
            .collect();

        if sorted_by_refcount {
            snapshot.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        } else {
            snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        }
        snapshot
    }

    /// Convenience accessor returning the same data as a map, used by
    /// callers that only need refcount lookups rather than ordering.
    pub fn snapshot_map(&self) -> HashMap<String, usize> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().refcount))
            .collect()
    }
}

impl Drop for NamespaceGuard<'_> {
    fn drop(&mut self) {
        self._permit = None;
        self.registry.release(&self.key);
    }
}

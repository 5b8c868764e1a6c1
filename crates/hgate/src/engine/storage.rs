// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-worker indexed storage.
//!
//! Subsystems that need worker-local state (e.g. a parsed-query classifier
//! cache) obtain an integer key once at registration and store their data
//! under it on every worker. Teardown invokes each deleter exactly once and
//! reports the bytes released.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-global key allocator. Keys are never reused.
static NEXT_KEY: AtomicU64 = AtomicU64::new(0);

/// Allocate a storage key for a subsystem. Call once at subsystem
/// registration, before workers start.
pub fn create_key() -> StorageKey {
    StorageKey(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
}

/// Opaque index into every worker's [`IndexedStorage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageKey(u64);

/// Reports the heap bytes owned by an entry, for the memory telemetry of
/// the admin surface.
pub type Sizer = fn(&dyn Any) -> usize;

struct Entry {
    data: Box<dyn Any + Send>,
    sizer: Option<Sizer>,
}

/// Integer-indexed storage with deleters and sizers.
#[derive(Default)]
pub struct IndexedStorage {
    slots: Vec<Option<Entry>>,
}

impl IndexedStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `data` under `key`, replacing any previous entry (its drop
    /// runs immediately).
    pub fn store<D: Any + Send>(&mut self, key: StorageKey, data: D, sizer: Option<Sizer>) {
        let index = key.0 as usize;
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        self.slots[index] = Some(Entry {
            data: Box::new(data),
            sizer,
        });
    }

    pub fn get<D: Any>(&self, key: StorageKey) -> Option<&D> {
        self.slots
            .get(key.0 as usize)?
            .as_ref()?
            .data
            .downcast_ref()
    }

    pub fn get_mut<D: Any>(&mut self, key: StorageKey) -> Option<&mut D> {
        self.slots
            .get_mut(key.0 as usize)?
            .as_mut()?
            .data
            .downcast_mut()
    }

    /// Total bytes reported by the entry sizers.
    pub fn size(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter_map(|entry| entry.sizer.map(|sizer| sizer(entry.data.as_ref())))
            .sum()
    }

    /// Drop every entry, in registration order, and report the bytes
    /// released. The vector is empty afterwards.
    pub fn clear(&mut self) -> usize {
        let released = self.size();
        self.slots.clear();
        released
    }
}

impl Drop for IndexedStorage {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_store_and_get() {
        let key = create_key();
        let mut storage = IndexedStorage::new();
        storage.store(key, vec![1u32, 2, 3], None);

        assert_eq!(storage.get::<Vec<u32>>(key), Some(&vec![1, 2, 3]));
        storage.get_mut::<Vec<u32>>(key).unwrap().push(4);
        assert_eq!(storage.get::<Vec<u32>>(key).unwrap().len(), 4);
    }

    #[test]
    fn test_sizer_accounting() {
        fn vec_sizer(data: &dyn Any) -> usize {
            data.downcast_ref::<Vec<u8>>().map_or(0, |v| v.capacity())
        }

        let key = create_key();
        let mut storage = IndexedStorage::new();
        storage.store(key, vec![0u8; 128], Some(vec_sizer));

        assert_eq!(storage.size(), 128);
        assert_eq!(storage.clear(), 128);
        assert_eq!(storage.size(), 0);
        assert!(storage.get::<Vec<u8>>(key).is_none());
    }

    #[test]
    fn test_clear_runs_each_deleter_once() {
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let keys = [create_key(), create_key()];
        let mut storage = IndexedStorage::new();
        for key in keys {
            storage.store(key, Counted(Arc::clone(&drops)), None);
        }

        storage.clear();
        assert_eq!(drops.load(Ordering::Relaxed), 2);
        storage.clear();
        assert_eq!(drops.load(Ordering::Relaxed), 2, "deleters run exactly once");
    }

    #[test]
    fn test_replace_drops_previous() {
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let key = create_key();
        let mut storage = IndexedStorage::new();
        storage.store(key, Counted(Arc::clone(&drops)), None);
        storage.store(key, Counted(Arc::clone(&drops)), None);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }
}

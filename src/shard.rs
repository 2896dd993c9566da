//! One shard: a reader-writer-locked index of slot handles.
//!
//! The map stores only handles; probes read keys out of the pool entries,
//! so an entry's stored key is the key it is reachable under by
//! construction. Writers are exclusive, and the write lock is what makes
//! "observe refcount, then reclaim" sequences atomic from the table's
//! point of view.

use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};

use hashbrown::HashTable;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::pool::{Handle, SlotPool};

pub(crate) struct Shard {
    map: RwLock<ShardMap>,
}

impl Shard {
    pub(crate) fn new() -> Self {
        Self {
            map: RwLock::new(ShardMap {
                index: HashTable::new(),
            }),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, ShardMap> {
        self.map.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, ShardMap> {
        self.map.write()
    }
}

pub(crate) struct ShardMap {
    index: HashTable<Handle>,
}

impl ShardMap {
    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn find<K, Q>(&self, pool: &SlotPool<K>, hash: u64, key: &Q) -> Option<Handle>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        self.index
            .find(hash, |&h| {
                pool.get(h)
                    .map(|e| e.key().borrow() == key)
                    .unwrap_or(false)
            })
            .copied()
    }

    /// Insert a handle the caller has verified is not present. Key
    /// uniqueness within the shard is the caller's invariant.
    pub(crate) fn insert<K, S>(&mut self, pool: &SlotPool<K>, hasher: &S, hash: u64, handle: Handle)
    where
        K: Hash,
        S: BuildHasher,
    {
        self.index.insert_unique(hash, handle, |&h| {
            let entry = pool.get(h).expect("mapped handle must be live");
            hasher.hash_one(entry.key())
        });
    }

    pub(crate) fn remove(&mut self, hash: u64, handle: Handle) -> bool {
        match self.index.find_entry(hash, |&h| h == handle) {
            Ok(occupied) => {
                occupied.remove();
                true
            }
            Err(_) => false,
        }
    }

    /// First entry with a zero refcount, if any. Advisory: the caller holds
    /// only the read lock, so the count must be re-checked under the write
    /// lock before reclaiming.
    pub(crate) fn scan_quiescent<K>(&self, pool: &SlotPool<K>) -> Option<Handle> {
        self.index
            .iter()
            .copied()
            .find(|&h| pool.get(h).map(|e| e.accessor_count() == 0).unwrap_or(false))
    }
}

//! Generic machinery shared by the keyed table variants.
//!
//! A table is a fixed set of shards over one slot pool. Lookups acquire
//! under the shard read lock; creation, deletion and reclaim run under the
//! write lock. The pool's exhaustion hook is wired back to the table at
//! construction (`Arc::new_cyclic`), so eviction of a quiescent entry runs
//! on whichever thread hit the empty free list; there is no background
//! reaper.
//!
//! Lock order is shard, then pool free list. The create path allocates its
//! slot *before* taking the shard write lock, which is what lets the
//! evictor take shard locks without deadlocking against its own caller.

use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLockWriteGuard;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::pool::{EntryRef, Handle, SlotPool};
use crate::reentrancy;
use crate::refcount::RefCount;
use crate::shard::{Shard, ShardMap};

/// Construction parameters common to every table variant.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Diagnostic name, reported by `name()` and used in log events.
    pub name: String,
    /// Size in bytes of one slot, entry header included.
    pub object_size: usize,
    /// Maximum number of live slots.
    pub object_limit: u32,
    /// Number of (map, lock) shards partitioning the key space.
    pub shard_count: u32,
}

/// Runs after a new entry is inserted, with the shard write lock held.
/// Must be brief and must not call back into the same table.
pub type PrepareNewFn<K> = Box<dyn Fn(EntryRef<'_, K>) + Send + Sync>;

/// Runs right before a reclaimed entry's slot returns to the pool, with
/// the shard write lock held. Same restrictions as [`PrepareNewFn`].
pub type BeforeReleaseFn<K> = Box<dyn Fn(EntryRef<'_, K>) + Send + Sync>;

pub(crate) struct TableCore<K, S> {
    name: String,
    hasher: S,
    shards: Box<[Shard]>,
    pool: SlotPool<K>,
    prepare_new: Option<PrepareNewFn<K>>,
    before_release: Option<BeforeReleaseFn<K>>,
    /// Whether the last release reclaims the entry, or parks it quiescent
    /// in the map for reuse/eviction.
    reclaim_on_release: AtomicBool,
}

/// Result of the create slow path.
pub(crate) enum GetOrCreate<'t> {
    /// Lost the insert race; the existing entry was acquired.
    Found(Handle),
    /// A new entry was inserted. The lock must be finished (dropped) to
    /// perform the final acquire and release the shard write lock.
    Created(Handle, NewEntryLock<'t>),
}

/// Holds the shard write lock over a freshly created entry so the creator
/// can populate the payload before any other thread can look it up.
/// Dropping it performs the final acquire and releases the lock on every
/// path, including unwinding.
pub(crate) struct NewEntryLock<'t> {
    _guard: RwLockWriteGuard<'t, ShardMap>,
    refs: &'t RefCount,
}

impl Drop for NewEntryLock<'_> {
    fn drop(&mut self) {
        // A created entry starts with two references: the creator's base
        // reference and this final acquire.
        self.refs.acquire();
    }
}

impl<K, S> TableCore<K, S>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Default + Send + Sync + 'static,
{
    pub(crate) fn new(
        config: TableConfig,
        hasher: S,
        prepare_new: Option<PrepareNewFn<K>>,
        before_release: Option<BeforeReleaseFn<K>>,
        reclaim_on_release: bool,
    ) -> Result<Arc<Self>> {
        if config.shard_count == 0 {
            return Err(Error::InvalidConfig {
                reason: "shard_count must be >= 1".into(),
            });
        }
        let pool = SlotPool::new(config.object_size, config.object_limit)?;
        let shards: Box<[Shard]> = (0..config.shard_count).map(|_| Shard::new()).collect();
        debug!(
            "table '{}' initialized: {} shards, {} objects of {} bytes",
            config.name, config.shard_count, config.object_limit, config.object_size
        );
        Ok(Arc::new_cyclic(|weak: &Weak<Self>| {
            let evictor = weak.clone();
            pool.set_on_exhausted(Box::new(move || {
                if let Some(core) = evictor.upgrade() {
                    core.evict_one();
                }
            }));
            Self {
                name: config.name,
                hasher,
                shards,
                pool,
                prepare_new,
                before_release,
                reclaim_on_release: AtomicBool::new(reclaim_on_release),
            }
        }))
    }

    fn addr(&self) -> usize {
        self as *const Self as *const () as usize
    }

    fn hash_of<Q: ?Sized + Hash>(&self, key: &Q) -> u64 {
        self.hasher.hash_one(key)
    }

    fn shard_for(&self, hash: u64) -> &Shard {
        &self.shards[(hash % self.shards.len() as u64) as usize]
    }

    /// Look up `key` and acquire the entry under the shard read lock.
    pub(crate) fn try_get<Q>(&self, key: &Q) -> Option<Handle>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        reentrancy::debug_assert_not_reentrant(self.addr());
        let hash = self.hash_of(key);
        let map = self.shard_for(hash).read();
        let handle = map.find(&self.pool, hash, key)?;
        self.pool
            .get(handle)
            .expect("mapped handle must be live")
            .acquire();
        Some(handle)
    }

    /// Create slow path. Callers run the fast path (`try_get`) first.
    pub(crate) fn get_or_create(&self, key: K) -> Result<GetOrCreate<'_>> {
        reentrancy::debug_assert_not_reentrant(self.addr());
        // Allocate before taking the write lock: the evictor runs on this
        // thread inside `alloc` and takes shard locks of its own.
        let slot = self.pool.alloc()?;
        let hash = self.hash_of(&key);
        let mut map = self.shard_for(hash).write();
        if let Some(existing) = map.find(&self.pool, hash, &key) {
            // Lost the race since the fast path; keep the existing entry.
            self.pool
                .get(existing)
                .expect("mapped handle must be live")
                .acquire();
            // The surplus slot's key was never initialized.
            self.pool.free(slot);
            return Ok(GetOrCreate::Found(existing));
        }
        let entry = self
            .pool
            .get(slot)
            .expect("freshly allocated slot must be live");
        unsafe { entry.write_key(key) };
        entry.acquire();
        map.insert(&self.pool, &self.hasher, hash, slot);
        if let Some(hook) = &self.prepare_new {
            let _in_hook = reentrancy::enter_hook(self.addr());
            hook(entry);
        }
        trace!("table '{}': created entry", self.name);
        Ok(GetOrCreate::Created(
            slot,
            NewEntryLock {
                _guard: map,
                refs: entry.refs(),
            },
        ))
    }

    /// Force-removal: reclaim `key` if present and quiescent; otherwise a
    /// no-op (the last release, or the evictor, will pick it up).
    pub(crate) fn delete<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        reentrancy::debug_assert_not_reentrant(self.addr());
        let hash = self.hash_of(key);
        let mut map = self.shard_for(hash).write();
        let Some(handle) = map.find(&self.pool, hash, key) else {
            return;
        };
        let entry = self.pool.get(handle).expect("mapped handle must be live");
        if entry.accessor_count() != 0 {
            return;
        }
        self.reclaim_locked(&mut map, hash, handle, entry);
    }

    /// Drop one reference. At zero, reclaim according to the table policy.
    pub(crate) fn release(&self, handle: Handle) {
        reentrancy::debug_assert_not_reentrant(self.addr());
        let Some(entry) = self.pool.get(handle) else {
            debug_assert!(false, "release of a stale or foreign handle");
            return;
        };
        if !self.reclaim_on_release.load(Ordering::Relaxed) {
            // Deferred-reclaim policy: the entry stays in the map for
            // reuse; the evictor reclaims it if capacity is needed.
            entry.release();
            return;
        }
        // Snapshot the key while our reference still pins the entry; once
        // the count hits zero the evictor may free the slot at any time.
        let key = entry.key().clone();
        if entry.release() > 0 {
            return;
        }
        let hash = self.hash_of(&key);
        let mut map = self.shard_for(hash).write();
        // Re-validate under the write lock: a reader may have re-acquired
        // through the map, or the evictor may have already reclaimed this
        // slot and the pool recycled it for a new entry under the same key.
        match map.find(&self.pool, hash, &key) {
            Some(mapped) if mapped == handle => {
                let entry = self.pool.get(handle).expect("mapped handle must be live");
                if entry.accessor_count() == 0 {
                    self.reclaim_locked(&mut map, hash, handle, entry);
                }
            }
            _ => {}
        }
    }

    fn reclaim_locked(
        &self,
        map: &mut ShardMap,
        hash: u64,
        handle: Handle,
        entry: EntryRef<'_, K>,
    ) {
        if let Some(hook) = &self.before_release {
            let _in_hook = reentrancy::enter_hook(self.addr());
            hook(entry);
        }
        let removed = map.remove(hash, handle);
        debug_assert!(removed, "reclaimed entry must have been mapped");
        unsafe { entry.drop_key() };
        self.pool.free(handle);
    }

    /// One eviction attempt, run by the pool's exhaustion hook. Scans
    /// shards in index order under the read lock for a quiescent entry and
    /// deletes the first candidate; `delete` re-validates under the write
    /// lock, so the advisory scan can never free a re-acquired entry.
    pub(crate) fn evict_one(&self) {
        let mut victim: Option<K> = None;
        for shard in self.shards.iter() {
            let map = shard.read();
            if let Some(handle) = map.scan_quiescent(&self.pool) {
                let entry = self.pool.get(handle).expect("mapped handle must be live");
                victim = Some(entry.key().clone());
            }
            drop(map);
            if victim.is_some() {
                break;
            }
        }
        if let Some(key) = victim {
            trace!("table '{}': evicting quiescent entry", self.name);
            self.delete(&key);
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Generation-checked dereference of a handle.
    pub(crate) fn entry(&self, handle: Handle) -> Option<EntryRef<'_, K>> {
        self.pool.get(handle)
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.pool.capacity()
    }

    pub(crate) fn available(&self) -> usize {
        self.pool.available()
    }

    pub(crate) fn in_use(&self) -> usize {
        self.pool.in_use()
    }

    pub(crate) fn set_reclaim_on_release(&self, reclaim: bool) {
        self.reclaim_on_release.store(reclaim, Ordering::Relaxed);
    }

    pub(crate) fn reclaim_on_release(&self) -> bool {
        self.reclaim_on_release.load(Ordering::Relaxed)
    }
}

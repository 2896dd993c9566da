//! String-keyed table with a two-phase create path.
//!
//! `must_get` on a missing key returns a [`NewEntryCompletion`] that keeps
//! the shard write lock held so the caller can populate the payload before
//! any other thread can look the entry up. Completing (or dropping) it
//! performs the final acquire and releases the lock on every path.

use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use std::collections::hash_map::RandomState;
use std::sync::Arc;

use crate::error::Result;
use crate::pool::{header_size, EntryRef, Handle};
use crate::table::{
    BeforeReleaseFn, GetOrCreate, NewEntryLock, PrepareNewFn, TableConfig, TableCore,
};

/// Keyed object table over `String` keys.
///
/// Creation policy matches [`Int32Table`](crate::Int32Table): a created
/// entry starts with two references once the completion runs. Reclaim on
/// the last release is governed by the `release_requires_reclaim` policy
/// (default false: quiescent entries stay in the map for reuse and are
/// reclaimed by the evictor when capacity is needed).
pub struct StringTable<S = RandomState> {
    core: Arc<TableCore<String, S>>,
}

/// Deferred completion for a newly created entry.
///
/// Holds the shard write lock. Caller contract: finish it promptly and do
/// not call into the same table while holding it; any operation that maps
/// to the locked shard would deadlock. Both [`complete`] and `Drop`
/// perform the final acquire and release the lock, so an early return or
/// unwind cannot leak the lock.
///
/// [`complete`]: NewEntryCompletion::complete
pub struct NewEntryCompletion<'t> {
    _lock: NewEntryLock<'t>,
}

impl NewEntryCompletion<'_> {
    /// Perform the final acquire and release the shard write lock.
    pub fn complete(self) {}
}

impl StringTable {
    pub fn new(
        config: TableConfig,
        prepare_new: Option<PrepareNewFn<String>>,
        before_release: Option<BeforeReleaseFn<String>>,
    ) -> Result<Self> {
        Self::with_hasher(config, RandomState::new(), prepare_new, before_release)
    }
}

impl<S> StringTable<S>
where
    S: BuildHasher + Clone + Default + Send + Sync + 'static,
{
    pub fn with_hasher(
        config: TableConfig,
        hasher: S,
        prepare_new: Option<PrepareNewFn<String>>,
        before_release: Option<BeforeReleaseFn<String>>,
    ) -> Result<Self> {
        Ok(Self {
            core: TableCore::new(config, hasher, prepare_new, before_release, false)?,
        })
    }

    /// Smallest valid `object_size`: the entry header alone (no payload).
    pub fn min_object_size() -> usize {
        header_size::<String>()
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Whether the last release reclaims the entry (true) or parks it
    /// quiescent in the map (false, the default).
    pub fn release_requires_reclaim(&self) -> bool {
        self.core.reclaim_on_release()
    }

    pub fn set_release_requires_reclaim(&self, reclaim: bool) {
        self.core.set_reclaim_on_release(reclaim)
    }

    /// Look up `key`, acquiring the entry if present. Pair a returned
    /// handle with exactly one [`release`](Self::release).
    pub fn try_get<Q>(&self, key: &Q) -> Option<Handle>
    where
        String: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.core.try_get(key)
    }

    /// Look up or create `key`. The completion is `Some` iff the entry was
    /// newly created; the caller must finish it to publish the entry and
    /// release the shard write lock (dropping it does the same).
    pub fn must_get(&self, key: &str) -> Result<(Handle, Option<NewEntryCompletion<'_>>)> {
        if let Some(handle) = self.core.try_get(key) {
            return Ok((handle, None));
        }
        match self.core.get_or_create(key.to_owned())? {
            GetOrCreate::Found(handle) => Ok((handle, None)),
            GetOrCreate::Created(handle, lock) => {
                Ok((handle, Some(NewEntryCompletion { _lock: lock })))
            }
        }
    }

    /// Reclaim `key` if present and quiescent; no-op otherwise.
    pub fn delete(&self, key: &str) {
        self.core.delete(key)
    }

    /// Drop one reference. The handle must not be dereferenced afterwards.
    pub fn release(&self, handle: Handle) {
        self.core.release(handle)
    }

    /// Dereference a handle. `None` once the entry has been reclaimed.
    pub fn entry(&self, handle: Handle) -> Option<EntryRef<'_, String>> {
        self.core.entry(handle)
    }

    /// Number of entries currently in the map (live or quiescent).
    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> u32 {
        self.core.capacity()
    }

    /// Free slots remaining in the pool.
    pub fn available(&self) -> usize {
        self.core.available()
    }

    /// Slots currently handed out by the pool.
    pub fn in_use(&self) -> usize {
        self.core.in_use()
    }
}

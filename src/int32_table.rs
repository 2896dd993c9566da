//! Int32-keyed table.

use core::hash::BuildHasher;
use std::collections::hash_map::RandomState;
use std::sync::Arc;

use crate::error::Result;
use crate::pool::{header_size, EntryRef, Handle};
use crate::table::{BeforeReleaseFn, GetOrCreate, PrepareNewFn, TableConfig, TableCore};

/// Keyed object table over `i32` keys.
///
/// Creation policy: a created entry starts with two references (the
/// creator's base reference plus the final acquire), so a creator pairs
/// its `must_get` with two `release` calls. The last release reclaims the
/// entry unconditionally.
pub struct Int32Table<S = RandomState> {
    core: Arc<TableCore<i32, S>>,
}

impl Int32Table {
    pub fn new(
        config: TableConfig,
        prepare_new: Option<PrepareNewFn<i32>>,
        before_release: Option<BeforeReleaseFn<i32>>,
    ) -> Result<Self> {
        Self::with_hasher(config, RandomState::new(), prepare_new, before_release)
    }
}

impl<S> Int32Table<S>
where
    S: BuildHasher + Clone + Default + Send + Sync + 'static,
{
    pub fn with_hasher(
        config: TableConfig,
        hasher: S,
        prepare_new: Option<PrepareNewFn<i32>>,
        before_release: Option<BeforeReleaseFn<i32>>,
    ) -> Result<Self> {
        Ok(Self {
            core: TableCore::new(config, hasher, prepare_new, before_release, true)?,
        })
    }

    /// Smallest valid `object_size`: the entry header alone (no payload).
    pub fn min_object_size() -> usize {
        header_size::<i32>()
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Look up `key`, acquiring the entry if present. Pair a returned
    /// handle with exactly one [`release`](Self::release).
    pub fn try_get(&self, key: i32) -> Option<Handle> {
        self.core.try_get(&key)
    }

    /// Look up or create `key`. The flag is true iff the entry was newly
    /// created; a creator holds two references (see the type docs).
    pub fn must_get(&self, key: i32) -> Result<(Handle, bool)> {
        if let Some(handle) = self.core.try_get(&key) {
            return Ok((handle, false));
        }
        match self.core.get_or_create(key)? {
            GetOrCreate::Found(handle) => Ok((handle, false)),
            GetOrCreate::Created(handle, lock) => {
                // Final acquire + unlock.
                drop(lock);
                Ok((handle, true))
            }
        }
    }

    /// Reclaim `key` if present and quiescent; no-op otherwise.
    pub fn delete(&self, key: i32) {
        self.core.delete(&key)
    }

    /// Drop one reference. The handle must not be dereferenced afterwards.
    pub fn release(&self, handle: Handle) {
        self.core.release(handle)
    }

    /// Dereference a handle. `None` once the entry has been reclaimed.
    pub fn entry(&self, handle: Handle) -> Option<EntryRef<'_, i32>> {
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

//! Fixed-capacity slot pool with generational handles.
//!
//! One arena allocation backs every slot, so slot addresses are stable for
//! the pool's lifetime. Each slot starts with an [`EntryHead`] (refcount +
//! key) followed by an opaque byte payload. Handles carry a generation that
//! is bumped on free, so a stale handle dereferences to `None` instead of
//! aliasing a recycled slot.
//!
//! Eviction runs inside the allocator: when the free list is empty,
//! `alloc` invokes the registered exhaustion hook (at most once per failed
//! attempt) and retries, up to a fixed bound. The pool never holds its own
//! mutex while the hook runs.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::mem::{self, MaybeUninit};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::refcount::RefCount;

/// Eviction rounds attempted per allocation before surfacing `Exhausted`.
const ALLOC_EVICTION_ROUNDS: usize = 3;

/// Fixed header at the start of every slot: the entry's refcount and key.
///
/// The key cell is written under the shard write lock before the entry is
/// published and dropped in place at reclaim; it is only ever read through
/// handles that were published with the key initialized.
#[repr(C)]
pub(crate) struct EntryHead<K> {
    refs: RefCount,
    key: UnsafeCell<MaybeUninit<K>>,
}

pub(crate) fn header_size<K>() -> usize {
    mem::size_of::<EntryHead<K>>()
}

/// Opaque, copyable identifier for one slot.
///
/// Cheaply dereferenceable while the entry's refcount is positive. The
/// generation catches use-after-free: once the slot is returned to the
/// pool, old handles stop resolving.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

/// Borrowed view of one live entry: key, refcount and payload.
pub struct EntryRef<'pool, K> {
    head: &'pool EntryHead<K>,
    payload: NonNull<u8>,
    payload_len: usize,
}

impl<K> Clone for EntryRef<'_, K> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<K> Copy for EntryRef<'_, K> {}

impl<'pool, K> EntryRef<'pool, K> {
    /// The entry's stored key.
    pub fn key(&self) -> &'pool K {
        // Entries are published only after `write_key`; unpublished slots
        // never escape the create path.
        unsafe { (*self.head.key.get()).assume_init_ref() }
    }

    /// Snapshot of the refcount. Advisory unless the owning shard's write
    /// lock is held.
    pub fn accessor_count(&self) -> u32 {
        self.head.refs.accessor_count()
    }

    pub(crate) fn acquire(&self) -> u32 {
        self.head.refs.acquire()
    }

    pub(crate) fn release(&self) -> u32 {
        self.head.refs.release()
    }

    pub(crate) fn refs(&self) -> &'pool RefCount {
        &self.head.refs
    }

    /// Size in bytes of the opaque payload region.
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Raw pointer to the payload region. The caller's acquire/release
    /// discipline is what synchronizes access to it.
    pub fn payload_ptr(&self) -> NonNull<u8> {
        self.payload
    }

    /// Typed shared view of the payload.
    ///
    /// # Safety
    /// The payload must hold an initialized `T` (the creator writes it via
    /// `payload_mut` before other holders read), `T` must fit the payload
    /// region, and no `&mut T` to it may be live.
    pub unsafe fn payload<T>(&self) -> &'pool T {
        debug_assert!(mem::size_of::<T>() <= self.payload_len);
        debug_assert_eq!(self.payload.as_ptr() as usize % mem::align_of::<T>(), 0);
        &*self.payload.cast::<T>().as_ptr()
    }

    /// Typed exclusive view of the payload.
    ///
    /// # Safety
    /// As [`EntryRef::payload`], and the caller must be the only accessor
    /// (e.g. the creator before publication, or a holder by protocol).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn payload_mut<T>(&self) -> &'pool mut T {
        debug_assert!(mem::size_of::<T>() <= self.payload_len);
        debug_assert_eq!(self.payload.as_ptr() as usize % mem::align_of::<T>(), 0);
        &mut *self.payload.cast::<T>().as_ptr()
    }

    /// Initialize the key of a freshly allocated slot.
    ///
    /// # Safety
    /// Must run exactly once per allocation, before the handle is
    /// published; the slot's previous key must have been dropped.
    pub(crate) unsafe fn write_key(&self, key: K) {
        (*self.head.key.get()).write(key);
    }

    /// Drop the key in place during reclaim.
    ///
    /// # Safety
    /// Must run exactly once, under the owning shard's write lock, after
    /// the entry left the map and its refcount is 0.
    pub(crate) unsafe fn drop_key(&self) {
        ptr::drop_in_place((*self.head.key.get()).as_mut_ptr());
    }
}

/// Bounded allocator of fixed-size, stably-addressed slots.
pub(crate) struct SlotPool<K> {
    arena: NonNull<u8>,
    arena_layout: Layout,
    stride: usize,
    payload_len: usize,
    capacity: u32,
    generations: Box<[AtomicU32]>,
    free: Mutex<Vec<u32>>,
    in_use: AtomicUsize,
    on_exhausted: OnceLock<Box<dyn Fn() + Send + Sync>>,
    _keys: PhantomData<K>,
}

// The arena is plain memory; cross-thread access to entries is mediated by
// the refcount protocol and the shard locks above the pool.
unsafe impl<K: Send> Send for SlotPool<K> {}
unsafe impl<K: Send + Sync> Sync for SlotPool<K> {}

impl<K> SlotPool<K> {
    /// Allocate the arena for `object_limit` slots of `object_size` bytes.
    pub(crate) fn new(object_size: usize, object_limit: u32) -> Result<Self> {
        let header = header_size::<K>();
        if object_limit == 0 {
            return Err(Error::InvalidConfig {
                reason: "object_limit must be >= 1".into(),
            });
        }
        if object_size < header {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "object_size {object_size} is smaller than the entry header ({header} bytes)"
                ),
            });
        }
        // Slot bases are 16-aligned so word-sized payload views land
        // naturally aligned after the header.
        let align = mem::align_of::<EntryHead<K>>().max(16);
        let stride = object_size.div_ceil(align) * align;
        let total = stride
            .checked_mul(object_limit as usize)
            .ok_or_else(|| Error::InvalidConfig {
                reason: format!("arena size overflows: {stride} * {object_limit}"),
            })?;
        let arena_layout = Layout::from_size_align(total, align).map_err(|_| Error::InvalidConfig {
            reason: format!("unrepresentable arena layout: {total} bytes"),
        })?;
        // Zeroed so every refcount starts as a valid 0 before first use.
        let arena = unsafe { alloc_zeroed(arena_layout) };
        let arena = NonNull::new(arena).unwrap_or_else(|| handle_alloc_error(arena_layout));

        let generations = (0..object_limit).map(|_| AtomicU32::new(0)).collect();
        // Reverse order so `pop` hands out slot 0 first.
        let free: Vec<u32> = (0..object_limit).rev().collect();

        debug!(
            "slot pool initialized: {} slots x {} bytes ({} payload)",
            object_limit,
            object_size,
            object_size - header
        );

        Ok(Self {
            arena,
            arena_layout,
            stride,
            payload_len: object_size - header,
            capacity: object_limit,
            generations,
            free: Mutex::new(free),
            in_use: AtomicUsize::new(0),
            on_exhausted: OnceLock::new(),
            _keys: PhantomData,
        })
    }

    /// Register the eviction hook. Called exactly once, at table
    /// construction, before the pool is shared.
    pub(crate) fn set_on_exhausted(&self, hook: Box<dyn Fn() + Send + Sync>) {
        assert!(
            self.on_exhausted.set(hook).is_ok(),
            "exhaustion hook registered twice"
        );
    }

    fn entry_at(&self, index: u32) -> EntryRef<'_, K> {
        debug_assert!(index < self.capacity);
        let base = unsafe { self.arena.as_ptr().add(self.stride * index as usize) };
        EntryRef {
            head: unsafe { &*(base as *const EntryHead<K>) },
            payload: unsafe { NonNull::new_unchecked(base.add(header_size::<K>())) },
            payload_len: self.payload_len,
        }
    }

    /// Pop a free slot, evicting through the hook when none is available.
    ///
    /// The returned slot's refcount is reset to 0; key and payload are
    /// undefined until the caller initializes them.
    pub(crate) fn alloc(&self) -> Result<Handle> {
        let mut rounds = 0usize;
        loop {
            let popped = self.free.lock().pop();
            if let Some(index) = popped {
                self.in_use.fetch_add(1, Ordering::Relaxed);
                self.entry_at(index).refs().reset();
                let generation = self.generations[index as usize].load(Ordering::Acquire);
                return Ok(Handle { index, generation });
            }
            let Some(evict) = self.on_exhausted.get() else {
                return Err(Error::Exhausted);
            };
            if rounds == ALLOC_EVICTION_ROUNDS {
                debug!("slot pool exhausted after {rounds} eviction rounds");
                return Err(Error::Exhausted);
            }
            rounds += 1;
            trace!("slot pool full, running eviction (round {rounds})");
            // No pool lock is held here; the hook may free slots through us.
            evict();
        }
    }

    /// Return a slot to the free set, invalidating outstanding handles.
    /// Double-free is a caller bug (debug-detected via the generation).
    pub(crate) fn free(&self, handle: Handle) {
        let idx = handle.index as usize;
        assert!(idx < self.capacity as usize, "free of a foreign handle");
        let generation = &self.generations[idx];
        debug_assert_eq!(
            generation.load(Ordering::Acquire),
            handle.generation,
            "double free or stale handle"
        );
        generation.fetch_add(1, Ordering::AcqRel);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.free.lock().push(handle.index);
    }

    /// Generation-checked dereference. `None` for stale or foreign handles.
    pub(crate) fn get(&self, handle: Handle) -> Option<EntryRef<'_, K>> {
        let idx = handle.index as usize;
        if idx >= self.capacity as usize {
            return None;
        }
        if self.generations[idx].load(Ordering::Acquire) != handle.generation {
            return None;
        }
        Some(self.entry_at(handle.index))
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of slots currently on the free list.
    pub(crate) fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of slots currently handed out.
    pub(crate) fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }
}

impl<K> Drop for SlotPool<K> {
    fn drop(&mut self) {
        if mem::needs_drop::<K>() {
            // Slots not on the free list hold initialized keys.
            let mut is_free = vec![false; self.capacity as usize];
            for &i in self.free.get_mut().iter() {
                is_free[i as usize] = true;
            }
            for index in 0..self.capacity {
                if !is_free[index as usize] {
                    unsafe { self.entry_at(index).drop_key() };
                }
            }
        }
        unsafe { dealloc(self.arena.as_ptr(), self.arena_layout) };
    }
}

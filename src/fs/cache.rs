//! Block buffer cache.
//!
//! A fixed array of slots maps block numbers to in-memory 4 KiB pages.
//! The cache spinlock guards only slot presence (which slot owns which
//! block number, and reference claims); each slot carries its own
//! spinlock for lifecycle transitions and a reader/writer lock over the
//! page contents. Disk I/O is never issued with a spinlock held: a
//! loading slot is parked in the `Loading` state and concurrent loaders
//! block on the cache's wait queue, so any number of concurrent `load`
//! calls for one block issue exactly one disk read.
//!
//! References are counted. [`BcRef`] is the smart reference: cloning
//! increments the slot's count, dropping decrements it. While a slot has
//! references its buffer is stable. Unreferenced clean slots stay cached
//! and are reclaimed least-recently-touched-first when the slot table is
//! full, or eagerly by [`BufCache::sync`] with `drop` set.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use bytemuck::Zeroable;
use spin::{Mutex as SpinMutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error;
use crate::errors::{FsError, FsResult};
use crate::fs::layout::{BlockNum, BLOCK_SIZE, EMPTY_BLOCK};
use crate::fs::BlockDevice;

/// A cached disk block image.
pub type Page = [u8; BLOCK_SIZE];

/// Called on a freshly loaded page before it becomes visible, used to
/// zero in-memory-only fields of on-disk structures.
pub type CleanFn = fn(&mut Page);

/// Default number of slots: the teaching size.
pub const NSLOTS: usize = 10;

mod state {
    pub const EMPTY: u32 = 0;
    pub const ALLOCATED: u32 = 1;
    pub const LOADING: u32 = 2;
    pub const CLEAN: u32 = 3;
    pub const DIRTY: u32 = 4;
}

struct WaitQueue {
    mutex: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    fn new() -> WaitQueue {
        WaitQueue {
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Blocks until `pred()` returns true. Wakers must change the
    /// observed state before calling [`WaitQueue::wake_all`].
    fn wait_until<F: Fn() -> bool>(&self, pred: F) {
        let mut guard = self.mutex.lock().expect("wait queue poisoned");
        while !pred() {
            guard = self.cond.wait(guard).expect("wait queue poisoned");
        }
    }

    fn wake_all(&self) {
        let _guard = self.mutex.lock().expect("wait queue poisoned");
        self.cond.notify_all();
    }
}

struct Slot {
    /// Block number, or [`EMPTY_BLOCK`]. Changes only under the cache
    /// spinlock.
    bn: AtomicU32,
    /// Slot lifecycle state; see the `state` constants.
    state: AtomicU32,
    /// Reference count. Nonzero keeps `buf` stable.
    refs: AtomicU32,
    /// Last-touch stamp for reclaim ordering.
    stamp: AtomicU64,
    /// Slot spinlock ordering lifecycle transitions.
    lock: SpinMutex<()>,
    /// Page contents. Populated while the slot is clean or dirty.
    buf: RwLock<Option<Box<Page>>>,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            bn: AtomicU32::new(EMPTY_BLOCK),
            state: AtomicU32::new(state::EMPTY),
            refs: AtomicU32::new(0),
            stamp: AtomicU64::new(0),
            lock: SpinMutex::new(()),
            buf: RwLock::new(None),
        }
    }

    fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }
}

/// The buffer cache over one disk.
pub struct BufCache {
    disk: Arc<dyn BlockDevice>,
    slots: Vec<Slot>,
    /// Protects slot presence: `bn` assignments and reference claims.
    lock: SpinMutex<()>,
    /// Wait queue for block-load completion.
    read_wq: WaitQueue,
    clock: AtomicU64,
}

impl BufCache {
    /// Creates a cache with the default slot count.
    pub fn new(disk: Arc<dyn BlockDevice>) -> Arc<BufCache> {
        Self::with_slots(disk, NSLOTS)
    }

    /// Creates a cache with `nslots` slots.
    pub fn with_slots(disk: Arc<dyn BlockDevice>, nslots: usize) -> Arc<BufCache> {
        assert!(nslots > 0);
        Arc::new(BufCache {
            disk,
            slots: (0..nslots).map(|_| Slot::new()).collect(),
            lock: SpinMutex::new(()),
            read_wq: WaitQueue::new(),
            clock: AtomicU64::new(0),
        })
    }

    /// The disk this cache reads and writes.
    pub fn disk(&self) -> &Arc<dyn BlockDevice> {
        &self.disk
    }

    fn touch(&self, idx: usize) {
        let now = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        self.slots[idx].stamp.store(now, Ordering::Relaxed);
    }

    /// Reads disk block `bn` into the cache and returns a reference to
    /// its slot. May block. If the block is read from disk and `cleaner`
    /// is given, the cleaner runs on the page before it becomes visible.
    ///
    /// # Errors
    ///
    /// [`FsError::CacheFull`] when every slot is busy, or the underlying
    /// I/O error when the disk read fails.
    pub fn load(
        self: &Arc<Self>,
        bn: BlockNum,
        cleaner: Option<CleanFn>,
    ) -> FsResult<BcRef> {
        assert!(bn != EMPTY_BLOCK);

        // look for a slot containing `bn`, else claim one
        let idx = {
            let _guard = self.lock.lock();
            if let Some(i) = self
                .slots
                .iter()
                .position(|s| s.bn.load(Ordering::Relaxed) == bn)
            {
                self.slots[i].refs.fetch_add(1, Ordering::Relaxed);
                i
            } else if let Some(i) = self.claim_slot(bn) {
                i
            } else {
                error!("bufcache", "no room for block {}", bn);
                return Err(FsError::CacheFull);
            }
        };

        // load the block, or wait for the concurrent loader to finish
        let slot = &self.slots[idx];
        loop {
            match slot.state() {
                state::CLEAN | state::DIRTY => break,
                state::ALLOCATED => {
                    {
                        let _guard = slot.lock.lock();
                        if slot.state.load(Ordering::Relaxed) != state::ALLOCATED {
                            continue;
                        }
                        slot.state.store(state::LOADING, Ordering::Release);
                    }
                    if let Err(err) = self.load_slot(idx, cleaner) {
                        self.release(idx);
                        return Err(err);
                    }
                }
                state::LOADING => self
                    .read_wq
                    .wait_until(|| slot.state() != state::LOADING),
                _ => unreachable!("referenced slot went empty"),
            }
        }

        self.touch(idx);
        Ok(BcRef {
            cache: Arc::clone(self),
            idx,
        })
    }

    // Claims a slot for `bn` under the cache lock: an empty slot if one
    // exists, else the least recently touched clean unreferenced slot.
    fn claim_slot(&self, bn: BlockNum) -> Option<usize> {
        let idx = self
            .slots
            .iter()
            .position(|s| s.state.load(Ordering::Relaxed) == state::EMPTY)
            .or_else(|| {
                self.slots
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| {
                        s.refs.load(Ordering::Relaxed) == 0
                            && s.state.load(Ordering::Relaxed) == state::CLEAN
                    })
                    .min_by_key(|(_, s)| s.stamp.load(Ordering::Relaxed))
                    .map(|(i, _)| i)
            })?;
        let slot = &self.slots[idx];
        slot.bn.store(bn, Ordering::Relaxed);
        slot.state.store(state::ALLOCATED, Ordering::Release);
        slot.refs.store(1, Ordering::Relaxed);
        Some(idx)
    }

    // Issues the blocking disk read for a slot we just moved to
    // `Loading`. No lock is held across the I/O.
    fn load_slot(&self, idx: usize, cleaner: Option<CleanFn>) -> FsResult<()> {
        let slot = &self.slots[idx];
        let bn = slot.bn.load(Ordering::Relaxed);
        let mut page: Box<Page> = Box::new(Zeroable::zeroed());
        let read = self
            .disk
            .read(&mut page[..], bn as u64 * BLOCK_SIZE as u64);
        match read {
            Ok(()) => {
                if let Some(cleaner) = cleaner {
                    cleaner(&mut page);
                }
                *slot.buf.write() = Some(page);
                {
                    let _guard = slot.lock.lock();
                    slot.state.store(state::CLEAN, Ordering::Release);
                }
                self.read_wq.wake_all();
                Ok(())
            }
            Err(err) => {
                // back to allocated; the next loader (or waiter) retries
                {
                    let _guard = slot.lock.lock();
                    slot.state.store(state::ALLOCATED, Ordering::Release);
                }
                self.read_wq.wake_all();
                Err(FsError::Io(err))
            }
        }
    }

    // Decrements a slot's reference count. The buffer stays cached; the
    // slot is reclaimed later, on demand or by `sync(drop)`.
    fn release(&self, idx: usize) {
        let prev = self.slots[idx].refs.fetch_sub(1, Ordering::Release);
        assert!(prev != 0, "releasing buffer-cache slot with zero refs");
    }

    // Marks a slot dirty. Valid only on a loaded slot.
    fn mark_dirty(&self, idx: usize) {
        let slot = &self.slots[idx];
        let _guard = slot.lock.lock();
        match slot.state.load(Ordering::Relaxed) {
            state::CLEAN | state::DIRTY => {
                slot.state.store(state::DIRTY, Ordering::Release)
            }
            other => panic!("dirtying buffer-cache slot in state {other}"),
        }
    }

    /// Writes all dirty buffers to disk (blocking until complete).
    /// Additionally frees every clean unreferenced slot if `drop` is set.
    /// Returns the number of blocks written.
    pub fn sync(&self, drop: bool) -> FsResult<usize> {
        let mut written = 0;
        for slot in &self.slots {
            if slot.state() != state::DIRTY {
                continue;
            }
            let guard = slot.buf.read();
            if let Some(page) = guard.as_ref() {
                let bn = slot.bn.load(Ordering::Relaxed);
                self.disk
                    .write(&page[..], bn as u64 * BLOCK_SIZE as u64)?;
                // holding the page read guard here keeps writers out
                // until the state change lands
                let _g = slot.lock.lock();
                if slot.state.load(Ordering::Relaxed) == state::DIRTY {
                    slot.state.store(state::CLEAN, Ordering::Release);
                }
                written += 1;
            }
        }

        if drop {
            let _guard = self.lock.lock();
            for slot in &self.slots {
                if slot.refs.load(Ordering::Relaxed) == 0
                    && slot.state.load(Ordering::Relaxed) == state::CLEAN
                {
                    *slot.buf.write() = None;
                    slot.state.store(state::EMPTY, Ordering::Release);
                    slot.bn.store(EMPTY_BLOCK, Ordering::Relaxed);
                }
            }
        }

        Ok(written)
    }

    #[cfg(test)]
    fn slot_refs(&self, bn: BlockNum) -> Option<u32> {
        self.slots
            .iter()
            .find(|s| s.bn.load(Ordering::Relaxed) == bn)
            .map(|s| s.refs.load(Ordering::Relaxed))
    }
}

/// A counted reference to a buffer-cache slot.
///
/// While any `BcRef` to a slot exists, the slot keeps its block number
/// and its buffer. Clones share the slot; the last drop releases it.
pub struct BcRef {
    cache: Arc<BufCache>,
    idx: usize,
}

impl BcRef {
    /// The block number this reference pins.
    pub fn bn(&self) -> BlockNum {
        self.cache.slots[self.idx].bn.load(Ordering::Relaxed)
    }

    /// Read access to the page contents.
    pub fn data(&self) -> PageRef<'_> {
        let guard = self.cache.slots[self.idx].buf.read();
        assert!(guard.is_some(), "reading an unloaded slot");
        PageRef { guard }
    }

    /// Write access to the page contents. Taking the guard marks the
    /// slot dirty; the data reaches the disk on the next `sync`.
    pub fn data_mut(&self) -> PageRefMut<'_> {
        let guard = self.cache.slots[self.idx].buf.write();
        assert!(guard.is_some(), "writing an unloaded slot");
        self.cache.mark_dirty(self.idx);
        PageRefMut { guard }
    }

    /// The owning cache.
    pub fn cache(&self) -> &Arc<BufCache> {
        &self.cache
    }
}

impl Clone for BcRef {
    fn clone(&self) -> BcRef {
        self.cache.slots[self.idx]
            .refs
            .fetch_add(1, Ordering::Relaxed);
        BcRef {
            cache: Arc::clone(&self.cache),
            idx: self.idx,
        }
    }
}

impl Drop for BcRef {
    fn drop(&mut self) {
        self.cache.release(self.idx);
    }
}

/// Shared read guard over a cached page.
pub struct PageRef<'a> {
    guard: RwLockReadGuard<'a, Option<Box<Page>>>,
}

impl Deref for PageRef<'_> {
    type Target = Page;

    fn deref(&self) -> &Page {
        self.guard.as_ref().expect("slot buffer vanished")
    }
}

/// Exclusive write guard over a cached page.
pub struct PageRefMut<'a> {
    guard: RwLockWriteGuard<'a, Option<Box<Page>>>,
}

impl Deref for PageRefMut<'_> {
    type Target = Page;

    fn deref(&self) -> &Page {
        self.guard.as_ref().expect("slot buffer vanished")
    }
}

impl DerefMut for PageRefMut<'_> {
    fn deref_mut(&mut self) -> &mut Page {
        self.guard.as_mut().expect("slot buffer vanished")
    }
}

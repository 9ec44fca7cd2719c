//! Block cache (C3): two chained hash tables (read/write) mapping a block
//! number to a handle, plus an optional LRU list over the read cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::cell::Shared;
use crate::interval::BlockType;

bitflags! {
    /// Per-handle status bits.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Flags: u8 {
        /// The handle has already gone through the diff pass this
        /// transaction.
        const PROCESSED   = 0b0001;
        /// The handle's type has been resolved and its references pass
        /// has run.
        const ATTACHED    = 0b0010;
        /// The handle's buffer mirrors what is on the underlying device.
        const ON_DISK     = 0b0100;
        /// A read of this block from the device is currently in flight.
        const BEING_READ  = 0b1000;
    }
}

/// Which table a block handle lives in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Kind {
    Read,
    Write,
}

/// Shared, reference-counted record attached to blocks whose type carries
/// side data (directory entries, indirect blocks, indirect directory
/// blocks). The owning reference count is Rust's own `Arc` strong count;
/// there is no separate manual counter to keep in sync.
#[derive(Debug)]
pub struct SideData {
    owning_dir_inode_nr: AtomicU32,
}

impl SideData {
    pub fn new(owning_dir_inode_nr: u32) -> Arc<Self> {
        Arc::new(SideData {
            owning_dir_inode_nr: AtomicU32::new(owning_dir_inode_nr),
        })
    }

    pub fn owning_dir_inode_nr(&self) -> u32 {
        self.owning_dir_inode_nr.load(Ordering::Relaxed)
    }

    pub fn set_owning_dir_inode_nr(&self, nr: u32) {
        self.owning_dir_inode_nr.store(nr, Ordering::Relaxed);
    }
}

/// The mutable state behind a block handle.
pub struct HandleInner {
    pub nr: u32,
    pub flags: Flags,
    pub buf: Vec<u8>,
    pub block_type: Option<BlockType>,
    pub side_data: Option<Arc<SideData>>,
    /// Transient back-pointer to this block's last-committed version,
    /// valid only between `preprocess` and promotion during a commit.
    pub prev_version: Option<Handle>,
}

/// A reference to a cached block. Cheap to clone; all clones see the same
/// underlying state.
#[derive(Clone)]
pub struct Handle(Shared<HandleInner>);

impl Handle {
    pub fn new(nr: u32, buf: Vec<u8>) -> Self {
        Handle(Shared::new(HandleInner {
            nr,
            flags: Flags::empty(),
            buf,
            block_type: None,
            side_data: None,
            prev_version: None,
        }))
    }

    pub fn with<R>(&self, f: impl FnOnce(&HandleInner) -> R) -> R {
        self.0.with(f)
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut HandleInner) -> R) -> R {
        self.0.with_mut(f)
    }

    pub fn nr(&self) -> u32 {
        self.with(|h| h.nr)
    }

    pub fn same_as(&self, other: &Handle) -> bool {
        Shared::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(feature = "lru")]
struct LruState {
    order: std::collections::VecDeque<u32>,
    threshold: usize,
}

/// Two chained hash tables keyed by block number. Blocks pending a write
/// that has not yet been committed live in `write`; everything committed
/// (or read-only) lives in `read`.
pub struct BlockCache {
    read: HashMap<u32, Handle>,
    write: HashMap<u32, Handle>,
    #[cfg(feature = "lru")]
    lru: parking_lot::Mutex<LruState>,
    #[cfg(feature = "lru")]
    disk_ready: parking_lot::Condvar,
}

impl BlockCache {
    pub fn new() -> Self {
        BlockCache {
            read: HashMap::new(),
            write: HashMap::new(),
            #[cfg(feature = "lru")]
            lru: parking_lot::Mutex::new(LruState {
                order: std::collections::VecDeque::new(),
                threshold: 0,
            }),
            #[cfg(feature = "lru")]
            disk_ready: parking_lot::Condvar::new(),
        }
    }

    #[cfg(feature = "lru")]
    pub fn set_threshold(&self, blocks: usize) {
        self.lru.lock().threshold = blocks;
    }

    fn table(&self, kind: Kind) -> &HashMap<u32, Handle> {
        match kind {
            Kind::Read => &self.read,
            Kind::Write => &self.write,
        }
    }

    fn table_mut(&mut self, kind: Kind) -> &mut HashMap<u32, Handle> {
        match kind {
            Kind::Read => &mut self.read,
            Kind::Write => &mut self.write,
        }
    }

    pub fn find(&self, kind: Kind, nr: u32) -> Option<Handle> {
        self.table(kind).get(&nr).cloned()
    }

    pub fn keys(&self, kind: Kind) -> Vec<u32> {
        self.table(kind).keys().copied().collect()
    }

    pub fn insert(&mut self, kind: Kind, handle: Handle) {
        let nr = handle.nr();
        #[cfg(feature = "lru")]
        if kind == Kind::Read {
            self.touch(nr);
        }
        self.table_mut(kind).insert(nr, handle);
    }

    pub fn remove(&mut self, kind: Kind, nr: u32) -> Option<Handle> {
        #[cfg(feature = "lru")]
        if kind == Kind::Read {
            self.lru.lock().order.retain(|&n| n != nr);
        }
        self.table_mut(kind).remove(&nr)
    }

    /// Moves a write-cache entry into the read cache, as happens for every
    /// block that survives a commit unchanged in type.
    pub fn promote(&mut self, nr: u32) {
        if let Some(h) = self.write.remove(&nr) {
            self.insert(Kind::Read, h);
        }
    }

    pub fn invalidate_all(&mut self) {
        self.read.clear();
        self.write.clear();
        #[cfg(feature = "lru")]
        self.lru.lock().order.clear();
    }

    #[cfg(feature = "lru")]
    pub(crate) fn touch(&self, nr: u32) {
        let mut g = self.lru.lock();
        g.order.retain(|&n| n != nr);
        g.order.push_back(nr);
    }

    /// Blocks in memory still counted as "in LRU" (`ATTACHED ∧ ¬ON_DISK`)
    /// that should be evicted to bring that count down to the configured
    /// threshold, oldest first, skipping anything mid-read. Does not touch
    /// any state; the caller (which alone has access to the plugin) does
    /// the actual invalidation via [`BlockCache::mark_on_disk`].
    #[cfg(feature = "lru")]
    pub(crate) fn evict_candidates(&self) -> Vec<u32> {
        let g = self.lru.lock();
        if g.threshold == 0 || g.order.len() <= g.threshold {
            return Vec::new();
        }
        let mut remaining = g.order.len();
        g.order
            .iter()
            .copied()
            .filter(|&nr| {
                if remaining <= g.threshold {
                    return false;
                }
                let ok = self.evictable(nr);
                if ok {
                    remaining -= 1;
                }
                ok
            })
            .collect()
    }

    #[cfg(feature = "lru")]
    fn evictable(&self, nr: u32) -> bool {
        match self.read.get(&nr) {
            Some(h) => h.with(|inner| !inner.flags.contains(Flags::BEING_READ)),
            None => false,
        }
    }

    /// Marks a read-cache entry `ON_DISK` after its buffer has been freed by
    /// the plugin's `invalidate`, and drops it from the LRU order: an
    /// `ON_DISK` entry is no longer "in LRU" per invariant 6. The cache
    /// entry itself (the shell) stays put so a later `find` can still see
    /// it and transparently reload it.
    #[cfg(feature = "lru")]
    pub(crate) fn mark_on_disk(&mut self, nr: u32) {
        if let Some(h) = self.read.get(&nr) {
            h.with_mut(|inner| {
                inner.flags.remove(Flags::ATTACHED);
                inner.flags.insert(Flags::ON_DISK);
            });
        }
        self.lru.lock().order.retain(|&n| n != nr);
    }

    /// Blocks the caller until no read of this handle is currently in
    /// flight (`BEING_READ` clears). Only meaningful with the `lru` feature;
    /// without it, reads are never concurrent so this returns immediately.
    #[cfg(feature = "lru")]
    pub fn wait_on_disk(&self, handle: &Handle) {
        let mut guard = self.lru.lock();
        loop {
            let ready = handle.with(|inner| !inner.flags.contains(Flags::BEING_READ));
            if ready {
                return;
            }
            self.disk_ready.wait(&mut guard);
        }
    }

    #[cfg(feature = "lru")]
    pub fn notify_on_disk(&self) {
        let _guard = self.lru.lock();
        self.disk_ready.notify_all();
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_find_round_trip() {
        let mut cache = BlockCache::new();
        let h = Handle::new(3, vec![0; 16]);
        cache.insert(Kind::Read, h.clone());
        let found = cache.find(Kind::Read, 3).unwrap();
        assert!(found.same_as(&h));
        assert!(cache.find(Kind::Write, 3).is_none());
    }

    #[test]
    fn promote_moves_write_to_read() {
        let mut cache = BlockCache::new();
        let h = Handle::new(7, vec![1; 16]);
        cache.insert(Kind::Write, h);
        cache.promote(7);
        assert!(cache.find(Kind::Write, 7).is_none());
        assert!(cache.find(Kind::Read, 7).is_some());
    }

    #[test]
    fn side_data_frees_when_last_handle_drops() {
        let data = SideData::new(2);
        assert_eq!(Arc::strong_count(&data), 1);
        let clone = data.clone();
        assert_eq!(Arc::strong_count(&data), 2);
        drop(clone);
        assert_eq!(Arc::strong_count(&data), 1);
    }
}

//! RV core (C4): block/write/transaction interposition and the plugin
//! dispatch that drives the diff pass to a fixed point.

use std::fmt;

use log::{debug, warn};

use crate::cache::{BlockCache, Flags, Handle, Kind};
use crate::device::BlockDevice;
use crate::error::{Result, RvError};
use crate::interval::{BlockType, IntervalMap};
use crate::sink::ChangeSink;

/// The context a plugin call gets instead of reaching into process-wide
/// globals: everything it needs to resolve block types, read or write
/// other blocks, and report changes, borrowed for the duration of the call.
pub struct PluginCtx<'a> {
    pub cache: &'a mut BlockCache,
    pub intervals: &'a mut IntervalMap,
    pub device: &'a mut dyn BlockDevice,
    pub sink: &'a mut dyn ChangeSink,
    pub delete_list: &'a mut Vec<u32>,
    pub tx_id: u64,
}

/// Per-filesystem plugin contract (the vtable of the reference
/// implementation, translated to a trait). One `FsPlugin` instance is
/// bound to exactly one [`Rv`] through the generic parameter, so there is
/// no shared mutable global state to coordinate.
pub trait FsPlugin {
    /// Fixed block size for this filesystem, in bytes.
    fn block_size(&self) -> usize;

    /// Registers whatever intervals are known before any block has been
    /// read, typically just the superblock's own interval.
    fn bootstrap(&mut self, ctx: &mut PluginCtx) -> Result<()>;

    /// Whether the host filesystem promises not to observe its own
    /// uncommitted writes.
    fn crash_consistent(&self) -> bool;

    /// Whether the host filesystem may rewrite the same block more than
    /// once inside a single transaction.
    fn multiple_updates(&self) -> bool;

    fn tx_start(&mut self, ctx: &mut PluginCtx, tx_type: &str) -> Result<()>;
    fn tx_end(&mut self, ctx: &mut PluginCtx) -> Result<()>;

    /// Resolves the type of a block, consulting (and possibly extending)
    /// the interval map. Returns `None` for a block whose type cannot yet
    /// be determined (an ordinary data block, most likely).
    fn create(&mut self, ctx: &mut PluginCtx, nr: u32, for_write: bool) -> Result<Option<BlockType>>;

    /// Copies `buf` into the handle and marks it attached.
    fn attach(&mut self, ctx: &mut PluginCtx, handle: &Handle, buf: &[u8]) -> Result<()>;

    /// Walks a freshly-read, typed block's content and predeclares any
    /// child blocks it references (inserting intervals and read-cache
    /// placeholders). Only called on the read path.
    fn references(&mut self, ctx: &mut PluginCtx, handle: &Handle) -> Result<()>;

    fn destroy(&mut self, ctx: &mut PluginCtx, handle: &Handle) -> Result<()>;
    fn invalidate(&mut self, ctx: &mut PluginCtx, handle: &Handle) -> Result<()>;

    /// Re-fetches a block's bytes from the device after it was evicted to
    /// `ON_DISK`. Only meaningful in `lru` builds.
    fn read(&mut self, ctx: &mut PluginCtx, handle: &Handle) -> Result<()>;

    /// Runs before the diff loop, once per write-cache entry: propagates
    /// type and side-data from `handle`'s previous version (or from the
    /// interval map, if this is a brand new block).
    fn preprocess(&mut self, ctx: &mut PluginCtx, handle: &Handle) -> Result<()>;

    /// Diffs `handle` against its previous version (set by `preprocess`),
    /// reporting changes to `ctx.sink`. Returns whether this call resolved
    /// something that could make another, currently-stuck block
    /// processable (a newly assigned type, a newly created interval); the
    /// core keeps looping over unprocessed blocks until a full pass makes
    /// no progress.
    fn process(&mut self, ctx: &mut PluginCtx, handle: &Handle) -> Result<bool>;

    /// Flips a bit of `handle`'s buffer; used to exercise
    /// corruption-detection paths when corruption injection is enabled.
    fn corrupt(&mut self, ctx: &mut PluginCtx, handle: &Handle) -> Result<()>;
}

/// Tunables that do not belong to any one component.
#[derive(Clone, Copy, Debug, Default)]
pub struct RvConfig {
    /// Upper bound on read-cache entries kept in memory. Zero means
    /// unlimited; only enforced when built with the `lru` feature.
    pub block_threshold: usize,
    /// Inject a random single-bit flip into every written block, to
    /// exercise the diff pass against corrupted input.
    pub corrupt: bool,
}

macro_rules! ctx {
    ($self:ident) => {
        PluginCtx {
            cache: &mut $self.cache,
            intervals: &mut $self.intervals,
            device: &mut *$self.device,
            sink: &mut *$self.sink,
            delete_list: &mut $self.delete_list,
            tx_id: $self.cur_tx_id,
        }
    };
}

/// Root state of the runtime-verification layer, generic over the
/// filesystem plugin bound to it.
pub struct Rv<P: FsPlugin> {
    cache: BlockCache,
    intervals: IntervalMap,
    device: Box<dyn BlockDevice>,
    sink: Box<dyn ChangeSink>,
    plugin: P,
    enabled: bool,
    tx_in_progress: Option<String>,
    cur_tx_id: u64,
    delete_list: Vec<u32>,
    corrupt: bool,
}

impl<P: FsPlugin> Rv<P> {
    pub fn new(
        device: Box<dyn BlockDevice>,
        sink: Box<dyn ChangeSink>,
        plugin: P,
        config: RvConfig,
    ) -> Result<Self> {
        let mut rv = Rv {
            cache: BlockCache::new(),
            intervals: IntervalMap::new(),
            device,
            sink,
            plugin,
            enabled: true,
            tx_in_progress: None,
            cur_tx_id: 0,
            delete_list: Vec::new(),
            corrupt: config.corrupt,
        };
        #[cfg(feature = "lru")]
        rv.cache.set_threshold(config.block_threshold);
        #[cfg(not(feature = "lru"))]
        let _ = config.block_threshold;
        let mut ctx = ctx!(rv);
        rv.plugin.bootstrap(&mut ctx)?;
        Ok(rv)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn plugin(&self) -> &P {
        &self.plugin
    }

    /// Disables the RV permanently. Idempotent; safe to call from any
    /// internal error path. Loud by design: RV is an observer, and its own
    /// failure must not be allowed to silently stop reporting.
    fn disable(&mut self, reason: impl fmt::Display) {
        if self.enabled {
            warn!("rv_enabled is set to 0: {reason}");
        }
        self.enabled = false;
        self.tx_in_progress = None;
        self.delete_list.clear();
        self.cache.invalidate_all();
        self.intervals.delete_all();
    }

    /// Mirrors a block just read from the device into the RV's view of it.
    /// Must be called after the real read completes (`block.c`'s
    /// `read_blocks` calls `rv_read` only once the bytes are in hand).
    pub fn read(&mut self, nr: u32, buf: &[u8]) {
        if !self.enabled {
            return;
        }
        if let Err(e) = self.try_read(nr, buf) {
            self.disable(e);
        }
    }

    fn try_read(&mut self, nr: u32, buf: &[u8]) -> Result<()> {
        self.try_read_inner(nr, buf)?;
        self.run_eviction()
    }

    fn try_read_inner(&mut self, nr: u32, buf: &[u8]) -> Result<()> {
        if self.cache.find(Kind::Write, nr).is_some() {
            if self.plugin.crash_consistent() {
                return Err(RvError::Protocol(
                    "crash-consistent filesystem read its own uncommitted write",
                ));
            }
            return Ok(());
        }
        let handle = match self.find_read_reload(nr)? {
            Some(h) => h,
            None => {
                let ty = {
                    let mut ctx = ctx!(self);
                    self.plugin.create(&mut ctx, nr, false)?
                };
                // A block whose type cannot be determined is an ordinary
                // data block: RV has nothing to track, so no cache entry is
                // created for it at all (not merely left untyped). This is
                // what lets a later `references` pass predeclare it without
                // tripping the cache-uniqueness invariant.
                let ty = match ty {
                    Some(t) => t,
                    None => return Ok(()),
                };
                let h = Handle::new(nr, Vec::new());
                h.with_mut(|i| i.block_type = Some(ty));
                self.cache.insert(Kind::Read, h.clone());
                h
            }
        };
        if handle.with(|h| h.flags.contains(Flags::ATTACHED)) {
            return Ok(());
        }
        {
            let mut ctx = ctx!(self);
            self.plugin.attach(&mut ctx, &handle, buf)?;
        }
        handle.with_mut(|h| h.flags |= Flags::ATTACHED);
        if handle.with(|h| h.block_type.is_some()) {
            let mut ctx = ctx!(self);
            self.plugin.references(&mut ctx, &handle)?;
        }
        Ok(())
    }

    /// Looks up `nr` in the read cache. If the `lru` feature evicted it to
    /// `ON_DISK`, transparently re-fetches it through the plugin's `read`
    /// slot and promotes it back to MRU before returning, per the "a
    /// successful find on an `ON_DISK` entry transparently reloads" contract.
    /// A racing reload in flight is waited out rather than duplicated.
    #[cfg(feature = "lru")]
    fn find_read_reload(&mut self, nr: u32) -> Result<Option<Handle>> {
        let handle = match self.cache.find(Kind::Read, nr) {
            Some(h) => h,
            None => return Ok(None),
        };
        self.cache.wait_on_disk(&handle);
        if handle.with(|h| h.flags.contains(Flags::ON_DISK)) {
            handle.with_mut(|h| h.flags.insert(Flags::BEING_READ));
            let result = {
                let mut ctx = ctx!(self);
                self.plugin.read(&mut ctx, &handle)
            };
            handle.with_mut(|h| {
                h.flags.remove(Flags::ON_DISK | Flags::BEING_READ);
                h.flags.insert(Flags::ATTACHED);
            });
            self.cache.notify_on_disk();
            self.cache.touch(nr);
            result?;
        }
        Ok(Some(handle))
    }

    #[cfg(not(feature = "lru"))]
    fn find_read_reload(&mut self, nr: u32) -> Result<Option<Handle>> {
        Ok(self.cache.find(Kind::Read, nr))
    }

    /// Evicts read-cache entries over the configured threshold: the plugin
    /// frees each victim's buffer (`invalidate`) and the cache marks it
    /// `ON_DISK`, keeping the shell so a later read reloads it transparently
    /// instead of re-running `references`. A no-op without the `lru`
    /// feature or below threshold.
    #[cfg(feature = "lru")]
    fn run_eviction(&mut self) -> Result<()> {
        for nr in self.cache.evict_candidates() {
            if let Some(h) = self.cache.find(Kind::Read, nr) {
                let mut ctx = ctx!(self);
                self.plugin.invalidate(&mut ctx, &h)?;
                self.cache.mark_on_disk(nr);
            }
        }
        Ok(())
    }

    #[cfg(not(feature = "lru"))]
    fn run_eviction(&mut self) -> Result<()> {
        Ok(())
    }

    /// Mirrors a pending write into the RV's write cache. Must be called
    /// before the real write, so the diff pass always has the
    /// last-committed content to compare against in the read cache.
    pub fn write(&mut self, nr: u32, buf: &[u8]) {
        if !self.enabled {
            return;
        }
        if let Err(e) = self.try_write(nr, buf) {
            self.disable(e);
        }
    }

    fn try_write(&mut self, nr: u32, buf: &[u8]) -> Result<()> {
        if self.tx_in_progress.is_none() {
            return Err(RvError::Protocol("write outside of a transaction"));
        }
        if self.cache.find(Kind::Write, nr).is_some() {
            if !self.plugin.multiple_updates() {
                return Err(RvError::Protocol(
                    "block written twice in one transaction without multiple_updates",
                ));
            }
            self.cache.remove(Kind::Write, nr);
        }
        let ty = {
            let mut ctx = ctx!(self);
            self.plugin.create(&mut ctx, nr, true)?
        };
        let handle = Handle::new(nr, Vec::new());
        handle.with_mut(|i| i.block_type = ty);
        self.cache.insert(Kind::Write, handle.clone());
        {
            let mut ctx = ctx!(self);
            self.plugin.attach(&mut ctx, &handle, buf)?;
        }
        handle.with_mut(|h| h.flags |= Flags::ATTACHED);
        if self.corrupt {
            let mut ctx = ctx!(self);
            self.plugin.corrupt(&mut ctx, &handle)?;
        }
        Ok(())
    }

    pub fn tx_start(&mut self, tx_type: &str) {
        if !self.enabled {
            return;
        }
        if let Err(e) = self.try_tx_start(tx_type) {
            self.disable(e);
        }
    }

    fn try_tx_start(&mut self, tx_type: &str) -> Result<()> {
        if self.tx_in_progress.is_some() {
            return Err(RvError::Protocol(
                "tx_start called while a transaction is already open",
            ));
        }
        self.tx_in_progress = Some(tx_type.to_lowercase());
        self.delete_list.clear();
        Ok(())
    }

    pub fn tx_commit(&mut self, tx_type: &str) {
        if !self.enabled {
            return;
        }
        if let Err(e) = self.try_tx_commit(tx_type) {
            self.disable(e);
        }
    }

    fn try_tx_commit(&mut self, tx_type: &str) -> Result<()> {
        let tx_type = tx_type.to_lowercase();
        match &self.tx_in_progress {
            Some(t) if *t == tx_type => {}
            Some(_) => return Err(RvError::Protocol("tx_commit type does not match tx_start")),
            None => return Err(RvError::Protocol("tx_commit called with no transaction open")),
        }
        self.tx_in_progress = None;
        self.cur_tx_id += 1;
        let tx_id = self.cur_tx_id;
        self.sink.tx_begin(tx_id, &tx_type)?;

        {
            let mut ctx = ctx!(self);
            self.plugin.tx_start(&mut ctx, &tx_type)?;
        }

        for nr in self.cache.keys(Kind::Write) {
            let handle = match self.cache.find(Kind::Write, nr) {
                Some(h) => h,
                None => continue,
            };
            let prev = self.find_read_reload(nr)?;
            handle.with_mut(|h| h.prev_version = prev);
            let mut ctx = ctx!(self);
            self.plugin.preprocess(&mut ctx, &handle)?;
        }

        let mut rounds = 0u32;
        loop {
            let pending: Vec<u32> = self
                .cache
                .keys(Kind::Write)
                .into_iter()
                .filter(|&nr| {
                    self.cache
                        .find(Kind::Write, nr)
                        .map(|h| {
                            h.with(|i| {
                                !i.flags.contains(Flags::PROCESSED) && i.block_type.is_some()
                            })
                        })
                        .unwrap_or(false)
                })
                .collect();
            if pending.is_empty() {
                break;
            }
            let mut made_progress = false;
            for nr in pending {
                let handle = match self.cache.find(Kind::Write, nr) {
                    Some(h) => h,
                    None => continue,
                };
                let progressed = {
                    let mut ctx = ctx!(self);
                    self.plugin.process(&mut ctx, &handle)?
                };
                handle.with_mut(|h| h.flags |= Flags::PROCESSED);
                made_progress |= progressed;
            }
            rounds += 1;
            if !made_progress {
                break;
            }
            debug_assert!(rounds < 10_000, "fixed-point commit loop did not converge");
        }
        debug!("tx {tx_id} reached fixed point after {rounds} rounds");

        for nr in self.cache.keys(Kind::Write) {
            let handle = match self.cache.find(Kind::Write, nr) {
                Some(h) => h,
                None => continue,
            };
            let processed = handle.with(|h| h.flags.contains(Flags::PROCESSED));
            handle.with_mut(|h| h.prev_version = None);
            if processed {
                if let Some(prev) = self.cache.find(Kind::Read, nr) {
                    let mut ctx = ctx!(self);
                    self.plugin.destroy(&mut ctx, &prev)?;
                    self.cache.remove(Kind::Read, nr);
                }
                self.cache.promote(nr);
            } else {
                let mut ctx = ctx!(self);
                self.plugin.destroy(&mut ctx, &handle)?;
                self.cache.remove(Kind::Write, nr);
            }
        }

        for nr in std::mem::take(&mut self.delete_list) {
            if let Some(h) = self.cache.find(Kind::Read, nr) {
                let mut ctx = ctx!(self);
                self.plugin.destroy(&mut ctx, &h)?;
                self.cache.remove(Kind::Read, nr);
            }
        }

        {
            let mut ctx = ctx!(self);
            self.plugin.tx_end(&mut ctx)?;
        }
        self.run_eviction()?;
        self.sink.tx_end(tx_id)?;
        Ok(())
    }
}

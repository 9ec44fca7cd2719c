//! Filesystem plugin (C5): the typed-block layer for the `testfs` toy
//! filesystem. Implements [`FsPlugin`] against the on-disk layout in
//! [`layout`], dispatching to [`refs`] on the read path and [`diff`] on the
//! commit path.

pub mod layout;
mod diff;
mod refs;

use rand_core::{OsRng, RngCore};

use crate::cache::Handle;
use crate::core::{FsPlugin, PluginCtx};
use crate::error::Result;
use crate::interval::BlockType;
use layout::{Superblock, BLOCK_SIZE, SUPERBLOCK_NR};

/// One `TestfsPlugin` is bound to exactly one [`crate::core::Rv`] instance
/// through the generic parameter: there is no process-wide "current
/// superblock" the way the reference implementation keeps one, only this
/// struct's own field.
pub struct TestfsPlugin {
    superblock: Superblock,
    /// Directory inode numbers already diffed this transaction, so a
    /// directory spanning several dir blocks is only diffed once.
    processed_dirs: Vec<u32>,
}

impl TestfsPlugin {
    pub fn new() -> Self {
        TestfsPlugin {
            superblock: Superblock::default(),
            processed_dirs: Vec::new(),
        }
    }
}

impl Default for TestfsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl FsPlugin for TestfsPlugin {
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn bootstrap(&mut self, ctx: &mut PluginCtx) -> Result<()> {
        ctx.intervals
            .create(SUPERBLOCK_NR, SUPERBLOCK_NR + 1, BlockType::SuperBlock)
    }

    fn crash_consistent(&self) -> bool {
        false
    }

    fn multiple_updates(&self) -> bool {
        true
    }

    fn tx_start(&mut self, _ctx: &mut PluginCtx, _tx_type: &str) -> Result<()> {
        self.processed_dirs.clear();
        Ok(())
    }

    fn tx_end(&mut self, _ctx: &mut PluginCtx) -> Result<()> {
        self.processed_dirs.clear();
        Ok(())
    }

    fn create(&mut self, ctx: &mut PluginCtx, nr: u32, for_write: bool) -> Result<Option<BlockType>> {
        if for_write {
            // A write always creates a block of unknown type; `preprocess`
            // resolves it from the previous version or the interval map
            // before the diff pass runs.
            return Ok(None);
        }
        Ok(ctx.intervals.find(nr))
    }

    fn attach(&mut self, _ctx: &mut PluginCtx, handle: &Handle, buf: &[u8]) -> Result<()> {
        handle.with_mut(|h| h.buf = buf.to_vec());
        Ok(())
    }

    fn references(&mut self, ctx: &mut PluginCtx, handle: &Handle) -> Result<()> {
        let ty = handle.with(|h| h.block_type);
        match ty {
            Some(BlockType::SuperBlock) => refs::super_block_refs(ctx, self, handle),
            Some(BlockType::InodeBlock) => refs::inode_block_refs(ctx, self, handle),
            Some(BlockType::IndirectDirBlock) => refs::indirect_dir_block_refs(ctx, handle),
            _ => Ok(()),
        }
    }

    fn destroy(&mut self, _ctx: &mut PluginCtx, handle: &Handle) -> Result<()> {
        handle.with_mut(|h| {
            h.buf.clear();
            h.side_data = None;
        });
        Ok(())
    }

    fn invalidate(&mut self, _ctx: &mut PluginCtx, handle: &Handle) -> Result<()> {
        handle.with_mut(|h| h.buf.clear());
        Ok(())
    }

    fn read(&mut self, ctx: &mut PluginCtx, handle: &Handle) -> Result<()> {
        let nr = handle.nr();
        let mut buf = vec![0u8; self.block_size()];
        ctx.device.read_block(nr, &mut buf)?;
        handle.with_mut(|h| h.buf = buf);
        Ok(())
    }

    fn preprocess(&mut self, ctx: &mut PluginCtx, handle: &Handle) -> Result<()> {
        let nr = handle.nr();
        let prev = handle.with(|h| h.prev_version.clone());
        if let Some(prev) = prev {
            let (ty, side_data) = prev.with(|p| (p.block_type, p.side_data.clone()));
            handle.with_mut(|h| {
                h.block_type = ty;
                h.side_data = side_data;
            });
        } else if let Some(ty) = ctx.intervals.find(nr) {
            handle.with_mut(|h| h.block_type = Some(ty));
        }
        Ok(())
    }

    fn process(&mut self, ctx: &mut PluginCtx, handle: &Handle) -> Result<bool> {
        let ty = match handle.with(|h| h.block_type) {
            Some(t) => t,
            None => return Ok(false),
        };
        diff::dispatch(ctx, self, handle, ty)?;
        Ok(true)
    }

    fn corrupt(&mut self, _ctx: &mut PluginCtx, handle: &Handle) -> Result<()> {
        corrupt_block(handle);
        Ok(())
    }
}

/// Flips a handful of random byte ranges, the way the reference
/// implementation's `testfs_block_corrupt` exercises the diff pass against
/// damaged input when corruption injection is enabled. Most calls are a
/// no-op: `RAND(10) - 7` is negative about 70% of the time.
fn corrupt_block(handle: &Handle) {
    let mut rng = OsRng;
    let runs = (rng.next_u32() % 10) as i32 - 7;
    if runs <= 0 {
        return;
    }
    handle.with_mut(|h| {
        let len = h.buf.len();
        if len == 0 {
            return;
        }
        for _ in 0..runs {
            let start = (rng.next_u32() as usize) % len;
            let span = (rng.next_u32() as usize) % (len - start + 1);
            let end = (start + span).min(len);
            for b in &mut h.buf[start..end] {
                *b = (rng.next_u32() % 256) as u8;
            }
        }
    });
}

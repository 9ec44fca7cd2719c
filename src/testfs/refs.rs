//! References pass (`spec.md` §4.5): walks a freshly-typed block's content
//! and predeclares any child blocks it points at, so a later `read` of the
//! child never has to re-derive its type from a parent walk.

use crate::cache::{Handle, Kind, SideData};
use crate::core::PluginCtx;
use crate::error::{Result, RvError};
use crate::interval::BlockType;

use super::layout::*;
use super::TestfsPlugin;

/// Inserts a read-cache placeholder for `nr`: known type, no buffer yet,
/// fresh side-data pointing at `owning_inode`. Fails if `nr` is already
/// tracked in either cache (on a healthy filesystem every block is
/// referenced from exactly one place, so a collision here is corruption,
/// not a races-with-ourselves bug).
fn predeclare(ctx: &mut PluginCtx, nr: u32, ty: BlockType, owning_inode: u32) -> Result<()> {
    if ctx.cache.find(Kind::Read, nr).is_some() || ctx.cache.find(Kind::Write, nr).is_some() {
        return Err(RvError::Exists(nr));
    }
    let handle = Handle::new(nr, Vec::new());
    handle.with_mut(|h| {
        h.block_type = Some(ty);
        h.side_data = Some(SideData::new(owning_inode));
    });
    ctx.cache.insert(Kind::Read, handle);
    Ok(())
}

/// Parses the superblock and registers the three intervals it bootstraps:
/// the inode freemap, the block freemap, and the inode blocks.
pub(super) fn super_block_refs(
    ctx: &mut PluginCtx,
    plugin: &mut TestfsPlugin,
    handle: &Handle,
) -> Result<()> {
    let sb = handle.with(|h| Superblock::decode(&h.buf));
    plugin.superblock = sb;
    ctx.intervals
        .create(sb.inode_freemap_start, sb.block_freemap_start, BlockType::InodeFreemap)?;
    ctx.intervals
        .create(sb.block_freemap_start, sb.inode_blocks_start, BlockType::BlockFreemap)?;
    ctx.intervals
        .create(sb.inode_blocks_start, sb.data_blocks_start, BlockType::InodeBlock)?;
    Ok(())
}

/// For every non-empty inode in the block: predeclares its direct blocks as
/// `DirBlock` if it is a directory, and its indirect block as
/// `IndirectBlock` or `IndirectDirBlock` according to the inode's type.
pub(super) fn inode_block_refs(
    ctx: &mut PluginCtx,
    plugin: &mut TestfsPlugin,
    handle: &Handle,
) -> Result<()> {
    let nr = handle.nr();
    let sb = plugin.superblock;
    let buf = handle.with(|h| h.buf.clone());
    for slot in 0..INODES_PER_BLOCK {
        let inode = Inode::decode(&buf, slot);
        if inode.i_type == IT_NONE {
            continue;
        }
        let inode_nr = Inode::to_nr(&sb, nr, slot);
        if inode.i_type == IT_DIR {
            for &bnr in inode.i_block_nr.iter() {
                if bnr == 0 {
                    continue;
                }
                predeclare(ctx, bnr, BlockType::DirBlock, inode_nr)?;
            }
        }
        if inode.i_indirect != 0 {
            let ty = if inode.i_type == IT_FILE {
                BlockType::IndirectBlock
            } else {
                BlockType::IndirectDirBlock
            };
            predeclare(ctx, inode.i_indirect, ty, inode_nr)?;
        }
    }
    Ok(())
}

/// For every non-zero entry: predeclares the referenced block as
/// `DirBlock`, carrying the same owning inode as this indirect-dir block.
pub(super) fn indirect_dir_block_refs(ctx: &mut PluginCtx, handle: &Handle) -> Result<()> {
    let owning_inode = handle
        .with(|h| h.side_data.as_ref().map(|d| d.owning_dir_inode_nr()))
        .ok_or_else(|| RvError::Malformed {
            block: handle.nr(),
            reason: "indirect dir block has no owning-inode side data",
        })?;
    let buf = handle.with(|h| h.buf.clone());
    for chunk in buf.chunks_exact(4) {
        let bnr = u32::from_le_bytes(chunk.try_into().unwrap());
        if bnr != 0 {
            predeclare(ctx, bnr, BlockType::DirBlock, owning_inode)?;
        }
    }
    Ok(())
}

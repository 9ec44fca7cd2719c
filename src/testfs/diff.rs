//! Diff pass (`spec.md` §4.5): compares a write-cache block against its
//! previous version (or an implicit all-zero predecessor for a block that
//! never existed before) and reports what changed to the change sink.

use crate::block::{self, BitOrder};
use crate::cache::{Handle, Kind, SideData};
use crate::core::PluginCtx;
use crate::error::{Result, RvError};
use crate::interval::BlockType;
use crate::sink::ChangeRecord;

use super::layout::*;
use super::TestfsPlugin;

/// Dispatches to the per-type diff routine. Every write-cache entry that
/// reaches here has a known `BlockType`; the core never calls this for an
/// `UNKNOWN_BLOCK` entry.
pub(super) fn dispatch(
    ctx: &mut PluginCtx,
    plugin: &mut TestfsPlugin,
    handle: &Handle,
    ty: BlockType,
) -> Result<()> {
    match ty {
        BlockType::SuperBlock => diff_super_block(ctx, plugin, handle),
        BlockType::InodeFreemap => diff_inode_freemap(ctx, handle),
        BlockType::BlockFreemap => diff_block_freemap(ctx, plugin, handle),
        BlockType::InodeBlock => diff_inode_block(ctx, plugin, handle),
        BlockType::IndirectBlock => diff_indirect_block(ctx, handle),
        BlockType::IndirectDirBlock => diff_indirect_dir_block(ctx, handle),
        BlockType::DirBlock => diff_dir_block(ctx, plugin, handle),
    }
}

/// The previous version's bytes, or an all-zero block for one that has
/// none (a block just predeclared and written for the first time this
/// transaction is diffed as if its prior content were all zero bits).
fn prev_buf(handle: &Handle) -> Vec<u8> {
    let prev = handle.with(|h| h.prev_version.clone());
    match prev {
        Some(p) => p.with(|i| i.buf.clone()),
        None => vec![0u8; BLOCK_SIZE],
    }
}

fn read_u32_at(buf: &[u8], index: u32) -> u32 {
    let off = index as usize * 4;
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn diff_super_block(ctx: &mut PluginCtx, plugin: &mut TestfsPlugin, handle: &Handle) -> Result<()> {
    let old = Superblock::decode(&prev_buf(handle));
    let new = handle.with(|h| Superblock::decode(&h.buf));
    plugin.superblock = new;
    for field in 0..SUPER_FIELD_COUNT {
        let (o, n) = (old.field(field), new.field(field));
        if o != n {
            ctx.sink
                .record(ctx.tx_id, &ChangeRecord::SuperBlock { field, old: o, new: n })?;
        }
    }
    Ok(())
}

fn diff_inode_freemap(ctx: &mut PluginCtx, handle: &Handle) -> Result<()> {
    let old = prev_buf(handle);
    let new = handle.with(|h| h.buf.clone());
    scan_freemap(&old, &new, |bit, o, n| {
        ctx.sink.record(
            ctx.tx_id,
            &ChangeRecord::InodeFreemap { inode_nr: bit, old: o, new: n },
        )
    })
}

fn diff_block_freemap(ctx: &mut PluginCtx, plugin: &TestfsPlugin, handle: &Handle) -> Result<()> {
    let old = prev_buf(handle);
    let new = handle.with(|h| h.buf.clone());
    let base = plugin.superblock.data_blocks_start;
    scan_freemap(&old, &new, |bit, o, n| {
        ctx.sink.record(
            ctx.tx_id,
            &ChangeRecord::BlockFreemap { block_nr: bit + base, old: o, new: n },
        )
    })
}

/// Shared bit-scan driving both freemap diffs: walks every differing bit,
/// little-endian-numbered as free-maps require, reporting `(bit, old, new)`.
fn scan_freemap(
    old: &[u8],
    new: &[u8],
    mut report: impl FnMut(u32, bool, bool) -> std::io::Result<()>,
) -> Result<()> {
    if !block::block_diff(old, new) {
        return Ok(());
    }
    let total_bits = (old.len() * 8) as u32;
    let mut bit = 0u32;
    while let Some(found) = block::block_next_diff(old, new, bit, total_bits, BitOrder::Little) {
        let ob = block::block_get_bit(old, found, BitOrder::Little);
        let nb = block::block_get_bit(new, found, BitOrder::Little);
        debug_assert_ne!(ob, nb);
        report(found, ob, nb).map_err(RvError::Device)?;
        bit = found + 1;
    }
    Ok(())
}

/// Finds `nr`'s write-cache entry (it must already exist: the filesystem
/// writes a block before its owning inode can point at it) and assigns it
/// the type newly discovered for it, plus fresh side-data.
fn retype_write_entry(ctx: &mut PluginCtx, nr: u32, ty: BlockType, owning_inode: u32) -> Result<()> {
    let h = ctx
        .cache
        .find(Kind::Write, nr)
        .ok_or(RvError::NotFound(nr))?;
    h.with_mut(|i| {
        i.block_type = Some(ty);
        i.side_data = Some(SideData::new(owning_inode));
    });
    Ok(())
}

fn diff_inode_block(ctx: &mut PluginCtx, plugin: &mut TestfsPlugin, handle: &Handle) -> Result<()> {
    let nr = handle.nr();
    let old_buf = prev_buf(handle);
    let new_buf = handle.with(|h| h.buf.clone());
    let sb = plugin.superblock;
    for slot in 0..INODES_PER_BLOCK {
        let old_inode = Inode::decode(&old_buf, slot);
        let new_inode = Inode::decode(&new_buf, slot);
        let inode_nr = Inode::to_nr(&sb, nr, slot);
        for field in 0..INODE_FIELD_COUNT {
            let (o, n) = (old_inode.field(field), new_inode.field(field));
            if o == n {
                continue;
            }
            if (3..=7).contains(&field) {
                debug_assert!(o == 0 || n == 0, "a block pointer only ever toggles 0 <-> non-zero");
                if o != 0 {
                    ctx.delete_list.push(o);
                } else if (3..=6).contains(&field) && new_inode.i_type == IT_DIR {
                    retype_write_entry(ctx, n, BlockType::DirBlock, inode_nr)?;
                } else if field == 7 && (new_inode.i_type == IT_DIR || new_inode.i_type == IT_FILE)
                {
                    let ty = if new_inode.i_type == IT_FILE {
                        BlockType::IndirectBlock
                    } else {
                        BlockType::IndirectDirBlock
                    };
                    retype_write_entry(ctx, n, ty, inode_nr)?;
                }
            }
            ctx.sink.record(
                ctx.tx_id,
                &ChangeRecord::Inode { inode_nr, field, old: o, new: n },
            )?;
        }
    }
    Ok(())
}

fn diff_indirect_block(ctx: &mut PluginCtx, handle: &Handle) -> Result<()> {
    let nr = handle.nr();
    let old = prev_buf(handle);
    let new = handle.with(|h| h.buf.clone());
    for index in 0..ENTRIES_PER_INDIRECT_BLOCK {
        let o = read_u32_at(&old, index);
        let n = read_u32_at(&new, index);
        if o == n {
            continue;
        }
        debug_assert!(o == 0 || n == 0);
        if o != 0 {
            ctx.delete_list.push(o);
        }
        ctx.sink.record(
            ctx.tx_id,
            &ChangeRecord::IndirectBlock { block_nr: nr, index, old: o, new: n },
        )?;
    }
    Ok(())
}

fn diff_indirect_dir_block(ctx: &mut PluginCtx, handle: &Handle) -> Result<()> {
    let nr = handle.nr();
    let owning_inode = handle
        .with(|h| h.side_data.as_ref().map(|d| d.owning_dir_inode_nr()))
        .unwrap_or(0);
    let old = prev_buf(handle);
    let new = handle.with(|h| h.buf.clone());
    for index in 0..ENTRIES_PER_INDIRECT_BLOCK {
        let o = read_u32_at(&old, index);
        let n = read_u32_at(&new, index);
        if o == n {
            continue;
        }
        debug_assert!(o == 0 || n == 0);
        if o != 0 {
            ctx.delete_list.push(o);
        } else {
            retype_write_entry(ctx, n, BlockType::DirBlock, owning_inode)?;
        }
        ctx.sink.record(
            ctx.tx_id,
            &ChangeRecord::IndirectDirBlock { block_nr: nr, index, old: o, new: n },
        )?;
    }
    Ok(())
}

/// Which version of the filesystem a directory lookup should see.
#[derive(Clone, Copy)]
enum DirSource {
    /// The pre-transaction snapshot: read cache only.
    Old,
    /// The post-transaction snapshot: write cache where present, read
    /// cache otherwise.
    New,
}

fn find_block(ctx: &PluginCtx, source: DirSource, nr: u32) -> Option<Handle> {
    match source {
        DirSource::Old => ctx.cache.find(Kind::Read, nr),
        DirSource::New => ctx
            .cache
            .find(Kind::Write, nr)
            .or_else(|| ctx.cache.find(Kind::Read, nr)),
    }
}

fn inode_at(ctx: &PluginCtx, sb: &Superblock, source: DirSource, inode_nr: u32) -> Option<Inode> {
    let (block_nr, slot) = Inode::locate(sb, inode_nr);
    let h = find_block(ctx, source, block_nr)?;
    h.with(|inner| {
        if inner.buf.len() < INODE_SIZE * (slot as usize + 1) {
            None
        } else {
            Some(Inode::decode(&inner.buf, slot))
        }
    })
}

/// All blocks (direct + indirect) a directory inode currently points at, in
/// the given snapshot.
fn dir_block_numbers(ctx: &PluginCtx, source: DirSource, inode: &Inode) -> Vec<u32> {
    let mut out: Vec<u32> = inode.i_block_nr.iter().copied().filter(|&b| b != 0).collect();
    if inode.i_indirect != 0 {
        if let Some(h) = find_block(ctx, source, inode.i_indirect) {
            h.with(|inner| {
                for chunk in inner.buf.chunks_exact(4) {
                    let v = u32::from_le_bytes(chunk.try_into().unwrap());
                    if v != 0 {
                        out.push(v);
                    }
                }
            });
        }
    }
    out
}

/// Every live (non-deleted) dirent of directory `inode_nr`, read from every
/// dir block it owns in the given snapshot.
fn dir_entries(ctx: &PluginCtx, sb: &Superblock, source: DirSource, inode_nr: u32) -> Vec<Dirent> {
    let inode = match inode_at(ctx, sb, source, inode_nr) {
        Some(i) if i.i_type == IT_DIR => i,
        _ => return Vec::new(),
    };
    let mut out = Vec::new();
    for bnr in dir_block_numbers(ctx, source, &inode) {
        if let Some(h) = find_block(ctx, source, bnr) {
            h.with(|inner| {
                out.extend(iter_dirents(&inner.buf).filter(|d| d.inode_nr.is_some()));
            });
        }
    }
    out
}

/// Diffs a directory's entries against its pre-transaction snapshot.
/// Computed at most once per owning directory per transaction (the
/// processed-directories list dedups repeated dir blocks belonging to the
/// same directory).
fn diff_dir_block(ctx: &mut PluginCtx, plugin: &mut TestfsPlugin, handle: &Handle) -> Result<()> {
    let owning_inode = match handle.with(|h| h.side_data.as_ref().map(|d| d.owning_dir_inode_nr()))
    {
        Some(nr) => nr,
        None => return Ok(()),
    };
    if plugin.processed_dirs.contains(&owning_inode) {
        return Ok(());
    }
    plugin.processed_dirs.push(owning_inode);

    let sb = plugin.superblock;
    let old_entries = dir_entries(ctx, &sb, DirSource::Old, owning_inode);
    let new_entries = dir_entries(ctx, &sb, DirSource::New, owning_inode);

    let mut matched = vec![false; old_entries.len()];
    for new_d in &new_entries {
        let mut found = false;
        for (i, old_d) in old_entries.iter().enumerate() {
            if !matched[i] && old_d.inode_nr == new_d.inode_nr && old_d.name == new_d.name {
                matched[i] = true;
                found = true;
                break;
            }
        }
        if !found {
            let inode_nr = new_d.inode_nr.expect("dir_entries filters deleted entries");
            ctx.sink.record(
                ctx.tx_id,
                &ChangeRecord::DirEntryAdd {
                    dir_inode_nr: owning_inode,
                    name: new_d.name.clone(),
                    inode_nr,
                    dirent_size: Dirent::dirent_size(&new_d.name),
                },
            )?;
        }
    }
    for (i, old_d) in old_entries.iter().enumerate() {
        if !matched[i] {
            let inode_nr = old_d.inode_nr.expect("dir_entries filters deleted entries");
            ctx.sink.record(
                ctx.tx_id,
                &ChangeRecord::DirEntryRemove {
                    dir_inode_nr: owning_inode,
                    name: old_d.name.clone(),
                    inode_nr,
                    dirent_size: Dirent::dirent_size(&old_d.name),
                },
            )?;
        }
    }
    Ok(())
}

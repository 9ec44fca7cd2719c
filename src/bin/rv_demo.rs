//! Drives the runtime-verification layer against a hand-built `testfs`
//! image for one transaction: adding a file to the root directory.
//!
//! Usage: `rv-demo [image-path]`. With no argument a scratch image is
//! created next to the binary's working directory and left behind for
//! inspection alongside `rv.log`/`rv_change.log`.

use std::env;
use std::fs::OpenOptions;
use std::process::exit;

use log::info;

use rv::testfs::layout::{
    BLOCK_SIZE, IT_DIR, IT_FILE, Inode, ROOT_INODE_NR, SUPERBLOCK_NR, Superblock,
};
use rv::{BlockDevice, FileDevice, LogSink, Rv, RvConfig, TestfsPlugin};

const INODE_BLOCK_NR: u32 = 3;
const ROOT_DIR_BLOCK_NR: u32 = 4;
const NEW_FILE_INODE_NR: u32 = 1;

fn error(msg: impl std::fmt::Display) -> ! {
    eprintln!("rv-demo: error: {msg}");
    exit(1);
}

/// Builds a directory block holding `entries` packed from offset 0, with
/// every remaining 8-byte slot marked deleted (`d_inode_nr == -1`). All-zero
/// would decode as live entries pointing at inode 0 with an empty name,
/// since only a negative inode number marks a slot as free, so a freshly
/// formatted block cannot simply be zeroed the way `mkfs` would.
fn dir_block(entries: &[(u32, &str)]) -> Vec<u8> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut offset = 0usize;
    for &(inode_nr, name) in entries {
        buf[offset..offset + 4].copy_from_slice(&(inode_nr as i32).to_le_bytes());
        buf[offset + 4..offset + 8].copy_from_slice(&(name.len() as u32).to_le_bytes());
        buf[offset + 8..offset + 8 + name.len()].copy_from_slice(name.as_bytes());
        offset += 8 + name.len();
    }
    while offset + 8 <= buf.len() {
        buf[offset..offset + 4].copy_from_slice(&(-1i32).to_le_bytes());
        offset += 8;
    }
    buf
}

fn main() {
    env_logger::init();

    let path = env::args_os().nth(1).unwrap_or_else(|| "testfs.img".into());

    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .unwrap_or_else(|e| error(format!("{}: {e}", path.to_string_lossy())));
    file.set_len(16 * BLOCK_SIZE as u64)
        .unwrap_or_else(|e| error(e));

    let sb = Superblock {
        inode_freemap_start: 1,
        block_freemap_start: 2,
        inode_blocks_start: INODE_BLOCK_NR,
        data_blocks_start: ROOT_DIR_BLOCK_NR,
        modification_time: 0,
    };
    let mut sb_buf = vec![0u8; BLOCK_SIZE];
    sb.encode(&mut sb_buf);

    let mut root_inode_block = vec![0u8; BLOCK_SIZE];
    let mut root = Inode {
        i_type: IT_DIR,
        ..Inode::default()
    };
    root.i_block_nr[0] = ROOT_DIR_BLOCK_NR;
    root.encode(&mut root_inode_block, ROOT_INODE_NR);

    let root_dir_block = dir_block(&[]);

    let mut device = FileDevice::new(file, BLOCK_SIZE);
    device
        .write_block(SUPERBLOCK_NR, &sb_buf)
        .unwrap_or_else(|e| error(e));
    device
        .write_block(INODE_BLOCK_NR, &root_inode_block)
        .unwrap_or_else(|e| error(e));
    device
        .write_block(ROOT_DIR_BLOCK_NR, &root_dir_block)
        .unwrap_or_else(|e| error(e));

    let sink = LogSink::open("rv.log", "rv_change.log").unwrap_or_else(|e| error(e));

    let mut rv = Rv::new(
        Box::new(device),
        Box::new(sink),
        TestfsPlugin::new(),
        RvConfig::default(),
    )
    .unwrap_or_else(|e| error(e));

    // Mirror the initial on-disk state into RV, the way a real mount would
    // after reading the superblock and root inode block.
    rv.read(SUPERBLOCK_NR, &sb_buf);
    rv.read(INODE_BLOCK_NR, &root_inode_block);
    rv.read(ROOT_DIR_BLOCK_NR, &root_dir_block);

    info!("creating hello.txt in the root directory");
    rv.tx_start("create");

    let mut new_inode_block = root_inode_block.clone();
    let new_file = Inode {
        i_type: IT_FILE,
        ..Inode::default()
    };
    new_file.encode(&mut new_inode_block, NEW_FILE_INODE_NR);
    rv.write(INODE_BLOCK_NR, &new_inode_block);

    let new_dir_block = dir_block(&[(NEW_FILE_INODE_NR, "hello.txt")]);
    rv.write(ROOT_DIR_BLOCK_NR, &new_dir_block);

    rv.tx_commit("create");

    if !rv.is_enabled() {
        error("RV disabled itself during the transaction; see the log output above");
    }
    info!("transaction committed; see rv_change.log for the reported changes");
}

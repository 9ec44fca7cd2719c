//! Change sink (C6): where the diff pass reports what it found.
//!
//! Every commit writes an append-only text trail (`rv.log`, `rv_change.log`)
//! and, if the caller supplies one, asserts typed facts into a
//! [`FactSink`] for a downstream rule engine. The core must work with no
//! fact sink at all: [`NullFactSink`] is the default.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use log::debug;

/// One semantic change discovered by the diff pass, in the exact shapes the
/// plugin layer emits (mirroring the fixed-arity facts of the reference
/// rule engine).
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeRecord {
    SuperBlock {
        field: u32,
        old: u32,
        new: u32,
    },
    InodeFreemap {
        inode_nr: u32,
        old: bool,
        new: bool,
    },
    BlockFreemap {
        block_nr: u32,
        old: bool,
        new: bool,
    },
    Inode {
        inode_nr: u32,
        field: u32,
        old: u32,
        new: u32,
    },
    IndirectBlock {
        block_nr: u32,
        index: u32,
        old: u32,
        new: u32,
    },
    IndirectDirBlock {
        block_nr: u32,
        index: u32,
        old: u32,
        new: u32,
    },
    DirEntryAdd {
        dir_inode_nr: u32,
        name: String,
        inode_nr: u32,
        dirent_size: u32,
    },
    DirEntryRemove {
        dir_inode_nr: u32,
        name: String,
        inode_nr: u32,
        dirent_size: u32,
    },
}

impl ChangeRecord {
    fn log_line(&self) -> String {
        match self {
            ChangeRecord::SuperBlock { field, old, new } => {
                format!("super_block, field={field}, old={old}, new={new}")
            }
            ChangeRecord::InodeFreemap { inode_nr, old, new } => {
                format!("inode_freemap, inode_nr={inode_nr}, old={old}, new={new}")
            }
            ChangeRecord::BlockFreemap { block_nr, old, new } => {
                format!("block_freemap, block_nr={block_nr}, old={old}, new={new}")
            }
            ChangeRecord::Inode {
                inode_nr,
                field,
                old,
                new,
            } => format!("inode, inode_nr={inode_nr}, field={field}, old={old}, new={new}"),
            ChangeRecord::IndirectBlock {
                block_nr,
                index,
                old,
                new,
            } => format!("indirect_block, block_nr={block_nr}, index={index}, old={old}, new={new}"),
            ChangeRecord::IndirectDirBlock {
                block_nr,
                index,
                old,
                new,
            } => format!(
                "indirect_dir_block, block_nr={block_nr}, index={index}, old={old}, new={new}"
            ),
            ChangeRecord::DirEntryAdd {
                dir_inode_nr,
                name,
                inode_nr,
                dirent_size,
            } => format!(
                "dir_block, action=add, dir_inode_nr={dir_inode_nr}, name={name}, inode_nr={inode_nr}, dirent_size={dirent_size}"
            ),
            ChangeRecord::DirEntryRemove {
                dir_inode_nr,
                name,
                inode_nr,
                dirent_size,
            } => format!(
                "dir_block, action=remove, dir_inode_nr={dir_inode_nr}, name={name}, inode_nr={inode_nr}, dirent_size={dirent_size}"
            ),
        }
    }
}

/// Receives every change discovered during a commit, plus transaction
/// boundary notifications.
pub trait ChangeSink {
    fn tx_begin(&mut self, tx_id: u64, tx_type: &str) -> io::Result<()>;
    fn record(&mut self, tx_id: u64, change: &ChangeRecord) -> io::Result<()>;
    fn tx_end(&mut self, tx_id: u64) -> io::Result<()>;
}

/// A typed fact a [`FactSink`] can assert or retract. Field shapes mirror
/// [`ChangeRecord`] one-to-one; this is a separate type so a fact base can
/// outlive the text log and be retracted independently at `tx_end`.
pub type Fact = ChangeRecord;

/// Optional second consumer of changes, meant for a deductive rule engine.
/// The actual rule evaluation stays out of scope; this trait only shapes
/// the boundary so one could be plugged in later without touching the
/// core.
pub trait FactSink {
    fn assert(&mut self, tx_id: u64, fact: &Fact);
    fn retract_all(&mut self, tx_id: u64);
}

/// A `FactSink` that does nothing, used when the caller supplies none.
#[derive(Default)]
pub struct NullFactSink;

impl FactSink for NullFactSink {
    fn assert(&mut self, _tx_id: u64, _fact: &Fact) {}
    fn retract_all(&mut self, _tx_id: u64) {}
}

/// Append-only text log implementation of [`ChangeSink`].
///
/// Both `rv.log` and `rv_change.log` are truncated the first time they are
/// opened in a process's lifetime and appended to thereafter, matching the
/// reference implementation's `fopen(path, "w")`, not a true multi-run
/// append log. See `DESIGN.md` for the Open Question this resolves.
pub struct LogSink {
    rv_log: BufWriter<File>,
    change_log: BufWriter<File>,
}

impl LogSink {
    pub fn open(rv_log_path: impl AsRef<Path>, change_log_path: impl AsRef<Path>) -> io::Result<Self> {
        let rv_log = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(rv_log_path)?;
        let change_log = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(change_log_path)?;
        Ok(LogSink {
            rv_log: BufWriter::new(rv_log),
            change_log: BufWriter::new(change_log),
        })
    }
}

impl ChangeSink for LogSink {
    fn tx_begin(&mut self, tx_id: u64, tx_type: &str) -> io::Result<()> {
        debug!("tx {tx_id} start ({tx_type})");
        writeln!(self.rv_log, "id={tx_id}, start, type={tx_type}")?;
        self.rv_log.flush()
    }

    fn record(&mut self, tx_id: u64, change: &ChangeRecord) -> io::Result<()> {
        writeln!(self.change_log, "id={tx_id}, {}", change.log_line())?;
        self.change_log.flush()
    }

    fn tx_end(&mut self, tx_id: u64) -> io::Result<()> {
        debug!("tx {tx_id} end");
        writeln!(self.rv_log, "id={tx_id}, end")?;
        self.rv_log.flush()
    }
}

/// Wraps a [`ChangeSink`] together with an optional [`FactSink`] so the
/// core only ever has to drive one object.
pub struct CompositeSink<S: ChangeSink, F: FactSink = NullFactSink> {
    pub log: S,
    pub facts: F,
}

impl<S: ChangeSink, F: FactSink> CompositeSink<S, F> {
    pub fn new(log: S, facts: F) -> Self {
        CompositeSink { log, facts }
    }
}

impl<S: ChangeSink> CompositeSink<S, NullFactSink> {
    pub fn log_only(log: S) -> Self {
        CompositeSink {
            log,
            facts: NullFactSink,
        }
    }
}

impl<S: ChangeSink, F: FactSink> ChangeSink for CompositeSink<S, F> {
    fn tx_begin(&mut self, tx_id: u64, tx_type: &str) -> io::Result<()> {
        self.log.tx_begin(tx_id, tx_type)
    }

    fn record(&mut self, tx_id: u64, change: &ChangeRecord) -> io::Result<()> {
        self.facts.assert(tx_id, change);
        self.log.record(tx_id, change)
    }

    fn tx_end(&mut self, tx_id: u64) -> io::Result<()> {
        self.facts.retract_all(tx_id);
        self.log.tx_end(tx_id)
    }
}

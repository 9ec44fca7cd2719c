//! Runtime verification for block-structured filesystems.
//!
//! This crate sits between a filesystem implementation and its block
//! device, mirroring every read and write into a shadow cache so that at
//! each transaction boundary it can diff the blocks just written against
//! their last-committed versions and report what changed in terms the
//! filesystem's own on-disk structures, not raw bytes. See `testfs` for the
//! one plugin shipped here.

pub mod block;
pub mod cache;
mod cell;
pub mod core;
pub mod device;
pub mod error;
pub mod interval;
pub mod sink;
pub mod testfs;

pub use cache::{BlockCache, Handle, Kind, SideData};
pub use core::{FsPlugin, PluginCtx, Rv, RvConfig};
pub use device::{BlockDevice, FileDevice};
pub use error::{Result, RvError};
pub use interval::{BlockType, IntervalMap};
pub use sink::{ChangeRecord, ChangeSink, CompositeSink, Fact, FactSink, LogSink, NullFactSink};
pub use testfs::TestfsPlugin;

//! zdbfs-rs: a FUSE filesystem that keeps no local state of its own —
//! every inode, directory and data block is materialized on demand from a
//! remote append-only key-value store and written back through a small
//! write-back cache.

pub mod backend;
pub mod cache;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;

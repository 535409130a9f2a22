//! torrentfs - on-demand file access to torrents managed by a remote daemon
//!
//! This library serves byte-range reads of files inside torrents that a
//! separate BitTorrent daemon downloads. A read blocks until the pieces it
//! covers are downloaded and flushed out of the daemon's write cache, while
//! the daemon's piece priorities are steered towards what is being read.
//!
//! # Modules
//!
//! - [`backend`] - Handle table, capability checks and settings tuning
//! - [`torrent`] - Per-torrent state: piece waiters, flushes, prioritization
//! - [`info`] - Status snapshots, piece bitfields and byte-range splitting
//! - [`expiring`] - Single-flight cache for asynchronously fetched values
//! - [`rpc`] - Daemon client trait and wire types
//! - [`config`] - Timing and readahead settings

pub mod backend;
pub mod config;
pub mod constants;
pub mod error;
pub mod expiring;
pub mod info;
pub mod rpc;
pub mod torrent;

#[cfg(test)]
mod testing;

pub use backend::{Backend, ServerInfo, SyncBackend};
pub use config::Config;
pub use error::{Error, Result};
pub use expiring::{Expiring, Expiry};
pub use info::{split, Bitfield, FileEntry, Info, PieceSpan};
pub use rpc::{
    AddTorrentOptions, CacheEntry, DaemonClient, DaemonEvent, RpcError, SessionSettings,
    SettingValue, StatusFile, TorrentState, TorrentStatus,
};
pub use torrent::{FileInfo, Torrent};

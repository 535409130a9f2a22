//! Daemon contract constants and tuning parameters.
//!
//! This module pins the engine version and plugin this crate was built
//! against, the status fields requested from the daemon, the piece priority
//! levels used by the readahead scheduler, and the session settings the
//! backend keeps the daemon tuned to.

use crate::rpc::SettingValue;

// ============================================================================
// Daemon capability
// ============================================================================

/// Exact engine version the piece and cache contracts were verified against.
pub const REQUIRED_ENGINE_VERSION: &str = "1.1.9.0";

/// Plugin that exposes cache status, cache flushing and `CacheFlushedEvent`.
pub const REQUIRED_PLUGIN: &str = "PieceCache";

// ============================================================================
// Torrent status
// ============================================================================

/// Status fields requested on every torrent refresh.
pub const STATUS_FIELDS: &[&str] = &[
    "files",
    "length",
    "name",
    "piece_length",
    "piece_bitstring",
    "save_path",
    "hash",
    "num_pieces",
    "piece_priorities",
    "sequential_download",
    "state",
    "message",
];

/// Cache entry kind reported for pieces held in the write-back cache.
pub const WRITE_CACHE_KIND: u8 = 1;

// ============================================================================
// Piece priorities
// ============================================================================

/// Piece is not wanted.
pub const PRIORITY_SKIP: u8 = 0;

/// Piece falls inside a readahead window.
pub const PRIORITY_READAHEAD: u8 = 4;

/// Piece is needed by an outstanding read.
pub const PRIORITY_READING: u8 = 7;

// ============================================================================
// Open flags
// ============================================================================

/// Access mode mask of `open(2)` flags.
pub const O_ACCMODE: i32 = 0o3;

/// Read-only access mode.
pub const O_RDONLY: i32 = 0o0;

// ============================================================================
// Session tuning
// ============================================================================

/// Session settings favouring low-latency sequential throughput.
///
/// Redundant-connection closing and strict end-game would starve the pieces
/// a reader is blocked on, smooth connects slow down swarm ramp-up, and the
/// remaining values reconnect aggressively to keep the pipe full.
pub fn desired_session_settings() -> Vec<(&'static str, SettingValue)> {
    vec![
        ("close_redundant_connections", SettingValue::Bool(false)),
        ("strict_end_game_mode", SettingValue::Bool(false)),
        ("smooth_connects", SettingValue::Bool(false)),
        ("min_reconnect_time", SettingValue::Int(1)),
        ("max_failcount", SettingValue::Int(1)),
        ("connection_speed", SettingValue::Int(500)),
        ("connections_limit", SettingValue::Int(1000)),
        ("torrent_connect_boost", SettingValue::Int(100)),
    ]
}

/// Keys of [`desired_session_settings`], in order.
pub fn session_setting_keys() -> Vec<&'static str> {
    desired_session_settings()
        .into_iter()
        .map(|(key, _)| key)
        .collect()
}

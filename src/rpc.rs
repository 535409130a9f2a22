//! RPC surface consumed from the download daemon.
//!
//! The transport, authentication and event subscription plumbing live in
//! the client implementation; this module only fixes the calls and records
//! the file-access layer relies on.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by a [`DaemonClient`].
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The connection to the daemon failed or was lost.
    #[error("transport error: {0}")]
    Transport(String),

    /// The daemon raised an error while handling the call.
    #[error("{kind}: {message}")]
    Remote { kind: String, message: String },

    /// The response could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

/// A file entry of a multi-file torrent as reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFile {
    pub path: PathBuf,
    pub size: u64,
}

/// Run state reported for a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String")]
pub enum TorrentState {
    Allocating,
    Checking,
    Downloading,
    Seeding,
    Paused,
    Queued,
    Moving,
    Error,
    #[default]
    Unknown,
}

impl From<String> for TorrentState {
    fn from(state: String) -> Self {
        match state.as_str() {
            "Allocating" => TorrentState::Allocating,
            "Checking" => TorrentState::Checking,
            "Downloading" => TorrentState::Downloading,
            "Seeding" => TorrentState::Seeding,
            "Paused" => TorrentState::Paused,
            "Queued" => TorrentState::Queued,
            "Moving" => TorrentState::Moving,
            "Error" => TorrentState::Error,
            _ => TorrentState::Unknown,
        }
    }
}

impl TorrentState {
    pub fn is_paused(&self) -> bool {
        matches!(self, TorrentState::Paused)
    }
}

/// Torrent status record returned by `get_torrent_status`.
///
/// The daemon answers with an empty record for torrents it does not know,
/// which decodes to `hash == None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TorrentStatus {
    pub hash: Option<String>,
    pub name: Option<String>,
    pub files: Option<Vec<StatusFile>>,
    pub length: Option<u64>,
    pub piece_length: u64,
    /// Base64 of the completed-piece bitfield.
    pub piece_bitstring: String,
    pub save_path: PathBuf,
    pub num_pieces: usize,
    pub piece_priorities: Vec<u8>,
    pub sequential_download: bool,
    pub state: TorrentState,
    pub message: String,
}

impl TorrentStatus {
    pub fn is_registered(&self) -> bool {
        self.hash.as_deref().is_some_and(|hash| !hash.is_empty())
    }
}

/// One piece resident in the daemon's disk cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub piece: u32,
    pub kind: u8,
}

/// Value of a session setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

pub type SessionSettings = BTreeMap<String, SettingValue>;

/// Options for `add_torrent_file`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddTorrentOptions {
    pub add_paused: bool,
    pub sequential_download: bool,
}

/// Push notifications delivered by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    /// All cached writes of a torrent reached durable storage.
    CacheFlushed { hash: String },
}

/// Client for the download daemon's control API.
#[async_trait]
pub trait DaemonClient: Send + Sync {
    async fn get_torrent_status(
        &self,
        hash: &str,
        fields: &[&str],
    ) -> Result<TorrentStatus, RpcError>;

    async fn get_cache_info(&self, hash: &str) -> Result<Vec<CacheEntry>, RpcError>;

    /// Adds a torrent from its base64 encoded metainfo and returns its hash.
    async fn add_torrent_file(
        &self,
        save_path: Option<&Path>,
        data: String,
        options: AddTorrentOptions,
    ) -> Result<Option<String>, RpcError>;

    async fn prioritize_pieces(&self, hash: &str, priorities: &[u8]) -> Result<(), RpcError>;

    async fn set_sequential_download(&self, hash: &str, enabled: bool) -> Result<(), RpcError>;

    async fn resume_torrents(&self, hashes: &[String]) -> Result<(), RpcError>;

    /// Requests a flush; completion arrives as [`DaemonEvent::CacheFlushed`].
    async fn flush_cache(&self, hash: &str) -> Result<(), RpcError>;

    async fn get_engine_version(&self) -> Result<String, RpcError>;

    async fn get_enabled_plugins(&self) -> Result<Vec<String>, RpcError>;

    async fn get_session_settings(&self, keys: &[&str]) -> Result<SessionSettings, RpcError>;

    async fn set_session_settings(&self, settings: SessionSettings) -> Result<(), RpcError>;

    /// Registers for push events. Dropping the receiver deregisters.
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<DaemonEvent>, RpcError>;
}

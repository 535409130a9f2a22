//! In-memory daemon used by unit tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use data_encoding::BASE64;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::constants::{desired_session_settings, REQUIRED_ENGINE_VERSION, REQUIRED_PLUGIN};
use crate::info::Bitfield;
use crate::rpc::{
    AddTorrentOptions, CacheEntry, DaemonClient, DaemonEvent, RpcError, SessionSettings,
    StatusFile, TorrentState, TorrentStatus,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Status(String),
    CacheInfo(String),
    AddTorrent(String),
    Prioritize(String, Vec<u8>),
    Sequential(String, bool),
    Resume(Vec<String>),
    Flush(String),
    EngineVersion,
    Plugins,
    GetSettings,
    SetSettings(SessionSettings),
}

impl Call {
    pub fn hash(&self) -> Option<&str> {
        match self {
            Call::Status(h)
            | Call::CacheInfo(h)
            | Call::AddTorrent(h)
            | Call::Prioritize(h, _)
            | Call::Sequential(h, _)
            | Call::Flush(h) => Some(h),
            Call::Resume(hashes) => hashes.first().map(String::as_str),
            _ => None,
        }
    }

    /// True for calls that change daemon state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Call::AddTorrent(_)
                | Call::Prioritize(..)
                | Call::Sequential(..)
                | Call::Resume(_)
                | Call::Flush(_)
                | Call::SetSettings(_)
        )
    }
}

pub struct MockTorrent {
    pub files: Vec<(PathBuf, u64)>,
    pub piece_length: u64,
    pub save_path: PathBuf,
    pub have: HashSet<u32>,
    pub write_cache: HashSet<u32>,
    pub priorities: Vec<u8>,
    pub sequential: bool,
    pub state: TorrentState,
    pub registered: bool,
}

impl MockTorrent {
    pub fn new(files: &[(&str, u64)], piece_length: u64, save_path: &Path) -> Self {
        let files: Vec<(PathBuf, u64)> = files
            .iter()
            .map(|(path, size)| (PathBuf::from(path), *size))
            .collect();
        let total: u64 = files.iter().map(|(_, size)| size).sum();
        let num_pieces = total.div_ceil(piece_length) as usize;
        Self {
            files,
            piece_length,
            save_path: save_path.to_path_buf(),
            have: HashSet::new(),
            write_cache: HashSet::new(),
            priorities: vec![0; num_pieces],
            sequential: false,
            state: TorrentState::Downloading,
            registered: true,
        }
    }

    fn status(&self, hash: &str) -> TorrentStatus {
        if !self.registered {
            return TorrentStatus::default();
        }
        let num_pieces = self.priorities.len();
        TorrentStatus {
            hash: Some(hash.to_string()),
            files: Some(
                self.files
                    .iter()
                    .map(|(path, size)| StatusFile {
                        path: path.clone(),
                        size: *size,
                    })
                    .collect(),
            ),
            piece_length: self.piece_length,
            piece_bitstring: Bitfield::from_pieces(
                self.have.iter().map(|&p| p as usize),
                num_pieces,
            )
            .to_base64(),
            save_path: self.save_path.clone(),
            num_pieces,
            piece_priorities: self.priorities.clone(),
            sequential_download: self.sequential,
            state: self.state,
            ..Default::default()
        }
    }
}

pub struct MockDaemon {
    torrents: Mutex<HashMap<String, MockTorrent>>,
    calls: Mutex<Vec<Call>>,
    events: Mutex<Option<mpsc::UnboundedSender<DaemonEvent>>>,
    version: Mutex<String>,
    plugins: Mutex<Vec<String>>,
    settings: Mutex<SessionSettings>,
    status_delay: Mutex<Duration>,
    status_in_flight: AtomicUsize,
    status_peak: AtomicUsize,
}

impl MockDaemon {
    pub fn new() -> Arc<Self> {
        let settings = desired_session_settings()
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        Arc::new(Self {
            torrents: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            version: Mutex::new(REQUIRED_ENGINE_VERSION.to_string()),
            plugins: Mutex::new(vec![REQUIRED_PLUGIN.to_string()]),
            settings: Mutex::new(settings),
            status_delay: Mutex::new(Duration::ZERO),
            status_in_flight: AtomicUsize::new(0),
            status_peak: AtomicUsize::new(0),
        })
    }

    pub fn insert(&self, hash: &str, torrent: MockTorrent) {
        self.torrents.lock().insert(hash.to_string(), torrent);
    }

    pub fn with_torrent<R>(&self, hash: &str, f: impl FnOnce(&mut MockTorrent) -> R) -> R {
        let mut torrents = self.torrents.lock();
        f(torrents.get_mut(hash).expect("mock torrent"))
    }

    /// Marks a piece downloaded, optionally still sitting in the write cache.
    pub fn complete_piece(&self, hash: &str, piece: u32, cached: bool) {
        self.with_torrent(hash, |t| {
            t.have.insert(piece);
            if cached {
                t.write_cache.insert(piece);
            }
        });
    }

    pub fn priorities(&self, hash: &str) -> Vec<u8> {
        self.with_torrent(hash, |t| t.priorities.clone())
    }

    pub fn set_version(&self, version: &str) {
        *self.version.lock() = version.to_string();
    }

    pub fn set_plugins(&self, plugins: &[&str]) {
        *self.plugins.lock() = plugins.iter().map(|p| p.to_string()).collect();
    }

    pub fn settings(&self) -> SessionSettings {
        self.settings.lock().clone()
    }

    pub fn set_settings(&self, settings: SessionSettings) {
        *self.settings.lock() = settings;
    }

    pub fn set_status_delay(&self, delay: Duration) {
        *self.status_delay.lock() = delay;
    }

    /// Most status calls ever running at the same time.
    pub fn status_peak(&self) -> usize {
        self.status_peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

/// Counts a call as running until dropped, aborted calls included.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(current)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DaemonClient for MockDaemon {
    async fn get_torrent_status(
        &self,
        hash: &str,
        _fields: &[&str],
    ) -> Result<TorrentStatus, RpcError> {
        self.record(Call::Status(hash.to_string()));
        let _in_flight = InFlight::enter(&self.status_in_flight, &self.status_peak);
        let delay = *self.status_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let status = self
            .torrents
            .lock()
            .get(hash)
            .map(|t| t.status(hash))
            .unwrap_or_default();
        Ok(status)
    }

    async fn get_cache_info(&self, hash: &str) -> Result<Vec<CacheEntry>, RpcError> {
        self.record(Call::CacheInfo(hash.to_string()));
        let torrents = self.torrents.lock();
        Ok(torrents
            .get(hash)
            .map(|t| {
                t.write_cache
                    .iter()
                    .map(|&piece| CacheEntry { piece, kind: 1 })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn add_torrent_file(
        &self,
        _save_path: Option<&Path>,
        data: String,
        _options: AddTorrentOptions,
    ) -> Result<Option<String>, RpcError> {
        // Tests use the hash itself as metainfo.
        let raw = BASE64
            .decode(data.as_bytes())
            .map_err(|e| RpcError::Decode(e.to_string()))?;
        let hash = String::from_utf8(raw).map_err(|e| RpcError::Decode(e.to_string()))?;
        self.record(Call::AddTorrent(hash.clone()));
        let mut torrents = self.torrents.lock();
        match torrents.get_mut(&hash) {
            Some(t) => {
                t.registered = true;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    async fn prioritize_pieces(&self, hash: &str, priorities: &[u8]) -> Result<(), RpcError> {
        self.record(Call::Prioritize(hash.to_string(), priorities.to_vec()));
        self.with_torrent(hash, |t| t.priorities = priorities.to_vec());
        Ok(())
    }

    async fn set_sequential_download(&self, hash: &str, enabled: bool) -> Result<(), RpcError> {
        self.record(Call::Sequential(hash.to_string(), enabled));
        self.with_torrent(hash, |t| t.sequential = enabled);
        Ok(())
    }

    async fn resume_torrents(&self, hashes: &[String]) -> Result<(), RpcError> {
        self.record(Call::Resume(hashes.to_vec()));
        for hash in hashes {
            self.with_torrent(hash, |t| t.state = TorrentState::Downloading);
        }
        Ok(())
    }

    async fn flush_cache(&self, hash: &str) -> Result<(), RpcError> {
        self.record(Call::Flush(hash.to_string()));
        self.with_torrent(hash, |t| t.write_cache.clear());
        let events = self.events.lock().clone();
        if let Some(events) = events {
            let hash = hash.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let _ = events.send(DaemonEvent::CacheFlushed { hash });
            });
        }
        Ok(())
    }

    async fn get_engine_version(&self) -> Result<String, RpcError> {
        self.record(Call::EngineVersion);
        Ok(self.version.lock().clone())
    }

    async fn get_enabled_plugins(&self) -> Result<Vec<String>, RpcError> {
        self.record(Call::Plugins);
        Ok(self.plugins.lock().clone())
    }

    async fn get_session_settings(&self, keys: &[&str]) -> Result<SessionSettings, RpcError> {
        self.record(Call::GetSettings);
        let settings = self.settings.lock();
        Ok(keys
            .iter()
            .filter_map(|key| settings.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect())
    }

    async fn set_session_settings(&self, settings: SessionSettings) -> Result<(), RpcError> {
        self.record(Call::SetSettings(settings.clone()));
        self.settings.lock().extend(settings);
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<DaemonEvent>, RpcError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        Ok(rx)
    }
}

/// Short timings so polling tests settle quickly.
pub fn test_config() -> Config {
    Config {
        info_cache_time: 1.0,
        server_info_cache_time: 1.0,
        info_poll_interval: 0.02,
        server_info_poll_interval: 60.0,
        cache_flush_timeout: 1.0,
        piece_timeout: None,
        readahead_pieces: 2,
        readahead_bytes: 0,
    }
}

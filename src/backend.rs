//! Top-level file-access façade.
//!
//! The [`Backend`] owns the daemon client, hands out file handles, keeps one
//! [`Torrent`] per torrent with open handles, and routes the daemon's push
//! events. Reads are refused unless the daemon runs the engine and plugin
//! the piece and cache contracts depend on.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use torrentfs::{Backend, Config, DaemonClient};
//!
//! # async fn example(client: Arc<dyn DaemonClient>) -> Result<(), torrentfs::Error> {
//! let backend = Backend::new(client, Config::default());
//! backend.init().await?;
//!
//! let handle = backend.open("0123abcd", 0, 0).await?;
//! let data = backend.read("0123abcd", 0, 0, 65536, handle, None).await?;
//! assert!(data.len() <= 65536);
//! backend.release("0123abcd", 0, handle).await?;
//!
//! backend.destroy();
//! # Ok(())
//! # }
//! ```

mod blocking;
mod server;

pub use blocking::SyncBackend;
pub use server::ServerInfo;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use crate::config::Config;
use crate::constants::{O_ACCMODE, O_RDONLY};
use crate::error::{Error, Result};
use crate::expiring::{Expiring, Expiry};
use crate::rpc::{DaemonClient, DaemonEvent};
use crate::torrent::{FileInfo, Torrent};

#[derive(Default)]
struct State {
    torrents: HashMap<String, Arc<Torrent>>,
    handles: HashMap<u64, Arc<FileInfo>>,
    metainfo: HashMap<String, Bytes>,
    last_release: Option<Instant>,
    tasks: Vec<JoinHandle<()>>,
    prioritize_task: Option<AbortHandle>,
}

pub struct Backend {
    client: Arc<dyn DaemonClient>,
    config: Arc<Config>,
    server_info: Expiring<Arc<ServerInfo>>,
    next_handle: AtomicU64,
    state: Mutex<State>,
}

impl Backend {
    pub fn new(client: Arc<dyn DaemonClient>, config: Config) -> Arc<Self> {
        let server_ttl = config.server_info_cache_time();
        Arc::new(Self {
            client,
            config: Arc::new(config),
            server_info: Expiring::new(Expiry::After(server_ttl)),
            next_handle: AtomicU64::new(1),
            state: Mutex::new(State::default()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Subscribes to daemon events and starts the background settings poll.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        let events = self.client.subscribe().await?;
        let dispatch = tokio::spawn(Arc::clone(self).dispatch_events(events));
        let poll = tokio::spawn(Arc::clone(self).poll());
        self.state.lock().tasks.extend([dispatch, poll]);
        debug!("Backend initialized");
        Ok(())
    }

    /// Stops background work, drops every torrent and deregisters events.
    pub fn destroy(&self) {
        let (tasks, prioritize, torrents) = {
            let mut state = self.state.lock();
            state.handles.clear();
            (
                std::mem::take(&mut state.tasks),
                state.prioritize_task.take(),
                std::mem::take(&mut state.torrents),
            )
        };
        for task in tasks {
            task.abort();
        }
        if let Some(prioritize) = prioritize {
            prioritize.abort();
        }
        for torrent in torrents.into_values() {
            torrent.destroy();
        }
        self.server_info.cancel();
        debug!("Backend destroyed");
    }

    async fn dispatch_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<DaemonEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                DaemonEvent::CacheFlushed { hash } => self.on_cache_flushed(&hash),
            }
        }
        warn!("Daemon event stream closed");
    }

    async fn poll(self: Arc<Self>) {
        loop {
            match self.refresh_server_info().await {
                Ok(_) => {
                    let _ = self.prioritize();
                }
                Err(e) => warn!("Polling daemon capabilities failed: {}", e),
            }
            tokio::time::sleep(self.config.server_info_poll_interval()).await;
        }
    }

    /// Makes the raw torrent file available for re-adding `hash` to the daemon.
    pub fn register_metainfo(&self, hash: &str, data: Bytes) {
        self.state.lock().metainfo.insert(hash.to_string(), data);
    }

    /// Opens file `file_index` of torrent `hash` read-only.
    pub async fn open(&self, hash: &str, file_index: usize, flags: i32) -> Result<u64> {
        if flags & O_ACCMODE != O_RDONLY {
            return Err(Error::ReadOnly);
        }

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let torrent = {
            let mut state = self.state.lock();
            let metainfo = state.metainfo.get(hash).cloned();
            let torrent = state
                .torrents
                .entry(hash.to_string())
                .or_insert_with(|| {
                    Torrent::new(
                        hash.to_string(),
                        Arc::clone(&self.client),
                        Arc::clone(&self.config),
                        metainfo,
                    )
                })
                .clone();
            let file = FileInfo::new(Arc::clone(&torrent), file_index);
            torrent.add_handle(id, Arc::clone(&file));
            state.handles.insert(id, file);
            torrent
        };

        let _ = torrent.prioritize();
        debug!("Opened handle {} on file {} of {}", id, file_index, hash);
        Ok(id)
    }

    fn file(&self, hash: &str, file_index: usize, handle: u64) -> Result<Arc<FileInfo>> {
        let state = self.state.lock();
        state
            .handles
            .get(&handle)
            .filter(|file| file.torrent().hash() == hash && file.index() == file_index)
            .cloned()
            .ok_or(Error::BadHandle(handle))
    }

    /// Reads up to `size` bytes at `offset`, waiting for the pieces to land on disk.
    pub async fn read(
        &self,
        hash: &str,
        file_index: usize,
        offset: u64,
        size: u64,
        handle: u64,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        self.validate().await?;
        let file = self.file(hash, file_index, handle)?;
        file.read(offset, size, timeout.or(self.config.piece_timeout()))
            .await
    }

    /// Closes a handle, dropping its torrent if it was the last one.
    pub async fn release(&self, hash: &str, file_index: usize, handle: u64) -> Result<()> {
        let (torrent, remaining) = {
            let mut state = self.state.lock();
            state.last_release = Some(Instant::now());

            let owned = state
                .handles
                .get(&handle)
                .is_some_and(|file| file.torrent().hash() == hash && file.index() == file_index);
            if !owned {
                return Err(Error::BadHandle(handle));
            }
            state.handles.remove(&handle);

            let torrent = state
                .torrents
                .get(hash)
                .cloned()
                .ok_or_else(|| Error::TorrentNotFound(hash.to_string()))?;
            let remaining = torrent.remove_handle(handle).unwrap_or(0);
            if remaining == 0 {
                state.torrents.remove(hash);
            }
            (torrent, remaining)
        };

        if remaining == 0 {
            torrent.destroy();
            debug!("Released last handle of {}", hash);
            return Ok(());
        }

        // Deprioritize what this handle was reading right away.
        match torrent.prioritize().await {
            Ok(_) => Ok(()),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(Error::Task(e.to_string())),
        }
    }

    /// Routes a flush-completion event to its torrent.
    pub fn on_cache_flushed(&self, hash: &str) {
        let torrent = self.state.lock().torrents.get(hash).cloned();
        match torrent {
            Some(torrent) => torrent.on_cache_flushed(),
            None => debug!("Cache flush event for untracked torrent {}", hash),
        }
    }

    pub fn torrent(&self, hash: &str) -> Option<Arc<Torrent>> {
        self.state.lock().torrents.get(hash).cloned()
    }

    pub fn torrent_count(&self) -> usize {
        self.state.lock().torrents.len()
    }

    pub fn handle_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// When a handle was last released, for idle-shutdown policies.
    pub fn last_release(&self) -> Option<Instant> {
        self.state.lock().last_release
    }
}

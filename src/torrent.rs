//! Per-torrent state machine.
//!
//! A [`Torrent`] exists while at least one [`FileInfo`] handle is open on
//! it. It keeps a single-flight cached [`Info`], wakes readers waiting on
//! pieces, steers piece priorities towards what open handles are reading,
//! and coordinates write-cache flushes with the daemon.
//!
//! # Readiness
//!
//! A read can only be served from the backing store once each of its pieces
//! is both downloaded and out of the daemon's write cache. Waiting happens in
//! two phases: first every piece must be reported present (woken by a
//! refresh, with a background poll running while anyone waits), then the
//! cache is flushed until the snapshot shows all of them on disk.

mod file_info;
mod prioritize;

pub use file_info::FileInfo;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use data_encoding::BASE64;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::constants::{PRIORITY_SKIP, STATUS_FIELDS};
use crate::error::{Error, Result};
use crate::expiring::{Expiring, Expiry};
use crate::info::Info;
use crate::rpc::{AddTorrentOptions, DaemonClient, TorrentStatus};

#[derive(Default)]
struct State {
    handles: HashMap<u64, Arc<FileInfo>>,
    waiters: HashMap<u32, watch::Sender<bool>>,
    /// Pieces whose priority this layer raised from zero.
    raised: HashSet<u32>,
    flushed: Option<oneshot::Sender<()>>,
    last_save_path: Option<PathBuf>,
    poll_task: Option<JoinHandle<()>>,
    prioritize_task: Option<AbortHandle>,
    destroyed: bool,
}

pub struct Torrent {
    hash: String,
    client: Arc<dyn DaemonClient>,
    config: Arc<Config>,
    metainfo: Option<Bytes>,
    info: Expiring<Option<Arc<Info>>>,
    flush: Expiring<()>,
    state: Mutex<State>,
}

impl Torrent {
    /// Creates the state machine for `hash`.
    ///
    /// `metainfo` is the raw torrent file, used to add the torrent again if
    /// the daemon forgets it while handles are open.
    pub fn new(
        hash: String,
        client: Arc<dyn DaemonClient>,
        config: Arc<Config>,
        metainfo: Option<Bytes>,
    ) -> Arc<Self> {
        let info_ttl = config.info_cache_time();
        Arc::new(Self {
            hash,
            client,
            config,
            metainfo,
            info: Expiring::new(Expiry::After(info_ttl)),
            flush: Expiring::new(Expiry::OnCompletion),
            state: Mutex::new(State::default()),
        })
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn add_handle(&self, id: u64, file: Arc<FileInfo>) {
        self.state.lock().handles.insert(id, file);
    }

    /// Removes a handle and returns how many remain, or `None` if unknown.
    pub fn remove_handle(&self, id: u64) -> Option<usize> {
        let mut state = self.state.lock();
        state.handles.remove(&id).map(|_| state.handles.len())
    }

    pub fn handle_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Pieces some caller is currently waiting on.
    pub fn pending_pieces(&self) -> Vec<u32> {
        let mut pieces: Vec<u32> = self.state.lock().waiters.keys().copied().collect();
        pieces.sort_unstable();
        pieces
    }

    fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Returns the cached snapshot, refreshing it if stale.
    ///
    /// `None` means the daemon does not know the torrent and nothing here
    /// needs it any more.
    pub async fn get_info(self: &Arc<Self>) -> Result<Option<Arc<Info>>> {
        let this = Arc::clone(self);
        self.info.get(move || Arc::clone(&this).fetch_info()).await
    }

    /// Forces a new snapshot, replacing any refresh in flight.
    pub async fn refresh(self: &Arc<Self>) -> Result<Option<Arc<Info>>> {
        let this = Arc::clone(self);
        self.info.refresh(move || Arc::clone(&this).fetch_info()).await
    }

    pub(crate) async fn require_info(self: &Arc<Self>) -> Result<Arc<Info>> {
        self.get_info()
            .await?
            .ok_or_else(|| Error::TorrentNotFound(self.hash.clone()))
    }

    fn fetch_info(self: Arc<Self>) -> BoxFuture<'static, Result<Option<Arc<Info>>>> {
        self.refresh_once().boxed()
    }

    async fn refresh_once(self: Arc<Self>) -> Result<Option<Arc<Info>>> {
        if self.is_destroyed() {
            return Ok(None);
        }

        let mut status = self
            .client
            .get_torrent_status(&self.hash, STATUS_FIELDS)
            .await?;

        if !status.is_registered() {
            if self.handle_count() == 0 {
                debug!("Torrent {} is not registered and has no handles", self.hash);
                return Ok(None);
            }
            status = self.reregister().await?;
        }

        let cache = self.client.get_cache_info(&self.hash).await?;
        let info = Arc::new(Info::from_status(status, cache)?);
        debug!(
            "Refreshed {}: {}/{} pieces, {} write-cached",
            self.hash,
            info.pieces().count(),
            info.num_pieces(),
            info.write_cached().count()
        );

        self.wake_waiters(&info);
        let _ = self.prioritize();
        Ok(Some(info))
    }

    /// Adds the torrent to the daemon again and resets its priorities.
    async fn reregister(&self) -> Result<TorrentStatus> {
        let metainfo = self
            .metainfo
            .as_ref()
            .ok_or_else(|| Error::TorrentNotFound(self.hash.clone()))?;
        let save_path = self.state.lock().last_save_path.clone();

        info!("Torrent {} is not registered, adding it again", self.hash);
        let added = self
            .client
            .add_torrent_file(
                save_path.as_deref(),
                BASE64.encode(metainfo),
                AddTorrentOptions::default(),
            )
            .await?;
        match added {
            Some(hash) if hash == self.hash => {}
            other => {
                return Err(Error::HashMismatch {
                    expected: self.hash.clone(),
                    actual: other.unwrap_or_default(),
                })
            }
        }

        // Priorities from the previous registration are meaningless now.
        let status = self
            .client
            .get_torrent_status(&self.hash, STATUS_FIELDS)
            .await?;
        self.client
            .prioritize_pieces(&self.hash, &vec![PRIORITY_SKIP; status.num_pieces])
            .await?;
        self.state.lock().raised.clear();

        let status = self
            .client
            .get_torrent_status(&self.hash, STATUS_FIELDS)
            .await?;
        if !status.is_registered() {
            return Err(Error::TorrentNotFound(self.hash.clone()));
        }
        Ok(status)
    }

    fn wake_waiters(&self, info: &Info) {
        let mut state = self.state.lock();
        state.last_save_path = Some(info.save_path().to_path_buf());
        state.waiters.retain(|&piece, ready| {
            if info.have_piece(piece) {
                debug!("Piece {} of {} is ready", piece, info.hash());
                ready.send_replace(true);
                false
            } else {
                true
            }
        });
        if state.waiters.is_empty() {
            if let Some(poll) = state.poll_task.take() {
                poll.abort();
            }
        }
    }

    fn ensure_polling(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        if state.poll_task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        state.poll_task = Some(tokio::spawn(Arc::clone(self).poll()));
    }

    async fn poll(self: Arc<Self>) {
        loop {
            {
                // Checked and cleared under one lock so a new waiter either
                // sees this task gone or is seen by it.
                let mut state = self.state.lock();
                if state.waiters.is_empty() {
                    state.poll_task = None;
                    return;
                }
            }
            if let Err(e) = self.refresh().await {
                warn!("Polling {} failed: {}", self.hash, e);
            }
            tokio::time::sleep(self.config.info_poll_interval()).await;
        }
    }

    /// Waits until the daemon reports `piece` downloaded.
    pub async fn ensure_piece(self: &Arc<Self>, piece: u32, timeout: Option<Duration>) -> Result<()> {
        let info = self.require_info().await?;
        if piece as usize >= info.num_pieces() {
            return Err(Error::InvalidPieceIndex(piece));
        }
        if info.have_piece(piece) {
            return Ok(());
        }

        let mut waiter = {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(Error::TorrentNotFound(self.hash.clone()));
            }
            let ready = state
                .waiters
                .entry(piece)
                .or_insert_with(|| watch::channel(false).0)
                .subscribe();
            PieceWaiter {
                torrent: self.as_ref(),
                piece,
                ready: Some(ready),
            }
        };
        self.ensure_polling();

        match timeout {
            Some(limit) => tokio::time::timeout(limit, waiter.wait())
                .await
                .unwrap_or_else(|_| {
                    Err(Error::Timeout(format!("piece {} of {}", piece, self.hash)))
                }),
            None => waiter.wait().await,
        }
    }

    fn forget_waiter(&self, piece: u32) {
        let mut state = self.state.lock();
        if state
            .waiters
            .get(&piece)
            .is_some_and(|ready| ready.receiver_count() == 0)
        {
            state.waiters.remove(&piece);
        }
    }

    /// Waits until every piece is downloaded and flushed out of the write cache.
    pub async fn ensure_pieces_on_disk(
        self: &Arc<Self>,
        pieces: &[u32],
        timeout: Option<Duration>,
    ) -> Result<()> {
        let info = self.require_info().await?;
        if pieces.iter().all(|&piece| info.piece_on_disk(piece)) {
            return Ok(());
        }

        futures::future::try_join_all(pieces.iter().map(|&piece| self.ensure_piece(piece, timeout)))
            .await?;

        loop {
            let info = self
                .refresh()
                .await?
                .ok_or_else(|| Error::TorrentNotFound(self.hash.clone()))?;
            let cached = pieces
                .iter()
                .filter(|&&piece| !info.piece_on_disk(piece))
                .count();
            if cached == 0 {
                return Ok(());
            }
            debug!("{} pieces of {} still write-cached, flushing", cached, self.hash);
            self.flush_cache().await?;
        }
    }

    /// Asks the daemon to flush its write cache and waits for confirmation.
    pub async fn flush_cache(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        self.flush
            .get(move || Arc::clone(&this).flush_once().boxed())
            .await
    }

    async fn flush_once(self: Arc<Self>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(Error::TorrentNotFound(self.hash.clone()));
            }
            state.flushed = Some(tx);
        }

        self.client.flush_cache(&self.hash).await?;

        match tokio::time::timeout(self.config.cache_flush_timeout(), rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.state.lock().flushed = None;
                Err(Error::Timeout(format!("cache flush of {}", self.hash)))
            }
        }
    }

    /// Handles the daemon's flush-completion event for this torrent.
    pub fn on_cache_flushed(&self) {
        let pending = self.state.lock().flushed.take();
        match pending {
            Some(flushed) => {
                let _ = flushed.send(());
            }
            None => debug!("Spurious cache flush notification for {}", self.hash),
        }
        self.info.invalidate();
    }

    /// Cancels all background work and wakes every waiter with an error.
    pub fn destroy(&self) {
        let (poll, prioritize) = {
            let mut state = self.state.lock();
            state.destroyed = true;
            state.handles.clear();
            state.waiters.clear();
            state.flushed = None;
            (state.poll_task.take(), state.prioritize_task.take())
        };
        if let Some(poll) = poll {
            poll.abort();
        }
        if let Some(prioritize) = prioritize {
            prioritize.abort();
        }
        self.info.cancel();
        self.flush.cancel();
        debug!("Torrent {} destroyed", self.hash);
    }
}

/// Interest in one piece. Unregisters itself however the wait ends,
/// including when the waiting future is dropped.
struct PieceWaiter<'a> {
    torrent: &'a Torrent,
    piece: u32,
    ready: Option<watch::Receiver<bool>>,
}

impl PieceWaiter<'_> {
    async fn wait(&mut self) -> Result<()> {
        match self.ready.as_mut() {
            Some(ready) => wait_ready(ready).await,
            None => Err(Error::Cancelled),
        }
    }
}

impl Drop for PieceWaiter<'_> {
    fn drop(&mut self) {
        // The receiver must be gone before the count is checked.
        self.ready.take();
        self.torrent.forget_waiter(self.piece);
    }
}

async fn wait_ready(ready: &mut watch::Receiver<bool>) -> Result<()> {
    loop {
        let done = *ready.borrow_and_update();
        if done {
            return Ok(());
        }
        if ready.changed().await.is_err() {
            // Sender gone: either woken and removed, or the torrent was destroyed.
            let done = *ready.borrow();
            return if done { Ok(()) } else { Err(Error::Cancelled) };
        }
    }
}

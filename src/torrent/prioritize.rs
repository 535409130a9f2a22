use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::Torrent;
use crate::constants::{PRIORITY_READAHEAD, PRIORITY_READING, PRIORITY_SKIP};
use crate::error::{Error, Result};
use crate::info::Info;

impl Torrent {
    /// Recomputes piece priorities in the background.
    ///
    /// Any pass still running is aborted so only the newest read pattern is
    /// applied. The returned handle may be awaited or dropped.
    pub fn prioritize(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let mut state = self.state.lock();
        if let Some(previous) = state.prioritize_task.take() {
            previous.abort();
        }
        if state.destroyed {
            return tokio::spawn(async { Ok(()) });
        }

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = this.prioritize_once().await;
            if let Err(e) = &result {
                warn!("Prioritizing {} failed: {}", this.hash, e);
            }
            result
        });
        state.prioritize_task = Some(task.abort_handle());
        task
    }

    /// Brings the daemon's piece priorities in line with open handles' reads.
    pub async fn prioritize_once(self: &Arc<Self>) -> Result<()> {
        let Some(info) = self.get_info().await? else {
            if self.handle_count() > 0 {
                return Err(Error::TorrentNotFound(self.hash.clone()));
            }
            return Ok(());
        };

        let (lasts, reading) = self.read_positions();
        let window = self.config.readahead_window(info.piece_length());
        let desired = desired_priorities(info.num_pieces(), &lasts, &reading, window);
        let changes = {
            let mut state = self.state.lock();
            stage_changes(&info, &desired, &mut state.raised)
        };

        let resume;
        let mut calls = Vec::new();
        if let Some(priorities) = &changes {
            debug!(
                "Updating priorities of {}: reading {:?}, readahead {} after {:?}",
                self.hash, reading, window, lasts
            );
            calls.push(self.client.prioritize_pieces(&self.hash, priorities));
        }
        if !info.sequential_download() {
            calls.push(self.client.set_sequential_download(&self.hash, true));
        }
        if info.state().is_paused() {
            resume = vec![self.hash.clone()];
            calls.push(self.client.resume_torrents(&resume));
        }
        if calls.is_empty() {
            return Ok(());
        }

        futures::future::try_join_all(calls).await?;
        self.info.invalidate();
        Ok(())
    }

    /// Last piece and all pieces of each open handle's most recent read.
    fn read_positions(&self) -> (Vec<u32>, HashSet<u32>) {
        let state = self.state.lock();
        let mut lasts = Vec::new();
        let mut reading = HashSet::new();
        for file in state.handles.values() {
            let pieces = file.last_pieces();
            if let Some(&last) = pieces.iter().max() {
                lasts.push(last);
            }
            reading.extend(pieces);
        }
        (lasts, reading)
    }
}

/// Readahead after every handle's last piece, overlaid by pieces being read.
pub(crate) fn desired_priorities(
    num_pieces: usize,
    lasts: &[u32],
    reading: &HashSet<u32>,
    readahead: usize,
) -> Vec<u8> {
    let mut desired = vec![PRIORITY_SKIP; num_pieces];
    for &last in lasts {
        let start = (last as usize + 1).min(num_pieces);
        let end = start.saturating_add(readahead).min(num_pieces);
        desired[start..end].fill(PRIORITY_READAHEAD);
    }
    for &piece in reading {
        if let Some(slot) = desired.get_mut(piece as usize) {
            *slot = PRIORITY_READING;
        }
    }
    desired
}

/// Returns the full priority array to send, or `None` if nothing changes.
///
/// Pieces already downloaded are left alone, and a priority is only lowered
/// back to zero if this layer raised it.
pub(crate) fn stage_changes(
    info: &Info,
    desired: &[u8],
    raised: &mut HashSet<u32>,
) -> Option<Vec<u8>> {
    let current = info.piece_priorities();
    let mut next = current.to_vec();
    let mut changed = false;

    for (index, (&have, &want)) in current.iter().zip(desired).enumerate() {
        let piece = index as u32;
        if info.have_piece(piece) {
            raised.remove(&piece);
            continue;
        }
        if have == want {
            continue;
        }
        if have == PRIORITY_SKIP {
            raised.insert(piece);
        } else if want == PRIORITY_SKIP && !raised.remove(&piece) {
            continue;
        }
        next[index] = want;
        changed = true;
    }

    changed.then_some(next)
}

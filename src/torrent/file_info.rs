use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::FutureExt;
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex as TokioMutex;
use tracing::debug;

use super::Torrent;
use crate::error::Result;
use crate::expiring::{Expiring, Expiry};
use crate::info::split;

struct OpenFile {
    path: PathBuf,
    file: TokioMutex<File>,
}

impl OpenFile {
    async fn open(path: PathBuf) -> Result<Self> {
        let file = File::open(&path).await?;
        debug!("Opened {}", path.display());
        Ok(Self {
            path,
            file: TokioMutex::new(file),
        })
    }

    async fn read_at(&self, offset: u64, size: usize) -> Result<Bytes> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                debug!(
                    "Short read of {} at {}: {} of {} bytes",
                    self.path.display(),
                    offset,
                    filled,
                    size
                );
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }
}

/// One open handle on a file inside a torrent.
pub struct FileInfo {
    torrent: Arc<Torrent>,
    index: usize,
    file: Expiring<Arc<OpenFile>>,
    last_pieces: Mutex<Vec<u32>>,
}

impl FileInfo {
    pub fn new(torrent: Arc<Torrent>, index: usize) -> Arc<Self> {
        Arc::new(Self {
            torrent,
            index,
            file: Expiring::new(Expiry::Never),
            last_pieces: Mutex::new(Vec::new()),
        })
    }

    pub fn torrent(&self) -> &Arc<Torrent> {
        &self.torrent
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Pieces touched by this handle's most recent read.
    pub fn last_pieces(&self) -> Vec<u32> {
        self.last_pieces.lock().clone()
    }

    pub(crate) fn set_last_pieces(&self, pieces: Vec<u32>) {
        *self.last_pieces.lock() = pieces;
    }

    async fn open_file(&self) -> Result<Arc<OpenFile>> {
        let torrent = Arc::clone(&self.torrent);
        let index = self.index;
        self.file
            .get(move || {
                let torrent = Arc::clone(&torrent);
                async move {
                    let info = torrent.require_info().await?;
                    let path = info.file_path(index)?;
                    Ok(Arc::new(OpenFile::open(path).await?))
                }
                .boxed()
            })
            .await
    }

    /// Reads up to `size` bytes at `offset` once the covering pieces are on disk.
    pub async fn read(
        &self,
        offset: u64,
        size: u64,
        piece_timeout: Option<Duration>,
    ) -> Result<Bytes> {
        let info = self.torrent.require_info().await?;
        let spans = split(&info, self.index, offset, size)?;
        let pieces: Vec<u32> = spans.iter().map(|span| span.piece).collect();
        let length: u64 = spans.iter().map(|span| span.len()).sum();

        self.set_last_pieces(pieces.clone());
        let _ = self.torrent.prioritize();

        self.torrent
            .ensure_pieces_on_disk(&pieces, piece_timeout)
            .await?;
        if length == 0 {
            return Ok(Bytes::new());
        }

        let file = self.open_file().await?;
        file.read_at(offset, length as usize).await
    }
}

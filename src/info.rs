//! Torrent status snapshots.
//!
//! An [`Info`] is decoded from one status and one cache-status round trip
//! and never changes afterwards; fresher state always arrives as a new
//! snapshot.
//!
//! # Components
//!
//! - [`Bitfield`] - Completed-piece flags decoded from the daemon
//! - [`Info`] - Immutable status snapshot with piece presence queries
//! - [`FileEntry`] - A file of the torrent and its absolute offset
//! - [`split`] - Mapping of a file byte range to piece spans
//!
//! # Examples
//!
//! ```
//! use torrentfs::info::{split, Info};
//! use torrentfs::rpc::{StatusFile, TorrentStatus};
//!
//! let status = TorrentStatus {
//!     hash: Some("abc".into()),
//!     files: Some(vec![StatusFile { path: "movie.mkv".into(), size: 40 }]),
//!     piece_length: 16,
//!     num_pieces: 3,
//!     ..Default::default()
//! };
//! let info = Info::from_status(status, Vec::new()).unwrap();
//!
//! let spans = split(&info, 0, 10, 20).unwrap();
//! assert_eq!(spans.len(), 2);
//! assert_eq!((spans[0].low, spans[0].high), (10, 16));
//! ```

mod bitfield;
mod split;

pub use bitfield::Bitfield;
pub use split::{split, PieceSpan};

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use crate::constants::WRITE_CACHE_KIND;
use crate::error::Error;
use crate::rpc::{CacheEntry, TorrentState, TorrentStatus};

/// A file inside a torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the torrent's save path.
    pub path: PathBuf,
    pub length: u64,
    /// Offset of the first byte within the torrent's concatenated content.
    pub offset: u64,
}

impl FileEntry {
    pub fn new(path: PathBuf, length: u64, offset: u64) -> Self {
        Self {
            path,
            length,
            offset,
        }
    }
}

/// Immutable snapshot of one torrent's status.
#[derive(Debug, Clone)]
pub struct Info {
    hash: String,
    files: Vec<FileEntry>,
    piece_length: u64,
    num_pieces: usize,
    piece_priorities: Vec<u8>,
    pieces: Bitfield,
    save_path: PathBuf,
    sequential_download: bool,
    state: TorrentState,
    message: String,
    write_cache: HashMap<u32, CacheEntry>,
}

impl Info {
    /// Builds a snapshot from a registered torrent's status and its cache entries.
    pub fn from_status(status: TorrentStatus, cache: Vec<CacheEntry>) -> Result<Self, Error> {
        let hash = match status.hash {
            Some(hash) if !hash.is_empty() => hash,
            _ => return Err(Error::InvalidStatus("missing torrent hash".into())),
        };

        let files = match (status.files, status.length) {
            (Some(files), _) => {
                let mut offset = 0;
                files
                    .into_iter()
                    .map(|file| {
                        let entry = FileEntry::new(file.path, file.size, offset);
                        offset += file.size;
                        entry
                    })
                    .collect()
            }
            (None, Some(length)) => {
                let name = status.name.unwrap_or_else(|| hash.clone());
                vec![FileEntry::new(PathBuf::from(name), length, 0)]
            }
            (None, None) => {
                return Err(Error::InvalidStatus(format!(
                    "torrent {} reports neither files nor length",
                    hash
                )))
            }
        };

        let mut piece_priorities = status.piece_priorities;
        piece_priorities.resize(status.num_pieces, 0);

        let write_cache = cache
            .into_iter()
            .filter(|entry| entry.kind == WRITE_CACHE_KIND)
            .map(|entry| (entry.piece, entry))
            .collect();

        Ok(Self {
            pieces: Bitfield::from_base64(&status.piece_bitstring)?,
            hash,
            files,
            piece_length: status.piece_length,
            num_pieces: status.num_pieces,
            piece_priorities,
            save_path: status.save_path,
            sequential_download: status.sequential_download,
            state: status.state,
            message: status.message,
            write_cache,
        })
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn file(&self, index: usize) -> Option<&FileEntry> {
        self.files.get(index)
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn piece_priorities(&self) -> &[u8] {
        &self.piece_priorities
    }

    pub fn pieces(&self) -> &Bitfield {
        &self.pieces
    }

    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    pub fn sequential_download(&self) -> bool {
        self.sequential_download
    }

    pub fn state(&self) -> TorrentState {
        self.state
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true once the daemon reports the piece downloaded.
    pub fn have_piece(&self, piece: u32) -> bool {
        self.pieces.get(piece as usize)
    }

    /// Returns true if the piece is downloaded and no longer in the write cache.
    pub fn piece_on_disk(&self, piece: u32) -> bool {
        self.have_piece(piece) && !self.write_cache.contains_key(&piece)
    }

    pub fn write_cached(&self) -> impl Iterator<Item = u32> + '_ {
        self.write_cache.keys().copied()
    }

    /// Resolves the absolute path of a file, rejecting paths that escape
    /// the save path.
    pub fn file_path(&self, index: usize) -> Result<PathBuf, Error> {
        let file = self.file(index).ok_or(Error::InvalidFileIndex(index))?;
        validate_file_path(&file.path)?;
        Ok(self.save_path.join(&file.path))
    }
}

fn validate_file_path(file_path: &Path) -> Result<(), Error> {
    for component in file_path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathTraversal(file_path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

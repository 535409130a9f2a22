use super::Info;
use crate::error::Error;

/// The part of one piece covered by a byte range.
///
/// `low..high` is relative to the start of the piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceSpan {
    pub piece: u32,
    pub low: u64,
    pub high: u64,
}

impl PieceSpan {
    pub fn len(&self) -> u64 {
        self.high - self.low
    }

    pub fn is_empty(&self) -> bool {
        self.high == self.low
    }
}

/// Maps `size` bytes at `offset` of file `file_index` to the pieces holding them.
///
/// The range is clamped to the end of the file; an empty result means there
/// is nothing to read.
pub fn split(
    info: &Info,
    file_index: usize,
    offset: u64,
    size: u64,
) -> Result<Vec<PieceSpan>, Error> {
    let file = info
        .file(file_index)
        .ok_or(Error::InvalidFileIndex(file_index))?;
    let piece_length = info.piece_length();
    if piece_length == 0 {
        return Err(Error::InvalidStatus("piece length is zero".into()));
    }

    let size = size.min(file.length.saturating_sub(offset));
    if size == 0 {
        return Ok(Vec::new());
    }

    let start = file.offset + offset;
    let end = start + size;
    let first = start / piece_length;
    let last = (end - 1) / piece_length;

    let spans = (first..=last)
        .map(|piece| {
            let piece_start = piece * piece_length;
            PieceSpan {
                piece: piece as u32,
                low: start.max(piece_start) - piece_start,
                high: end.min(piece_start + piece_length) - piece_start,
            }
        })
        .collect();

    Ok(spans)
}

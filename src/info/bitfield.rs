use bytes::Bytes;
use data_encoding::BASE64;

use crate::error::Error;

/// Completed-piece flags as reported by the daemon.
///
/// Each bit represents whether a piece is present (1) or not (0).
/// Bits are numbered from the high bit of the first byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield {
    bits: Bytes,
}

impl Bitfield {
    /// Creates a bitfield from raw bytes.
    pub fn from_bytes(bits: Bytes) -> Self {
        Self { bits }
    }

    /// Decodes the daemon's base64 piece bitstring.
    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        let bits = BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| Error::InvalidStatus(format!("piece bitstring: {}", e)))?;
        Ok(Self::from_bytes(Bytes::from(bits)))
    }

    /// Builds a bitfield with exactly the given pieces set.
    pub fn from_pieces(pieces: impl IntoIterator<Item = usize>, piece_count: usize) -> Self {
        let mut bits = vec![0u8; piece_count.div_ceil(8)];
        for index in pieces {
            if index < piece_count {
                bits[index / 8] |= 1 << (7 - (index % 8));
            }
        }
        Self::from_bytes(Bytes::from(bits))
    }

    /// Returns true if the piece at the given index is present.
    ///
    /// Indices beyond the encoded length are absent.
    pub fn get(&self, index: usize) -> bool {
        let byte_index = index >> 3;
        let bit_index = 7 - (index % 8);
        self.bits
            .get(byte_index)
            .is_some_and(|byte| (byte >> bit_index) & 1 == 1)
    }

    /// Returns the number of pieces that are present.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Returns the raw bytes of the bitfield.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Encodes the bitfield the way the daemon reports it.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bits)
    }
}

use std::fmt;
use std::sync::Mutex;

use anyhow::{bail, Result};

/// Thread-safe presence map over piece indices.
///
/// Bit 7 of byte 0 is piece 0. Storage is byte aligned, the trailing bits of the last byte past
/// `piece_count` never belong to a piece and are never set.
#[derive(Debug)]
pub struct Bitfield {
    bytes: Mutex<Vec<u8>>,
    piece_count: u32,
}

fn byte_offset(idx: u32) -> usize {
    (idx / 8) as usize
}

fn bit_mask(idx: u32) -> u8 {
    1 << (7 - idx % 8)
}

impl Bitfield {
    pub fn new(piece_count: u32) -> Self {
        Bitfield {
            bytes: Mutex::new(vec![0; piece_count.div_ceil(8) as usize]),
            piece_count,
        }
    }

    // number of valid bits in the last byte, 0 when the piece count is byte aligned
    fn barrier(&self) -> u32 {
        self.piece_count % 8
    }

    // a poisoned lock still holds consistent bytes: every mutation is a single byte write
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks `idx` as present. Idempotent.
    ///
    /// # Panics
    ///
    /// If `idx` is not a piece of the torrent (debug builds) or addresses a byte beyond storage.
    pub fn set(&self, idx: u32) {
        debug_assert!(
            idx < self.piece_count,
            "piece {idx} set in a bitfield of {} pieces",
            self.piece_count
        );
        let mut bytes = self.lock();
        bytes[byte_offset(idx)] |= bit_mask(idx);
    }

    pub fn set_with_check(&self, idx: u32) -> Result<()> {
        if idx >= self.piece_count {
            bail!(
                "piece {idx} does not belong to the torrent ({} pieces)",
                self.piece_count
            );
        }
        let mut bytes = self.lock();
        match bytes.get_mut(byte_offset(idx)) {
            Some(b) => *b |= bit_mask(idx),
            None => bail!("piece {idx} is out of range for the bitfield"),
        }
        Ok(())
    }

    pub fn check(&self, idx: u32) -> bool {
        if idx >= self.piece_count {
            return false;
        }
        self.lock()[byte_offset(idx)] & bit_mask(idx) != 0
    }

    /// Pieces not yet present, ascending.
    pub fn missing_pieces(&self) -> Vec<u32> {
        let bytes = self.lock();
        (0..self.piece_count)
            .filter(|i| bytes[byte_offset(*i)] & bit_mask(*i) == 0)
            .collect()
    }

    /// Pieces present, ascending.
    #[cfg(test)]
    pub fn existing_pieces(&self) -> Vec<u32> {
        let bytes = self.lock();
        (0..self.piece_count)
            .filter(|i| bytes[byte_offset(*i)] & bit_mask(*i) != 0)
            .collect()
    }

    pub fn count_set(&self) -> u32 {
        self.lock().iter().map(|b| b.count_ones()).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count_set() == self.piece_count
    }

    /// Copy of the raw bytes, ready to be sent in a bitfield message.
    pub fn clone_bytes(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Replaces the whole content with `other`, as received from a remote peer.
    pub fn overwrite(&self, other: &[u8]) -> Result<()> {
        let mut bytes = self.lock();
        if other.len() != bytes.len() {
            bail!(
                "bitfield has {} bytes, expected {} for {} pieces",
                other.len(),
                bytes.len(),
                self.piece_count
            );
        }
        let barrier = self.barrier();
        if barrier != 0 {
            let spare_mask = 0xffu8 >> barrier;
            if other[other.len() - 1] & spare_mask != 0 {
                bail!("bitfield has spare bits set past the last piece");
            }
        }
        bytes.copy_from_slice(other);
        Ok(())
    }
}

impl fmt::Display for Bitfield {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{} pieces", self.count_set(), self.piece_count)
    }
}

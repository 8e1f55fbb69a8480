//! Piece assembly, verification, and availability bookkeeping.
//!
//! The store holds every piece's in-flight blocks until the piece is
//! contiguously covered, hashes the assembled bytes against the metainfo
//! digest, and tracks how many connected peers hold each piece (the input
//! to rarest-first selection).
use crate::metainfo::Metainfo;
use crate::storage::Storage;
use crate::storage::StorageError;

use sha1::Digest;
use sha1::Sha1;
use std::collections::BTreeMap;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PieceError {
    #[error("Piece {piece} offset {begin} length {length} outside torrent data")]
    OutOfRange { piece: u32, begin: u32, length: u32 },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type PieceResult<T> = std::result::Result<T, PieceError>;

/// What happened to an ingested block.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BlockOutcome {
    /// Piece already verified, or the block overlaps data we hold.
    Ignored,
    /// Stored; the piece is still incomplete.
    Stored,
    /// The block completed the piece and the hash matched.
    Verified,
    /// The block completed the piece but the hash did not match; all
    /// blocks for the piece were discarded.
    HashMismatch,
}

/// Per-torrent piece state: have-map, in-flight blocks, and frequency.
pub struct PieceStore {
    piece_hashes: Vec<[u8; 20]>,
    piece_length: u32,
    total_length: u64,
    have: Vec<bool>,
    /// In-flight assembly, keyed by piece then by block begin offset.
    /// Entries are removed the moment a piece verifies.
    blocks: HashMap<u32, BTreeMap<u32, Vec<u8>>>,
    /// Count of connected peers known to hold each piece.
    frequency: Vec<u32>,
    bytes_verified: u64,
}

impl PieceStore {
    pub fn new(metainfo: &Metainfo) -> Self {
        let n = metainfo.num_pieces();
        Self {
            piece_hashes: metainfo.piece_hashes.clone(),
            piece_length: metainfo.piece_length,
            total_length: metainfo.total_length,
            have: vec![false; n],
            blocks: HashMap::new(),
            frequency: vec![0; n],
            bytes_verified: 0,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Size of the piece at `index`; the last piece may be short.
    pub fn piece_size(&self, index: u32) -> u32 {
        let n = self.num_pieces();
        if index as usize >= n {
            return 0;
        }
        if (index as usize) + 1 < n {
            return self.piece_length;
        }
        let remainder = self.total_length % u64::from(self.piece_length);
        if remainder == 0 {
            self.piece_length
        } else {
            remainder as u32
        }
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.have.get(index as usize).copied().unwrap_or(false)
    }

    pub fn have_any(&self) -> bool {
        self.have.iter().any(|h| *h)
    }

    pub fn is_complete(&self) -> bool {
        self.have.iter().all(|h| *h)
    }

    /// Bytes still needed, as reported to trackers via `left`.
    pub fn bytes_left(&self) -> u64 {
        self.total_length - self.bytes_verified
    }

    pub fn frequency(&self, index: u32) -> u32 {
        self.frequency.get(index as usize).copied().unwrap_or(0)
    }

    /// Pieces we still lack, in index order.
    pub fn missing_pieces(&self) -> impl Iterator<Item = u32> + '_ {
        self.have
            .iter()
            .enumerate()
            .filter(|(_, h)| !**h)
            .map(|(i, _)| i as u32)
    }

    /// Whether a peer with this has-map holds anything we lack.
    pub fn interesting(&self, peer_has: &[bool]) -> bool {
        peer_has
            .iter()
            .zip(self.have.iter())
            .any(|(theirs, ours)| *theirs && !*ours)
    }

    /// Our have-map encoded for a `Bitfield` message: MSB of byte 0 is
    /// piece 0, trailing pad bits zero.
    pub fn have_bitfield(&self) -> Vec<u8> {
        let mut bits = vec![0u8; self.num_pieces().div_ceil(8)];
        for (i, have) in self.have.iter().enumerate() {
            if *have {
                bits[i / 8] |= 0x80 >> (i % 8);
            }
        }
        bits
    }

    /// Smallest offset within `index` not yet covered by a stored block,
    /// or `None` when the piece is fully covered (or already verified).
    pub fn next_gap(&self, index: u32) -> Option<u32> {
        if self.has_piece(index) {
            return None;
        }
        let size = self.piece_size(index);
        let mut covered_to = 0u32;
        if let Some(piece_blocks) = self.blocks.get(&index) {
            for (begin, data) in piece_blocks {
                if *begin > covered_to {
                    break;
                }
                covered_to = covered_to.max(begin + data.len() as u32);
            }
        }
        if covered_to < size {
            Some(covered_to)
        } else {
            None
        }
    }

    /**
    Ingests one block of piece data.

    # How it works:
    1. A block for a piece we already verified is discarded.
    2. Otherwise the block is written through to storage at its final
       position and recorded in the piece's block map. A block that
       overlaps bytes we already hold is ignored wholesale; stored
       ranges stay disjoint.
    3. If the stored intervals now cover `[0, piece_size)` contiguously,
       the concatenation is hashed. A match marks the piece verified and
       releases the block map; a mismatch discards every block so the
       piece can be re-fetched from scratch.
    */
    #[tracing::instrument(level = "trace", skip(self, data, storage))]
    pub fn add_block(
        &mut self,
        index: u32,
        begin: u32,
        data: &[u8],
        storage: &mut Storage,
    ) -> PieceResult<BlockOutcome> {
        let size = self.piece_size(index);
        let length = data.len() as u32;
        if index as usize >= self.num_pieces()
            || begin.checked_add(length).map_or(true, |end| end > size)
        {
            return Err(PieceError::OutOfRange { piece: index, begin, length });
        }
        if self.has_piece(index) {
            return Ok(BlockOutcome::Ignored);
        }

        let piece_blocks = self.blocks.entry(index).or_default();
        let overlaps = piece_blocks.iter().any(|(other_begin, other)| {
            let other_end = other_begin + other.len() as u32;
            begin < other_end && *other_begin < begin + length
        });
        if overlaps {
            tracing::debug!(index, begin, length, "Ignoring overlapping block");
            return Ok(BlockOutcome::Ignored);
        }

        storage.write_block(index, begin, data)?;
        piece_blocks.insert(begin, data.to_vec());

        // Completion test: disjoint intervals cover the piece iff they
        // are gapless from offset zero.
        let mut covered_to = 0u32;
        for (block_begin, block) in piece_blocks.iter() {
            if *block_begin != covered_to {
                return Ok(BlockOutcome::Stored);
            }
            covered_to += block.len() as u32;
        }
        if covered_to < size {
            return Ok(BlockOutcome::Stored);
        }

        let mut hasher = Sha1::new();
        for block in piece_blocks.values() {
            hasher.update(block);
        }
        let digest: [u8; 20] = hasher.finalize().into();

        if digest == self.piece_hashes[index as usize] {
            self.blocks.remove(&index);
            self.have[index as usize] = true;
            self.bytes_verified += u64::from(size);
            tracing::debug!(index, "Piece verified");
            Ok(BlockOutcome::Verified)
        } else {
            // Some peer fed us bad data; none of the stored blocks can be
            // trusted to be the honest ones.
            self.blocks.remove(&index);
            tracing::warn!(
                index,
                expected = %hex::encode(self.piece_hashes[index as usize]),
                got = %hex::encode(digest),
                "Piece hash mismatch, discarding blocks"
            );
            Ok(BlockOutcome::HashMismatch)
        }
    }

    /// Whether any block of `index` is currently buffered.
    pub fn has_blocks(&self, index: u32) -> bool {
        self.blocks.get(&index).is_some_and(|b| !b.is_empty())
    }

    /// A peer newly advertised `index` via `Have`.
    pub fn record_have(&mut self, index: u32) {
        if let Some(count) = self.frequency.get_mut(index as usize) {
            *count += 1;
        }
    }

    /// A peer's one-shot `Bitfield`: count every piece it holds.
    pub fn record_bitfield(&mut self, peer_has: &[bool]) {
        for (index, held) in peer_has.iter().enumerate() {
            if *held {
                self.frequency[index] += 1;
            }
        }
    }

    /// A peer dropped: its availability leaves the swarm.
    pub fn release_peer(&mut self, peer_has: &[bool]) {
        for (index, held) in peer_has.iter().enumerate() {
            if *held {
                self.frequency[index] = self.frequency[index].saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::FileEntry;
    use crate::metainfo::Metainfo;

    fn sha1_of(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    /// A torrent whose pieces hash the given contents.
    fn fixture(piece_length: u32, pieces: &[&[u8]]) -> (Metainfo, Storage, tempfile::TempDir) {
        let total_length: u64 = pieces.iter().map(|p| p.len() as u64).sum();
        let metainfo = Metainfo {
            announce: "http://tracker.test/ann".to_string(),
            announce_list: Vec::new(),
            creation_date: None,
            comment: String::new(),
            created_by: String::new(),
            info: crate::bencode::BencodeValue::Dict(Default::default()),
            info_hash: [0u8; 20],
            name: "fixture".to_string(),
            piece_length,
            piece_hashes: pieces.iter().map(|p| sha1_of(p)).collect(),
            files: vec![FileEntry { length: total_length, path: Vec::new() }],
            total_length,
        };
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::create(&metainfo, dir.path()).unwrap();
        (metainfo, storage, dir)
    }

    #[test]
    fn single_block_piece_verifies() {
        let data = b"sixteen byte pc!";
        let (metainfo, mut storage, _dir) = fixture(16, &[data]);
        let mut store = PieceStore::new(&metainfo);

        assert_eq!(
            store.add_block(0, 0, data, &mut storage).unwrap(),
            BlockOutcome::Verified
        );
        assert!(store.has_piece(0));
        assert!(store.is_complete());
        assert!(!store.has_blocks(0));
        assert_eq!(store.bytes_left(), 0);
        assert_eq!(storage.read_block(0, 0, 16).unwrap(), data);
    }

    #[test]
    fn out_of_order_blocks_assemble() {
        let piece: Vec<u8> = (0u8..32).collect();
        let (metainfo, mut storage, _dir) = fixture(32, &[&piece]);
        let mut store = PieceStore::new(&metainfo);

        assert_eq!(
            store.add_block(0, 16, &piece[16..], &mut storage).unwrap(),
            BlockOutcome::Stored
        );
        assert_eq!(store.next_gap(0), Some(0));
        assert_eq!(
            store.add_block(0, 0, &piece[..16], &mut storage).unwrap(),
            BlockOutcome::Verified
        );
        assert_eq!(store.next_gap(0), None);
    }

    #[test]
    fn short_last_piece_assembles() {
        let first: Vec<u8> = vec![0xaa; 16];
        let last: Vec<u8> = vec![0xbb; 4];
        let (metainfo, mut storage, _dir) = fixture(16, &[&first, &last]);
        let mut store = PieceStore::new(&metainfo);

        assert_eq!(store.piece_size(1), 4);
        assert_eq!(
            store.add_block(1, 0, &last, &mut storage).unwrap(),
            BlockOutcome::Verified
        );
        assert!(store.has_piece(1));
        assert!(!store.is_complete());
        assert_eq!(store.bytes_left(), 16);
    }

    #[test]
    fn hash_mismatch_discards_blocks() {
        let (metainfo, mut storage, _dir) = fixture(16, &[b"sixteen byte pc!"]);
        let mut store = PieceStore::new(&metainfo);

        assert_eq!(
            store.add_block(0, 0, b"wrong wrong wron", &mut storage).unwrap(),
            BlockOutcome::HashMismatch
        );
        assert!(!store.has_piece(0));
        assert!(!store.has_blocks(0));
        assert_eq!(store.next_gap(0), Some(0));
    }

    #[test]
    fn blocks_for_verified_pieces_are_ignored() {
        let data = b"sixteen byte pc!";
        let (metainfo, mut storage, _dir) = fixture(16, &[data]);
        let mut store = PieceStore::new(&metainfo);

        store.add_block(0, 0, data, &mut storage).unwrap();
        assert_eq!(
            store.add_block(0, 0, data, &mut storage).unwrap(),
            BlockOutcome::Ignored
        );
    }

    #[test]
    fn overlapping_blocks_are_ignored() {
        let piece: Vec<u8> = (0u8..32).collect();
        let (metainfo, mut storage, _dir) = fixture(32, &[&piece]);
        let mut store = PieceStore::new(&metainfo);

        store.add_block(0, 0, &piece[..16], &mut storage).unwrap();
        assert_eq!(
            store.add_block(0, 8, &piece[8..24], &mut storage).unwrap(),
            BlockOutcome::Ignored
        );
        assert_eq!(store.next_gap(0), Some(16));
    }

    #[test]
    fn rejects_blocks_outside_the_piece() {
        let (metainfo, mut storage, _dir) = fixture(16, &[b"sixteen byte pc!"]);
        let mut store = PieceStore::new(&metainfo);
        assert!(store.add_block(0, 12, b"too far", &mut storage).is_err());
        assert!(store.add_block(1, 0, b"no such piece", &mut storage).is_err());
    }

    #[test]
    fn frequency_tracks_peer_availability() {
        let (metainfo, _storage, _dir) = fixture(16, &[b"sixteen byte pc!", b"sixteen byte pc!"]);
        let mut store = PieceStore::new(&metainfo);

        let peer_a = vec![true, false];
        let peer_b = vec![true, true];
        store.record_bitfield(&peer_a);
        store.record_bitfield(&peer_b);
        store.record_have(1); // peer_a later announces piece 1

        assert_eq!(store.frequency(0), 2);
        assert_eq!(store.frequency(1), 2);

        // Sum of frequencies equals the sum of has-bits across peers.
        let sum: u32 = (0..2).map(|i| store.frequency(i)).sum();
        assert_eq!(sum, 4);

        store.release_peer(&[true, true]);
        assert_eq!(store.frequency(0), 1);
        assert_eq!(store.frequency(1), 1);
    }

    #[test]
    fn have_bitfield_sets_msb_first() {
        let (metainfo, mut storage, _dir) = fixture(16, &[b"sixteen byte pc!", b"0123456789abcdef"]);
        let mut store = PieceStore::new(&metainfo);
        assert_eq!(store.have_bitfield(), vec![0b0000_0000]);
        store.add_block(1, 0, b"0123456789abcdef", &mut storage).unwrap();
        assert_eq!(store.have_bitfield(), vec![0b0100_0000]);
    }
}

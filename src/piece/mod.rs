use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{atomic::{AtomicU64, AtomicUsize, Ordering}, Mutex},
    time::Instant,
};
use sha1::{Digest, Sha1};
use crate::{
    block::{block_len, num_blocks, BlockInfo},
    store::StoreInfo,
    Bitfield,
    ID,
};

pub mod strategy;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("piece index {0} out of range")]
    PieceOutOfRange(u32),

    #[error("no block at offset {1} in piece {0}")]
    UnknownBlock(u32, u32),

    #[error("block length mismatch: got {got}, expected {expected}")]
    InvalidBlockLength { got: usize, expected: usize },
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    #[default]
    Missing,
    Requested,
    Downloaded,
    Verified,
}

// Outcome of feeding one block into the store.
#[derive(Debug, PartialEq, Eq)]
pub enum BlockStatus {
    // Stored, piece still incomplete.
    Accepted,

    // Byte-equal re-delivery of a block we already hold.
    Duplicate,

    // A payload conflicting with one already held; dropped.
    Rejected,

    // Final block assembled the piece and its hash checked out.
    // Carries the full piece bytes for the disk write.
    PieceComplete(Vec<u8>),

    // Assembled piece failed verification; every block was cleared
    // and the piece is missing again.
    HashMismatch,
}

#[derive(Debug)]
struct Piece {
    len: usize,

    hash: ID,

    state: PieceState,

    // One slot per block, filled as payloads arrive.
    blocks: Vec<Option<Vec<u8>>>,

    num_received: usize,

    // In-flight requests for this piece, keyed by requester and block.
    pending: HashMap<(SocketAddr, u32, u32), Instant>,
}

impl Piece {
    fn new(len: usize, hash: ID) -> Self {
        Self {
            len,
            hash,
            state: PieceState::Missing,
            blocks: vec![None; num_blocks(len)],
            num_received: 0,
            pending: HashMap::new(),
        }
    }

    fn reset(&mut self) {
        self.state = PieceState::Missing;
        self.blocks.iter_mut().for_each(|b| *b = None);
        self.num_received = 0;
        self.pending.clear();
    }

    // Concatenates block payloads in offset order.
    fn assemble(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.len);
        for block in &self.blocks {
            data.extend_from_slice(block.as_ref().expect("piece not complete"));
        }
        data
    }
}

// Authoritative record of which pieces and blocks are present, verified
// or outstanding. Shared behind an Arc; writers are serialized per piece
// so hashing one piece never blocks delivery into another.
#[derive(Debug)]
pub struct PieceStore {
    pieces: Vec<Mutex<Piece>>,

    // Bit i set iff piece i is verified. Exported to peers.
    bitfield: Mutex<Bitfield>,

    num_verified: AtomicUsize,

    bytes_downloaded: AtomicU64,
}

impl PieceStore {
    pub fn new(info: &StoreInfo, piece_hashes: Vec<ID>) -> Self {
        debug_assert_eq!(piece_hashes.len(), info.num_pieces as usize);
        let pieces = piece_hashes
            .into_iter()
            .enumerate()
            .map(|(idx, hash)| Mutex::new(Piece::new(info.piece_length(idx as u32), hash)))
            .collect();

        Self {
            pieces,
            bitfield: Mutex::new(Bitfield::repeat(false, info.num_pieces as usize)),
            num_verified: AtomicUsize::new(0),
            bytes_downloaded: AtomicU64::new(0),
        }
    }

    pub fn num_pieces(&self) -> u32 {
        self.pieces.len() as u32
    }

    fn piece(&self, idx: u32) -> Result<&Mutex<Piece>> {
        self.pieces
            .get(idx as usize)
            .ok_or(StoreError::PieceOutOfRange(idx))
    }

    pub fn has_block(&self, idx: u32, offset: u32) -> bool {
        match self.piece(idx) {
            Ok(piece) => {
                let piece = piece.lock().unwrap();
                piece
                    .blocks
                    .get(offset as usize / crate::BLOCK_SIZE)
                    .map(|b| b.is_some())
                    .unwrap_or(false)
            }
            Err(_) => false,
        }
    }

    // Blocks of a piece that hold no payload yet.
    pub fn missing_blocks(&self, idx: u32) -> Vec<BlockInfo> {
        let Ok(piece) = self.piece(idx) else { return Vec::new() };
        let piece = piece.lock().unwrap();
        piece
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_none())
            .map(|(i, _)| BlockInfo {
                piece_idx: idx,
                offset: (i * crate::BLOCK_SIZE) as u32,
                len: block_len(piece.len, i) as u32,
            })
            .collect()
    }

    // Missing blocks with no request pending to any peer.
    pub fn unrequested_blocks(&self, idx: u32) -> Vec<BlockInfo> {
        let Ok(piece) = self.piece(idx) else { return Vec::new() };
        let piece = piece.lock().unwrap();
        piece
            .blocks
            .iter()
            .enumerate()
            .filter(|(i, b)| {
                let offset = (i * crate::BLOCK_SIZE) as u32;
                b.is_none() && !piece.pending.keys().any(|(_, off, _)| *off == offset)
            })
            .map(|(i, _)| BlockInfo {
                piece_idx: idx,
                offset: (i * crate::BLOCK_SIZE) as u32,
                len: block_len(piece.len, i) as u32,
            })
            .collect()
    }

    // Feeds one arrived block into the store. On completion the piece is
    // hashed exactly once; a match flips the bitfield bit and returns the
    // assembled bytes, a mismatch resets the piece for re-download.
    pub fn record_block(&self, idx: u32, offset: u32, data: &[u8]) -> Result<BlockStatus> {
        let mut piece = self.piece(idx)?.lock().unwrap();

        if piece.state == PieceState::Verified {
            // Late arrival for a piece already done, e.g. after a timeout
            // re-issue. Payload slots are long freed; ignore it.
            return Ok(BlockStatus::Duplicate);
        }

        let block_idx = offset as usize / crate::BLOCK_SIZE;
        if offset as usize % crate::BLOCK_SIZE != 0 || block_idx >= piece.blocks.len() {
            return Err(StoreError::UnknownBlock(idx, offset));
        }

        let expected = block_len(piece.len, block_idx);
        if data.len() != expected {
            return Err(StoreError::InvalidBlockLength { got: data.len(), expected });
        }

        // A payload, once set, stays until the piece resets.
        if let Some(existing) = &piece.blocks[block_idx] {
            return if existing.as_slice() == data {
                Ok(BlockStatus::Duplicate)
            } else {
                tracing::warn!("conflicting payload for block {}:{}", idx, offset);
                Ok(BlockStatus::Rejected)
            };
        }

        piece.blocks[block_idx] = Some(data.to_vec());
        piece.num_received += 1;
        piece
            .pending
            .retain(|&(_, off, len), _| !(off == offset && len as usize == expected));
        self.bytes_downloaded.fetch_add(data.len() as u64, Ordering::Relaxed);

        if piece.num_received < piece.blocks.len() {
            return Ok(BlockStatus::Accepted);
        }

        // Last block just landed; hash the assembled piece.
        piece.state = PieceState::Downloaded;
        let assembled = piece.assemble();
        let digest: ID = Sha1::digest(&assembled).into();

        if digest == piece.hash {
            piece.state = PieceState::Verified;
            piece.pending.clear();
            // Payload slots are no longer needed, reads go to disk.
            piece.blocks.iter_mut().for_each(|b| *b = None);
            drop(piece);
            self.set_bit(idx);
            Ok(BlockStatus::PieceComplete(assembled))
        } else {
            tracing::warn!("piece {} failed hash verification", idx);
            piece.reset();
            Ok(BlockStatus::HashMismatch)
        }
    }

    // All payload slots filled, or already verified.
    pub fn is_complete(&self, idx: u32) -> bool {
        match self.piece(idx) {
            Ok(piece) => {
                let piece = piece.lock().unwrap();
                piece.state == PieceState::Verified || piece.num_received == piece.blocks.len()
            }
            Err(_) => false,
        }
    }

    pub fn state(&self, idx: u32) -> PieceState {
        self.piece(idx)
            .map(|p| p.lock().unwrap().state)
            .unwrap_or_default()
    }

    pub fn is_verified(&self, idx: u32) -> bool {
        self.state(idx) == PieceState::Verified
    }

    fn set_bit(&self, idx: u32) {
        let mut bitfield = self.bitfield.lock().unwrap();
        if !bitfield[idx as usize] {
            bitfield.set(idx as usize, true);
            self.num_verified.fetch_add(1, Ordering::Relaxed);
        }
    }

    // Marks a piece verified without feeding blocks through it.
    pub fn mark_verified(&self, idx: u32) -> Result<()> {
        let mut piece = self.piece(idx)?.lock().unwrap();
        piece.state = PieceState::Verified;
        piece.pending.clear();
        drop(piece);
        self.set_bit(idx);
        Ok(())
    }

    // Clears all payloads and pending requests; used on hash failure.
    pub fn reset(&self, idx: u32) -> Result<()> {
        let mut piece = self.piece(idx)?.lock().unwrap();
        if piece.state != PieceState::Verified {
            piece.reset();
        }
        Ok(())
    }

    // Copy of the verified-piece bitfield.
    pub fn bitfield(&self) -> Bitfield {
        self.bitfield.lock().unwrap().clone()
    }

    // Big-endian bitfield bytes as sent on the wire. Trailing spare
    // bits of the last byte are zero.
    pub fn bitfield_bytes(&self) -> Vec<u8> {
        self.bitfield.lock().unwrap().as_raw_slice().to_vec()
    }

    pub fn progress(&self) -> (usize, usize) {
        (self.num_verified.load(Ordering::Relaxed), self.pieces.len())
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }

    pub fn is_done(&self) -> bool {
        let (verified, total) = self.progress();
        verified == total
    }

    // Indices of pieces not yet verified.
    pub fn pieces_needed(&self) -> Vec<u32> {
        let bitfield = self.bitfield.lock().unwrap();
        bitfield.iter_zeros().map(|i| i as u32).collect()
    }

    // Request bookkeeping, driven by the coordinator.

    pub fn add_request(&self, block: BlockInfo, peer: SocketAddr, now: Instant) -> Result<()> {
        let mut piece = self.piece(block.piece_idx)?.lock().unwrap();
        if piece.state == PieceState::Missing {
            piece.state = PieceState::Requested;
        }
        piece
            .pending
            .insert((peer, block.offset, block.len), now);
        Ok(())
    }

    pub fn remove_request(&self, block: BlockInfo, peer: SocketAddr) {
        if let Ok(piece) = self.piece(block.piece_idx) {
            piece
                .lock()
                .unwrap()
                .pending
                .remove(&(peer, block.offset, block.len));
        }
    }

    // Drops every pending entry a peer holds, across all pieces.
    pub fn drop_peer_requests(&self, peer: &SocketAddr) {
        for piece in &self.pieces {
            piece
                .lock()
                .unwrap()
                .pending
                .retain(|(p, _, _), _| p != peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_SIZE;

    fn store_for(content: &[u8], piece_len: usize) -> PieceStore {
        let info = StoreInfo::test_layout(vec![("data", content.len())], piece_len, "out");
        let hashes = content
            .chunks(piece_len)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();
        PieceStore::new(&info, hashes)
    }

    fn test_addr(n: u8) -> SocketAddr {
        format!("10.0.0.{}:6881", n).parse().unwrap()
    }

    // 50_000 bytes at 16KiB pieces: sizes 16384, 16384, 16384, 848.
    fn content() -> Vec<u8> {
        (0..50_000u32).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_block_assembly_out_of_order() {
        let content = content();
        let store = store_for(&content, 16_384);
        assert_eq!(store.num_pieces(), 4);

        // Feed each piece's blocks in arbitrary per-piece order.
        let orders: [&[usize]; 4] = [&[1, 0], &[0, 1], &[1, 0], &[0]];
        for (idx, order) in orders.iter().enumerate() {
            let piece_start = idx * 16_384;
            let piece_end = (piece_start + 16_384).min(content.len());
            let piece_bytes = &content[piece_start..piece_end];

            for (n, &block_idx) in order.iter().enumerate() {
                let start = block_idx * BLOCK_SIZE;
                let end = (start + BLOCK_SIZE).min(piece_bytes.len());
                let status = store
                    .record_block(idx as u32, start as u32, &piece_bytes[start..end])
                    .unwrap();
                if n + 1 == order.len() {
                    match status {
                        BlockStatus::PieceComplete(data) => assert_eq!(data, piece_bytes),
                        other => panic!("expected completion, got {:?}", other),
                    }
                } else {
                    assert_eq!(status, BlockStatus::Accepted);
                }
            }
        }

        assert_eq!(store.progress(), (4, 4));
        assert!(store.is_done());
        assert_eq!(store.bitfield_bytes(), vec![0b1111_0000]);
        assert!(store.pieces_needed().is_empty());
    }

    #[test]
    fn test_bad_block_resets_piece() {
        let content = content();
        let store = store_for(&content, 16_384);

        let good = &content[..BLOCK_SIZE];
        assert_eq!(store.record_block(0, 0, good).unwrap(), BlockStatus::Accepted);

        // Tamper with the last block of piece 0.
        let mut bad = content[BLOCK_SIZE..2 * BLOCK_SIZE].to_vec();
        bad[100] ^= 0xff;
        let status = store.record_block(0, BLOCK_SIZE as u32, &bad).unwrap();
        assert_eq!(status, BlockStatus::HashMismatch);

        // Piece is missing again, payloads cleared, bitfield untouched.
        assert_eq!(store.state(0), PieceState::Missing);
        assert!(!store.has_block(0, 0));
        assert_eq!(store.missing_blocks(0).len(), 2);
        assert_eq!(store.bitfield_bytes(), vec![0u8]);
        assert_eq!(store.progress(), (0, 4));

        // Re-downloading the correct bytes succeeds.
        store.record_block(0, 0, good).unwrap();
        let status = store
            .record_block(0, BLOCK_SIZE as u32, &content[BLOCK_SIZE..2 * BLOCK_SIZE])
            .unwrap();
        assert!(matches!(status, BlockStatus::PieceComplete(_)));
        assert!(store.is_verified(0));
    }

    #[test]
    fn test_duplicate_and_conflicting_blocks() {
        let content = content();
        let store = store_for(&content, 16_384);
        let block = &content[..BLOCK_SIZE];

        assert_eq!(store.record_block(0, 0, block).unwrap(), BlockStatus::Accepted);
        // Byte-equal redelivery is idempotent.
        assert_eq!(store.record_block(0, 0, block).unwrap(), BlockStatus::Duplicate);

        // A different payload for the same slot is dropped.
        let other = vec![0xaa; BLOCK_SIZE];
        assert_eq!(store.record_block(0, 0, &other).unwrap(), BlockStatus::Rejected);
        assert!(store.has_block(0, 0));
    }

    #[test]
    fn test_record_block_rejects_bad_lengths() {
        let store = store_for(&content(), 16_384);

        assert!(matches!(
            store.record_block(0, 0, &[0u8; 100]),
            Err(StoreError::InvalidBlockLength { got: 100, expected: 16_384 })
        ));
        // Last block of last piece is 848 bytes.
        assert!(matches!(
            store.record_block(3, 0, &[0u8; BLOCK_SIZE]),
            Err(StoreError::InvalidBlockLength { .. })
        ));
        assert!(matches!(
            store.record_block(4, 0, &[0u8; BLOCK_SIZE]),
            Err(StoreError::PieceOutOfRange(4))
        ));
        assert!(matches!(
            store.record_block(0, 17, &[0u8; BLOCK_SIZE]),
            Err(StoreError::UnknownBlock(0, 17))
        ));
    }

    #[test]
    fn test_pending_requests() {
        let content = content();
        let store = store_for(&content, 16_384);
        let peer_a = test_addr(1);
        let peer_b = test_addr(2);
        let now = Instant::now();

        let first = BlockInfo { piece_idx: 0, offset: 0, len: BLOCK_SIZE as u32 };
        store.add_request(first, peer_a, now).unwrap();
        assert_eq!(store.state(0), PieceState::Requested);

        // The requested block no longer shows as unrequested.
        let unrequested = store.unrequested_blocks(0);
        assert_eq!(unrequested.len(), 1);
        assert_eq!(unrequested[0].offset, BLOCK_SIZE as u32);
        // But it is still missing.
        assert_eq!(store.missing_blocks(0).len(), 2);

        // Arrival clears the pending entry whichever peer it came from.
        store.record_block(0, 0, &content[..BLOCK_SIZE]).unwrap();
        assert_eq!(store.unrequested_blocks(0).len(), 1);

        let second = BlockInfo { piece_idx: 0, offset: BLOCK_SIZE as u32, len: BLOCK_SIZE as u32 };
        store.add_request(second, peer_b, now).unwrap();
        store.drop_peer_requests(&peer_b);
        assert_eq!(store.unrequested_blocks(0).len(), 1);
    }

    #[test]
    fn test_bitfield_boundary() {
        // 17 pieces: 3 bitfield bytes, 7 spare trailing bits.
        let piece_len = BLOCK_SIZE;
        let total = piece_len * 17;
        let content: Vec<u8> = (0..total).map(|i| (i % 163) as u8).collect();
        let store = store_for(&content, piece_len);
        assert_eq!(store.num_pieces(), 17);
        assert_eq!(store.bitfield_bytes(), vec![0, 0, 0]);

        store
            .record_block(16, 0, &content[16 * piece_len..])
            .unwrap();
        let bytes = store.bitfield_bytes();
        assert_eq!(bytes.len(), 3);
        assert_eq!(bytes[2], 0x80);
        assert_eq!(bytes[2] & 0x7f, 0, "spare bits must stay zero");
        assert_eq!(store.pieces_needed(), (0..16).collect::<Vec<u32>>());
    }

    #[test]
    fn test_bitfield_tracks_verified_state() {
        let content = content();
        let store = store_for(&content, 16_384);

        for idx in 0..4u32 {
            let bitfield = store.bitfield();
            assert_eq!(bitfield[idx as usize], store.is_verified(idx));
            store.mark_verified(idx).unwrap();
            let bitfield = store.bitfield();
            assert!(bitfield[idx as usize] && store.is_verified(idx));
        }
        assert_eq!(store.progress(), (4, 4));
    }
}

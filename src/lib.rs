pub mod block;
pub mod config;
pub mod coordinator;
pub mod disk;
pub mod metainfo;
pub mod p2p;
pub mod piece;
pub mod pool;
pub mod store;
pub mod torrent;
pub mod tracker;

mod de;

// Most commonly used block size - 16KB.
pub const BLOCK_SIZE: usize = 0x4000;

// Upper bound on a single wire frame - 128KB.
pub const MAX_FRAME_LEN: usize = 0x20000;

pub type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

// 20 byte SHA1 info hash, also used for peer ids.
pub type ID = [u8; 20];

const PEER_ID_PREFIX: &[u8; 8] = b"-SB0100-";

// Azureus-style peer id: client prefix followed by 12 random bytes.
pub fn generate_peer_id() -> ID {
    use rand::Rng;
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(PEER_ID_PREFIX);
    rand::thread_rng().fill(&mut id[8..]);
    id
}

// Re-exports
pub use config::{Config, StrategyKind};
pub use metainfo::{MetaInfo, MetaInfoError};
pub use piece::{PieceState, PieceStore};
pub use torrent::{Torrent, TorrentError};
pub use tracker::TrackerError;

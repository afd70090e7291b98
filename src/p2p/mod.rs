use std::{net::SocketAddr, sync::RwLock};
use tokio::sync::mpsc;
use crate::{block::{BlockData, BlockInfo}, piece::StoreError, Bitfield, ID};

pub mod handshake;
pub mod message;
mod session;

pub use handshake::Extensions;
pub use session::PeerSession;

// Bounded queue sizes: per-session command pipeline and the shared
// session -> coordinator event pipeline.
pub const COMMAND_QUEUE_LIMIT: usize = 100;
pub const EVENT_QUEUE_LIMIT: usize = 1000;

pub type Result<T, E = PeerError> = std::result::Result<T, E>;
pub type PeerTx = mpsc::Sender<PeerCommand>;
pub type PeerRx = mpsc::Receiver<PeerCommand>;
pub type EventTx = mpsc::Sender<PeerEvent>;
pub type EventRx = mpsc::Receiver<PeerEvent>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no handshake recieved")]
    NoHandshake,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("malformed block: {0}")]
    BadBlock(#[from] StoreError),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("channel error: {0}")]
    Channel(String),

    #[error("connection timeout")]
    Timeout,
}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PeerError::Channel(e.to_string())
    }
}

// Commands into a peer session's pipeline.
#[derive(Debug)]
pub enum PeerCommand {
    // Request a block from the peer. Dropped if the peer is choking us.
    Request(BlockInfo),

    // Reconcile our interest flag against the pieces still needed.
    UpdateInterest(std::sync::Arc<Vec<u32>>),

    // Tell the peer we got a piece.
    Have(u32),

    // Block read from disk, ready to serve.
    BlockRead(BlockData),

    // End the peer session safely.
    Shutdown,
}

// What happened to a block the session pushed into the piece store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Stored,
    Duplicate,
    Completed,
    HashMismatch,
}

// Events surfaced by sessions, consumed by the coordinator.
#[derive(Debug)]
pub enum PeerEvent {
    Connected { addr: SocketAddr, id: ID },

    // The peer's advertised pieces changed (BITFIELD or HAVE).
    AvailabilityChanged { addr: SocketAddr },

    Choked { addr: SocketAddr },

    Unchoked { addr: SocketAddr },

    BlockReceived { addr: SocketAddr, block: BlockInfo, outcome: BlockOutcome },

    Disconnected { addr: SocketAddr },
}

// The four protocol booleans of a session. We never unchoke, so
// am_choking stays true for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    pub am_choking: bool,

    pub am_interested: bool,

    pub peer_choking: bool,

    pub peer_interested: bool,
}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

impl SessionState {
    pub fn can_download(&self) -> bool {
        !self.peer_choking && self.am_interested
    }
}

// State a session publishes for the coordinator: mutated only by the
// session's receive path, read as a snapshot everywhere else.
#[derive(Debug)]
pub struct SessionShared {
    pub addr: SocketAddr,

    state: RwLock<SessionState>,

    bitfield: RwLock<Option<Bitfield>>,

    peer_id: RwLock<Option<ID>>,

    extensions: RwLock<Option<Extensions>>,
}

impl SessionShared {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            state: RwLock::new(SessionState::default()),
            bitfield: RwLock::new(None),
            peer_id: RwLock::new(None),
            extensions: RwLock::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap()
    }

    pub(crate) fn update_state(&self, f: impl FnOnce(&mut SessionState)) {
        f(&mut self.state.write().unwrap());
    }

    // Copy-on-read snapshot of the remote availability.
    pub fn bitfield(&self) -> Option<Bitfield> {
        self.bitfield.read().unwrap().clone()
    }

    pub fn has_piece(&self, idx: u32) -> bool {
        self.bitfield
            .read()
            .unwrap()
            .as_ref()
            .and_then(|bf| bf.get(idx as usize).map(|b| *b))
            .unwrap_or(false)
    }

    pub(crate) fn set_bitfield(&self, bitfield: Bitfield) {
        *self.bitfield.write().unwrap() = Some(bitfield);
    }

    // Sets bit idx, allocating the bitfield on a HAVE that arrives
    // before any BITFIELD.
    pub(crate) fn set_have(&self, idx: u32, num_pieces: u32) {
        let mut guard = self.bitfield.write().unwrap();
        let bitfield = guard.get_or_insert_with(|| Bitfield::repeat(false, num_pieces as usize));
        bitfield.set(idx as usize, true);
    }

    pub fn peer_id(&self) -> Option<ID> {
        *self.peer_id.read().unwrap()
    }

    pub fn extensions(&self) -> Option<Extensions> {
        *self.extensions.read().unwrap()
    }

    pub(crate) fn set_remote(&self, id: ID, extensions: Extensions) {
        *self.peer_id.write().unwrap() = Some(id);
        *self.extensions.write().unwrap() = Some(extensions);
    }
}

// A live session as registered in the pool.
#[derive(Debug)]
pub struct PeerHandle {
    pub tx: PeerTx,

    pub shared: std::sync::Arc<SessionShared>,

    pub task: tokio::task::JoinHandle<()>,
}

impl PeerHandle {
    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

use std::{collections::HashMap, net::SocketAddr};
use rand::{rngs::StdRng, Rng, SeedableRng};
use crate::{config::StrategyKind, Bitfield};
use super::PieceStore;

// Policy for choosing the next piece to request from a peer, given
// what the peer advertises and what we still need. Rarest-first keeps
// per-peer availability, fed through the peer_* hooks.
pub trait SelectionStrategy: Send {
    fn select_piece(&mut self, store: &PieceStore, peer: &Bitfield) -> Option<u32>;

    fn peer_bitfield_update(&mut self, addr: SocketAddr, bitfield: &Bitfield) {
        let _ = (addr, bitfield);
    }

    fn peer_removed(&mut self, addr: &SocketAddr) {
        let _ = addr;
    }
}

pub fn make_strategy(kind: StrategyKind) -> Box<dyn SelectionStrategy> {
    match kind {
        StrategyKind::Sequential => Box::new(SequentialStrategy),
        StrategyKind::Random => Box::new(RandomStrategy::new()),
        StrategyKind::RarestFirst => Box::new(RarestFirstStrategy::new()),
        StrategyKind::Smart => Box::new(SmartStrategy::new()),
    }
}

#[inline]
fn peer_has(peer: &Bitfield, idx: u32) -> bool {
    peer.get(idx as usize).map(|b| *b).unwrap_or(false)
}

// Pieces we still need that the peer advertises.
fn candidates(store: &PieceStore, peer: &Bitfield) -> Vec<u32> {
    let ours = store.bitfield();
    (0..store.num_pieces())
        .filter(|&i| !ours[i as usize] && peer_has(peer, i))
        .collect()
}

// Lowest-indexed needed piece the peer has.
pub struct SequentialStrategy;

impl SelectionStrategy for SequentialStrategy {
    fn select_piece(&mut self, store: &PieceStore, peer: &Bitfield) -> Option<u32> {
        let ours = store.bitfield();
        (0..store.num_pieces()).find(|&i| !ours[i as usize] && peer_has(peer, i))
    }
}

// Uniform over the needed pieces the peer has.
pub struct RandomStrategy {
    rng: StdRng,
}

impl RandomStrategy {
    pub fn new() -> Self {
        Self { rng: StdRng::from_entropy() }
    }

    // Deterministic selection order for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }
}

impl SelectionStrategy for RandomStrategy {
    fn select_piece(&mut self, store: &PieceStore, peer: &Bitfield) -> Option<u32> {
        let candidates = candidates(store, peer);
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[self.rng.gen_range(0..candidates.len())])
    }
}

// Among needed pieces the peer has, the one held by the fewest live
// peers; ties break to the lowest index.
pub struct RarestFirstStrategy {
    peer_bitfields: HashMap<SocketAddr, Bitfield>,
}

impl RarestFirstStrategy {
    pub fn new() -> Self {
        Self { peer_bitfields: HashMap::new() }
    }

    fn rarity(&self, idx: u32) -> usize {
        self.peer_bitfields
            .values()
            .filter(|bf| peer_has(bf, idx))
            .count()
    }
}

impl SelectionStrategy for RarestFirstStrategy {
    fn select_piece(&mut self, store: &PieceStore, peer: &Bitfield) -> Option<u32> {
        candidates(store, peer)
            .into_iter()
            .min_by_key(|&idx| (self.rarity(idx), idx))
    }

    fn peer_bitfield_update(&mut self, addr: SocketAddr, bitfield: &Bitfield) {
        self.peer_bitfields.insert(addr, bitfield.clone());
    }

    fn peer_removed(&mut self, addr: &SocketAddr) {
        self.peer_bitfields.remove(addr);
    }
}

// Phased default policy: sequential start so playback can begin,
// rarest-first for the bulk, any-available once few pieces remain.
pub struct SmartStrategy {
    sequential: SequentialStrategy,
    rarest_first: RarestFirstStrategy,

    // Use sequential until this many pieces are verified.
    sequential_threshold: usize,

    // Take anything on offer once this few pieces remain.
    endgame_threshold: usize,
}

impl SmartStrategy {
    pub fn new() -> Self {
        Self {
            sequential: SequentialStrategy,
            rarest_first: RarestFirstStrategy::new(),
            sequential_threshold: 4,
            endgame_threshold: 10,
        }
    }
}

impl SelectionStrategy for SmartStrategy {
    fn select_piece(&mut self, store: &PieceStore, peer: &Bitfield) -> Option<u32> {
        let (verified, total) = store.progress();

        if verified < self.sequential_threshold {
            if let Some(idx) = self.sequential.select_piece(store, peer) {
                return Some(idx);
            }
            // Sequential found nothing this peer can serve; fall
            // through rather than starve the connection.
        }

        let remaining = total - verified;
        if remaining <= self.endgame_threshold {
            return candidates(store, peer).into_iter().next();
        }

        self.rarest_first.select_piece(store, peer)
    }

    fn peer_bitfield_update(&mut self, addr: SocketAddr, bitfield: &Bitfield) {
        self.rarest_first.peer_bitfield_update(addr, bitfield);
    }

    fn peer_removed(&mut self, addr: &SocketAddr) {
        self.rarest_first.peer_removed(addr);
    }
}

// Caller-assigned priorities; highest wins, ties break to the lowest
// index, all-default falls back to the base strategy.
pub struct PriorityStrategy {
    priorities: HashMap<u32, i32>,
    base: Box<dyn SelectionStrategy>,
}

impl PriorityStrategy {
    pub fn new(base: Box<dyn SelectionStrategy>) -> Self {
        Self { priorities: HashMap::new(), base }
    }

    pub fn set_priority(&mut self, idx: u32, priority: i32) {
        self.priorities.insert(idx, priority);
    }
}

impl SelectionStrategy for PriorityStrategy {
    fn select_piece(&mut self, store: &PieceStore, peer: &Bitfield) -> Option<u32> {
        let best = candidates(store, peer)
            .into_iter()
            .map(|idx| (idx, self.priorities.get(&idx).copied().unwrap_or(0)))
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)));

        match best {
            Some((idx, priority)) if priority > 0 => Some(idx),
            Some(_) => self.base.select_piece(store, peer),
            None => None,
        }
    }

    fn peer_bitfield_update(&mut self, addr: SocketAddr, bitfield: &Bitfield) {
        self.base.peer_bitfield_update(addr, bitfield);
    }

    fn peer_removed(&mut self, addr: &SocketAddr) {
        self.base.peer_removed(addr);
    }
}

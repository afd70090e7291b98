use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Instant};
use tokio::time;
use crate::{
    block::BlockInfo,
    p2p::{BlockOutcome, EventRx, PeerCommand, PeerEvent},
    piece::strategy::{make_strategy, SelectionStrategy},
    pool::{PeerPool, PeerRef},
    torrent::{CommandToTorrent, TorrentContext, TorrentTx},
};

// A block request we have on the wire somewhere.
#[derive(Debug)]
struct Outstanding {
    len: u32,
    peer: SocketAddr,
    requested_at: Instant,
}

// The global control loop. Each cycle reconciles peer interest, asks
// the selector for work per downloadable peer and issues block
// requests, deduplicated so that any (piece, offset) is in flight to
// at most one peer at a time.
pub struct Coordinator {
    ctx: Arc<TorrentContext>,

    pool: Arc<PeerPool>,

    strategy: Box<dyn SelectionStrategy>,

    // Sole owner of the outstanding request map, keyed (piece, offset).
    outstanding: HashMap<(u32, u32), Outstanding>,

    events_rx: EventRx,

    torrent_tx: TorrentTx,

    verified_reported: bool,
}

impl Coordinator {
    pub fn new(
        ctx: Arc<TorrentContext>,
        pool: Arc<PeerPool>,
        events_rx: EventRx,
        torrent_tx: TorrentTx,
    ) -> Self {
        let strategy = make_strategy(ctx.config.strategy);
        Self {
            ctx,
            pool,
            strategy,
            outstanding: HashMap::new(),
            events_rx,
            torrent_tx,
            verified_reported: false,
        }
    }

    #[tracing::instrument(skip_all, name = "coordinator")]
    pub async fn run(mut self) {
        tracing::debug!("download coordinator started");

        let mut cycle = time::interval(self.ctx.config.cycle_interval);
        let mut sweep = time::interval(self.ctx.config.sweep_interval);
        cycle.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        sweep.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop { tokio::select! {
            _ = self.ctx.cancel.cancelled() => break,

            event = self.events_rx.recv() => match event {
                Some(event) => self.handle_event(event),
                None => break,
            },

            _ = cycle.tick() => self.cycle(),

            _ = sweep.tick() => self.evict_timed_out(Instant::now()),
        }}

        tracing::debug!("download coordinator stopped");
    }

    fn cycle(&mut self) {
        self.run_cycle(self.pool.all(), Instant::now());
    }

    // One coordination cycle over a snapshot of the live sessions.
    fn run_cycle(&mut self, peers: Vec<PeerRef>, now: Instant) {
        let mut needed = self.ctx.pieces.pieces_needed();
        if needed.is_empty() {
            if !self.verified_reported {
                self.verified_reported = true;
                tracing::info!("all pieces verified");
                self.torrent_tx.try_send(CommandToTorrent::AllVerified).ok();
            }
            return;
        }
        needed.truncate(self.ctx.config.max_pieces_per_cycle);
        let needed = Arc::new(needed);

        for peer in &peers {
            peer.tx
                .try_send(PeerCommand::UpdateInterest(Arc::clone(&needed)))
                .ok();
        }

        for peer in &peers {
            if !peer.shared.state().can_download() {
                continue;
            }
            // Nothing to pick from until the peer tells us what it has.
            let Some(bitfield) = peer.shared.bitfield() else { continue };

            let in_flight = self
                .outstanding
                .values()
                .filter(|o| o.peer == peer.addr)
                .count();
            let mut budget = self.ctx.config.max_inflight_per_peer.saturating_sub(in_flight);
            if budget == 0 {
                continue;
            }

            let Some(idx) = self.strategy.select_piece(&self.ctx.pieces, &bitfield) else {
                continue;
            };

            for block in self.ctx.pieces.unrequested_blocks(idx) {
                if budget == 0 {
                    break;
                }
                // At most one in-flight request per block, globally.
                if self.outstanding.contains_key(&(block.piece_idx, block.offset)) {
                    continue;
                }
                if peer.tx.try_send(PeerCommand::Request(block)).is_err() {
                    tracing::debug!("command queue full for {}", peer.addr);
                    break;
                }

                self.ctx.pieces.add_request(block, peer.addr, now).ok();
                self.outstanding.insert(
                    (block.piece_idx, block.offset),
                    Outstanding { len: block.len, peer: peer.addr, requested_at: now },
                );
                tracing::trace!("requested {}:{} from {}", block.piece_idx, block.offset, peer.addr);
                budget -= 1;
            }
        }

        let (verified, total) = self.ctx.pieces.progress();
        tracing::debug!(
            "cycle: {}/{} pieces verified, {} requests in flight, {} peers",
            verified,
            total,
            self.outstanding.len(),
            peers.len(),
        );
    }

    fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected { addr, id } => {
                tracing::debug!("peer {} connected as {:?}", addr, String::from_utf8_lossy(&id));
            }

            PeerEvent::AvailabilityChanged { addr } => {
                // Read the session's current snapshot rather than carry
                // bitfields through the event queue.
                if let Some(peer) = self.pool.get(&addr) {
                    if let Some(bitfield) = peer.shared.bitfield() {
                        self.strategy.peer_bitfield_update(addr, &bitfield);
                    }
                }
            }

            // The peer is free to drop anything we had queued on it.
            PeerEvent::Choked { addr } => self.drop_peer_requests(addr),

            // Nothing to do; the next cycle starts requesting.
            PeerEvent::Unchoked { addr } => {
                tracing::debug!("peer {} unchoked us", addr);
            }

            PeerEvent::BlockReceived { addr, block, outcome } => {
                self.on_block_received(addr, block, outcome);
            }

            PeerEvent::Disconnected { addr } => {
                self.drop_peer_requests(addr);
                self.strategy.peer_removed(&addr);
                self.pool.remove(&addr);
            }
        }
    }

    // Clears the matching outstanding entry and records the round trip.
    fn on_block_received(&mut self, addr: SocketAddr, block: BlockInfo, outcome: BlockOutcome) {
        match self.outstanding.remove(&(block.piece_idx, block.offset)) {
            Some(req) => tracing::trace!(
                "block {}:{} from {} after {:?}",
                block.piece_idx,
                block.offset,
                addr,
                req.requested_at.elapsed(),
            ),
            None => tracing::warn!(
                "spurious block {}:{} from {}",
                block.piece_idx,
                block.offset,
                addr,
            ),
        }

        if outcome == BlockOutcome::HashMismatch {
            // The store reset the piece; anything still marked in
            // flight for it is stale.
            self.outstanding.retain(|&(piece, _), _| piece != block.piece_idx);
        }
    }

    // Used on CHOKE and on session loss: every outstanding request to
    // the peer is considered lost immediately.
    fn drop_peer_requests(&mut self, addr: SocketAddr) {
        let before = self.outstanding.len();
        self.outstanding.retain(|_, o| o.peer != addr);
        let dropped = before - self.outstanding.len();
        self.ctx.pieces.drop_peer_requests(&addr);
        if dropped > 0 {
            tracing::debug!("freed {} outstanding requests for {}", dropped, addr);
        }
    }

    // Evicted entries become eligible for re-issue on the next cycle,
    // possibly to a different peer.
    fn evict_timed_out(&mut self, now: Instant) {
        let timeout = self.ctx.config.request_timeout;
        let mut evicted = Vec::new();
        self.outstanding.retain(|&(piece, offset), req| {
            if now.duration_since(req.requested_at) > timeout {
                evicted.push((piece, offset, req.len, req.peer));
                false
            } else {
                true
            }
        });

        for (piece_idx, offset, len, peer) in evicted {
            tracing::debug!("request timeout for block {}:{} from {}", piece_idx, offset, peer);
            self.ctx
                .pieces
                .remove_request(BlockInfo { piece_idx, offset, len }, peer);
        }
    }

    #[cfg(test)]
    fn outstanding_for(&self, addr: SocketAddr) -> usize {
        self.outstanding.values().filter(|o| o.peer == addr).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use crate::{
        config::{Config, StrategyKind},
        disk::DISK_QUEUE_LIMIT,
        p2p::{PeerRx, SessionShared, COMMAND_QUEUE_LIMIT, EVENT_QUEUE_LIMIT},
        piece::PieceStore,
        pool::PeerPool,
        store::StoreInfo,
        torrent::TorrentRx,
        Bitfield,
        BLOCK_SIZE,
    };

    struct Harness {
        coordinator: Coordinator,
        torrent_rx: TorrentRx,
        _disk_rx: crate::disk::DiskRx,
    }

    // Two-block pieces make the in-flight accounting visible.
    fn harness(num_pieces: usize, inflight: usize) -> Harness {
        let piece_len = 2 * BLOCK_SIZE;
        let info = StoreInfo::test_layout(
            vec![("data", num_pieces * piece_len)],
            piece_len,
            "out",
        );
        let pieces = Arc::new(PieceStore::new(&info, vec![[0u8; 20]; num_pieces]));

        let config = Config {
            strategy: StrategyKind::Sequential,
            max_inflight_per_peer: inflight,
            ..Config::default()
        };
        let (disk_tx, disk_rx) = mpsc::channel(DISK_QUEUE_LIMIT);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_LIMIT);
        let (torrent_tx, torrent_rx) = mpsc::channel(64);

        let ctx = Arc::new(TorrentContext {
            info_hash: [0xaa; 20],
            client_id: crate::generate_peer_id(),
            info,
            pieces,
            disk_tx,
            events_tx,
            config,
            cancel: CancellationToken::new(),
        });
        let pool = PeerPool::new(Arc::clone(&ctx));

        Harness {
            coordinator: Coordinator::new(ctx, pool, events_rx, torrent_tx),
            torrent_rx,
            _disk_rx: disk_rx,
        }
    }

    fn fake_peer(n: u8, num_pieces: usize) -> (PeerRef, PeerRx) {
        let addr: SocketAddr = format!("10.0.0.{}:6881", n).parse().unwrap();
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_LIMIT);
        let shared = Arc::new(SessionShared::new(addr));
        shared.update_state(|s| {
            s.peer_choking = false;
            s.am_interested = true;
        });
        shared.set_bitfield(Bitfield::repeat(true, num_pieces));
        (PeerRef { addr, tx, shared }, rx)
    }

    fn drain_requests(rx: &mut PeerRx) -> Vec<BlockInfo> {
        let mut requests = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            if let PeerCommand::Request(block) = cmd {
                requests.push(block);
            }
        }
        requests
    }

    #[tokio::test]
    async fn test_at_most_one_request_per_block() {
        let mut h = harness(2, 10);
        let (peer_a, mut rx_a) = fake_peer(1, 2);
        let (peer_b, mut rx_b) = fake_peer(2, 2);
        let now = Instant::now();

        h.coordinator.run_cycle(vec![peer_a.clone(), peer_b.clone()], now);

        // Sequential strategy points both peers at piece 0; only the
        // first may take its two blocks.
        let requests_a = drain_requests(&mut rx_a);
        let requests_b = drain_requests(&mut rx_b);
        assert_eq!(requests_a.len(), 2);
        assert!(requests_b.is_empty());
        assert_eq!(h.coordinator.outstanding.len(), 2);

        // Re-running the cycle issues nothing new.
        h.coordinator.run_cycle(vec![peer_a, peer_b], now);
        assert!(drain_requests(&mut rx_a).is_empty());
        assert!(drain_requests(&mut rx_b).is_empty());
        assert_eq!(h.coordinator.outstanding.len(), 2);
    }

    #[tokio::test]
    async fn test_inflight_budget_respected() {
        let mut h = harness(4, 1);
        let (peer, mut rx) = fake_peer(1, 4);

        h.coordinator.run_cycle(vec![peer.clone()], Instant::now());
        assert_eq!(drain_requests(&mut rx).len(), 1);
        assert_eq!(h.coordinator.outstanding_for(peer.addr), 1);

        // Budget exhausted: another cycle adds nothing.
        h.coordinator.run_cycle(vec![peer], Instant::now());
        assert!(drain_requests(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_choke_frees_outstanding_requests() {
        let mut h = harness(2, 10);
        let (peer_a, mut rx_a) = fake_peer(1, 2);
        let (peer_b, mut rx_b) = fake_peer(2, 2);

        h.coordinator.run_cycle(vec![peer_a.clone(), peer_b.clone()], Instant::now());
        assert_eq!(h.coordinator.outstanding_for(peer_a.addr), 2);

        // CHOKE arrives: the outstanding count for the peer drops to
        // zero at once.
        peer_a.shared.update_state(|s| s.peer_choking = true);
        h.coordinator
            .handle_event(PeerEvent::Choked { addr: peer_a.addr });
        assert_eq!(h.coordinator.outstanding_for(peer_a.addr), 0);
        assert!(h.coordinator.outstanding.is_empty());

        // The freed blocks are re-issued, this time to the other peer.
        h.coordinator.run_cycle(vec![peer_a, peer_b], Instant::now());
        assert!(drain_requests(&mut rx_a).is_empty());
        assert_eq!(drain_requests(&mut rx_b).len(), 2);
    }

    #[tokio::test]
    async fn test_timed_out_requests_are_evicted() {
        let mut h = harness(1, 10);
        let (peer, mut rx) = fake_peer(1, 1);
        let issued_at = Instant::now();

        h.coordinator.run_cycle(vec![peer.clone()], issued_at);
        assert_eq!(h.coordinator.outstanding.len(), 2);
        drain_requests(&mut rx);

        // Not yet stale.
        h.coordinator.evict_timed_out(issued_at + Duration::from_secs(10));
        assert_eq!(h.coordinator.outstanding.len(), 2);

        // Past the request timeout: evicted and eligible again.
        h.coordinator.evict_timed_out(issued_at + Duration::from_secs(16));
        assert!(h.coordinator.outstanding.is_empty());

        h.coordinator.run_cycle(vec![peer], issued_at + Duration::from_secs(16));
        assert_eq!(drain_requests(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_drops_requests() {
        let mut h = harness(2, 10);
        let (peer, mut rx) = fake_peer(1, 2);

        h.coordinator.run_cycle(vec![peer.clone()], Instant::now());
        assert_eq!(h.coordinator.outstanding.len(), 2);
        drain_requests(&mut rx);

        h.coordinator
            .handle_event(PeerEvent::Disconnected { addr: peer.addr });
        assert!(h.coordinator.outstanding.is_empty());
        // Pending entries in the store were released too.
        assert_eq!(h.coordinator.ctx.pieces.unrequested_blocks(0).len(), 2);
    }

    #[tokio::test]
    async fn test_spurious_block_is_tolerated() {
        let mut h = harness(1, 10);
        let addr: SocketAddr = "10.0.0.9:6881".parse().unwrap();

        // A block nobody asked for must not disturb the map.
        h.coordinator.on_block_received(
            addr,
            BlockInfo { piece_idx: 0, offset: 0, len: BLOCK_SIZE as u32 },
            BlockOutcome::Stored,
        );
        assert!(h.coordinator.outstanding.is_empty());
    }

    #[tokio::test]
    async fn test_block_arrival_clears_outstanding() {
        let mut h = harness(1, 10);
        let (peer, mut rx) = fake_peer(1, 1);

        h.coordinator.run_cycle(vec![peer.clone()], Instant::now());
        let requests = drain_requests(&mut rx);
        assert_eq!(requests.len(), 2);

        h.coordinator.on_block_received(peer.addr, requests[0], BlockOutcome::Stored);
        assert_eq!(h.coordinator.outstanding.len(), 1);
        h.coordinator.on_block_received(peer.addr, requests[1], BlockOutcome::Stored);
        assert!(h.coordinator.outstanding.is_empty());
    }

    #[tokio::test]
    async fn test_skips_peers_without_bitfield() {
        let mut h = harness(2, 10);
        let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let (tx, mut rx) = mpsc::channel(COMMAND_QUEUE_LIMIT);
        let shared = Arc::new(SessionShared::new(addr));
        shared.update_state(|s| {
            s.peer_choking = false;
            s.am_interested = true;
        });
        // No bitfield published yet.
        let peer = PeerRef { addr, tx, shared };

        h.coordinator.run_cycle(vec![peer], Instant::now());
        assert!(drain_requests(&mut rx).is_empty());
        assert!(h.coordinator.outstanding.is_empty());
    }

    #[tokio::test]
    async fn test_completion_reported_once() {
        let mut h = harness(1, 10);
        h.coordinator.ctx.pieces.mark_verified(0).unwrap();

        h.coordinator.run_cycle(Vec::new(), Instant::now());
        h.coordinator.run_cycle(Vec::new(), Instant::now());

        assert!(matches!(
            h.torrent_rx.try_recv(),
            Ok(CommandToTorrent::AllVerified)
        ));
        assert!(h.torrent_rx.try_recv().is_err());
    }
}

use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Instant};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc, time};
use tokio_util::codec::Framed;
use crate::{
    block::{BlockData, BlockInfo},
    disk::DiskCommand,
    piece::BlockStatus,
    torrent::TorrentContext,
    Bitfield,
};
use super::{*, handshake::*, message::*};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

// One session per remote peer: owns the socket, the protocol state
// machine and a bounded command pipeline. Availability and the four
// protocol booleans are published through SessionShared for the
// coordinator to snapshot.
#[derive(Debug)]
pub struct PeerSession {
    // The peer's IP address.
    addr: SocketAddr,

    // Read only state shared by all sessions of the run.
    ctx: Arc<TorrentContext>,

    shared: Arc<SessionShared>,

    // Commands to the session.
    cmd_rx: PeerRx,

    // Handed to the disk task so block reads come back to us.
    peer_tx: PeerTx,

    // Pending block requests from the peer to us.
    requests_in: HashSet<BlockInfo>,

    last_seen: Instant,

    last_send: Instant,
}

impl PeerSession {
    pub fn new(addr: SocketAddr, ctx: Arc<TorrentContext>) -> (PeerSession, PeerTx, Arc<SessionShared>) {
        let (peer_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_LIMIT);
        let shared = Arc::new(SessionShared::new(addr));

        (
            PeerSession {
                addr,
                ctx,
                shared: Arc::clone(&shared),
                cmd_rx,
                peer_tx: peer_tx.clone(),
                requests_in: HashSet::new(),
                last_seen: Instant::now(),
                last_send: Instant::now(),
            },
            peer_tx,
            shared,
        )
    }

    #[tracing::instrument(name = "peer", skip(self), fields(address = %self.addr))]
    pub async fn start(mut self) -> Result<()> {
        let res = self.connect_and_run().await;
        if let Err(e) = &res {
            tracing::debug!("session ended: {}", e);
        }
        // Frees the session's outstanding requests back to the coordinator.
        self.ctx
            .events_tx
            .send(PeerEvent::Disconnected { addr: self.addr })
            .await
            .ok();
        res
    }

    async fn connect_and_run(&mut self) -> Result<()> {
        let stream = time::timeout(self.ctx.config.dial_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| PeerError::Timeout)??;
        tracing::trace!("outbound connection successful");

        let mut socket = Framed::new(stream, HandshakeCodec);
        let remote = time::timeout(
            self.ctx.config.handshake_timeout,
            self.exchange_handshake(&mut socket),
        )
        .await
        .map_err(|_| PeerError::Timeout)??;

        self.shared.set_remote(remote.peer_id, remote.extensions());
        self.ctx
            .events_tx
            .send(PeerEvent::Connected { addr: self.addr, id: remote.peer_id })
            .await
            .ok();

        // map_codec keeps the read buffer: a bitfield the peer fired
        // off right behind its handshake must not be lost.
        let socket = socket.map_codec(|_| MessageCodec);
        self.run(socket).await
    }

    async fn exchange_handshake(
        &mut self,
        socket: &mut Framed<TcpStream, HandshakeCodec>,
    ) -> Result<Handshake> {
        tracing::trace!("send handshake");
        socket
            .send(Handshake::new(self.ctx.info_hash, self.ctx.client_id))
            .await?;

        if let Some(handshake) = socket.next().await.transpose()? {
            if handshake.protocol != PROTOCOL {
                return Err(PeerError::IncorrectProtocol);
            }
            if handshake.info_hash != self.ctx.info_hash {
                return Err(PeerError::IncorrectInfoHash);
            }
            tracing::debug!(
                "handshake successful, peer {} connected",
                String::from_utf8_lossy(&handshake.peer_id),
            );
            Ok(handshake)
        } else {
            Err(PeerError::NoHandshake)
        }
    }

    async fn run(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {
        let (mut sink, mut stream) = socket.split();
        self.last_seen = Instant::now();
        self.last_send = Instant::now();

        // Advertise anything we already hold.
        if self.ctx.pieces.progress().0 > 0 {
            self.send(&mut sink, Message::Bitfield(self.ctx.pieces.bitfield())).await?;
        }

        // Drives keep-alive and idle-read checks.
        let mut ticker = time::interval(time::Duration::from_secs(1));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop { tokio::select! {
            _ = self.ctx.cancel.cancelled() => break,

            // Message from peer.
            msg = stream.next() => match msg {
                Some(Ok(msg)) => self.handle_msg(&mut sink, msg).await?,
                Some(Err(e)) => return Err(e),
                None => return Err(PeerError::ConnectionClosed),
            },

            // Command from elsewhere in the client.
            cmd = self.cmd_rx.recv() => match cmd {
                Some(PeerCommand::Shutdown) | None => {
                    tracing::trace!("session shutdown");
                    break;
                },
                Some(cmd) => self.handle_cmd(&mut sink, cmd).await?,
            },

            _ = ticker.tick() => self.tick(&mut sink).await?,
        }}

        Ok(())
    }

    // Logs and sends a message, refreshing the keep-alive clock.
    async fn send(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("send: {}", msg);
        sink.send(msg).await?;
        self.last_send = Instant::now();
        Ok(())
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("read: {}", msg);
        self.last_seen = Instant::now();

        match msg {
            Message::KeepAlive => {},

            Message::Choke => {
                if !self.shared.state().peer_choking {
                    self.shared.update_state(|s| s.peer_choking = true);
                    // The coordinator must immediately consider our
                    // outstanding requests to this peer lost.
                    self.emit(PeerEvent::Choked { addr: self.addr }).await;
                }
            },

            Message::Unchoke => {
                if self.shared.state().peer_choking {
                    self.shared.update_state(|s| s.peer_choking = false);
                    self.emit(PeerEvent::Unchoked { addr: self.addr }).await;
                }
            },

            Message::Interested => self.shared.update_state(|s| s.peer_interested = true),

            Message::NotInterested => self.shared.update_state(|s| s.peer_interested = false),

            Message::Have { idx } => self.handle_have(idx).await?,

            // BEP 3 allows bitfield only directly after the handshake,
            // but we accept it at any time for robustness.
            Message::Bitfield(bitfield) => self.handle_bitfield(bitfield).await,

            Message::Request(request) => self.handle_request(request).await?,

            Message::Block(block) => self.handle_block(block).await?,

            Message::Cancel(request) => self.handle_cancel(request),

            // DHT port announcement, nothing to do with it here.
            Message::Port { port } => tracing::trace!("peer dht port: {}", port),
        }

        Ok(())
    }

    async fn handle_have(&mut self, idx: u32) -> Result<()> {
        if idx >= self.ctx.info.num_pieces {
            tracing::warn!("have msg with invalid idx: {}", idx);
            return Err(PeerError::InvalidMessage);
        }
        if self.shared.has_piece(idx) {
            return Ok(());
        }
        self.shared.set_have(idx, self.ctx.info.num_pieces);
        self.emit(PeerEvent::AvailabilityChanged { addr: self.addr }).await;
        Ok(())
    }

    async fn handle_bitfield(&mut self, mut bitfield: Bitfield) {
        // Remove spare trailing bits.
        bitfield.resize(self.ctx.info.num_pieces as usize, false);
        tracing::debug!(
            "peer has {}/{} pieces",
            bitfield.count_ones(),
            self.ctx.info.num_pieces,
        );
        self.shared.set_bitfield(bitfield);
        self.emit(PeerEvent::AvailabilityChanged { addr: self.addr }).await;
    }

    async fn handle_block(&mut self, block: BlockData) -> Result<()> {
        let info = block.info();
        if !info.is_valid(&self.ctx.info) {
            tracing::warn!("invalid block: {:?}", info);
            return Err(PeerError::InvalidMessage);
        }

        let outcome = match self.ctx.pieces.record_block(info.piece_idx, info.offset, &block.data)? {
            BlockStatus::Accepted => BlockOutcome::Stored,
            BlockStatus::Duplicate | BlockStatus::Rejected => {
                tracing::debug!("duplicate block: {:?}", info);
                BlockOutcome::Duplicate
            },
            BlockStatus::PieceComplete(data) => {
                // Verified; hand the assembled piece to the disk task.
                self.ctx
                    .disk_tx
                    .send(DiskCommand::WritePiece { idx: info.piece_idx, data })
                    .await
                    .map_err(|e| PeerError::Channel(e.to_string()))?;
                BlockOutcome::Completed
            },
            BlockStatus::HashMismatch => BlockOutcome::HashMismatch,
        };

        self.emit(PeerEvent::BlockReceived { addr: self.addr, block: info, outcome }).await;
        Ok(())
    }

    async fn handle_request(&mut self, request: BlockInfo) -> Result<()> {
        if !request.is_valid(&self.ctx.info) {
            tracing::warn!("invalid request: {:?}", request);
            return Err(PeerError::InvalidMessage);
        }
        // Leech-only: am_choking stays true, so this drops everything.
        if self.shared.state().am_choking || !self.ctx.pieces.is_verified(request.piece_idx) {
            tracing::trace!("dropping request: {:?}", request);
            return Ok(());
        }
        if !self.requests_in.insert(request) {
            tracing::debug!("duplicate request: {:?}", request);
            return Ok(());
        }

        self.ctx
            .disk_tx
            .send(DiskCommand::ReadBlock { block: request, tx: self.peer_tx.clone() })
            .await
            .map_err(|e| PeerError::Channel(e.to_string()))?;
        Ok(())
    }

    fn handle_cancel(&mut self, request: BlockInfo) {
        // Best effort: drop the queued response if it hasn't gone out.
        self.requests_in.remove(&request);
    }

    async fn handle_cmd(&mut self, sink: &mut MessageSink, cmd: PeerCommand) -> Result<()> {
        match cmd {
            PeerCommand::Request(block) => {
                // Fail fast rather than queue requests a choking peer
                // is free to ignore.
                if self.shared.state().peer_choking {
                    tracing::debug!("not requesting {:?}, peer is choking", block);
                    return Ok(());
                }
                self.send(sink, Message::Request(block)).await?;
            },

            PeerCommand::UpdateInterest(needed) => {
                let interested = needed.iter().any(|&idx| self.shared.has_piece(idx));
                let state = self.shared.state();
                if interested && !state.am_interested {
                    self.send(sink, Message::Interested).await?;
                    self.shared.update_state(|s| s.am_interested = true);
                } else if !interested && state.am_interested {
                    self.send(sink, Message::NotInterested).await?;
                    self.shared.update_state(|s| s.am_interested = false);
                }
            },

            PeerCommand::Have(idx) => {
                // No point advertising to a peer that has it.
                if !self.shared.has_piece(idx) {
                    self.send(sink, Message::Have { idx }).await?;
                }
            },

            PeerCommand::BlockRead(block) => {
                if self.requests_in.remove(&block.info()) {
                    self.send(sink, Message::Block(block)).await?;
                } else {
                    tracing::debug!("block read but request was cancelled: {:?}", block.info());
                }
            },

            PeerCommand::Shutdown => unreachable!("handled by the session loop"),
        }
        Ok(())
    }

    async fn tick(&mut self, sink: &mut MessageSink) -> Result<()> {
        let now = Instant::now();

        if now.duration_since(self.last_seen) > self.ctx.config.read_idle_timeout {
            tracing::debug!("closing idle session");
            return Err(PeerError::Timeout);
        }

        if now.duration_since(self.last_send) >= self.ctx.config.keep_alive_interval {
            self.send(sink, Message::KeepAlive).await?;
        }

        Ok(())
    }

    async fn emit(&self, event: PeerEvent) {
        if self.ctx.events_tx.send(event).await.is_err() {
            tracing::trace!("event channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use sha1::{Digest, Sha1};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;
    use crate::{
        config::Config,
        disk::{DiskRx, DISK_QUEUE_LIMIT},
        piece::PieceStore,
        store::StoreInfo,
        ID,
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        ctx: Arc<TorrentContext>,
        events_rx: EventRx,
        disk_rx: DiskRx,
    }

    // One piece of 848 bytes, a single short block.
    fn harness(content: &[u8]) -> Harness {
        let info = StoreInfo::test_layout(vec![("data", content.len())], content.len(), "out");
        let hash: ID = Sha1::digest(content).into();
        let pieces = Arc::new(PieceStore::new(&info, vec![hash]));

        let (disk_tx, disk_rx) = mpsc::channel(DISK_QUEUE_LIMIT);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_LIMIT);

        let ctx = Arc::new(TorrentContext {
            info_hash: [0xab; 20],
            client_id: crate::generate_peer_id(),
            info,
            pieces,
            disk_tx,
            events_tx,
            config: Config::default(),
            cancel: CancellationToken::new(),
        });

        Harness { ctx, events_rx, disk_rx }
    }

    async fn next_event(rx: &mut EventRx) -> PeerEvent {
        time::timeout(TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    // Drives a full leeching exchange against a scripted remote:
    // handshake, bitfield, unchoke, request, block, completion.
    #[tokio::test]
    async fn test_session_downloads_a_piece() {
        let content: Vec<u8> = (0..848u32).map(|i| (i % 251) as u8).collect();
        let mut h = harness(&content);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = h.ctx.info_hash;

        let remote_content = content.clone();
        let remote = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = Framed::new(stream, HandshakeCodec);

            let handshake = socket.next().await.unwrap().unwrap();
            assert_eq!(handshake.protocol, PROTOCOL);
            assert_eq!(handshake.info_hash, info_hash);
            assert_eq!(&handshake.peer_id[..8], b"-SB0100-");
            socket.send(Handshake::new(info_hash, [0x22; 20])).await.unwrap();

            let mut socket = socket.map_codec(|_| MessageCodec);
            socket.send(Message::Bitfield(Bitfield::repeat(true, 1))).await.unwrap();
            socket.send(Message::Unchoke).await.unwrap();

            // The session becomes interested, then requests the block.
            assert_eq!(socket.next().await.unwrap().unwrap(), Message::Interested);
            let request = match socket.next().await.unwrap().unwrap() {
                Message::Request(block) => block,
                other => panic!("expected request, got {}", other),
            };
            assert_eq!(request, BlockInfo { piece_idx: 0, offset: 0, len: 848 });

            socket
                .send(Message::Block(BlockData {
                    piece_idx: 0,
                    offset: 0,
                    data: remote_content,
                }))
                .await
                .unwrap();

            // Hold the socket open until the session hangs up.
            while let Some(msg) = socket.next().await {
                if msg.is_err() {
                    break;
                }
            }
        });

        let (session, tx, shared) = PeerSession::new(addr, Arc::clone(&h.ctx));
        let task = tokio::spawn(session.start());

        match next_event(&mut h.events_rx).await {
            PeerEvent::Connected { id, .. } => assert_eq!(id, [0x22; 20]),
            other => panic!("expected connected, got {:?}", other),
        }
        assert!(matches!(
            next_event(&mut h.events_rx).await,
            PeerEvent::AvailabilityChanged { .. }
        ));
        assert!(matches!(next_event(&mut h.events_rx).await, PeerEvent::Unchoked { .. }));
        assert!(shared.has_piece(0));
        assert!(!shared.state().peer_choking);

        // Coordinator-style interest reconciliation and request issue.
        tx.send(PeerCommand::UpdateInterest(Arc::new(vec![0]))).await.unwrap();
        tx.send(PeerCommand::Request(BlockInfo { piece_idx: 0, offset: 0, len: 848 }))
            .await
            .unwrap();

        match next_event(&mut h.events_rx).await {
            PeerEvent::BlockReceived { block, outcome, .. } => {
                assert_eq!(block.offset, 0);
                assert_eq!(outcome, BlockOutcome::Completed);
            }
            other => panic!("expected block received, got {:?}", other),
        }

        // The verified piece went to the disk task and the bitfield bit
        // flipped.
        match time::timeout(TIMEOUT, h.disk_rx.recv()).await.unwrap() {
            Some(DiskCommand::WritePiece { idx, data }) => {
                assert_eq!(idx, 0);
                assert_eq!(data, content);
            }
            _ => panic!("expected a piece write"),
        }
        assert!(h.ctx.pieces.is_verified(0));
        assert_eq!(h.ctx.pieces.bitfield_bytes(), vec![0x80]);

        tx.send(PeerCommand::Shutdown).await.unwrap();
        assert!(matches!(
            next_event(&mut h.events_rx).await,
            PeerEvent::Disconnected { .. }
        ));
        time::timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
        time::timeout(TIMEOUT, remote).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_session_rejects_wrong_info_hash() {
        let content = vec![1u8; 848];
        let mut h = harness(&content);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = Framed::new(stream, HandshakeCodec);
            socket.next().await;
            // Answer for some other torrent.
            socket.send(Handshake::new([0xee; 20], [0x22; 20])).await.unwrap();
        });

        let (session, _tx, _shared) = PeerSession::new(addr, Arc::clone(&h.ctx));
        let task = tokio::spawn(session.start());

        assert!(matches!(
            next_event(&mut h.events_rx).await,
            PeerEvent::Disconnected { .. }
        ));
        let res = time::timeout(TIMEOUT, task).await.unwrap().unwrap();
        assert!(matches!(res, Err(PeerError::IncorrectInfoHash)));
    }

    #[tokio::test]
    async fn test_session_closes_on_out_of_range_have() {
        let content = vec![1u8; 848];
        let mut h = harness(&content);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = h.ctx.info_hash;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = Framed::new(stream, HandshakeCodec);
            socket.next().await;
            socket.send(Handshake::new(info_hash, [0x22; 20])).await.unwrap();

            let mut socket = socket.map_codec(|_| MessageCodec);
            // Only one piece exists; index 99 is a protocol error.
            socket.send(Message::Have { idx: 99 }).await.unwrap();
            while let Some(msg) = socket.next().await {
                if msg.is_err() {
                    break;
                }
            }
        });

        let (session, _tx, _shared) = PeerSession::new(addr, Arc::clone(&h.ctx));
        let task = tokio::spawn(session.start());

        assert!(matches!(
            next_event(&mut h.events_rx).await,
            PeerEvent::Connected { .. }
        ));
        assert!(matches!(
            next_event(&mut h.events_rx).await,
            PeerEvent::Disconnected { .. }
        ));
        let res = time::timeout(TIMEOUT, task).await.unwrap().unwrap();
        assert!(matches!(res, Err(PeerError::InvalidMessage)));
    }
}

use std::{sync::Arc, time::Instant};
use tokio::{sync::mpsc, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use crate::{
    config::Config,
    coordinator::Coordinator,
    disk::{spawn_disk, Disk, DiskCommand, DiskTx, DISK_QUEUE_LIMIT},
    metainfo::MetaInfo,
    p2p::{EventTx, EVENT_QUEUE_LIMIT},
    piece::PieceStore,
    pool::PeerPool,
    store::StoreInfo,
    tracker::{AnnounceParams, Event, TrackerClient},
    generate_peer_id,
    ID,
};

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("disk error: {0}")]
    DiskError(#[from] crate::disk::DiskError),

    #[error("disk failure: {0}")]
    DiskFailure(String),

    #[error("channel error: {0}")]
    ChannelError(String),
}

pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::Sender<CommandToTorrent>;
pub type TorrentRx = mpsc::Receiver<CommandToTorrent>;

const TORRENT_QUEUE_LIMIT: usize = 64;

#[derive(Debug)]
pub enum CommandToTorrent {
    // Sent by the disk task once a verified piece hit stable storage.
    PieceWritten { idx: u32 },

    // Sent by the coordinator when every piece passed verification.
    AllVerified,

    // Disk I/O failed; the run is over.
    DiskFailure(String),
}

// Read-only state shared by every task of the run.
#[derive(Debug)]
pub struct TorrentContext {
    pub info_hash: ID,

    // Our own peer id, sent in every handshake.
    pub client_id: ID,

    pub info: StoreInfo,

    pub pieces: Arc<PieceStore>,

    pub disk_tx: DiskTx,

    pub events_tx: EventTx,

    pub config: Config,

    // Root cancellation: tears down sessions, coordinator and sweeps.
    pub cancel: CancellationToken,
}

// Drives one torrent from announce to completed download.
pub struct Torrent {
    ctx: Arc<TorrentContext>,

    pool: Arc<PeerPool>,

    // Trackers ordered by tier.
    trackers: Vec<Vec<TrackerClient>>,

    torrent_rx: TorrentRx,

    torrent_tx: TorrentTx,

    events_rx: Option<crate::p2p::EventRx>,

    disk_handle: Option<JoinHandle<crate::disk::Result<()>>>,

    pieces_written: usize,

    all_verified: bool,

    start_time: Option<Instant>,
}

impl Torrent {
    pub fn new(metainfo: MetaInfo, config: Config) -> Result<Self> {
        let info = StoreInfo::new(&metainfo, config.output_dir.clone());
        let piece_hashes = metainfo.piece_hashes();
        let pieces = Arc::new(PieceStore::new(&info, piece_hashes.clone()));

        // Allocation failure is fatal before we talk to anyone.
        let disk = Disk::allocate(info.clone(), piece_hashes)?;

        let (disk_tx, disk_rx) = mpsc::channel(DISK_QUEUE_LIMIT);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_LIMIT);
        let (torrent_tx, torrent_rx) = mpsc::channel(TORRENT_QUEUE_LIMIT);

        let ctx = Arc::new(TorrentContext {
            info_hash: metainfo.info_hash(),
            client_id: generate_peer_id(),
            info,
            pieces,
            disk_tx,
            events_tx,
            config,
            cancel: CancellationToken::new(),
        });

        let disk_handle = spawn_disk(Arc::new(disk), disk_rx, torrent_tx.clone());

        let trackers = metainfo
            .trackers()
            .into_iter()
            .map(|tier| {
                tier.into_iter()
                    .filter(|url| {
                        let supported = url.scheme() == "http" || url.scheme() == "https";
                        if !supported {
                            tracing::warn!("unsupported tracker scheme: {}", url.scheme());
                        }
                        supported
                    })
                    .map(TrackerClient::new)
                    .collect::<Vec<_>>()
            })
            .filter(|tier: &Vec<TrackerClient>| !tier.is_empty())
            .collect();

        Ok(Self {
            pool: PeerPool::new(Arc::clone(&ctx)),
            ctx,
            trackers,
            torrent_rx,
            torrent_tx,
            events_rx: Some(events_rx),
            disk_handle: Some(disk_handle),
            pieces_written: 0,
            all_verified: false,
            start_time: None,
        })
    }

    // Handle for external shutdown, e.g. on ctrl-c.
    pub fn cancel_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    #[tracing::instrument(skip(self), name = "torrent", fields(info_hash = %hex::encode(self.ctx.info_hash)))]
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(
            "starting: {} pieces, {} bytes",
            self.ctx.info.num_pieces,
            self.ctx.info.total_len,
        );
        self.start_time = Some(Instant::now());

        self.announce(Some(Event::Started)).await;

        let coordinator = Coordinator::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.pool),
            self.events_rx.take().expect("torrent already ran"),
            self.torrent_tx.clone(),
        );
        let coordinator_handle = tokio::spawn(coordinator.run());
        let sweep_handle = self.pool.spawn_sweep();

        let mut announce_ticker = time::interval(time::Duration::from_secs(60));
        // Swallow the interval's immediate tick, we just announced.
        announce_ticker.tick().await;

        let result = loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => {
                    self.announce(Some(Event::Stopped)).await;
                    break Ok(());
                }

                cmd = self.torrent_rx.recv() => match cmd {
                    Some(CommandToTorrent::PieceWritten { idx }) => {
                        self.pieces_written += 1;
                        self.pool.broadcast_have(idx);
                        tracing::info!(
                            "piece {} written, {}/{} on disk",
                            idx,
                            self.pieces_written,
                            self.ctx.info.num_pieces,
                        );
                        if self.is_done() {
                            self.complete().await;
                            break Ok(());
                        }
                    },

                    Some(CommandToTorrent::AllVerified) => {
                        self.all_verified = true;
                        if self.is_done() {
                            self.complete().await;
                            break Ok(());
                        }
                    },

                    Some(CommandToTorrent::DiskFailure(e)) => {
                        tracing::error!("aborting run: {}", e);
                        break Err(TorrentError::DiskFailure(e));
                    },

                    None => break Err(TorrentError::ChannelError("torrent channel closed".into())),
                },

                _ = announce_ticker.tick() => {
                    self.announce(None).await;
                }
            }
        };

        self.teardown().await;
        coordinator_handle.await.ok();
        sweep_handle.await.ok();
        result
    }

    fn is_done(&self) -> bool {
        self.all_verified && self.pieces_written == self.ctx.info.num_pieces as usize
    }

    async fn complete(&mut self) {
        let elapsed = self.start_time.map(|t| t.elapsed()).unwrap_or_default();
        tracing::info!("download complete in {:?}", elapsed);
        self.announce(Some(Event::Completed)).await;
    }

    // Walks the tracker tiers until one announce succeeds; new peer
    // addresses go straight to the pool.
    async fn announce(&mut self, event: Option<Event>) {
        let now = Instant::now();
        let (verified, total) = self.ctx.pieces.progress();
        let left = self
            .ctx
            .info
            .total_len
            .saturating_sub(verified as u64 * self.ctx.info.piece_len as u64);
        let need_peers = self.pool.len() < self.ctx.config.max_peers;

        let params = AnnounceParams {
            info_hash: self.ctx.info_hash,
            peer_id: self.ctx.client_id,
            port: self.ctx.config.port,
            uploaded: 0,
            downloaded: self.ctx.pieces.bytes_downloaded(),
            left: if verified == total { 0 } else { left },
            event,
            num_want: Some(self.ctx.config.max_peers),
        };

        for tier in self.trackers.iter_mut() {
            for tracker in tier.iter_mut() {
                let due = event.is_some()
                    || tracker.should_announce(now)
                    || (need_peers && tracker.can_announce(now));
                if !due {
                    continue;
                }

                match tracker.announce(params).await {
                    Ok(peers) => {
                        self.pool.connect(peers);
                        return;
                    }
                    // Retriable: the run keeps going on known peers.
                    Err(e) => tracing::warn!("tracker {} announce failed: {}", tracker.url, e),
                }
            }
        }
    }

    async fn teardown(&mut self) {
        self.ctx.cancel.cancel();
        self.pool.shutdown().await;

        // Nobody is draining our command queue any more; close it so a
        // disk task blocked on a write notification fails out instead
        // of deadlocking the shutdown.
        self.torrent_rx.close();
        self.ctx.disk_tx.send(DiskCommand::Shutdown).await.ok();
        if let Some(handle) = self.disk_handle.take() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("disk teardown error: {}", e),
                Err(e) => tracing::error!("disk task join error: {}", e),
            }
        }
    }
}

use std::{collections::HashMap, net::SocketAddr, sync::{Arc, Mutex}};
use tokio::task::JoinHandle;
use crate::{
    p2p::{PeerCommand, PeerHandle, PeerSession, PeerTx, SessionShared},
    torrent::TorrentContext,
};

// A session as seen from outside: its command pipeline plus the
// snapshot state it publishes.
#[derive(Debug, Clone)]
pub struct PeerRef {
    pub addr: SocketAddr,
    pub tx: PeerTx,
    pub shared: Arc<SessionShared>,
}

// Lifecycle of the peer sessions: dial, dedupe by address, cap by
// count, reap the dead. The registry lock is held only for
// insert/remove/snapshot.
#[derive(Debug)]
pub struct PeerPool {
    ctx: Arc<TorrentContext>,

    peers: Mutex<HashMap<SocketAddr, PeerHandle>>,
}

impl PeerPool {
    pub fn new(ctx: Arc<TorrentContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            peers: Mutex::new(HashMap::new()),
        })
    }

    // Dials new peers, skipping addresses we already have a session
    // with and respecting the configured cap.
    pub fn connect(&self, addrs: impl IntoIterator<Item = SocketAddr>) {
        let mut peers = self.peers.lock().unwrap();
        let mut dialed = 0;

        for addr in addrs {
            if peers.len() >= self.ctx.config.max_peers {
                tracing::debug!("peer cap reached, ignoring remaining addresses");
                break;
            }
            if peers.contains_key(&addr) {
                continue;
            }

            let (session, tx, shared) = PeerSession::new(addr, Arc::clone(&self.ctx));
            let task = tokio::spawn(async move {
                if let Err(e) = session.start().await {
                    tracing::debug!("peer {} session error: {}", addr, e);
                }
            });
            peers.insert(addr, PeerHandle { tx, shared, task });
            dialed += 1;
        }

        if dialed > 0 {
            tracing::info!("dialing {} new peers, {} total", dialed, peers.len());
        }
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<PeerRef> {
        self.peers.lock().unwrap().get(addr).map(|handle| PeerRef {
            addr: *addr,
            tx: handle.tx.clone(),
            shared: Arc::clone(&handle.shared),
        })
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // All live sessions.
    pub fn all(&self) -> Vec<PeerRef> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, handle)| handle.is_alive())
            .map(|(addr, handle)| PeerRef {
                addr: *addr,
                tx: handle.tx.clone(),
                shared: Arc::clone(&handle.shared),
            })
            .collect()
    }

    // Sessions we are allowed to pull blocks from.
    pub fn downloadable(&self) -> Vec<PeerRef> {
        self.all()
            .into_iter()
            .filter(|peer| peer.shared.state().can_download())
            .collect()
    }

    pub fn peers_with_piece(&self, idx: u32) -> Vec<PeerRef> {
        self.all()
            .into_iter()
            .filter(|peer| peer.shared.has_piece(idx))
            .collect()
    }

    // Advertise a freshly verified piece to the swarm.
    pub fn broadcast_have(&self, idx: u32) {
        for peer in self.all() {
            peer.tx.try_send(PeerCommand::Have(idx)).ok();
        }
    }

    pub fn remove(&self, addr: &SocketAddr) {
        if self.peers.lock().unwrap().remove(addr).is_some() {
            tracing::debug!("removed peer {}", addr);
        }
    }

    // Drops registry entries whose session task has ended.
    pub fn reap(&self) {
        let mut peers = self.peers.lock().unwrap();
        let before = peers.len();
        peers.retain(|_, handle| handle.is_alive());
        let reaped = before - peers.len();
        if reaped > 0 {
            tracing::debug!("reaped {} dead sessions, {} remain", reaped, peers.len());
        }
    }

    // Periodic sweep for dead connections.
    pub fn spawn_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.ctx.config.pool_cleanup_interval);
            loop {
                tokio::select! {
                    _ = pool.ctx.cancel.cancelled() => break,
                    _ = ticker.tick() => pool.reap(),
                }
            }
        })
    }

    // Asks every session to stop and waits for them to finish.
    pub async fn shutdown(&self) {
        let peers: Vec<(SocketAddr, PeerHandle)> =
            self.peers.lock().unwrap().drain().collect();
        tracing::info!("disconnecting from {} peers", peers.len());

        for (_, handle) in &peers {
            handle.tx.try_send(PeerCommand::Shutdown).ok();
        }
        for (addr, handle) in peers {
            if let Err(e) = handle.task.await {
                tracing::warn!("session {} join error: {}", addr, e);
            }
        }
    }
}

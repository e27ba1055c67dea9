//! Torrent is the coordinator of a download.
//!
//! A torrent manages multiple peers, peers send messages to the torrent
//! using [`TorrentMsg`], and the torrent sends messages to the peers using
//! [`PeerMsg`]. The torrent is the only owner of the [`Progress`], peers
//! never mutate it.

mod progress;
mod types;

// re-exports
pub use progress::*;
pub use types::*;

use std::{collections::VecDeque, net::SocketAddr, sync::Arc, time::Duration};

use hashbrown::{HashMap, HashSet};
use tokio::{
    net::{TcpListener, TcpStream},
    select, spawn,
    sync::{mpsc, oneshot},
    time::{interval, interval_at, sleep, timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    disk::DiskMsg,
    error::Error,
    metainfo::MetaInfo,
    peer::{self, Direction, Peer, PeerCtx, PeerId, PeerMsg},
    tcp_wire::Block,
    tracker::{AnnounceResponse, Event, Tracker, TrackerMsg},
    utils::{to_human_readable, to_percent},
};

/// How long the final announces may take before we stop waiting.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

pub trait TorrentState {}

/// The tracker was not contacted and no peer is connected.
pub struct Idle;

pub struct Connected {
    pub progress: Progress,

    /// Stats of the current Torrent, returned from tracker on announce
    /// requests.
    pub stats: Stats,

    /// Peers that completed the handshake.
    pub peers: HashMap<SocketAddr, Arc<PeerCtx>>,

    /// Peers that are not choking us.
    pub unchoked: HashSet<SocketAddr>,

    /// Peers to which we sent interested.
    pub interested: HashSet<SocketAddr>,

    /// Outbound peers being dialed or handshaked, and inbound peers being
    /// handshaked.
    pub connecting: HashSet<SocketAddr>,

    /// Idle peers returned from an announce request to the tracker.
    /// Will be removed from this queue as we connect with them.
    pub idle_peers: VecDeque<SocketAddr>,

    /// Every address that was ever queued, used to de-duplicate announces.
    pub known: HashSet<SocketAddr>,

    /// If at least one peer completed the handshake in this session.
    pub ever_handshaked: bool,

    pub tracker_tx: Option<mpsc::Sender<TrackerMsg>>,

    /// Address of the listener of inbound peers.
    pub listen_addr: Option<SocketAddr>,

    /// The downloaded bytes of the previous second, used to get the
    /// download rate.
    pub last_second_downloaded: u64,
}

impl TorrentState for Idle {}
impl TorrentState for Connected {}

/// This is the main entity responsible for the high-level management of
/// a torrent download.
pub struct Torrent<S: TorrentState> {
    pub ctx: Arc<TorrentCtx>,
    pub name: String,
    pub rx: mpsc::Receiver<TorrentMsg>,
    pub state: S,
}

impl Torrent<Idle> {
    #[tracing::instrument(skip_all, name = "torrent::new")]
    pub fn new(
        meta_info: MetaInfo,
        mut config: Config,
        disk_tx: mpsc::Sender<DiskMsg>,
    ) -> Self {
        config.sanitize();
        let (tx, rx) = mpsc::channel::<TorrentMsg>(100);

        let name = meta_info
            .info
            .name
            .clone()
            .unwrap_or_else(|| meta_info.info_hash.to_string());

        let ctx = Arc::new(TorrentCtx {
            tx,
            disk_tx,
            info_hash: meta_info.info_hash,
            local_peer_id: PeerId::generate(),
            meta_info,
            config,
        });

        Self { ctx, name, rx, state: Idle }
    }

    /// Start the Torrent, announcing [`Event::Started`] to the tracker of the
    /// torrent to get a list of peers. But it doesn't run the torrent event
    /// loop.
    ///
    /// Fails with [`Error::NoPeers`] if the tracker knows no peer.
    #[tracing::instrument(skip(self), name = "torrent::start")]
    pub async fn start(self) -> Result<Torrent<Connected>, Error> {
        let listener = Self::bind_listener(&self.ctx.config).await?;
        let port = listener.local_addr()?.port();

        let mut tracker = Tracker::new(
            &self.ctx.meta_info.announce,
            self.ctx.info_hash,
            self.ctx.local_peer_id,
            port,
        )
        .await?;

        let res = tracker
            .announce(Event::Started, 0, 0, self.ctx.meta_info.info.length)
            .await?;

        if res.peers.is_empty() {
            return Err(Error::NoPeers);
        }

        let tracker_tx = tracker.tx.clone();
        let torrent_tx = self.ctx.tx.clone();

        spawn(async move {
            if let Err(e) = tracker.run(torrent_tx).await {
                warn!("tracker stopped: {e}");
            }
        });

        Ok(self.connected(res, Some(listener), Some(tracker_tx)))
    }

    /// Start the Torrent with a known list of peers, without a tracker.
    ///
    /// When every peer is gone the download fails with
    /// [`Error::PeersExhausted`], there is no one to ask for more.
    pub fn start_with_peers(
        self,
        peers: Vec<SocketAddr>,
        listener: Option<TcpListener>,
    ) -> Torrent<Connected> {
        let res = AnnounceResponse { peers, ..Default::default() };
        self.connected(res, listener, None)
    }

    /// Probe the configured port range for a free port.
    pub async fn bind_listener(config: &Config) -> Result<TcpListener, Error> {
        let (start, end) = (config.port_range_start, config.port_range_end);

        for port in start..=end {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) => debug!("port {port} is not available: {e}"),
            }
        }

        Err(Error::NoListenPort(start, end))
    }

    fn connected(
        self,
        res: AnnounceResponse,
        listener: Option<TcpListener>,
        tracker_tx: Option<mpsc::Sender<TrackerMsg>>,
    ) -> Torrent<Connected> {
        let info = self.ctx.meta_info.info.clone();
        let config = &self.ctx.config;
        let progress =
            Progress::new(info, config.piece_strategy, config.max_peer_failures);

        let listen_addr = listener.as_ref().and_then(|l| l.local_addr().ok());

        if let Some(listener) = listener {
            Self::spawn_listener(listener, self.ctx.tx.clone());
        }

        let mut known = HashSet::new();
        let idle_peers: VecDeque<SocketAddr> =
            res.peers.into_iter().filter(|p| known.insert(*p)).collect();

        debug!("starting torrent {} with {} peers", self.name, idle_peers.len());

        Torrent {
            state: Connected {
                progress,
                stats: Stats {
                    interval: res.interval,
                    min_interval: res.min_interval,
                    seeders: res.seeders,
                    leechers: res.leechers,
                },
                peers: HashMap::new(),
                unchoked: HashSet::new(),
                interested: HashSet::new(),
                connecting: HashSet::new(),
                idle_peers,
                known,
                ever_handshaked: false,
                tracker_tx,
                listen_addr,
                last_second_downloaded: 0,
            },
            ctx: self.ctx,
            name: self.name,
            rx: self.rx,
        }
    }

    /// Accept connections from other peers and hand them to the torrent.
    fn spawn_listener(listener: TcpListener, tx: mpsc::Sender<TorrentMsg>) {
        spawn(async move {
            debug!("accepting requests in {:?}", listener.local_addr());

            loop {
                match listener.accept().await {
                    Ok((socket, addr)) => {
                        info!("received inbound connection from {addr}");
                        let msg = TorrentMsg::Inbound(socket, addr);
                        if tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("error accepting connection: {e}"),
                }
            }
        });
    }
}

impl Torrent<Connected> {
    /// Run the Torrent main event loop until the download completes.
    ///
    /// Errors with [`Error::NoReachablePeers`] if every peer failed before a
    /// single handshake, and with [`Error::PeersExhausted`] if there is no
    /// tracker and every peer is gone.
    #[tracing::instrument(skip_all, fields(name = %self.name))]
    pub async fn run(&mut self) -> Result<(), Error> {
        debug!("running torrent: {:?}", self.name);

        self.connect_idle_peers();

        // requests that got no block in time go back to the pool
        let mut timeout_interval = interval(Duration::from_secs(1));

        let mut progress_interval = interval(Duration::from_secs(1));

        let announce_period = self.state.stats.announce_period();
        let mut announce_interval =
            interval_at(Instant::now() + announce_period, announce_period);

        loop {
            select! {
                Some(msg) = self.rx.recv() => {
                    if let TorrentMsg::Quit = msg {
                        info!("quitting {}", self.name);
                        self.quit_peers();
                        self.flush_disk().await?;
                        self.announce_and_wait(Event::Stopped).await;
                        return Ok(());
                    }
                    self.handle_msg(msg).await?;
                }
                _ = timeout_interval.tick() => {
                    self.check_request_timeouts();
                }
                _ = progress_interval.tick() => {
                    self.log_progress();
                }
                // periodically announce to tracker, at the specified interval
                // to discover new peers
                _ = announce_interval.tick(), if self.state.tracker_tx.is_some() => {
                    self.announce(Event::None);
                }
            }

            if self.state.progress.is_complete() {
                return self.finish().await;
            }

            self.check_exhausted()?;
        }
    }

    async fn handle_msg(&mut self, msg: TorrentMsg) -> Result<(), Error> {
        match msg {
            TorrentMsg::PeerConnected(ctx) => {
                let addr = ctx.remote_addr;
                self.state.connecting.remove(&addr);

                if self.state.progress.is_banned(&addr)
                    || self.state.peers.contains_key(&addr)
                {
                    let _ = ctx.tx.try_send(PeerMsg::Quit);
                    return Ok(());
                }

                info!("connected with {addr}, id {}", ctx.id);
                self.state.ever_handshaked = true;
                self.state.peers.insert(addr, ctx);
            }
            TorrentMsg::PeerConnectingError(addr) => {
                debug!("could not connect to {addr}");
                self.state.connecting.remove(&addr);
                self.connect_idle_peers();
            }
            TorrentMsg::Bitfield(addr, pieces) => {
                self.state.progress.set_peer_pieces(addr, pieces);
                self.update_interest(addr);
            }
            TorrentMsg::Have(addr, piece) => {
                self.state.progress.peer_has(addr, piece);
                self.update_interest(addr);
            }
            TorrentMsg::Choked(addr) => {
                self.state.unchoked.remove(&addr);
                let released = self.state.progress.release_peer(&addr);
                if !released.is_empty() {
                    debug!(
                        "{addr} choked us with {} blocks in flight",
                        released.len()
                    );
                    self.request_all();
                }
            }
            TorrentMsg::Unchoked(addr) => {
                self.state.unchoked.insert(addr);
                self.request_blocks(addr);
            }
            TorrentMsg::Block(addr, block) => {
                self.handle_block(addr, block).await?;
            }
            TorrentMsg::RequestRejected(addr, block_info) => {
                if self.state.progress.release_block(&addr, &block_info) {
                    self.request_all();
                }
            }
            TorrentMsg::PeerDisconnected(addr, reason) => {
                debug!("{addr} disconnected: {reason:?}");
                self.remove_peer(&addr);
                self.state.connecting.remove(&addr);
                self.request_all();
                self.connect_idle_peers();
            }
            TorrentMsg::AddPeers(peers) => {
                let before = self.state.idle_peers.len();
                for peer in peers {
                    if !self.state.progress.is_banned(&peer)
                        && self.state.known.insert(peer)
                    {
                        self.state.idle_peers.push_back(peer);
                    }
                }
                debug!(
                    "tracker sent {} new peers",
                    self.state.idle_peers.len() - before
                );
                self.connect_idle_peers();
            }
            TorrentMsg::Inbound(socket, addr) => {
                if self.state.progress.is_banned(&addr)
                    || self.state.peers.contains_key(&addr)
                    || self.state.connecting.contains(&addr)
                    || self.is_full()
                {
                    debug!("dropping inbound connection of {addr}");
                    return Ok(());
                }
                self.state.connecting.insert(addr);
                Self::spawn_peer(self.ctx.clone(), addr, Some(socket));
            }
            TorrentMsg::Quit => {}
        }

        Ok(())
    }

    /// Store a received block, and act on the piece if it is complete.
    async fn handle_block(
        &mut self,
        addr: SocketAddr,
        block: Block,
    ) -> Result<(), Error> {
        match self.state.progress.receive_block(addr, block) {
            BlockOutcome::Ignored => {}
            BlockOutcome::Stored => {
                self.request_blocks(addr);
            }
            BlockOutcome::PieceVerified { index, data } => {
                self.ctx.disk_tx.send(DiskMsg::WritePiece { index, data }).await?;

                // tell every peer that we have this piece now
                for peer in self.state.peers.values() {
                    let _ = peer.tx.try_send(PeerMsg::Have(index));
                }

                let addrs: Vec<SocketAddr> =
                    self.state.peers.keys().copied().collect();
                for peer in addrs {
                    self.update_interest(peer);
                }

                self.request_blocks(addr);
            }
            BlockOutcome::HashMismatch { index, banned } => {
                warn!("piece {index} is corrupted, requesting it again");
                for peer in banned {
                    if let Some(ctx) = self.state.peers.get(&peer) {
                        let _ = ctx.tx.try_send(PeerMsg::Quit);
                    }
                    self.remove_peer(&peer);
                }
                self.request_all();
            }
        }

        Ok(())
    }

    fn remove_peer(&mut self, addr: &SocketAddr) {
        self.state.peers.remove(addr);
        self.state.unchoked.remove(addr);
        self.state.interested.remove(addr);
        let released = self.state.progress.remove_peer(addr);
        if !released.is_empty() {
            debug!("{addr} released {} blocks", released.len());
        }
    }

    /// Send interested, or not interested, to a peer depending on the pieces
    /// that it has.
    fn update_interest(&mut self, addr: SocketAddr) {
        let Some(ctx) = self.state.peers.get(&addr) else { return };
        let interesting = self.state.progress.is_interesting(&addr);
        let interested = self.state.interested.contains(&addr);

        if interesting && !interested {
            if ctx.tx.try_send(PeerMsg::Interested).is_ok() {
                self.state.interested.insert(addr);
            }
        } else if !interesting
            && interested
            && ctx.tx.try_send(PeerMsg::NotInterested).is_ok()
        {
            // sorry, you're not the problem, it's me.
            self.state.interested.remove(&addr);
        }
    }

    /// Fill the request pipeline of an unchoked peer.
    fn request_blocks(&mut self, addr: SocketAddr) {
        if !self.state.unchoked.contains(&addr) {
            return;
        }
        let Some(ctx) = self.state.peers.get(&addr).cloned() else { return };

        let max = self.ctx.config.max_pending_requests;
        let blocks = self.state.progress.next_blocks(addr, max, Instant::now());

        for (i, block_info) in blocks.iter().enumerate() {
            if ctx.tx.try_send(PeerMsg::Request(*block_info)).is_err() {
                // the peer is busy or gone, it gets nothing this round
                for b in &blocks[i..] {
                    self.state.progress.release_block(&addr, b);
                }
                break;
            }
        }
    }

    /// Fill the request pipeline of every unchoked peer.
    fn request_all(&mut self) {
        let unchoked: Vec<SocketAddr> =
            self.state.unchoked.iter().copied().collect();
        for addr in unchoked {
            self.request_blocks(addr);
        }
    }

    fn check_request_timeouts(&mut self) {
        let timed_out = self
            .state
            .progress
            .take_timed_out(Instant::now(), self.ctx.config.request_timeout());

        if timed_out.is_empty() {
            return;
        }

        for (addr, block_info) in &timed_out {
            debug!("{addr} request timed out {block_info:?}");
            if let Some(ctx) = self.state.peers.get(addr) {
                let _ = ctx.tx.try_send(PeerMsg::Cancel(*block_info));
            }
        }

        self.request_all();
    }

    fn is_full(&self) -> bool {
        self.state.peers.len() + self.state.connecting.len()
            >= self.ctx.config.max_peers
    }

    /// Dial idle peers until the peer limit is reached.
    fn connect_idle_peers(&mut self) {
        while !self.is_full() {
            let Some(addr) = self.state.idle_peers.pop_front() else { break };

            if self.state.progress.is_banned(&addr)
                || self.state.peers.contains_key(&addr)
            {
                continue;
            }

            self.state.connecting.insert(addr);
            Self::spawn_peer(self.ctx.clone(), addr, None);
        }
    }

    /// Spawn the task of a peer. Outbound peers are dialed first, inbound
    /// peers come with their socket.
    fn spawn_peer(
        ctx: Arc<TorrentCtx>,
        addr: SocketAddr,
        socket: Option<TcpStream>,
    ) {
        spawn(async move {
            let (socket, direction) = match socket {
                Some(socket) => (socket, Direction::Inbound),
                None => match Self::connect(addr, &ctx.config).await {
                    Ok(socket) => (socket, Direction::Outbound),
                    Err(e) => {
                        debug!("error with peer {addr}: {e}");
                        let msg = TorrentMsg::PeerConnectingError(addr);
                        let _ = ctx.tx.send(msg).await;
                        return Err(e);
                    }
                },
            };

            Self::start_and_run_peer(ctx, addr, socket, direction).await
        });
    }

    /// Dial a peer, retrying with exponential backoff.
    pub async fn connect(
        addr: SocketAddr,
        config: &Config,
    ) -> Result<TcpStream, Error> {
        for attempt in 0..config.connect_attempts {
            if attempt > 0 {
                sleep(Duration::from_millis(500 * 2_u64.pow(attempt - 1))).await;
            }

            match timeout(config.connect_timeout(), TcpStream::connect(addr)).await {
                Ok(Ok(socket)) => return Ok(socket),
                Ok(Err(e)) => debug!("{addr} connect attempt {attempt}: {e}"),
                Err(_) => debug!("{addr} connect attempt {attempt} timed out"),
            }
        }

        Err(Error::ConnectTimeout(addr))
    }

    #[tracing::instrument(skip(ctx, socket), name = "torrent::start_and_run_peer")]
    async fn start_and_run_peer(
        ctx: Arc<TorrentCtx>,
        addr: SocketAddr,
        socket: TcpStream,
        direction: Direction,
    ) -> Result<(), Error> {
        let torrent_tx = ctx.tx.clone();
        let idle_peer = Peer::<peer::Idle>::new(direction, ctx);

        match idle_peer.handshake(socket).await {
            Err(r) => {
                debug!("failed to handshake peer {addr}: {r}");
                let _ = torrent_tx.send(TorrentMsg::PeerConnectingError(addr)).await;
                Err(r)
            }
            Ok(connected_peer) => connected_peer.run().await,
        }
    }

    /// Fail the download if no peer is left and no more will come.
    fn check_exhausted(&self) -> Result<(), Error> {
        let s = &self.state;
        if !s.peers.is_empty()
            || !s.connecting.is_empty()
            || !s.idle_peers.is_empty()
        {
            return Ok(());
        }
        if !s.ever_handshaked {
            return Err(Error::NoReachablePeers);
        }
        if s.tracker_tx.is_none() {
            return Err(Error::PeersExhausted);
        }
        Ok(())
    }

    /// Periodic announce, the tracker sends the new peers back as
    /// [`TorrentMsg::AddPeers`].
    fn announce(&self, event: Event) {
        let Some(tracker_tx) = &self.state.tracker_tx else { return };
        debug!("sending periodic announce");

        let _ = tracker_tx.try_send(TrackerMsg::Announce {
            event,
            downloaded: self.state.progress.downloaded(),
            uploaded: 0,
            left: self.state.progress.left(),
            recipient: None,
        });
    }

    /// Announce and wait for the response, for a bounded time.
    async fn announce_and_wait(&self, event: Event) {
        let Some(tracker_tx) = &self.state.tracker_tx else { return };

        let (otx, orx) = oneshot::channel();
        let msg = TrackerMsg::Announce {
            event,
            downloaded: self.state.progress.downloaded(),
            uploaded: 0,
            left: self.state.progress.left(),
            recipient: Some(otx),
        };

        if tracker_tx.send(msg).await.is_err() {
            return;
        }

        match timeout(ANNOUNCE_TIMEOUT, orx).await {
            Ok(Ok(Ok(_))) => debug!("announced {event:?}"),
            Ok(Ok(Err(e))) => warn!("announce {event:?} failed: {e}"),
            _ => warn!("announce {event:?} got no response"),
        }
    }

    fn quit_peers(&mut self) {
        for peer in self.state.peers.values() {
            let _ = peer.tx.try_send(PeerMsg::Quit);
        }
        self.state.peers.clear();
        self.state.unchoked.clear();
    }

    /// Every piece is verified: close the peers, wait for the disk to flush
    /// and tell the tracker.
    async fn finish(&mut self) -> Result<(), Error> {
        info!(
            "downloaded {} ({})",
            self.name,
            to_human_readable(self.state.progress.downloaded())
        );

        self.quit_peers();
        self.flush_disk().await?;

        self.announce_and_wait(Event::Completed).await;
        self.announce_and_wait(Event::Stopped).await;

        Ok(())
    }

    /// Stop the disk and wait until every piece is on disk.
    async fn flush_disk(&self) -> Result<(), Error> {
        let (otx, orx) = oneshot::channel();
        self.ctx.disk_tx.send(DiskMsg::Quit(otx)).await?;
        orx.await?;
        Ok(())
    }

    fn log_progress(&mut self) {
        let progress = &self.state.progress;
        let downloaded = progress.downloaded();
        let rate = downloaded.saturating_sub(self.state.last_second_downloaded);
        self.state.last_second_downloaded = downloaded;

        info!(
            "{}: {} {}/{} pieces, {} of {} ({}/s), {} peers, {} connecting",
            self.name,
            to_percent(downloaded, self.ctx.meta_info.info.length),
            progress.have().count_ones(),
            progress.have().len(),
            to_human_readable(downloaded),
            to_human_readable(self.ctx.meta_info.info.length),
            to_human_readable(rate),
            self.state.peers.len(),
            self.state.connecting.len(),
        );
    }
}

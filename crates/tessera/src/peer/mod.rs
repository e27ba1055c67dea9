//! A remote peer in the network that we download data from.
//!
//! Each peer is an actor with its own task. It owns the socket, talks the
//! wire protocol and reports events to the torrent, which is the only owner
//! of the download state.
pub mod session;
mod types;

// re-exports
pub use types::*;

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    select,
    sync::mpsc,
    time::{interval_at, sleep, timeout, Instant},
};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    error::Error,
    peer::session::{ConnectionState, Session},
    tcp_wire::{Block, BlockInfo, Core, CoreCodec, Handshake, HandshakeCodec},
    torrent::{TorrentCtx, TorrentMsg},
};

/// Data about a remote Peer that the client is connected to,
/// but the client itself does not have a Peer struct.
pub struct Peer<S: PeerState> {
    pub state: S,
}

impl Peer<Idle> {
    pub fn new(direction: Direction, torrent_ctx: Arc<TorrentCtx>) -> Self {
        Self { state: Idle { direction, torrent_ctx } }
    }

    /// Exchange handshakes with the remote and switch the socket to the core
    /// codec.
    ///
    /// If we initiated the connection our handshake is sent first, otherwise
    /// we wait for theirs. The whole exchange is bounded by the configured
    /// handshake timeout.
    #[tracing::instrument(skip_all, fields(direction = ?self.state.direction))]
    pub async fn handshake(
        self,
        socket: TcpStream,
    ) -> Result<Peer<Connected>, Error> {
        let Idle { direction, torrent_ctx } = self.state;
        let local = socket.local_addr()?;
        let remote = socket.peer_addr()?;

        let mut session = Session::default();
        session.advance(ConnectionState::Handshaking);

        let our_handshake =
            Handshake::new(torrent_ctx.info_hash, torrent_ctx.local_peer_id);

        let mut socket = Framed::new(socket, HandshakeCodec);

        let exchange = async {
            // if we are connecting, send the first handshake
            if direction == Direction::Outbound {
                debug!("{local} sending the first handshake to {remote}");
                socket.send(our_handshake.clone()).await?;
            }

            // wait for, and validate, their handshake
            let their_handshake = match socket.next().await {
                Some(Ok(h)) => h,
                Some(Err(e)) => return Err(e),
                None => {
                    warn!("{remote} did not send a handshake");
                    return Err(Error::PeerClosedSocket);
                }
            };
            debug!("{local} received their handshake {remote}");

            our_handshake.validate(&their_handshake)?;

            // if inbound, we have already received their first handshake,
            // send our second handshake here.
            if direction == Direction::Inbound {
                debug!("{local} sending the second handshake to {remote}");
                socket.send(our_handshake.clone()).await?;
            }

            Ok::<_, Error>(their_handshake)
        };

        let their_handshake =
            timeout(torrent_ctx.config.handshake_timeout(), exchange)
                .await
                .map_err(|_| Error::HandshakeTimeout)??;

        session.advance(ConnectionState::Verified);

        // the remote may have sent core messages right after its handshake,
        // they are in the read buffer and must survive the codec switch.
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, CoreCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::channel::<PeerMsg>(300);

        let ctx = Arc::new(PeerCtx {
            tx,
            direction,
            id: their_handshake.peer_id,
            remote_addr: remote,
            local_addr: local,
        });

        let pieces = Bitfield::from_piece(torrent_ctx.meta_info.info.pieces());

        info!("{remote} handshake completed, peer id {}", ctx.id);

        Ok(Peer {
            state: Connected {
                stream,
                sink,
                rx,
                ctx,
                torrent_ctx,
                session,
                pieces,
                outgoing_requests: Vec::new(),
            },
        })
    }
}

impl Peer<Connected> {
    /// Run the event loop of the peer until it quits or fails, and then
    /// report [`TorrentMsg::PeerDisconnected`] to the torrent.
    #[tracing::instrument(skip_all, fields(remote = %self.state.ctx.remote_addr))]
    pub async fn run(mut self) -> Result<(), Error> {
        let r = self.event_loop().await;

        self.state.session.advance(ConnectionState::Closed);

        let reason = match &r {
            Ok(()) => DisconnectReason::Shutdown,
            Err(e) => DisconnectReason::from(e),
        };

        let ctx = &self.state.ctx;
        let session = &self.state.session;
        let now = Instant::now();
        let remote = ctx.remote_addr;

        info!(
            "{remote} disconnected: {reason:?}. {:?} from {}, connected for \
             {:?}, {} blocks received, last message {:?} ago",
            ctx.direction,
            ctx.local_addr,
            session.connected_for(now),
            session.downloaded_blocks,
            session.silent_for(now),
        );

        let _ = self
            .state
            .torrent_ctx
            .tx
            .send(TorrentMsg::PeerDisconnected(remote, reason))
            .await;

        r
    }

    /// Listen to messages sent by the remote on the peer wire protocol, and
    /// to the commands of the torrent.
    async fn event_loop(&mut self) -> Result<(), Error> {
        self.state.session.advance(ConnectionState::Active);

        self.state
            .torrent_ctx
            .tx
            .send(TorrentMsg::PeerConnected(self.state.ctx.clone()))
            .await?;

        let config = &self.state.torrent_ctx.config;
        let keep_alive = config.keep_alive();
        let idle_timeout = config.idle_timeout();
        let idle_secs = config.idle_timeout_secs;

        // send message to keep the connection alive
        let mut keep_alive_interval =
            interval_at(Instant::now() + keep_alive, keep_alive);

        // close the connection if the remote goes silent
        let idle = sleep(idle_timeout);
        tokio::pin!(idle);

        loop {
            select! {
                msg = self.state.stream.next() => {
                    let msg = match msg {
                        Some(msg) => msg?,
                        None => return Err(Error::PeerClosedSocket),
                    };

                    let now = Instant::now();
                    self.state.session.last_message_time = Some(now);
                    idle.as_mut().reset(now + idle_timeout);

                    self.handle_msg(msg).await?;
                }
                Some(msg) = self.state.rx.recv() => {
                    if let PeerMsg::Quit = msg {
                        debug!("{} quit", self.state.ctx.remote_addr);
                        return Ok(());
                    }
                    self.handle_cmd(msg).await?;
                }
                _ = keep_alive_interval.tick() => {
                    self.state.sink.send(Core::KeepAlive).await?;
                }
                _ = &mut idle => {
                    warn!("{} idle for {idle_secs}s", self.state.ctx.remote_addr);
                    return Err(Error::IdleTimeout(idle_secs));
                }
            }
        }
    }

    /// Handle a core message sent by the remote.
    async fn handle_msg(&mut self, msg: Core) -> Result<(), Error> {
        let remote = self.state.ctx.remote_addr;
        let tx = self.state.torrent_ctx.tx.clone();

        match msg {
            Core::KeepAlive => {
                debug!("{remote} keepalive");
            }
            Core::Choke => {
                debug!("{remote} choked us");
                self.state.session.state.peer_choking = true;
                // the remote drops our pending requests when choking us
                self.state.outgoing_requests.clear();
                tx.send(TorrentMsg::Choked(remote)).await?;
            }
            Core::Unchoke => {
                debug!("{remote} unchoked us");
                self.state.session.state.peer_choking = false;
                tx.send(TorrentMsg::Unchoked(remote)).await?;
            }
            Core::Interested => {
                debug!("{remote} is interested");
                self.state.session.state.peer_interested = true;
            }
            Core::NotInterested => {
                debug!("{remote} is not interested");
                self.state.session.state.peer_interested = false;
            }
            Core::Have(piece) => {
                if piece >= self.state.pieces.len() {
                    return Err(Error::ProtocolViolation(format!(
                        "have for piece {piece} out of range"
                    )));
                }
                debug!("{remote} has piece {piece}");
                self.state.pieces.set(piece, true);
                tx.send(TorrentMsg::Have(remote, piece)).await?;
            }
            Core::Bitfield(raw) => {
                let len = self.state.pieces.len();
                let Some(pieces) = Bitfield::from_wire(raw.as_raw_slice(), len)
                else {
                    return Err(Error::ProtocolViolation(format!(
                        "bitfield of {} bytes for {len} pieces",
                        raw.as_raw_slice().len(),
                    )));
                };
                debug!("{remote} bitfield with {} pieces", pieces.count_ones());
                self.state.pieces = pieces.clone();
                tx.send(TorrentMsg::Bitfield(remote, pieces)).await?;
            }
            Core::Piece(block) => {
                self.handle_piece_msg(block).await?;
            }
            Core::Request(block_info) | Core::Cancel(block_info) => {
                // we do not seed, requests of the remote are dropped
                debug!("{remote} ignoring upload message for {block_info:?}");
            }
        }

        Ok(())
    }

    /// Handle a new Piece msg from the peer, a Piece msg actually sends
    /// a block, and not a piece.
    async fn handle_piece_msg(&mut self, block: Block) -> Result<(), Error> {
        let remote = self.state.ctx.remote_addr;
        let block_info = block.info();

        let Some(pos) =
            self.state.outgoing_requests.iter().position(|v| *v == block_info)
        else {
            debug!("{remote} sent a block we did not ask for {block_info:?}");
            return Ok(());
        };

        // remove pending block request
        self.state.outgoing_requests.swap_remove(pos);
        self.state.session.downloaded_blocks += 1;

        self.state
            .torrent_ctx
            .tx
            .send(TorrentMsg::Block(remote, block))
            .await?;

        Ok(())
    }

    /// Handle a command of the torrent.
    async fn handle_cmd(&mut self, msg: PeerMsg) -> Result<(), Error> {
        let remote = self.state.ctx.remote_addr;

        match msg {
            PeerMsg::Interested => {
                if !self.state.session.state.am_interested {
                    debug!("{remote} sending interested");
                    self.state.session.state.am_interested = true;
                    self.state.sink.send(Core::Interested).await?;
                }
            }
            PeerMsg::NotInterested => {
                if self.state.session.state.am_interested {
                    debug!("{remote} sending not interested");
                    self.state.session.state.am_interested = false;
                    self.state.sink.send(Core::NotInterested).await?;
                }
            }
            PeerMsg::Request(block_info) => {
                match self.request(block_info) {
                    Ok(()) => {
                        self.state.sink.send(Core::Request(block_info)).await?;
                    }
                    Err(Error::RequestWhileChoked(block_info)) => {
                        debug!("{remote} choked, rejecting {block_info:?}");
                        self.state
                            .torrent_ctx
                            .tx
                            .send(TorrentMsg::RequestRejected(remote, block_info))
                            .await?;
                    }
                    Err(e) => return Err(e),
                }
            }
            PeerMsg::Cancel(block_info) => {
                let before = self.state.outgoing_requests.len();
                self.state.outgoing_requests.retain(|v| *v != block_info);

                if before != self.state.outgoing_requests.len() {
                    debug!("{remote} sending cancel {block_info:?}");
                    self.state.sink.send(Core::Cancel(block_info)).await?;
                }
            }
            PeerMsg::Have(piece) => {
                // send Have to this peer if it doesnt have this piece
                if !self.state.pieces.has(piece) {
                    debug!("{remote} sending have {piece}");
                    self.state.sink.send(Core::Have(piece)).await?;
                }
            }
            PeerMsg::Quit => {}
        }

        Ok(())
    }

    /// Register an outgoing request.
    ///
    /// Fails synchronously if the peer is choking us, requests can only be
    /// outstanding while unchoked.
    pub fn request(&mut self, block_info: BlockInfo) -> Result<(), Error> {
        if !self.state.session.can_request() {
            return Err(Error::RequestWhileChoked(block_info));
        }
        if !self.state.outgoing_requests.contains(&block_info) {
            self.state.outgoing_requests.push(block_info);
        }
        Ok(())
    }
}

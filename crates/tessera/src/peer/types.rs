use std::{
    fmt::Display,
    net::SocketAddr,
    sync::Arc,
};

use futures::stream::{SplitSink, SplitStream};
use rand::{distributions::Alphanumeric, Rng};
use speedy::{Readable, Writable};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_util::codec::Framed;

use super::session::Session;
use crate::{
    bitfield::Bitfield,
    error::Error,
    tcp_wire::{BlockInfo, Core, CoreCodec},
    torrent::TorrentCtx,
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Azureus-style id, client "TS" version 0001 and 12 random characters.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(b"-TS0001-");

        let mut rng = rand::thread_rng();
        for b in &mut id[8..] {
            *b = rng.sample(Alphanumeric);
        }

        Self(id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s)
    }
}

impl From<PeerId> for [u8; 20] {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

/// Commands sent by the torrent to one peer.
#[derive(Debug)]
pub enum PeerMsg {
    /// Tell this peer that we are interested.
    Interested,

    /// Tell this peer that we are not interested.
    NotInterested,

    /// Request a block. Rejected with
    /// [`crate::torrent::TorrentMsg::RequestRejected`] if the peer is choking
    /// us when the command is handled.
    Request(BlockInfo),

    /// Cancel a block that was requested before.
    Cancel(BlockInfo),

    /// We verified a piece, tell the peer if it doesn't have it.
    Have(usize),

    /// Close the connection.
    Quit,
}

/// Why a peer connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// We asked the peer to quit.
    Shutdown,
    /// The remote closed the socket.
    RemoteClosed,
    /// The remote sent nothing for too long.
    IdleTimeout,
    /// The remote broke the wire protocol.
    ProtocolViolation(String),
    /// Any other error, such as an IO error.
    Error(String),
}

impl From<&Error> for DisconnectReason {
    fn from(value: &Error) -> Self {
        match value {
            Error::PeerClosedSocket => Self::RemoteClosed,
            Error::IdleTimeout(_) => Self::IdleTimeout,
            Error::ProtocolViolation(v) => Self::ProtocolViolation(v.clone()),
            e => Self::Error(e.to_string()),
        }
    }
}

/// Determines who initiated the connection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Direction {
    /// Outbound means we initiated the connection
    Outbound,
    /// Inbound means the peer initiated the connection
    Inbound,
}

/// Context of a connected peer, shared with the torrent.
#[derive(Debug)]
pub struct PeerCtx {
    pub tx: mpsc::Sender<PeerMsg>,
    pub direction: Direction,

    /// Id the remote sent in its handshake.
    pub id: PeerId,

    /// Remote addr of this peer.
    pub remote_addr: SocketAddr,

    /// Our local addr for this peer.
    pub local_addr: SocketAddr,
}

pub trait PeerState {}

/// A peer that did not handshake yet.
pub struct Idle {
    pub direction: Direction,
    pub torrent_ctx: Arc<TorrentCtx>,
}

/// A peer that handshaked and exchanges core messages.
pub struct Connected {
    pub stream: SplitStream<Framed<TcpStream, CoreCodec>>,
    pub sink: SplitSink<Framed<TcpStream, CoreCodec>, Core>,
    pub rx: mpsc::Receiver<PeerMsg>,

    /// Context of the Peer which is shared for anyone who needs it.
    pub ctx: Arc<PeerCtx>,
    pub torrent_ctx: Arc<TorrentCtx>,

    pub session: Session,

    /// Pieces that the remote peer has.
    pub pieces: Bitfield,

    /// Our pending requests that we sent to peer. It represents the blocks
    /// that we are expecting.
    ///
    /// If we receive a block whose request entry is here, that entry is
    /// removed. The list is cleared when the peer chokes us.
    pub outgoing_requests: Vec<BlockInfo>,
}

impl PeerState for Idle {}
impl PeerState for Connected {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_peer_id() {
        let a = PeerId::generate();
        let b = PeerId::generate();

        assert_eq!(&a.0[..8], b"-TS0001-");
        assert!(a.0[8..].iter().all(|b| b.is_ascii_alphanumeric()));
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 40);
    }
}

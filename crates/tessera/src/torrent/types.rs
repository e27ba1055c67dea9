use std::{net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{net::TcpStream, sync::mpsc};

use crate::{
    bitfield::Bitfield,
    config::Config,
    disk::DiskMsg,
    metainfo::{InfoHash, MetaInfo},
    peer::{DisconnectReason, PeerCtx, PeerId},
    tcp_wire::{Block, BlockInfo},
};

/// Messages sent to the torrent, by its peers, its tracker and the listener
/// of inbound connections.
///
/// Messages of a single peer are handled in the order the peer sent them.
#[derive(Debug)]
pub enum TorrentMsg {
    /// A peer completed the handshake.
    PeerConnected(Arc<PeerCtx>),

    /// When we can't do a TCP connection with the ip of the Peer, or the
    /// handshake failed.
    PeerConnectingError(SocketAddr),

    /// The validated bitfield of a peer.
    Bitfield(SocketAddr, Bitfield),

    /// A peer has a new piece.
    Have(SocketAddr, usize),

    Choked(SocketAddr),
    Unchoked(SocketAddr),

    /// A block that we requested.
    Block(SocketAddr, Block),

    /// The peer was choking us when the request command arrived, the
    /// request was not sent.
    RequestRejected(SocketAddr, BlockInfo),

    PeerDisconnected(SocketAddr, DisconnectReason),

    /// Peers discovered by a periodic announce.
    AddPeers(Vec<SocketAddr>),

    /// A remote opened a connection with us.
    Inbound(TcpStream, SocketAddr),

    /// Stop the download, closing every peer.
    Quit,
}

/// Context of [`super::Torrent`] that can be shared between other types
#[derive(Debug)]
pub struct TorrentCtx {
    pub tx: mpsc::Sender<TorrentMsg>,
    pub disk_tx: mpsc::Sender<DiskMsg>,
    pub info_hash: InfoHash,
    pub local_peer_id: PeerId,
    pub meta_info: MetaInfo,
    pub config: Config,
}

/// Lower bound of the re-announce period when the tracker sends no
/// `min interval`.
pub const MIN_ANNOUNCE_INTERVAL: u32 = 60;

/// Status of the current Torrent, from the first announce request.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Stats {
    pub interval: u32,
    pub min_interval: Option<u32>,
    pub leechers: u32,
    pub seeders: u32,
}

impl Stats {
    /// Period of the re-announces: the interval of the tracker, but never
    /// shorter than its `min interval`.
    pub fn announce_period(&self) -> Duration {
        let floor = self.min_interval.unwrap_or(MIN_ANNOUNCE_INTERVAL).max(1);
        Duration::from_secs(self.interval.max(floor) as u64)
    }
}

/// The algorithm that determines the order in which pieces are requested.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PieceStrategy {
    /// Ascending piece index, deterministic.
    #[default]
    Sequential,
    /// Pieces held by the fewest known peers first, ties by index.
    Rarest,
}

impl FromStr for PieceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "rarest" => Ok(Self::Rarest),
            _ => Err(format!(
                "unknown piece strategy `{s}`, use sequential or rarest"
            )),
        }
    }
}

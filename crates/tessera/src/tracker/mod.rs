//! A tracker is a server that manages peers and stats of multiple torrents.
//!
//! The torrent announces itself to get a list of peers, and keeps
//! announcing at the interval asked by the tracker to discover more.
pub mod http;
pub mod udp;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use hashbrown::HashSet;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use self::{http::HttpTracker, udp::UdpTracker};
use crate::{
    bencode::Value,
    error::Error,
    metainfo::InfoHash,
    peer::PeerId,
    torrent::TorrentMsg,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Event {
    None = 0,
    Completed = 1,
    #[default]
    Started = 2,
    Stopped = 3,
}

impl Event {
    /// Value of the `event` query parameter, empty for [`Event::None`].
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::None => "",
            Event::Completed => "completed",
            Event::Started => "started",
            Event::Stopped => "stopped",
        }
    }
}

/// Everything the tracker needs to know about us.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    /// Port of our listener.
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Seconds to wait before the next announce.
    pub interval: u32,
    /// Seconds the tracker wants at least between two announces.
    pub min_interval: Option<u32>,
    pub seeders: u32,
    pub leechers: u32,
    /// Unique peers, in the order the tracker sent them.
    pub peers: Vec<SocketAddr>,
}

/// The protocol spoken with the tracker, picked from the announce url.
#[derive(Debug)]
pub enum Client {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl Client {
    pub async fn from_url(url: &str) -> Result<Self, Error> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Ok(Self::Http(HttpTracker::new(url)?))
        } else if url.starts_with("udp://") {
            Ok(Self::Udp(UdpTracker::connect_to(url).await?))
        } else {
            Err(Error::TrackerUnsupported(url.to_owned()))
        }
    }

    pub async fn announce(
        &self,
        req: &AnnounceRequest,
    ) -> Result<AnnounceResponse, Error> {
        match self {
            Client::Http(t) => t.announce(req).await,
            Client::Udp(t) => t.announce(req).await,
        }
    }
}

#[derive(Debug)]
pub enum TrackerMsg {
    /// Announce to the tracker. If `recipient` is None, the peers of the
    /// response are sent to the torrent as [`TorrentMsg::AddPeers`].
    Announce {
        event: Event,
        downloaded: u64,
        uploaded: u64,
        left: u64,
        recipient: Option<oneshot::Sender<Result<AnnounceResponse, Error>>>,
    },
}

/// The tracker actor of a torrent.
#[derive(Debug)]
pub struct Tracker {
    pub tx: mpsc::Sender<TrackerMsg>,
    rx: mpsc::Receiver<TrackerMsg>,
    client: Client,
    url: String,
    info_hash: InfoHash,
    peer_id: PeerId,
    port: u16,
}

impl Tracker {
    /// Resolve the tracker of `url`, nothing is sent yet.
    pub async fn new(
        url: &str,
        info_hash: InfoHash,
        peer_id: PeerId,
        port: u16,
    ) -> Result<Self, Error> {
        let client = Client::from_url(url).await?;
        let (tx, rx) = mpsc::channel::<TrackerMsg>(100);

        Ok(Self {
            tx,
            rx,
            client,
            url: url.to_owned(),
            info_hash,
            peer_id,
            port,
        })
    }

    pub async fn announce(
        &self,
        event: Event,
        downloaded: u64,
        uploaded: u64,
        left: u64,
    ) -> Result<AnnounceResponse, Error> {
        debug!("announcing {event:?} to {}", self.url);

        let req = AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded,
            downloaded,
            left,
            event,
        };

        let res = self.client.announce(&req).await?;

        info!(
            "tracker {} sent {} peers, {} seeders, {} leechers, interval {}s",
            self.url,
            res.peers.len(),
            res.seeders,
            res.leechers,
            res.interval
        );

        Ok(res)
    }

    #[tracing::instrument(name = "tracker", skip_all, fields(url = %self.url))]
    pub async fn run(
        &mut self,
        torrent_tx: mpsc::Sender<TorrentMsg>,
    ) -> Result<(), Error> {
        debug!("running tracker");

        while let Some(msg) = self.rx.recv().await {
            match msg {
                TrackerMsg::Announce {
                    event,
                    downloaded,
                    uploaded,
                    left,
                    recipient,
                } => {
                    let res =
                        self.announce(event, downloaded, uploaded, left).await;

                    match (recipient, res) {
                        (Some(recipient), res) => {
                            let _ = recipient.send(res);
                        }
                        (None, Ok(res)) => {
                            // never block on the torrent, it may be
                            // waiting on us.
                            if torrent_tx
                                .try_send(TorrentMsg::AddPeers(res.peers))
                                .is_err()
                            {
                                debug!("torrent busy, dropping announced peers");
                            }
                        }
                        (None, Err(e)) => {
                            warn!("announce failed: {e}");
                        }
                    }

                    if event == Event::Stopped {
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }
}

/// Peers of an announce response, either the compact form or a list of
/// dictionaries. Duplicated addresses are dropped.
pub fn parse_peers(value: &Value) -> Result<Vec<SocketAddr>, Error> {
    let peers = match value {
        Value::Bytes(buf) => parse_compact_peer_list(buf, false)?,
        Value::List(list) => list
            .iter()
            .filter_map(|peer| {
                let dict = peer.as_dict()?;
                let ip: IpAddr = dict.get(b"ip")?.as_str()?.parse().ok()?;
                let port: u16 = dict.get(b"port")?.as_integer()?.try_into().ok()?;
                Some(SocketAddr::new(ip, port))
            })
            .collect(),
        _ => return Err(Error::TrackerCompactPeerList),
    };

    Ok(dedup(peers))
}

/// Support for BEP23. IPv4 peers are 4 bytes of address and 2 of port,
/// IPv6 peers are 16 and 2.
pub fn parse_compact_peer_list(
    buf: &[u8],
    is_ipv6: bool,
) -> Result<Vec<SocketAddr>, Error> {
    let stride = if is_ipv6 { 18 } else { 6 };

    let chunks = buf.chunks_exact(stride);
    if !chunks.remainder().is_empty() {
        return Err(Error::TrackerCompactPeerList);
    }

    let peers = chunks
        .map(|hostport| {
            let (ip, port) = hostport.split_at(stride - 2);
            let ip = if is_ipv6 {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(ip);
                IpAddr::from(Ipv6Addr::from(octets))
            } else {
                IpAddr::from(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]))
            };
            let port = u16::from_be_bytes([port[0], port[1]]);
            SocketAddr::new(ip, port)
        })
        .collect();

    Ok(dedup(peers))
}

fn dedup(peers: Vec<SocketAddr>) -> Vec<SocketAddr> {
    let mut seen = HashSet::with_capacity(peers.len());
    peers.into_iter().filter(|p| seen.insert(*p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::Dict;

    #[test]
    fn compact_peers() {
        let buf = [
            127, 0, 0, 1, 0x1a, 0xe1,
            10, 0, 0, 2, 0, 80,
            127, 0, 0, 1, 0x1a, 0xe1,
        ];
        let peers = parse_peers(&Value::Bytes(buf.to_vec())).unwrap();
        assert_eq!(
            peers,
            vec![
                "127.0.0.1:6881".parse::<SocketAddr>().unwrap(),
                "10.0.0.2:80".parse().unwrap(),
            ]
        );

        assert!(matches!(
            parse_peers(&Value::Bytes(buf[..7].to_vec())),
            Err(Error::TrackerCompactPeerList)
        ));
    }

    #[test]
    fn compact_ipv6_peers() {
        let mut buf = [0u8; 18];
        buf[15] = 1;
        buf[16..].copy_from_slice(&6881u16.to_be_bytes());
        let peers = parse_compact_peer_list(&buf, true).unwrap();
        assert_eq!(peers, vec!["[::1]:6881".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn dictionary_peers() {
        let peer = |ip: &str, port: i64| {
            let mut d = Dict::default();
            d.insert(b"ip".to_vec(), Value::from(ip));
            d.insert(b"port".to_vec(), Value::from(port));
            d.insert(b"peer id".to_vec(), Value::from(&[1u8; 20][..]));
            Value::Dict(d)
        };
        let list = Value::List(vec![
            peer("127.0.0.1", 6881i64),
            peer("not an ip", 1i64),
            peer("::1", 51413i64),
            peer("127.0.0.1", 6881i64),
        ]);

        let peers = parse_peers(&list).unwrap();
        assert_eq!(
            peers,
            vec![
                "127.0.0.1:6881".parse::<SocketAddr>().unwrap(),
                "[::1]:51413".parse().unwrap(),
            ]
        );

        assert!(parse_peers(&Value::Integer(1i64)).is_err());
    }

    #[tokio::test]
    async fn unsupported_url() {
        assert!(matches!(
            Client::from_url("wss://tracker.example/announce").await,
            Err(Error::TrackerUnsupported(_))
        ));
    }
}

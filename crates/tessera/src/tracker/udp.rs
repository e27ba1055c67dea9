//! UDP tracker protocol, BEP 15.
//!
//! Every announce does a connect exchange first to get a connection id, then
//! the announce itself. Lost packets are sent again after `15 * 2^n`
//! seconds.
use std::{net::SocketAddr, time::Duration};

use speedy::{BigEndian, Readable, Writable};
use tokio::{
    net::{lookup_host, UdpSocket},
    time::timeout,
};
use tracing::{debug, error};

use super::{parse_compact_peer_list, AnnounceRequest, AnnounceResponse};
use crate::{error::Error, metainfo::InfoHash, peer::PeerId};

const MAGIC: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

const ANNOUNCE_RES_BUF_LEN: usize = 8192;

/// How many times a request is sent before giving up.
const MAX_TRANSMISSIONS: u32 = 4;

#[derive(Debug, PartialEq, Readable, Writable)]
struct ConnectRequest {
    protocol_id: u64,
    action: u32,
    transaction_id: u32,
}

#[derive(Debug, PartialEq, Readable, Writable)]
struct ConnectResponse {
    action: u32,
    transaction_id: u32,
    connection_id: u64,
}

impl ConnectResponse {
    const LENGTH: usize = 16;
}

#[derive(Debug, PartialEq, Readable, Writable)]
struct AnnouncePacket {
    connection_id: u64,
    action: u32,
    transaction_id: u32,
    info_hash: InfoHash,
    peer_id: PeerId,
    downloaded: u64,
    left: u64,
    uploaded: u64,
    event: u32,
    ip_address: u32,
    key: u32,
    num_want: i32,
    port: u16,
}

/// Header of the announce response, the compact peer list follows.
#[derive(Debug, PartialEq, Readable, Writable)]
struct AnnounceHeader {
    action: u32,
    transaction_id: u32,
    interval: u32,
    leechers: u32,
    seeders: u32,
}

impl AnnounceHeader {
    const LENGTH: usize = 20;
}

#[derive(Debug)]
pub struct UdpTracker {
    socket: UdpSocket,
    /// Remote addr of the tracker.
    pub tracker_addr: SocketAddr,
}

impl UdpTracker {
    /// Resolve the host of a `udp://host:port/...` url and connect an UDP
    /// socket to the first address that works.
    pub async fn connect_to(url: &str) -> Result<Self, Error> {
        let host = url
            .strip_prefix("udp://")
            .ok_or_else(|| Error::TrackerUnsupported(url.to_owned()))?;
        let host = host.split('/').next().unwrap_or(host);

        let addrs = lookup_host(host).await.map_err(|_| Error::TrackerNoHosts)?;

        for addr in addrs {
            debug!("trying to connect {addr:?}");

            let bind = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
            let Ok(socket) = UdpSocket::bind(bind).await else { continue };

            if socket.connect(addr).await.is_ok() {
                return Ok(Self { socket, tracker_addr: addr });
            }
        }

        Err(Error::TrackerSocketConnect)
    }

    /// Send `req` and wait for a response, sending it again each time the
    /// wait expires.
    async fn send_recv(&self, req: &[u8], buf: &mut [u8]) -> Result<usize, Error> {
        for n in 0..MAX_TRANSMISSIONS {
            self.socket.send(req).await?;

            let wait = Duration::from_secs(15 * 2_u64.pow(n));

            match timeout(wait, self.socket.recv(buf)).await {
                Ok(Ok(len)) => return Ok(len),
                Ok(Err(e)) => {
                    error!("error talking to tracker: {e:?}");
                    return Err(Error::TrackerResponse);
                }
                Err(_) => {
                    debug!("tracker request was lost after {wait:?}, sending again");
                }
            }
        }

        Err(Error::TrackerResponse)
    }

    async fn connect(&self) -> Result<u64, Error> {
        let req = ConnectRequest {
            protocol_id: MAGIC,
            action: ACTION_CONNECT,
            transaction_id: rand::random(),
        };
        let req_buf = req.write_to_vec_with_ctx(BigEndian {})?;

        let mut buf = [0u8; ConnectResponse::LENGTH];
        let len = self.send_recv(&req_buf, &mut buf).await?;

        if len != ConnectResponse::LENGTH {
            return Err(Error::TrackerResponse);
        }

        let res = ConnectResponse::read_from_buffer_with_ctx(BigEndian {}, &buf)?;

        if res.transaction_id != req.transaction_id || res.action != ACTION_CONNECT {
            error!("response is not valid {res:?}");
            return Err(Error::TrackerResponse);
        }

        Ok(res.connection_id)
    }

    pub async fn announce(
        &self,
        req: &AnnounceRequest,
    ) -> Result<AnnounceResponse, Error> {
        let connection_id = self.connect().await?;

        let packet = AnnouncePacket {
            connection_id,
            action: ACTION_ANNOUNCE,
            transaction_id: rand::random(),
            info_hash: req.info_hash,
            peer_id: req.peer_id,
            downloaded: req.downloaded,
            left: req.left,
            uploaded: req.uploaded,
            event: req.event as u32,
            ip_address: 0,
            key: rand::random(),
            num_want: -1,
            port: req.port,
        };
        let packet_buf = packet.write_to_vec_with_ctx(BigEndian {})?;

        let mut buf = [0u8; ANNOUNCE_RES_BUF_LEN];
        let len = self.send_recv(&packet_buf, &mut buf).await?;
        let buf = &buf[..len];

        // <action=3><transaction_id><message>
        if buf.len() >= 8
            && u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) == ACTION_ERROR
        {
            let message = String::from_utf8_lossy(&buf[8..]).into_owned();
            return Err(Error::TrackerFailure(message));
        }

        if buf.len() < AnnounceHeader::LENGTH {
            return Err(Error::TrackerResponse);
        }

        let header = AnnounceHeader::read_from_buffer_with_ctx(
            BigEndian {},
            &buf[..AnnounceHeader::LENGTH],
        )?;

        if header.transaction_id != packet.transaction_id
            || header.action != ACTION_ANNOUNCE
        {
            return Err(Error::TrackerResponse);
        }

        let peers = parse_compact_peer_list(
            &buf[AnnounceHeader::LENGTH..],
            self.tracker_addr.is_ipv6(),
        )?;

        Ok(AnnounceResponse {
            interval: header.interval,
            min_interval: None,
            seeders: header.seeders,
            leechers: header.leechers,
            peers,
        })
    }
}

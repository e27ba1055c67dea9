//! Announce over HTTP, the response is a bencoded dictionary.
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};

use super::{parse_peers, AnnounceRequest, AnnounceResponse};
use crate::{bencode, error::Error};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval used when the tracker does not send one.
const DEFAULT_INTERVAL: u32 = 1800;

/// Bodies larger than this are dropped without being decoded.
pub const MAX_RESPONSE_LEN: usize = 512 * 1024;

#[derive(Debug)]
pub struct HttpTracker {
    client: Client,
    url: String,
}

impl HttpTracker {
    pub fn new(url: &str) -> Result<Self, Error> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(Error::TrackerUnsupported(url.to_owned()));
        }

        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;

        Ok(Self { client, url: url.to_owned() })
    }

    /// The announce url with the query of `req`.
    pub fn announce_url(&self, req: &AnnounceRequest) -> String {
        // the url of the torrent may already carry a query, a passkey for
        // example
        let sep = if self.url.contains('?') { '&' } else { '?' };

        let mut url = format!(
            "{}{sep}info_hash={}&peer_id={}&port={}&uploaded={}\
             &downloaded={}&left={}&compact=1",
            self.url,
            req.info_hash.url_encoded(),
            urlencoding::encode_binary(&req.peer_id.0),
            req.port,
            req.uploaded,
            req.downloaded,
            req.left,
        );

        let event = req.event.as_str();
        if !event.is_empty() {
            url.push_str("&event=");
            url.push_str(event);
        }

        url
    }

    pub async fn announce(
        &self,
        req: &AnnounceRequest,
    ) -> Result<AnnounceResponse, Error> {
        let url = self.announce_url(req);
        debug!("GET {url}");

        let mut response = self.client.get(&url).send().await?;

        if let Some(len) = response.content_length() {
            if len > MAX_RESPONSE_LEN as u64 {
                return Err(Error::TrackerResponseTooLarge(MAX_RESPONSE_LEN));
            }
        }

        // the length header may be missing, or lie
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > MAX_RESPONSE_LEN {
                return Err(Error::TrackerResponseTooLarge(MAX_RESPONSE_LEN));
            }
            body.extend_from_slice(&chunk);
        }

        Self::parse_response(&body)
    }

    pub fn parse_response(buf: &[u8]) -> Result<AnnounceResponse, Error> {
        let value = bencode::from_bytes(buf)?;
        let dict = value.as_dict().ok_or(Error::TrackerResponse)?;

        if let Some(failure) = dict.get(b"failure reason") {
            let reason = String::from_utf8_lossy(
                failure.as_bytes().ok_or(Error::TrackerResponse)?,
            );
            return Err(Error::TrackerFailure(reason.into_owned()));
        }

        let warning = dict.get(b"warning message").and_then(|v| v.as_str());
        if let Some(warning) = warning {
            warn!("tracker warning: {warning}");
        }

        let int = |key: &[u8]| {
            dict.get(key)
                .and_then(|v| v.as_integer())
                .and_then(|v| u32::try_from(v).ok())
        };

        let peers = match dict.get(b"peers") {
            Some(peers) => parse_peers(peers)?,
            None => Vec::new(),
        };

        Ok(AnnounceResponse {
            interval: int(&b"interval"[..]).unwrap_or(DEFAULT_INTERVAL),
            min_interval: int(&b"min interval"[..]),
            seeders: int(&b"complete"[..]).unwrap_or(0),
            leechers: int(&b"incomplete"[..]).unwrap_or(0),
            peers,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        task::JoinHandle,
    };

    use super::*;
    use crate::{metainfo::InfoHash, peer::PeerId, tracker::Event};

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash([0xab; 20]),
            peer_id: PeerId(*b"-TS0001-abcdefghijkl"),
            port: 6881,
            uploaded: 0,
            downloaded: 10,
            left: 20,
            event: Event::Started,
        }
    }

    #[test]
    fn announce_url() {
        let tracker =
            HttpTracker::new("http://t.example/announce?pk=1").unwrap();
        let url = tracker.announce_url(&request());

        assert!(url.starts_with(
            "http://t.example/announce?pk=1&info_hash=%AB%AB"
        ));
        assert!(url.contains("&peer_id=-TS0001-abcdefghijkl&"));
        assert!(url.contains(
            "&port=6881&uploaded=0&downloaded=10&left=20&compact=1"
        ));
        assert!(url.ends_with("&event=started"));

        let mut req = request();
        req.event = Event::None;
        let tracker = HttpTracker::new("http://t.example/a").unwrap();
        let url = tracker.announce_url(&req);
        assert!(url.starts_with("http://t.example/a?info_hash="));
        assert!(!url.contains("event"));
    }

    #[test]
    fn failure_reason() {
        let r = HttpTracker::parse_response(b"d14:failure reason9:not founde");
        assert!(matches!(r, Err(Error::TrackerFailure(s)) if s == "not found"));
    }

    #[test]
    fn response() {
        let r = HttpTracker::parse_response(
            b"d8:completei3e10:incompletei1e8:intervali900e\
              12:min intervali300e5:peers6:\x7f\x00\x00\x01\x1a\xe1e",
        )
        .unwrap();

        assert_eq!(r.interval, 900);
        assert_eq!(r.min_interval, Some(300));
        assert_eq!(r.seeders, 3);
        assert_eq!(r.leechers, 1);
        assert_eq!(
            r.peers,
            vec!["127.0.0.1:6881".parse::<SocketAddr>().unwrap()]
        );

        let r = HttpTracker::parse_response(b"d5:peers0:e").unwrap();
        assert_eq!(r.interval, DEFAULT_INTERVAL);
        assert_eq!(r.min_interval, None);
    }

    /// An HTTP server on localhost that answers a single request with
    /// `body`, and returns the request it got.
    async fn serve_once(body: Vec<u8>) -> (SocketAddr, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut req = Vec::new();
            let mut buf = [0u8; 1024];
            while !req.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                req.extend_from_slice(&buf[..n]);
            }

            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\
                 Connection: close\r\n\r\n",
                body.len()
            );
            // the client may hang up early
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(&body).await;
            let _ = socket.shutdown().await;

            String::from_utf8_lossy(&req).into_owned()
        });

        (addr, handle)
    }

    #[tokio::test]
    async fn announce_to_local_server() {
        let body = b"d8:intervali60e5:peers12:\
                     \x7f\x00\x00\x01\x1a\xe1\x7f\x00\x00\x01\x1a\xe2e";
        let (addr, server) = serve_once(body.to_vec()).await;

        let tracker =
            HttpTracker::new(&format!("http://{addr}/announce")).unwrap();
        let res = tracker.announce(&request()).await.unwrap();

        assert_eq!(res.interval, 60);
        assert_eq!(res.peers.len(), 2);

        let req = server.await.unwrap();
        assert!(req.starts_with("GET /announce?info_hash=%AB"));
    }

    #[tokio::test]
    async fn oversized_response() {
        let (addr, server) = serve_once(vec![b'x'; MAX_RESPONSE_LEN + 1]).await;

        let tracker =
            HttpTracker::new(&format!("http://{addr}/announce")).unwrap();
        let r = tracker.announce(&request()).await;

        assert!(matches!(r, Err(Error::TrackerResponseTooLarge(_))));
        drop(tracker);
        server.await.unwrap();
    }
}

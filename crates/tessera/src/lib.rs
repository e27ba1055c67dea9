//! Tessera is a BitTorrent client library.
//!
//! A [`torrent::Torrent`] owns the download state of one single-file torrent
//! and talks to one [`peer::Peer`] task per remote peer over channels. Peers
//! speak the wire protocol through the codecs in [`tcp_wire`], verified
//! pieces go to the [`disk::Disk`] task and peers are discovered through a
//! [`tracker::Tracker`].
pub mod bencode;
pub mod bitfield;
pub mod config;
pub mod disk;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod tcp_wire;
pub mod torrent;
pub mod tracker;
pub mod utils;

use std::{io, net::SocketAddr};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::{
    bencode::MalformedEncoding, metainfo::DescriptorError,
    tcp_wire::{BlockInfo, HandshakeError},
};

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_value: mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    MalformedEncoding(#[from] MalformedEncoding),

    #[error("Invalid torrent file: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("The handshake received is not valid: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("The peer took to long to send the handshake")]
    HandshakeTimeout,

    #[error("The peer broke the wire protocol: {0}")]
    ProtocolViolation(String),

    #[error("Tried to request {0:?} while the peer is choking us")]
    RequestWhileChoked(BlockInfo),

    #[error("The peer closed the socket")]
    PeerClosedSocket,

    #[error("The peer sent nothing for {0} seconds")]
    IdleTimeout(u64),

    #[error("Could not connect to {0} in time")]
    ConnectTimeout(SocketAddr),

    #[error("IO error: {0}")]
    IO(#[from] io::Error),

    #[error("Error when serializing/deserializing")]
    SpeedyError(#[from] speedy::Error),

    #[error("Could not send message, the receiving side is gone")]
    ChannelClosed,

    #[error("Could not receive message from oneshot")]
    ReceiveErrorOneshot(#[from] oneshot::error::RecvError),

    #[error("HTTP request to the tracker failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("The tracker refused the announce: {0}")]
    TrackerFailure(String),

    #[error("The response received from the tracker was wrong")]
    TrackerResponse,

    #[error("The tracker sent a response larger than {0} bytes")]
    TrackerResponseTooLarge(usize),

    #[error("The peer list returned by the announce request is not valid")]
    TrackerCompactPeerList,

    #[error("Could not connect to the UDP socket of the tracker")]
    TrackerSocketConnect,

    #[error("Tracker resolved to no usable addresses")]
    TrackerNoHosts,

    #[error("Unsupported tracker url `{0}`, only http, https and udp work")]
    TrackerUnsupported(String),

    #[error("No ports available to listen on, tried {0}..={1}")]
    NoListenPort(u16, u16),

    #[error("No peers in the torrent")]
    NoPeers,

    #[error("Could not handshake with any of the peers")]
    NoReachablePeers,

    #[error("Every peer is gone and there is no tracker to ask for more")]
    PeersExhausted,

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you have \
         a $HOME env and that this program has the permission to create dirs."
    )]
    HomeInvalid,

    #[error(
        "Could not open the folder `{0}`. Please make sure the program has \
         permission to open it and that the folder exist"
    )]
    FolderOpenError(String),

    #[error(
        "Error while trying to read the configuration file, please make sure \
         it has the correct format"
    )]
    ConfigDeserializeError(#[from] toml::de::Error),

    #[error("Could not write the configuration file")]
    ConfigSerializeError(#[from] toml::ser::Error),
}

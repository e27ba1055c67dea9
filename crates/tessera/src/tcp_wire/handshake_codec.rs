//! Codec for encoding and decoding handshakes.
//!
//! This has to be a separate codec as the handshake has a different
//! structure than the rest of the messages. Moreover, handshakes may only
//! be sent once at the beginning of a connection, preceding all other
//! messages. Thus, after receiving and sending a handshake the codec
//! should be switched to [`super::CoreCodec`], but care should be taken not
//! to discard the underlying receive and send buffers.

use bytes::{Buf, BufMut, BytesMut};
use speedy::{BigEndian, Readable, Writable};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::PSTR;
use crate::{error::Error, metainfo::InfoHash, peer::PeerId};

/// Length of a handshake on the wire.
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("protocol string length must be 19, got {0}")]
    ProtocolLength(u8),

    #[error("protocol string is not \"BitTorrent protocol\"")]
    ProtocolName,

    #[error("info hash {0} is not the one of this torrent")]
    InfoHashMismatch(InfoHash),
}

#[derive(Debug)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Error> {
        let Handshake { pstr_len, pstr, reserved, info_hash, peer_id } =
            handshake;

        // we should only be sending the bittorrent protocol string
        debug_assert_eq!(pstr_len, 19);
        debug_assert_eq!(pstr, PSTR);

        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(pstr_len);
        buf.extend_from_slice(&pstr);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash.0);
        buf.extend_from_slice(&peer_id.0);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>, Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek at the length prefix, the rest may not be here yet.
        let prot_len = buf[0];
        if prot_len as usize != PSTR.len() {
            return Err(HandshakeError::ProtocolLength(prot_len).into());
        }

        if buf.remaining() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let handshake = Handshake::deserialize(&buf[..HANDSHAKE_LEN])?;
        buf.advance(HANDSHAKE_LEN);

        if handshake.pstr != PSTR {
            return Err(HandshakeError::ProtocolName.into());
        }

        Ok(Some(handshake))
    }
}

/// pstrlen = 19
/// pstr = "BitTorrent protocol"
/// This is the very first message exchanged. If the peer's protocol string
/// (`BitTorrent protocol`) or the info hash differs from ours, the connection
/// is severed. The reserved field is 8 zero bytes, no extensions are
/// advertised. The peer id is usually the client name and version.
#[derive(Clone, Debug, PartialEq, Writable, Readable)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            pstr_len: PSTR.len() as u8,
            pstr: PSTR,
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
    pub fn serialize(&self) -> Result<[u8; HANDSHAKE_LEN], Error> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        let temp = self.write_to_vec_with_ctx(BigEndian {})?;
        buf.copy_from_slice(&temp[..]);
        Ok(buf)
    }
    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        Ok(Self::read_from_buffer_with_ctx(BigEndian {}, buf)?)
    }
    /// Check the handshake of the remote peer against ours.
    pub fn validate(&self, theirs: &Self) -> Result<(), HandshakeError> {
        if theirs.pstr_len != 19 {
            return Err(HandshakeError::ProtocolLength(theirs.pstr_len));
        }
        if theirs.pstr != PSTR {
            return Err(HandshakeError::ProtocolName);
        }
        if self.info_hash != theirs.info_hash {
            return Err(HandshakeError::InfoHashMismatch(theirs.info_hash));
        }
        Ok(())
    }
}

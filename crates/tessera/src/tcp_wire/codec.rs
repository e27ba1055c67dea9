use bytes::{Buf, BufMut, BytesMut};
use tokio::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::{Block, BlockInfo};
use crate::{bitfield::Bitfield, error::Error};

/// 2MB maximum message size, anything larger is a protocol violation.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Core messages exchanged after a successful handshake.
/// These are from the vanilla protocol, with no extensions.
#[derive(Debug, Clone, PartialEq)]
pub enum Core {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(usize),
    /// The raw payload, as many bits as the sender sent. The peer validates
    /// it against the piece count.
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
}

/// The IDs of the [`Core`] messages. Both the encoder and the decoder go
/// through this table.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CoreId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for CoreId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use CoreId::*;
        Ok(match value {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            _ => return Err(value),
        })
    }
}

impl CoreId {
    /// If `size`, the length prefix, is valid for this message.
    fn accepts(self, size: usize) -> bool {
        use CoreId::*;
        match self {
            Choke | Unchoke | Interested | NotInterested => size == 1,
            // <len=0005><id=4><piece index>
            Have => size == 1 + 4,
            // <len=0001+X><id=5><bitfield>
            Bitfield => size >= 1,
            // <len=0013><id=6><index><begin><length>
            Request | Cancel => size == 1 + 4 + 4 + 4,
            // <len=0009+X><id=7><index><begin><block>, X >= 1
            Piece => size > 1 + 4 + 4,
        }
    }
}

impl Core {
    pub fn id(&self) -> Option<CoreId> {
        Some(match self {
            Core::KeepAlive => return None,
            Core::Choke => CoreId::Choke,
            Core::Unchoke => CoreId::Unchoke,
            Core::Interested => CoreId::Interested,
            Core::NotInterested => CoreId::NotInterested,
            Core::Have(_) => CoreId::Have,
            Core::Bitfield(_) => CoreId::Bitfield,
            Core::Request(_) => CoreId::Request,
            Core::Piece(_) => CoreId::Piece,
            Core::Cancel(_) => CoreId::Cancel,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CoreCodec;

impl Encoder<Core> for CoreCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Core,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let Some(id) = item.id() else {
            buf.put_u32(0);
            return Ok(());
        };

        match item {
            Core::KeepAlive => {}
            Core::Choke
            | Core::Unchoke
            | Core::Interested
            | Core::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(id as u8);
            }
            Core::Have(piece_index) => {
                let piece_index: u32 = piece_index.try_into().map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidInput, e)
                })?;
                buf.put_u32(1 + 4);
                buf.put_u8(id as u8);
                buf.put_u32(piece_index);
            }
            Core::Bitfield(bitfield) => {
                let v = bitfield.into_vec();
                buf.put_u32(1 + v.len() as u32);
                buf.put_u8(id as u8);
                buf.extend_from_slice(&v);
            }
            Core::Request(block_info) | Core::Cancel(block_info) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(id as u8);
                block_info.encode(buf);
            }
            Core::Piece(block) => {
                buf.put_u32(1 + 4 + 4 + block.block.len() as u32);
                buf.put_u8(id as u8);
                block.encode(buf)?;
            }
        }
        Ok(())
    }
}

impl Decoder for CoreCodec {
    type Item = Core;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        // unknown messages are skipped and the next one is tried
        loop {
            // the message length header must be present at the minimum,
            // otherwise we can't determine the message type
            if buf.len() < 4 {
                return Ok(None);
            }

            // peek at length prefix without consuming
            let size =
                u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

            if size == 0 {
                buf.advance(4);
                return Ok(Some(Core::KeepAlive));
            }

            if size > MAX_MESSAGE_SIZE {
                return Err(Error::ProtocolViolation(format!(
                    "message of {size} bytes is larger than {MAX_MESSAGE_SIZE}"
                )));
            }

            // incomplete message, the rest of it will arrive in later
            // packets. Don't advance the cursor and just wait.
            if buf.len() < 4 + size {
                buf.reserve(4 + size - buf.len());
                return Ok(None);
            }

            let msg_id = buf[4];

            let Ok(msg_id) = CoreId::try_from(msg_id) else {
                warn!("skipping unknown message_id {msg_id} of {size} bytes");
                buf.advance(4 + size);
                continue;
            };

            if !msg_id.accepts(size) {
                return Err(Error::ProtocolViolation(format!(
                    "{msg_id:?} with length {size}"
                )));
            }

            // advance past the size and the msg_id, into the payload.
            buf.advance(5);

            let msg = match msg_id {
                CoreId::Choke => Core::Choke,
                CoreId::Unchoke => Core::Unchoke,
                CoreId::Interested => Core::Interested,
                CoreId::NotInterested => Core::NotInterested,
                CoreId::Have => Core::Have(buf.get_u32() as usize),
                CoreId::Bitfield => {
                    let bitfield = buf.copy_to_bytes(size - 1).to_vec();
                    Core::Bitfield(Bitfield::from_vec(bitfield))
                }
                CoreId::Request => Core::Request(get_block_info(buf)),
                CoreId::Cancel => Core::Cancel(get_block_info(buf)),
                CoreId::Piece => {
                    let index = buf.get_u32() as usize;
                    let begin = buf.get_u32();

                    // size - 1 byte (msg_id) - 4 bytes (index) - 4 bytes (begin)
                    let block = buf.copy_to_bytes(size - 9).to_vec();

                    Core::Piece(Block { index, begin, block })
                }
            };

            return Ok(Some(msg));
        }
    }
}

fn get_block_info(buf: &mut BytesMut) -> BlockInfo {
    let index = buf.get_u32();
    let begin = buf.get_u32();
    let len = buf.get_u32();
    BlockInfo { index, begin, len }
}

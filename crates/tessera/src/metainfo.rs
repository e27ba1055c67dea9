//! Metainfo is a .torrent file with information about the Torrent.
//!
//! Only single-file torrents are supported. The info hash is the SHA1 of the
//! `info` dictionary exactly as it appears in the file, never of a
//! re-encoding of it.
use std::{fmt::Display, ops::Deref};

use speedy::{Readable, Writable};
use thiserror::Error;

use crate::{
    bencode::{self, decode_dict_spans, DictEntry, MalformedEncoding, Value},
    tcp_wire::{BlockInfo, BLOCK_LEN},
};

/// Why a .torrent file could not be turned into a [`MetaInfo`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{0}` has the wrong type")]
    InvalidType(&'static str),

    #[error("field `{0}` must be a positive integer")]
    InvalidLength(&'static str),

    #[error("field `{field}` has {len} bytes, not one 20 byte hash per piece")]
    BadHashLength { field: &'static str, len: usize },

    #[error(transparent)]
    Encoding(#[from] MalformedEncoding),
}

macro_rules! sha1_hash {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Readable, Writable)]
        pub struct $name(pub [u8; 20]);

        impl $name {
            /// Percent-encoded form, as sent in tracker query strings.
            pub fn url_encoded(&self) -> String {
                urlencoding::encode_binary(&self.0).into_owned()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let s = self.to_string();
                f.write_str(&s[..10])
            }
        }

        impl Deref for $name {
            type Target = [u8; 20];

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<[u8; 20]> for $name {
            fn from(value: [u8; 20]) -> Self {
                Self(value)
            }
        }

        impl From<$name> for [u8; 20] {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

sha1_hash!(
    /// SHA1 of the raw `info` dictionary. Identifies the torrent on the
    /// wire and on the tracker.
    InfoHash
);

sha1_hash!(
    /// Expected SHA1 of one piece.
    PieceHash
);

impl InfoHash {
    pub fn digest(buf: &[u8]) -> Self {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(buf);
        Self(hasher.digest().bytes())
    }
}

impl PieceHash {
    /// If `data` hashes to this value.
    pub fn matches(&self, data: &[u8]) -> bool {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(data);
        hasher.digest().bytes() == self.0
    }
}

/// A parsed .torrent file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaInfo {
    /// URL of the tracker.
    pub announce: String,
    pub info: Info,
    pub info_hash: InfoHash,
}

/// The `info` dictionary of a single-file torrent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Info {
    /// Suggested file name.
    pub name: Option<String>,

    /// Size of the file in bytes.
    pub length: u64,

    /// Length in bytes of each piece, the last piece may be smaller.
    pub piece_length: u32,

    /// One hash per piece, in piece order.
    pub pieces: Vec<PieceHash>,
}

impl MetaInfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, DescriptorError> {
        if buf.first() != Some(&b'd') {
            // still report garbage as an encoding error
            bencode::from_bytes(buf)?;
            return Err(DescriptorError::InvalidType("root"));
        }

        let mut cursor = 0;
        let entries = decode_dict_spans(buf, &mut cursor)?;

        if cursor != buf.len() {
            return Err(MalformedEncoding::new(
                cursor,
                bencode::MalformedKind::TrailingBytes,
            )
            .into());
        }

        let announce = field(&entries, "announce")?
            .value
            .as_str()
            .ok_or(DescriptorError::InvalidType("announce"))?
            .to_owned();

        let info_entry = field(&entries, "info")?;
        let info = Info::from_value(&info_entry.value)?;
        let info_hash = InfoHash::digest(&buf[info_entry.span.clone()]);

        Ok(Self { announce, info, info_hash })
    }
}

fn field<'a, 'b>(
    entries: &'a [DictEntry<'b>],
    name: &'static str,
) -> Result<&'a DictEntry<'b>, DescriptorError> {
    entries
        .iter()
        .find(|e| e.key == name.as_bytes())
        .ok_or(DescriptorError::MissingField(name))
}

impl Info {
    fn from_value(value: &Value) -> Result<Self, DescriptorError> {
        let dict = value.as_dict().ok_or(DescriptorError::InvalidType("info"))?;

        let positive = |name: &'static str| -> Result<u64, DescriptorError> {
            let v = dict
                .get(name.as_bytes())
                .ok_or(DescriptorError::MissingField(name))?
                .as_integer()
                .ok_or(DescriptorError::InvalidType(name))?;
            if v <= 0 {
                return Err(DescriptorError::InvalidLength(name));
            }
            Ok(v as u64)
        };

        let length = positive("length")?;
        let piece_length: u32 = positive("piece length")?
            .try_into()
            .map_err(|_| DescriptorError::InvalidLength("piece length"))?;

        let raw = dict
            .get(b"pieces")
            .ok_or(DescriptorError::MissingField("pieces"))?
            .as_bytes()
            .ok_or(DescriptorError::InvalidType("pieces"))?;

        let expected = length.div_ceil(piece_length as u64);

        if raw.len() % 20 != 0 || (raw.len() / 20) as u64 != expected {
            return Err(DescriptorError::BadHashLength {
                field: "pieces",
                len: raw.len(),
            });
        }

        let pieces = raw
            .chunks_exact(20)
            .map(|c| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(c);
                PieceHash(hash)
            })
            .collect();

        let name = match dict.get(b"name") {
            Some(v) => Some(
                v.as_str()
                    .ok_or(DescriptorError::InvalidType("name"))?
                    .to_owned(),
            ),
            None => None,
        };

        Ok(Self { name, length, piece_length, pieces })
    }

    /// Calculate how many pieces there are.
    #[inline]
    pub fn pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Get the size (in bytes) of a piece. The last one may be shorter.
    pub fn piece_size(&self, index: usize) -> u32 {
        let start = index as u64 * self.piece_length as u64;
        let end = (start + self.piece_length as u64).min(self.length);
        end.saturating_sub(start) as u32
    }

    pub fn piece_hash(&self, index: usize) -> Option<&PieceHash> {
        self.pieces.get(index)
    }

    /// Byte offset of the piece in the file.
    pub fn piece_offset(&self, index: usize) -> u64 {
        index as u64 * self.piece_length as u64
    }

    /// Calculate how many blocks there are in a piece.
    pub fn blocks_per_piece(&self, index: usize) -> usize {
        self.piece_size(index).div_ceil(BLOCK_LEN) as usize
    }

    /// All block infos of a piece, in ascending offset order.
    pub fn block_infos_of_piece(&self, index: usize) -> Vec<BlockInfo> {
        let piece_size = self.piece_size(index);
        let num_blocks = piece_size.div_ceil(BLOCK_LEN);
        let mut blocks = Vec::with_capacity(num_blocks as usize);

        for block_index in 0..num_blocks {
            let begin = block_index * BLOCK_LEN;
            let len = if block_index == num_blocks - 1 {
                piece_size - begin
            } else {
                BLOCK_LEN
            };

            blocks.push(BlockInfo { index: index as u32, begin, len });
        }

        blocks
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use bendy::decoding::{Decoder, Object};

    use super::*;
    use crate::bencode::{encode, Dict};

    /// Build a torrent whose `info` keys are deliberately out of order, so a
    /// re-encoding would not hash the same.
    pub(crate) fn torrent_bytes(
        length: u64,
        piece_length: u32,
        pieces: &[u8],
    ) -> Vec<u8> {
        let mut buf =
            b"d8:announce27:http://127.0.0.1:1/announce4:infod".to_vec();
        buf.extend_from_slice(format!("6:lengthi{length}e").as_bytes());
        buf.extend_from_slice(b"4:name8:file.bin");
        buf.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        buf.extend_from_slice(pieces);
        buf.extend_from_slice(
            format!("12:piece lengthi{piece_length}e").as_bytes(),
        );
        buf.extend_from_slice(b"ee");
        buf
    }

    fn bendy_info_span(buf: &[u8]) -> Vec<u8> {
        let mut decoder = Decoder::new(buf);
        let Some(Object::Dict(mut dict)) = decoder.next_object().unwrap() else {
            panic!("root is not a dict");
        };
        while let Some((key, value)) = dict.next_pair().unwrap() {
            if key == b"info" {
                let dict = value.try_into_dictionary().unwrap();
                return dict.into_raw().unwrap().to_vec();
            }
        }
        panic!("no info");
    }

    #[test]
    fn info_hash_over_raw_span() {
        let hashes = [7u8; 40];
        let buf = torrent_bytes(32768, 16384, &hashes);
        let meta = MetaInfo::from_bytes(&buf).unwrap();

        // the `info` value, up to the `e` closing the root dict
        let start = buf.windows(6).position(|w| w == b"4:info").unwrap() + 6;
        let raw = &buf[start..buf.len() - 1];
        assert!(raw.starts_with(b"d6:lengthi32768e"));

        // sha1 of the raw span, computed outside of this crate
        assert_eq!(
            meta.info_hash.to_string(),
            "e80399b540bc09cebc0962b983503e9d365c9cac"
        );

        // the sorted re-encoding is different bytes, so a different hash
        let reencoded = encode(&bencode::from_bytes(raw).unwrap());
        assert_ne!(reencoded, raw);
        assert_eq!(
            InfoHash::digest(&reencoded).to_string(),
            "2ea3292dbbb351d68e2bbfc739543ce177d5cba6"
        );

        assert_eq!(meta.announce, "http://127.0.0.1:1/announce");
        assert_eq!(meta.info.name.as_deref(), Some("file.bin"));
        assert_eq!(meta.info.length, 32768);
        assert_eq!(meta.info.piece_length, 16384);
        assert_eq!(meta.info.pieces(), 2);
        assert_eq!(meta.info.piece_hash(1), Some(&PieceHash([7; 20])));
    }

    #[test]
    fn known_vector() {
        let buf = b"d8:announce3:url4:infod6:lengthi1e\
                    12:piece lengthi1e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        let meta = MetaInfo::from_bytes(buf).unwrap();

        // keys are sorted here, so bendy agrees on the span
        let span = b"d6:lengthi1e12:piece lengthi1e6:pieces20:aaaaaaaaaaaaaaaaaaaae";
        assert_eq!(bendy_info_span(buf), span.to_vec());

        assert_eq!(
            meta.info_hash.to_string(),
            "9e1c46b039f8ee387daef971d9e4836a786f83ac"
        );
    }

    #[test]
    fn hash_forms() {
        let hash = InfoHash([0xab; 20]);
        assert_eq!(hash.to_string(), "ab".repeat(20));
        assert_eq!(hash.url_encoded(), "%AB".repeat(20));

        let hash = PieceHash(*b"abcdefghij0123456789");
        assert_eq!(hash.url_encoded(), "abcdefghij0123456789");
    }

    #[test]
    fn last_piece_is_shorter() {
        let info = Info {
            name: None,
            length: 40_000,
            piece_length: 32768,
            pieces: vec![PieceHash::default(); 2],
        };

        assert_eq!(info.piece_size(0), 32768);
        assert_eq!(info.piece_size(1), 40_000 - 32768);
        assert_eq!(info.blocks_per_piece(0), 2);
        assert_eq!(info.blocks_per_piece(1), 1);

        let blocks = info.block_infos_of_piece(0);
        assert_eq!(
            blocks,
            vec![
                BlockInfo { index: 0, begin: 0, len: BLOCK_LEN },
                BlockInfo { index: 0, begin: BLOCK_LEN, len: BLOCK_LEN },
            ]
        );
        let blocks = info.block_infos_of_piece(1);
        assert_eq!(blocks, vec![BlockInfo { index: 1, begin: 0, len: 7232 }]);
    }

    #[test]
    fn descriptor_errors() {
        let err = |v: Value| MetaInfo::from_bytes(&encode(&v)).unwrap_err();

        let info = |pairs: Vec<(&str, Value)>| -> Value {
            let info: Dict = pairs.into_iter().collect();
            [("announce", Value::from("u")), ("info", info.into())]
                .into_iter()
                .collect::<Dict>()
                .into()
        };

        assert_eq!(
            err([("info", Value::Dict(Dict::new()))]
                .into_iter()
                .collect::<Dict>()
                .into()),
            DescriptorError::MissingField("announce")
        );
        assert_eq!(
            err([("announce", Value::from("u"))]
                .into_iter()
                .collect::<Dict>()
                .into()),
            DescriptorError::MissingField("info")
        );
        assert_eq!(
            err(info(vec![
                ("piece length", 1i64.into()),
                ("pieces", Value::from(&[0u8; 20][..])),
            ])),
            DescriptorError::MissingField("length")
        );
        assert_eq!(
            err(info(vec![
                ("length", 0i64.into()),
                ("piece length", 1i64.into()),
                ("pieces", Value::from(&[0u8; 20][..]))
            ])),
            DescriptorError::InvalidLength("length")
        );
        assert_eq!(
            err(info(vec![
                ("length", 1i64.into()),
                ("piece length", Value::from("1")),
                ("pieces", Value::from(&[0u8; 20][..]))
            ])),
            DescriptorError::InvalidType("piece length")
        );
        assert_eq!(
            err(info(vec![
                ("length", 1i64.into()),
                ("piece length", 1i64.into()),
                ("pieces", Value::from(&[0u8; 19][..]))
            ])),
            DescriptorError::BadHashLength { field: "pieces", len: 19 }
        );
        // two hashes for a single piece
        assert_eq!(
            err(info(vec![
                ("length", 1i64.into()),
                ("piece length", 1i64.into()),
                ("pieces", Value::from(&[0u8; 40][..]))
            ])),
            DescriptorError::BadHashLength { field: "pieces", len: 40 }
        );
        assert_eq!(err(Value::from(1i64)), DescriptorError::InvalidType("root"));
    }

    #[test]
    fn malformed_file() {
        let buf = torrent_bytes(32768, 16384, &[7u8; 40]);
        let err = MetaInfo::from_bytes(&buf[..buf.len() - 1]).unwrap_err();
        assert!(matches!(err, DescriptorError::Encoding(_)));
    }
}

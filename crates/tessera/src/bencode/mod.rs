//! Bencode, the self-describing encoding of `.torrent` files and HTTP
//! tracker responses.
//!
//! There are four kinds of values: integers (`i42e`), byte strings
//! (`4:spam`), lists (`l...e`) and dictionaries (`d...e`). Decoding works on
//! an explicit cursor into a caller-owned buffer, so callers can walk a
//! compound value term by term and know exactly which bytes a sub-value
//! occupied. [`crate::metainfo`] relies on that to hash the raw `info`
//! dictionary.
mod decode;
mod encode;

pub use decode::*;
pub use encode::*;

use thiserror::Error;

/// A decoded bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    /// Raw bytes, not necessarily UTF-8.
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(Dict),
}

impl Value {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The value as UTF-8 text, if it is a byte string holding valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Bytes(value.as_bytes().to_vec())
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<Dict> for Value {
    fn from(value: Dict) -> Self {
        Value::Dict(value)
    }
}

/// A dictionary that remembers the order in which its keys were found.
///
/// Keys are unique. Two dictionaries are equal when they hold the same
/// pairs, regardless of order, since the encoder sorts keys anyway.
#[derive(Debug, Clone, Default, Eq)]
pub struct Dict(Vec<(Vec<u8>, Value)>);

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Insert a pair, replacing the value of an existing key in place.
    /// Returns the replaced value.
    pub fn insert(
        &mut self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Value>,
    ) -> Option<Value> {
        let key = key.into();
        let value = value.into();

        if let Some((_, v)) = self.0.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(v, value));
        }

        self.0.push((key, value));
        None
    }

    /// Append a pair whose key is known to be new.
    pub(crate) fn push(&mut self, key: Vec<u8>, value: Value) {
        self.0.push((key, value));
    }

    /// Pairs in encounter order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &Value)> {
        self.0.iter().map(|(k, v)| (k.as_slice(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pairs sorted by raw key bytes, the canonical encoding order.
    pub(crate) fn sorted(&self) -> Vec<(&[u8], &Value)> {
        let mut pairs: Vec<_> = self.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        pairs
    }
}

impl PartialEq for Dict {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.sorted() == other.sorted()
    }
}

impl<K: Into<Vec<u8>>, V: Into<Value>> FromIterator<(K, V)> for Dict {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut dict = Dict::new();
        for (k, v) in iter {
            dict.insert(k, v);
        }
        dict
    }
}

/// The buffer is not valid bencode. `offset` is the byte where decoding
/// gave up.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("malformed encoding at byte {offset}: {kind}")]
pub struct MalformedEncoding {
    pub offset: usize,
    pub kind: MalformedKind,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedKind {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("unexpected byte {0:#04x}")]
    UnexpectedByte(u8),

    #[error("invalid integer")]
    InvalidInteger,

    #[error("invalid byte string length")]
    InvalidLength,

    #[error("dictionary key is not a byte string")]
    NonStringKey,

    #[error("duplicate dictionary key")]
    DuplicateKey,

    #[error("nesting too deep")]
    TooDeep,

    #[error("trailing bytes after value")]
    TrailingBytes,
}

impl MalformedEncoding {
    pub(crate) fn new(offset: usize, kind: MalformedKind) -> Self {
        Self { offset, kind }
    }
}

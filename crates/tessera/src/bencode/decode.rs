use std::ops::Range;

use hashbrown::HashSet;

use super::{Dict, MalformedEncoding, MalformedKind, Value};

/// Maximum nesting of lists and dictionaries. Tracker responses come from
/// the network, this keeps a hostile one from blowing the stack.
pub const MAX_DEPTH: usize = 64;

/// A pair of a dictionary decoded by [`decode_dict_spans`], together with the
/// byte range the value occupied in the source buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictEntry<'a> {
    pub key: &'a [u8],
    pub value: Value,
    pub span: Range<usize>,
}

/// Decode a whole buffer that must hold exactly one value.
pub fn from_bytes(buf: &[u8]) -> Result<Value, MalformedEncoding> {
    let mut cursor = 0;
    let value = decode(buf, &mut cursor)?;

    if cursor != buf.len() {
        return Err(MalformedEncoding::new(
            cursor,
            MalformedKind::TrailingBytes,
        ));
    }

    Ok(value)
}

/// Decode the value that starts at `*cursor`.
///
/// On success the cursor is left on the first byte after the value, so
/// `*cursor - start` is the exact length of its encoding. On error the
/// cursor position is unspecified and the error carries the offset.
pub fn decode(buf: &[u8], cursor: &mut usize) -> Result<Value, MalformedEncoding> {
    decode_value(buf, cursor, 0)
}

/// Decode the dictionary that starts at `*cursor`, recording for each value
/// the span of source bytes it was decoded from.
///
/// Entries are returned in encounter order.
pub fn decode_dict_spans<'a>(
    buf: &'a [u8],
    cursor: &mut usize,
) -> Result<Vec<DictEntry<'a>>, MalformedEncoding> {
    expect(buf, cursor, b'd')?;

    let mut entries: Vec<DictEntry<'a>> = Vec::new();
    let mut seen: HashSet<&[u8]> = HashSet::new();

    while peek(buf, *cursor)? != b'e' {
        let key_offset = *cursor;
        let key = decode_key(buf, cursor)?;

        if !seen.insert(key) {
            return Err(MalformedEncoding::new(
                key_offset,
                MalformedKind::DuplicateKey,
            ));
        }

        let start = *cursor;
        let value = decode_value(buf, cursor, 1)?;

        entries.push(DictEntry { key, value, span: start..*cursor });
    }

    // skip the 'e'
    *cursor += 1;

    Ok(entries)
}

fn decode_value(
    buf: &[u8],
    cursor: &mut usize,
    depth: usize,
) -> Result<Value, MalformedEncoding> {
    if depth > MAX_DEPTH {
        return Err(MalformedEncoding::new(*cursor, MalformedKind::TooDeep));
    }

    match peek(buf, *cursor)? {
        b'0'..=b'9' => decode_bytes(buf, cursor).map(|b| Value::Bytes(b.to_vec())),
        b'i' => decode_integer(buf, cursor).map(Value::Integer),
        b'l' => decode_list(buf, cursor, depth),
        b'd' => decode_dict(buf, cursor, depth),
        byte => Err(MalformedEncoding::new(
            *cursor,
            MalformedKind::UnexpectedByte(byte),
        )),
    }
}

/// `<len>:<bytes>`, borrowing the bytes from the buffer.
fn decode_bytes<'a>(
    buf: &'a [u8],
    cursor: &mut usize,
) -> Result<&'a [u8], MalformedEncoding> {
    let start = *cursor;
    let mut len: usize = 0;

    loop {
        let byte = peek(buf, *cursor)?;
        match byte {
            b'0'..=b'9' => {
                len = len
                    .checked_mul(10)
                    .and_then(|l| l.checked_add((byte - b'0') as usize))
                    .ok_or(MalformedEncoding::new(
                        start,
                        MalformedKind::InvalidLength,
                    ))?;
                *cursor += 1;
            }
            b':' if *cursor > start => break,
            _ => {
                return Err(MalformedEncoding::new(
                    *cursor,
                    MalformedKind::InvalidLength,
                ))
            }
        }
    }

    // skip the ':'
    *cursor += 1;

    let end = cursor
        .checked_add(len)
        .filter(|end| *end <= buf.len())
        .ok_or(MalformedEncoding::new(buf.len(), MalformedKind::UnexpectedEof))?;

    let bytes = &buf[*cursor..end];
    *cursor = end;

    Ok(bytes)
}

/// `i<digits>e`. No leading zeros, no `-0`, no empty digits.
fn decode_integer(
    buf: &[u8],
    cursor: &mut usize,
) -> Result<i64, MalformedEncoding> {
    let start = *cursor;
    expect(buf, cursor, b'i')?;

    let negative = peek(buf, *cursor)? == b'-';
    if negative {
        *cursor += 1;
    }

    let digits_start = *cursor;
    let invalid = MalformedEncoding::new(start, MalformedKind::InvalidInteger);

    // accumulate as a negative number so that i64::MIN fits
    let mut value: i64 = 0;

    loop {
        let byte = peek(buf, *cursor)?;
        match byte {
            b'0'..=b'9' => {
                value = value
                    .checked_mul(10)
                    .and_then(|v| v.checked_sub((byte - b'0') as i64))
                    .ok_or(invalid)?;
                *cursor += 1;
            }
            b'e' => break,
            _ => {
                return Err(MalformedEncoding::new(
                    *cursor,
                    MalformedKind::InvalidInteger,
                ))
            }
        }
    }

    let digits = &buf[digits_start..*cursor];

    if digits.is_empty()
        || (digits[0] == b'0' && digits.len() > 1)
        || (negative && digits == b"0")
    {
        return Err(invalid);
    }

    // skip the 'e'
    *cursor += 1;

    if negative {
        Ok(value)
    } else {
        value.checked_neg().ok_or(invalid)
    }
}

fn decode_list(
    buf: &[u8],
    cursor: &mut usize,
    depth: usize,
) -> Result<Value, MalformedEncoding> {
    expect(buf, cursor, b'l')?;

    let mut list = Vec::new();

    while peek(buf, *cursor)? != b'e' {
        list.push(decode_value(buf, cursor, depth + 1)?);
    }

    *cursor += 1;

    Ok(Value::List(list))
}

fn decode_dict(
    buf: &[u8],
    cursor: &mut usize,
    depth: usize,
) -> Result<Value, MalformedEncoding> {
    expect(buf, cursor, b'd')?;

    let mut dict = Dict::new();
    let mut seen: HashSet<&[u8]> = HashSet::new();

    while peek(buf, *cursor)? != b'e' {
        let key_offset = *cursor;
        let key = decode_key(buf, cursor)?;

        if !seen.insert(key) {
            return Err(MalformedEncoding::new(
                key_offset,
                MalformedKind::DuplicateKey,
            ));
        }

        let value = decode_value(buf, cursor, depth + 1)?;
        dict.push(key.to_vec(), value);
    }

    *cursor += 1;

    Ok(Value::Dict(dict))
}

fn decode_key<'a>(
    buf: &'a [u8],
    cursor: &mut usize,
) -> Result<&'a [u8], MalformedEncoding> {
    if !peek(buf, *cursor)?.is_ascii_digit() {
        return Err(MalformedEncoding::new(*cursor, MalformedKind::NonStringKey));
    }
    decode_bytes(buf, cursor)
}

fn peek(buf: &[u8], cursor: usize) -> Result<u8, MalformedEncoding> {
    buf.get(cursor)
        .copied()
        .ok_or(MalformedEncoding::new(cursor, MalformedKind::UnexpectedEof))
}

fn expect(
    buf: &[u8],
    cursor: &mut usize,
    tag: u8,
) -> Result<(), MalformedEncoding> {
    let byte = peek(buf, *cursor)?;
    if byte != tag {
        return Err(MalformedEncoding::new(
            *cursor,
            MalformedKind::UnexpectedByte(byte),
        ));
    }
    *cursor += 1;
    Ok(())
}

use bytes::{BufMut, BytesMut};

use super::Value;

/// Encode a value. Dictionary keys are written sorted by their raw bytes,
/// so equal values always produce the same bytes.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf);
    buf.to_vec()
}

/// Append the encoding of `value` to `buf`.
pub fn encode_into(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Integer(i) => {
            buf.put_u8(b'i');
            buf.extend_from_slice(i.to_string().as_bytes());
            buf.put_u8(b'e');
        }
        Value::Bytes(b) => encode_bytes(b, buf),
        Value::List(list) => {
            buf.put_u8(b'l');
            for item in list {
                encode_into(item, buf);
            }
            buf.put_u8(b'e');
        }
        Value::Dict(dict) => {
            buf.put_u8(b'd');
            for (key, value) in dict.sorted() {
                encode_bytes(key, buf);
                encode_into(value, buf);
            }
            buf.put_u8(b'e');
        }
    }
}

fn encode_bytes(bytes: &[u8], buf: &mut BytesMut) {
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.extend_from_slice(bytes);
}

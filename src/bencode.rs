//! Bencode encoding and decoding ([BEP-3]).
//!
//! Bencode has four data types: integers, byte strings, lists, and
//! dictionaries. [`decode`] parses a complete document; [`decode_prefix`]
//! parses one value and reports how many bytes it consumed, which the
//! metadata extension uses to split a bencoded header from trailing raw
//! data.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

use std::collections::BTreeMap;

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    Eof,

    #[error("invalid byte {0:#04x} at offset {1}")]
    InvalidByte(u8, usize),

    #[error("invalid integer")]
    InvalidInteger,

    #[error("invalid string length")]
    InvalidLength,

    #[error("trailing data after value")]
    TrailingData,

    #[error("nesting too deep")]
    TooDeep,
}

const MAX_DEPTH: usize = 32;

/// A bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(Bytes),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Str(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up `key` in a dictionary value.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }

    pub fn get_int(&self, key: &[u8]) -> Option<i64> {
        self.get(key).and_then(Value::as_int)
    }

    pub fn get_str(&self, key: &[u8]) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bytes(&self, key: &[u8]) -> Option<&Bytes> {
        self.get(key).and_then(Value::as_bytes)
    }
}

/// Decodes a complete bencode document. Trailing bytes are an error.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let (value, used) = decode_prefix(data)?;
    if used != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Decodes one value from the front of `data`, returning it together with
/// the number of bytes consumed.
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut parser = Parser { data, pos: 0 };
    let value = parser.value(0)?;
    Ok((value, parser.pos))
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data.get(self.pos).copied().ok_or(BencodeError::Eof)
    }

    fn bump(&mut self) -> Result<u8, BencodeError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.string().map(Value::Str),
            b => Err(BencodeError::InvalidByte(b, self.pos)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.bump()?; // 'i'
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| BencodeError::InvalidInteger)?;
        let n: i64 = digits.parse().map_err(|_| BencodeError::InvalidInteger)?;
        self.pos += 1; // 'e'
        Ok(Value::Int(n))
    }

    fn string(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            if !self.data[self.pos].is_ascii_digit() {
                return Err(BencodeError::InvalidLength);
            }
            self.pos += 1;
        }
        let len: usize = std::str::from_utf8(&self.data[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidLength)?;
        self.pos += 1; // ':'
        if self.data.len() - self.pos < len {
            return Err(BencodeError::Eof);
        }
        let bytes = Bytes::copy_from_slice(&self.data[self.pos..self.pos + len]);
        self.pos += len;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.bump()?; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1; // 'e'
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.bump()?; // 'd'
        let mut map = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = self.string()?;
            let value = self.value(depth + 1)?;
            map.insert(key.to_vec(), value);
        }
        self.pos += 1; // 'e'
        Ok(Value::Dict(map))
    }
}

/// Encodes a value to its canonical bencode form.
///
/// Dictionary keys are emitted in sorted order, so re-encoding a decoded
/// canonical document reproduces its exact bytes.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

pub fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Str(s) => {
            out.extend_from_slice(s.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(s);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(map) => {
            out.push(b'd');
            for (key, val) in map {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(val, out);
            }
            out.push(b'e');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_integer() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"i-7e").unwrap(), Value::Int(-7));
        assert!(decode(b"iXe").is_err());
    }

    #[test]
    fn decode_string() {
        assert_eq!(decode(b"4:spam").unwrap(), Value::str("spam"));
        assert_eq!(decode(b"0:").unwrap(), Value::str(""));
        assert!(decode(b"5:spam").is_err());
    }

    #[test]
    fn decode_nested() {
        let v = decode(b"d4:listli1ei2ee3:str3:abce").unwrap();
        let list = v.get(b"list").and_then(Value::as_list).unwrap();
        assert_eq!(list, &[Value::Int(1), Value::Int(2)]);
        assert_eq!(v.get_str(b"str"), Some("abc"));
    }

    #[test]
    fn decode_rejects_trailing() {
        assert!(matches!(decode(b"i1ei2e"), Err(BencodeError::TrailingData)));
    }

    #[test]
    fn prefix_reports_consumed() {
        let data = b"d5:piecei3ee\x01\x02\x03";
        let (value, used) = decode_prefix(data).unwrap();
        assert_eq!(used, 12);
        assert_eq!(value.get_int(b"piece"), Some(3));
        assert_eq!(&data[used..], &[1, 2, 3]);
    }

    #[test]
    fn canonical_roundtrip() {
        let data = b"d3:bar4:spam3:fooi42ee".to_vec();
        let value = decode(&data).unwrap();
        assert_eq!(encode(&value), data);
    }
}

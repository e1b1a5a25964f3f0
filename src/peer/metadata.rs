use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::PeerError;
use crate::bencode::{self, Value};
use crate::constants::METADATA_PIECE_SIZE;

/// A ut_metadata message ([BEP-9]): a bencoded header, followed by raw
/// piece bytes for `Data`.
///
/// [BEP-9]: http://bittorrent.org/beps/bep_0009.html
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: u32, data: Bytes },
    Reject { piece: u32 },
}

const MSG_REQUEST: i64 = 0;
const MSG_DATA: i64 = 1;
const MSG_REJECT: i64 = 2;

impl MetadataMessage {
    pub fn encode(&self) -> Bytes {
        let (msg_type, piece, total_size, data) = match self {
            MetadataMessage::Request { piece } => (MSG_REQUEST, *piece, None, None),
            MetadataMessage::Data {
                piece,
                total_size,
                data,
            } => (MSG_DATA, *piece, Some(*total_size), Some(data)),
            MetadataMessage::Reject { piece } => (MSG_REJECT, *piece, None, None),
        };

        let mut dict = BTreeMap::new();
        dict.insert(b"msg_type".to_vec(), Value::Int(msg_type));
        dict.insert(b"piece".to_vec(), Value::Int(piece as i64));
        if let Some(total_size) = total_size {
            dict.insert(b"total_size".to_vec(), Value::Int(total_size as i64));
        }
        let mut out = bencode::encode(&Value::Dict(dict));
        if let Some(data) = data {
            out.extend_from_slice(data);
        }
        Bytes::from(out)
    }

    /// Decodes the bencoded header and, for `Data`, takes the trailing raw
    /// bytes after it.
    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let (header, used) = bencode::decode_prefix(payload)?;
        let piece = header
            .get_int(b"piece")
            .filter(|n| *n >= 0)
            .ok_or_else(|| PeerError::Extension("missing piece".into()))? as u32;

        match header.get_int(b"msg_type") {
            Some(MSG_REQUEST) => Ok(MetadataMessage::Request { piece }),
            Some(MSG_DATA) => {
                let total_size = header
                    .get_int(b"total_size")
                    .filter(|n| *n > 0)
                    .ok_or_else(|| PeerError::Extension("missing total_size".into()))?
                    as u32;
                Ok(MetadataMessage::Data {
                    piece,
                    total_size,
                    data: Bytes::copy_from_slice(&payload[used..]),
                })
            }
            Some(MSG_REJECT) => Ok(MetadataMessage::Reject { piece }),
            _ => Err(PeerError::Extension("unknown msg_type".into())),
        }
    }
}

/// Number of 16 KiB pieces in a metadata blob of `total_size` bytes.
pub fn metadata_piece_count(total_size: u32) -> u32 {
    (total_size as usize).div_ceil(METADATA_PIECE_SIZE) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_reject_roundtrip() {
        for msg in [
            MetadataMessage::Request { piece: 5 },
            MetadataMessage::Reject { piece: 0 },
        ] {
            assert_eq!(MetadataMessage::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn data_keeps_raw_tail() {
        let msg = MetadataMessage::Data {
            piece: 2,
            total_size: 40000,
            data: Bytes::from_static(b"d4:infoe-not-bencode"),
        };
        assert_eq!(MetadataMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn piece_counts() {
        assert_eq!(metadata_piece_count(1), 1);
        assert_eq!(metadata_piece_count(16384), 1);
        assert_eq!(metadata_piece_count(16385), 2);
        assert_eq!(metadata_piece_count(50000), 4);
    }
}

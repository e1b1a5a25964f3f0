use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::PeerError;

const PSTR: &[u8] = b"BitTorrent protocol";

/// Wire length of the canonical handshake.
pub const HANDSHAKE_LEN: usize = 68;

// Reserved-bit flags, per extension BEP.
const EXTENSION_PROTOCOL_BIT: (usize, u8) = (5, 0x10);
const FAST_EXTENSION_BIT: (usize, u8) = (7, 0x04);

/// The 68-byte connection handshake: pstr, reserved bits, info hash,
/// peer id.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// A handshake advertising the extension protocol and fast extension.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_PROTOCOL_BIT.0] |= EXTENSION_PROTOCOL_BIT.1;
        reserved[FAST_EXTENSION_BIT.0] |= FAST_EXTENSION_BIT.1;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[EXTENSION_PROTOCOL_BIT.0] & EXTENSION_PROTOCOL_BIT.1 != 0
    }

    pub fn supports_fast_extension(&self) -> bool {
        self.reserved[FAST_EXTENSION_BIT.0] & FAST_EXTENSION_BIT.1 != 0
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        out[0] = PSTR.len() as u8;
        out[1..20].copy_from_slice(PSTR);
        out[20..28].copy_from_slice(&self.reserved);
        out[28..48].copy_from_slice(&self.info_hash);
        out[48..68].copy_from_slice(&self.peer_id);
        out
    }

    pub fn decode(data: &[u8; HANDSHAKE_LEN]) -> Result<Self, PeerError> {
        if data[0] as usize != PSTR.len() || &data[1..20] != PSTR {
            return Err(PeerError::InvalidHandshake);
        }
        let mut hs = Self {
            reserved: [0; 8],
            info_hash: [0; 20],
            peer_id: [0; 20],
        };
        hs.reserved.copy_from_slice(&data[20..28]);
        hs.info_hash.copy_from_slice(&data[28..48]);
        hs.peer_id.copy_from_slice(&data[48..68]);
        Ok(hs)
    }
}

/// A peer wire message.
///
/// Framing is a 4-byte big-endian length followed by a 1-byte id and the
/// payload; a zero length is a keepalive. [`Message::encode`] produces the
/// full frame, [`Message::decode`] takes a frame with the length prefix
/// already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    // Fast extension (BEP-6)
    Suggest { index: u32 },
    HaveAll,
    HaveNone,
    Reject { index: u32, begin: u32, length: u32 },
    AllowedFast { index: u32 },
    // Extension protocol (BEP-10)
    Extended { id: u8, payload: Bytes },
}

// Message ids on the wire.
mod id {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
    pub const PORT: u8 = 9;
    pub const SUGGEST: u8 = 13;
    pub const HAVE_ALL: u8 = 14;
    pub const HAVE_NONE: u8 = 15;
    pub const REJECT: u8 = 16;
    pub const ALLOWED_FAST: u8 = 17;
    pub const EXTENDED: u8 = 20;
}

impl Message {
    /// Encodes the message as a complete frame, length prefix included.
    pub fn encode(&self) -> Bytes {
        use Message::*;

        let mut buf = BytesMut::with_capacity(16);
        buf.put_u32(0); // patched below
        match self {
            KeepAlive => {}
            Choke => buf.put_u8(id::CHOKE),
            Unchoke => buf.put_u8(id::UNCHOKE),
            Interested => buf.put_u8(id::INTERESTED),
            NotInterested => buf.put_u8(id::NOT_INTERESTED),
            Have { index } => {
                buf.put_u8(id::HAVE);
                buf.put_u32(*index);
            }
            Bitfield(bits) => {
                buf.put_u8(id::BITFIELD);
                buf.put_slice(bits);
            }
            Request {
                index,
                begin,
                length,
            } => {
                buf.put_u8(id::REQUEST);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Piece { index, begin, data } => {
                buf.put_u8(id::PIECE);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u8(id::CANCEL);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Port(port) => {
                buf.put_u8(id::PORT);
                buf.put_u16(*port);
            }
            Suggest { index } => {
                buf.put_u8(id::SUGGEST);
                buf.put_u32(*index);
            }
            HaveAll => buf.put_u8(id::HAVE_ALL),
            HaveNone => buf.put_u8(id::HAVE_NONE),
            Reject {
                index,
                begin,
                length,
            } => {
                buf.put_u8(id::REJECT);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            AllowedFast { index } => {
                buf.put_u8(id::ALLOWED_FAST);
                buf.put_u32(*index);
            }
            Extended { id: ext, payload } => {
                buf.put_u8(id::EXTENDED);
                buf.put_u8(*ext);
                buf.put_slice(payload);
            }
        }
        let body_len = (buf.len() - 4) as u32;
        buf[..4].copy_from_slice(&body_len.to_be_bytes());
        buf.freeze()
    }

    /// Decodes one frame. `frame` is the message body without the length
    /// prefix; an empty frame is a keepalive.
    pub fn decode(mut frame: Bytes) -> Result<Self, PeerError> {
        if frame.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let msg_id = frame.get_u8();
        let msg = match msg_id {
            id::CHOKE => Message::Choke,
            id::UNCHOKE => Message::Unchoke,
            id::INTERESTED => Message::Interested,
            id::NOT_INTERESTED => Message::NotInterested,
            id::HAVE => Message::Have {
                index: take_u32(&mut frame, "have")?,
            },
            id::BITFIELD => Message::Bitfield(frame.split_off(0)),
            id::REQUEST => Message::Request {
                index: take_u32(&mut frame, "request")?,
                begin: take_u32(&mut frame, "request")?,
                length: take_u32(&mut frame, "request")?,
            },
            id::PIECE => {
                if frame.len() < 8 {
                    return Err(PeerError::Malformed("piece"));
                }
                Message::Piece {
                    index: frame.get_u32(),
                    begin: frame.get_u32(),
                    data: frame.split_off(0),
                }
            }
            id::CANCEL => Message::Cancel {
                index: take_u32(&mut frame, "cancel")?,
                begin: take_u32(&mut frame, "cancel")?,
                length: take_u32(&mut frame, "cancel")?,
            },
            id::PORT => {
                if frame.len() < 2 {
                    return Err(PeerError::Malformed("port"));
                }
                Message::Port(frame.get_u16())
            }
            id::SUGGEST => Message::Suggest {
                index: take_u32(&mut frame, "suggest")?,
            },
            id::HAVE_ALL => Message::HaveAll,
            id::HAVE_NONE => Message::HaveNone,
            id::REJECT => Message::Reject {
                index: take_u32(&mut frame, "reject")?,
                begin: take_u32(&mut frame, "reject")?,
                length: take_u32(&mut frame, "reject")?,
            },
            id::ALLOWED_FAST => Message::AllowedFast {
                index: take_u32(&mut frame, "allowed fast")?,
            },
            id::EXTENDED => {
                if frame.is_empty() {
                    return Err(PeerError::Malformed("extended"));
                }
                Message::Extended {
                    id: frame.get_u8(),
                    payload: frame.split_off(0),
                }
            }
            other => return Err(PeerError::UnknownMessageId(other)),
        };
        Ok(msg)
    }
}

fn take_u32(frame: &mut Bytes, what: &'static str) -> Result<u32, PeerError> {
    if frame.len() < 4 {
        return Err(PeerError::Malformed(what));
    }
    Ok(frame.get_u32())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) -> Message {
        let frame = msg.encode();
        let body = frame.slice(4..);
        Message::decode(body).unwrap()
    }

    #[test]
    fn handshake_roundtrip() {
        let hs = Handshake::new([1; 20], [2; 20]);
        let wire = hs.encode();
        let back = Handshake::decode(&wire).unwrap();
        assert_eq!(back.info_hash, [1; 20]);
        assert_eq!(back.peer_id, [2; 20]);
        assert!(back.supports_extension_protocol());
        assert!(back.supports_fast_extension());
    }

    #[test]
    fn handshake_rejects_wrong_pstr() {
        let mut wire = Handshake::new([1; 20], [2; 20]).encode();
        wire[3] ^= 0xff;
        assert!(Handshake::decode(&wire).is_err());
    }

    #[test]
    fn frame_length_prefix() {
        assert_eq!(Message::KeepAlive.encode().as_ref(), &[0, 0, 0, 0]);
        let have = Message::Have { index: 3 }.encode();
        assert_eq!(have.as_ref(), &[0, 0, 0, 5, 4, 0, 0, 0, 3]);
    }

    #[test]
    fn representative_roundtrips() {
        let block = Bytes::from_static(&[9, 8, 7]);
        for msg in [
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::Have { index: 42 },
            Message::Bitfield(Bytes::from_static(&[0xf0])),
            Message::Request {
                index: 1,
                begin: 16384,
                length: 16384,
            },
            Message::Piece {
                index: 1,
                begin: 0,
                data: block,
            },
            Message::HaveAll,
            Message::AllowedFast { index: 6 },
            Message::Extended {
                id: 1,
                payload: Bytes::from_static(b"d1:ai1ee"),
            },
        ] {
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn truncated_payload_is_malformed() {
        assert!(matches!(
            Message::decode(Bytes::from_static(&[super::id::HAVE, 0, 0])),
            Err(PeerError::Malformed("have"))
        ));
        assert!(matches!(
            Message::decode(Bytes::from_static(&[99])),
            Err(PeerError::UnknownMessageId(99))
        ));
    }
}

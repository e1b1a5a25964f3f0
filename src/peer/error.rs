use thiserror::Error;

/// Errors from peer connections. All of these are transient per-peer
/// faults: the session recovers by disconnecting the peer.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid handshake")]
    InvalidHandshake,

    #[error("info hash mismatch")]
    InfoHashMismatch,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("unknown message id {0}")]
    UnknownMessageId(u8),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("connection closed")]
    Closed,

    #[error("extension error: {0}")]
    Extension(String),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),
}

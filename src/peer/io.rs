use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace};

use super::error::PeerError;
use super::message::{Handshake, Message, HANDSHAKE_LEN};
use super::peer_id::PeerId;
use crate::constants::{
    CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT, KEEPALIVE_INTERVAL, PEER_COMMAND_CHANNEL_SIZE,
};

/// Largest frame we accept: a block message plus slack for bitfields of
/// very large torrents.
const MAX_FRAME: usize = 4 * 1024 * 1024;

/// An event produced by a peer's I/O task.
#[derive(Debug)]
pub enum PeerEvent {
    Message(Message),
    /// The connection ended; emitted exactly once, last.
    Disconnected,
}

/// A command consumed by a peer's I/O task.
#[derive(Debug)]
pub enum PeerCommand {
    Send(Message),
    Close,
}

/// A peer that completed the wire handshake but has no I/O task yet.
#[derive(Debug)]
pub struct ConnectedPeer {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub supports_extension: bool,
    pub supports_fast: bool,
    stream: TcpStream,
}

/// Dials `addr` and performs the outgoing handshake.
pub async fn handshake_outgoing(
    addr: SocketAddr,
    info_hash: [u8; 20],
    local_id: PeerId,
) -> Result<ConnectedPeer, PeerError> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| PeerError::HandshakeTimeout)??;
    timeout(
        HANDSHAKE_TIMEOUT,
        exchange_handshake(stream, addr, info_hash, local_id, true),
    )
    .await
    .map_err(|_| PeerError::HandshakeTimeout)?
}

/// Performs the incoming handshake on an accepted connection.
pub async fn handshake_incoming(
    stream: TcpStream,
    info_hash: [u8; 20],
    local_id: PeerId,
) -> Result<ConnectedPeer, PeerError> {
    let addr = stream.peer_addr()?;
    timeout(
        HANDSHAKE_TIMEOUT,
        exchange_handshake(stream, addr, info_hash, local_id, false),
    )
    .await
    .map_err(|_| PeerError::HandshakeTimeout)?
}

async fn exchange_handshake(
    mut stream: TcpStream,
    addr: SocketAddr,
    info_hash: [u8; 20],
    local_id: PeerId,
    outgoing: bool,
) -> Result<ConnectedPeer, PeerError> {
    let ours = Handshake::new(info_hash, local_id.0);
    let mut theirs = [0u8; HANDSHAKE_LEN];

    if outgoing {
        stream.write_all(&ours.encode()).await?;
        stream.read_exact(&mut theirs).await?;
    } else {
        stream.read_exact(&mut theirs).await?;
        stream.write_all(&ours.encode()).await?;
    }

    let theirs = Handshake::decode(&theirs)?;
    if theirs.info_hash != info_hash {
        return Err(PeerError::InfoHashMismatch);
    }

    Ok(ConnectedPeer {
        id: PeerId::from_bytes(theirs.peer_id),
        addr,
        supports_extension: theirs.supports_extension_protocol(),
        supports_fast: theirs.supports_fast_extension(),
        stream,
    })
}

impl ConnectedPeer {
    /// Starts the I/O tasks for this peer.
    ///
    /// Incoming frames are decoded and delivered as `(id, event)` pairs on
    /// `event_tx` in wire order; the returned sender carries outgoing
    /// commands. Dropping it (or sending [`PeerCommand::Close`]) tears the
    /// connection down, after which a final [`PeerEvent::Disconnected`] is
    /// emitted.
    pub fn spawn(self, event_tx: mpsc::Sender<(PeerId, PeerEvent)>) -> mpsc::Sender<PeerCommand> {
        let (cmd_tx, cmd_rx) = mpsc::channel(PEER_COMMAND_CHANNEL_SIZE);
        let (closed_tx, closed_rx) = oneshot::channel();
        let (read_half, write_half) = self.stream.into_split();
        let id = self.id;

        tokio::spawn(write_loop(id, write_half, cmd_rx, closed_tx));
        tokio::spawn(read_loop(id, read_half, event_tx, closed_rx));
        cmd_tx
    }
}

async fn write_loop(
    id: PeerId,
    mut stream: OwnedWriteHalf,
    mut cmd_rx: mpsc::Receiver<PeerCommand>,
    _closed_tx: oneshot::Sender<()>,
) {
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await; // immediate first tick

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(PeerCommand::Send(msg)) => {
                    trace!(peer = ?id, ?msg, "send");
                    if stream.write_all(&msg.encode()).await.is_err() {
                        break;
                    }
                }
                Some(PeerCommand::Close) | None => break,
            },
            _ = keepalive.tick() => {
                if stream.write_all(&Message::KeepAlive.encode()).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = stream.shutdown().await;
    // dropping _closed_tx wakes the read loop
}

async fn read_loop(
    id: PeerId,
    mut stream: OwnedReadHalf,
    event_tx: mpsc::Sender<(PeerId, PeerEvent)>,
    mut closed_rx: oneshot::Receiver<()>,
) {
    let mut buf = BytesMut::with_capacity(64 * 1024);

    'io: loop {
        loop {
            match parse_frame(&mut buf) {
                Ok(Some(msg)) => {
                    if event_tx.send((id, PeerEvent::Message(msg))).await.is_err() {
                        break 'io;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(peer = ?id, %err, "protocol error");
                    break 'io;
                }
            }
        }
        tokio::select! {
            read = stream.read_buf(&mut buf) => match read {
                Ok(0) => break 'io,
                Ok(_) => {}
                Err(err) => {
                    debug!(peer = ?id, %err, "read error");
                    break 'io;
                }
            },
            _ = &mut closed_rx => break 'io,
        }
    }
    let _ = event_tx.send((id, PeerEvent::Disconnected)).await;
}

/// Extracts one complete frame from `buf`, stripping the length prefix.
fn parse_frame(buf: &mut BytesMut) -> Result<Option<Message>, PeerError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if frame_len > MAX_FRAME {
        return Err(PeerError::FrameTooLarge(frame_len));
    }
    if buf.len() < 4 + frame_len {
        return Ok(None);
    }
    buf.advance(4);
    let frame = buf.split_to(frame_len).freeze();
    Message::decode(frame).map(Some)
}

//! Single-piece download from a single peer.
//!
//! A downloader owns one piece buffer and pipelines block requests to one
//! peer. The controller routes that peer's wire events in; block receipt,
//! choking, rejects, and snub timing are handled here. In endgame the
//! controller mirrors blocks received from other peers into every racing
//! downloader, which cancels its own outstanding request for the block
//! instead of transferring it twice.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::constants::BLOCK_SIZE;
use crate::peer::{Message, PeerCommand, PeerId};

/// Results and notifications on the controller's shared channel.
#[derive(Debug)]
pub enum PieceDownloadMessage {
    /// No block arrived within the snub timeout; the download continues.
    Snubbed { peer: PeerId },
    /// All blocks are assembled. The buffer still needs hash verification.
    Done {
        peer: PeerId,
        index: u32,
        data: BytesMut,
    },
    /// The downloader ended early; unreceived blocks return to the picker.
    Abandoned { peer: PeerId, index: u32 },
}

/// Wire events the controller routes to this downloader.
#[derive(Debug)]
pub enum DownloaderEvent {
    Choked,
    Unchoked,
    /// A block from this downloader's own peer.
    Block { begin: u32, data: Bytes },
    /// A block another endgame downloader received first.
    Mirrored { begin: u32, data: Bytes },
    /// The peer rejected a block request (fast extension).
    Rejected { begin: u32 },
}

/// Controller-side handle; dropping `event_tx` cancels the task.
pub struct PieceDownload {
    pub index: u32,
    pub event_tx: mpsc::Sender<DownloaderEvent>,
    pub task: JoinHandle<()>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Missing,
    Requested,
    Received,
}

/// Starts a piece download.
///
/// `buf` must be `piece_length` long, typically from the piece pool.
/// `choked` is the peer's current choke state; a choked start is only
/// valid for an allowed-fast piece.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    peer: PeerId,
    peer_cmd: mpsc::Sender<PeerCommand>,
    index: u32,
    allowed_fast: bool,
    choked: bool,
    buf: BytesMut,
    queue_length: usize,
    snub_timeout: Duration,
    result_tx: mpsc::Sender<PieceDownloadMessage>,
) -> PieceDownload {
    let (event_tx, event_rx) = mpsc::channel(64);
    let task = tokio::spawn(
        Downloader {
            peer,
            peer_cmd,
            index,
            allowed_fast,
            choked,
            buf,
            queue_length,
            snub_timeout,
            result_tx,
            event_rx,
        }
        .run(),
    );
    PieceDownload {
        index,
        event_tx,
        task,
    }
}

struct Downloader {
    peer: PeerId,
    peer_cmd: mpsc::Sender<PeerCommand>,
    index: u32,
    allowed_fast: bool,
    choked: bool,
    buf: BytesMut,
    queue_length: usize,
    snub_timeout: Duration,
    result_tx: mpsc::Sender<PieceDownloadMessage>,
    event_rx: mpsc::Receiver<DownloaderEvent>,
}

impl Downloader {
    async fn run(mut self) {
        let piece_length = self.buf.len() as u32;
        let block_count = piece_length.div_ceil(BLOCK_SIZE) as usize;
        let mut blocks = vec![BlockState::Missing; block_count];
        let mut rejects = 0usize;
        let mut snub_deadline = Instant::now() + self.snub_timeout;
        let mut snub_reported = false;

        loop {
            if (!self.choked || self.allowed_fast)
                && !self.fill_pipeline(&mut blocks, piece_length).await
            {
                break self.abandon().await;
            }

            tokio::select! {
                event = self.event_rx.recv() => match event {
                    Some(DownloaderEvent::Unchoked) => self.choked = false,
                    Some(DownloaderEvent::Choked) => {
                        self.choked = true;
                        if !self.allowed_fast {
                            break self.abandon().await;
                        }
                    }
                    Some(DownloaderEvent::Block { begin, data }) => {
                        let Some(slot) = block_slot(begin, &data, piece_length) else {
                            debug!(peer = ?self.peer, begin, "bogus block");
                            break self.abandon().await;
                        };
                        snub_deadline = Instant::now() + self.snub_timeout;
                        snub_reported = false;
                        if blocks[slot] == BlockState::Received {
                            continue;
                        }
                        blocks[slot] = BlockState::Received;
                        self.buf[begin as usize..begin as usize + data.len()]
                            .copy_from_slice(&data);
                        if blocks.iter().all(|b| *b == BlockState::Received) {
                            break self.complete().await;
                        }
                    }
                    Some(DownloaderEvent::Mirrored { begin, data }) => {
                        let Some(slot) = block_slot(begin, &data, piece_length) else {
                            continue;
                        };
                        if blocks[slot] == BlockState::Received {
                            continue;
                        }
                        if blocks[slot] == BlockState::Requested {
                            let cancel = Message::Cancel {
                                index: self.index,
                                begin,
                                length: data.len() as u32,
                            };
                            if self.peer_cmd.send(PeerCommand::Send(cancel)).await.is_err() {
                                break self.abandon().await;
                            }
                        }
                        blocks[slot] = BlockState::Received;
                        self.buf[begin as usize..begin as usize + data.len()]
                            .copy_from_slice(&data);
                        if blocks.iter().all(|b| *b == BlockState::Received) {
                            break self.complete().await;
                        }
                    }
                    Some(DownloaderEvent::Rejected { begin }) => {
                        let slot = begin.checked_div(BLOCK_SIZE).map(|s| s as usize);
                        if let Some(slot) = slot.filter(|s| *s < blocks.len()) {
                            if blocks[slot] == BlockState::Requested {
                                blocks[slot] = BlockState::Missing;
                            }
                        }
                        rejects += 1;
                        if rejects > 2 * block_count {
                            debug!(peer = ?self.peer, "too many rejects");
                            break self.abandon().await;
                        }
                    }
                    None => break self.abandon().await,
                },
                _ = tokio::time::sleep_until(snub_deadline), if !snub_reported => {
                    snub_reported = true;
                    let snubbed = PieceDownloadMessage::Snubbed { peer: self.peer };
                    if self.result_tx.send(snubbed).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Requests missing blocks up to the pipeline depth. False means the
    /// peer's command channel is gone.
    async fn fill_pipeline(&mut self, blocks: &mut [BlockState], piece_length: u32) -> bool {
        let mut outstanding = blocks
            .iter()
            .filter(|b| **b == BlockState::Requested)
            .count();
        for slot in 0..blocks.len() {
            if outstanding >= self.queue_length {
                break;
            }
            if blocks[slot] != BlockState::Missing {
                continue;
            }
            let begin = slot as u32 * BLOCK_SIZE;
            let length = (piece_length - begin).min(BLOCK_SIZE);
            let request = Message::Request {
                index: self.index,
                begin,
                length,
            };
            if self.peer_cmd.send(PeerCommand::Send(request)).await.is_err() {
                return false;
            }
            blocks[slot] = BlockState::Requested;
            outstanding += 1;
        }
        true
    }

    async fn complete(self) {
        let message = PieceDownloadMessage::Done {
            peer: self.peer,
            index: self.index,
            data: self.buf,
        };
        let _ = self.result_tx.send(message).await;
    }

    async fn abandon(self) {
        let message = PieceDownloadMessage::Abandoned {
            peer: self.peer,
            index: self.index,
        };
        let _ = self.result_tx.send(message).await;
    }
}

/// Validates block geometry: 16 KiB-aligned begin, correct (possibly
/// short, for the final block) length inside the piece.
fn block_slot(begin: u32, data: &[u8], piece_length: u32) -> Option<usize> {
    if begin % BLOCK_SIZE != 0 || begin >= piece_length {
        return None;
    }
    let expected = (piece_length - begin).min(BLOCK_SIZE) as usize;
    if data.len() != expected {
        return None;
    }
    Some((begin / BLOCK_SIZE) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    const Q: usize = 50;

    struct Harness {
        dl: PieceDownload,
        cmd_rx: mpsc::Receiver<PeerCommand>,
        result_rx: mpsc::Receiver<PieceDownloadMessage>,
        peer: PeerId,
    }

    fn start(piece_length: u32, allowed_fast: bool, choked: bool) -> Harness {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (result_tx, result_rx) = mpsc::channel(8);
        let peer = PeerId::generate();
        let mut buf = BytesMut::new();
        buf.resize(piece_length as usize, 0);
        let dl = spawn(
            peer,
            cmd_tx,
            3,
            allowed_fast,
            choked,
            buf,
            Q,
            Duration::from_secs(60),
            result_tx,
        );
        Harness {
            dl,
            cmd_rx,
            result_rx,
            peer,
        }
    }

    fn sent_request(cmd: PeerCommand) -> (u32, u32, u32) {
        match cmd {
            PeerCommand::Send(Message::Request {
                index,
                begin,
                length,
            }) => (index, begin, length),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn pipelines_blocks_with_short_final_block() {
        let mut h = start(40000, false, false);
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(sent_request(h.cmd_rx.recv().await.unwrap()));
        }
        assert_eq!(
            seen,
            vec![(3, 0, 16384), (3, 16384, 16384), (3, 32768, 40000 - 32768)]
        );
    }

    #[tokio::test]
    async fn assembles_and_completes() {
        let mut h = start(20000, false, false);
        for _ in 0..2 {
            h.cmd_rx.recv().await.unwrap();
        }
        h.dl.event_tx
            .send(DownloaderEvent::Block {
                begin: 16384,
                data: Bytes::from(vec![2u8; 20000 - 16384]),
            })
            .await
            .unwrap();
        h.dl.event_tx
            .send(DownloaderEvent::Block {
                begin: 0,
                data: Bytes::from(vec![1u8; 16384]),
            })
            .await
            .unwrap();

        match h.result_rx.recv().await.unwrap() {
            PieceDownloadMessage::Done { peer, index, data } => {
                assert_eq!(peer, h.peer);
                assert_eq!(index, 3);
                assert!(data[..16384].iter().all(|b| *b == 1));
                assert!(data[16384..].iter().all(|b| *b == 2));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn choke_abandons_unless_allowed_fast() {
        let mut h = start(16384, false, false);
        h.cmd_rx.recv().await.unwrap();
        h.dl.event_tx.send(DownloaderEvent::Choked).await.unwrap();
        assert!(matches!(
            h.result_rx.recv().await.unwrap(),
            PieceDownloadMessage::Abandoned { index: 3, .. }
        ));

        // allowed-fast download survives the choke and completes
        let mut h = start(16384, true, true);
        h.cmd_rx.recv().await.unwrap();
        h.dl.event_tx.send(DownloaderEvent::Choked).await.unwrap();
        h.dl.event_tx
            .send(DownloaderEvent::Block {
                begin: 0,
                data: Bytes::from(vec![3u8; 16384]),
            })
            .await
            .unwrap();
        assert!(matches!(
            h.result_rx.recv().await.unwrap(),
            PieceDownloadMessage::Done { .. }
        ));
    }

    #[tokio::test]
    async fn mirrored_block_cancels_own_request() {
        let mut h = start(16384, false, false);
        h.cmd_rx.recv().await.unwrap();
        h.dl.event_tx
            .send(DownloaderEvent::Mirrored {
                begin: 0,
                data: Bytes::from(vec![4u8; 16384]),
            })
            .await
            .unwrap();
        match h.cmd_rx.recv().await.unwrap() {
            PeerCommand::Send(Message::Cancel {
                index,
                begin,
                length,
            }) => {
                assert_eq!((index, begin, length), (3, 0, 16384));
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert!(matches!(
            h.result_rx.recv().await.unwrap(),
            PieceDownloadMessage::Done { .. }
        ));
    }

    #[tokio::test]
    async fn reject_requeues_the_block() {
        let mut h = start(16384, false, false);
        assert_eq!(sent_request(h.cmd_rx.recv().await.unwrap()), (3, 0, 16384));
        h.dl.event_tx
            .send(DownloaderEvent::Rejected { begin: 0 })
            .await
            .unwrap();
        // the block is re-requested
        assert_eq!(sent_request(h.cmd_rx.recv().await.unwrap()), (3, 0, 16384));
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_peer_is_reported_snubbed() {
        let mut h = start(16384, false, false);
        h.cmd_rx.recv().await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(
            h.result_rx.recv().await.unwrap(),
            PieceDownloadMessage::Snubbed { peer } if peer == h.peer
        ));
    }

    #[tokio::test]
    async fn dropped_handle_abandons() {
        let h = start(16384, false, false);
        drop(h.dl.event_tx);
        let mut result_rx = h.result_rx;
        assert!(matches!(
            result_rx.recv().await.unwrap(),
            PieceDownloadMessage::Abandoned { .. }
        ));
    }
}

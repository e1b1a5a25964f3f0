//! Metadata download from a single peer ([BEP-9]).
//!
//! While the info dictionary is unknown, one downloader per candidate
//! peer requests consecutive metadata pieces, assembles the blob, and
//! checks its SHA1 against the torrent's info hash. The first downloader
//! to complete wins; a snubbed one keeps running because it may still
//! finish before its replacement.
//!
//! [BEP-9]: http://bittorrent.org/beps/bep_0009.html

use std::time::Duration;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::constants::METADATA_PIECE_SIZE;
use crate::peer::{metadata_piece_count, Message, MetadataMessage, PeerCommand, PeerId};

/// Results and notifications on the controller's shared channel.
#[derive(Debug)]
pub enum InfoDownloadMessage {
    /// No metadata piece arrived within the snub timeout. The download
    /// continues; the controller may start a replacement.
    Snubbed { peer: PeerId },
    /// The assembled blob hashed to the torrent's info hash.
    Done { peer: PeerId, info_bytes: Bytes },
    /// The peer rejected, sent garbage, or disconnected.
    Failed { peer: PeerId },
}

/// Metadata-extension events the controller routes to this downloader.
#[derive(Debug)]
pub enum MetadataEvent {
    Data {
        piece: u32,
        data: Bytes,
    },
    Reject {
        piece: u32,
    },
}

/// Controller-side handle; dropping `event_tx` ends the task.
pub struct InfoDownload {
    pub event_tx: mpsc::Sender<MetadataEvent>,
    pub task: JoinHandle<()>,
}

/// Starts a metadata download from one peer.
///
/// `ut_metadata` is the peer's advertised message id, `total_size` the
/// metadata size from its extension handshake.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    peer: PeerId,
    peer_cmd: mpsc::Sender<PeerCommand>,
    ut_metadata: u8,
    total_size: u32,
    info_hash: [u8; 20],
    queue_length: usize,
    snub_timeout: Duration,
    result_tx: mpsc::Sender<InfoDownloadMessage>,
) -> InfoDownload {
    let (event_tx, event_rx) = mpsc::channel(16);
    let task = tokio::spawn(run(
        peer,
        peer_cmd,
        ut_metadata,
        total_size,
        info_hash,
        queue_length,
        snub_timeout,
        result_tx,
        event_rx,
    ));
    InfoDownload { event_tx, task }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    peer: PeerId,
    peer_cmd: mpsc::Sender<PeerCommand>,
    ut_metadata: u8,
    total_size: u32,
    info_hash: [u8; 20],
    queue_length: usize,
    snub_timeout: Duration,
    result_tx: mpsc::Sender<InfoDownloadMessage>,
    mut event_rx: mpsc::Receiver<MetadataEvent>,
) {
    let piece_count = metadata_piece_count(total_size);
    let mut blob = vec![0u8; total_size as usize];
    let mut received = vec![false; piece_count as usize];
    let mut next_request = 0u32;
    let mut outstanding = 0usize;
    let mut snub_deadline = Instant::now() + snub_timeout;
    let mut snub_reported = false;

    loop {
        while outstanding < queue_length && next_request < piece_count {
            let request = MetadataMessage::Request {
                piece: next_request,
            };
            let msg = Message::Extended {
                id: ut_metadata,
                payload: request.encode(),
            };
            if peer_cmd.send(PeerCommand::Send(msg)).await.is_err() {
                let _ = result_tx.send(InfoDownloadMessage::Failed { peer }).await;
                return;
            }
            outstanding += 1;
            next_request += 1;
        }

        tokio::select! {
            event = event_rx.recv() => match event {
                Some(MetadataEvent::Data { piece, data }) => {
                    if piece >= piece_count
                        || data.len() != expected_len(piece, piece_count, total_size)
                    {
                        debug!(?peer, piece, "bogus metadata piece");
                        let _ = result_tx.send(InfoDownloadMessage::Failed { peer }).await;
                        return;
                    }
                    let start = piece as usize * METADATA_PIECE_SIZE;
                    blob[start..start + data.len()].copy_from_slice(&data);
                    if !received[piece as usize] {
                        received[piece as usize] = true;
                        outstanding = outstanding.saturating_sub(1);
                    }
                    snub_deadline = Instant::now() + snub_timeout;
                    snub_reported = false;

                    if received.iter().all(|r| *r) {
                        let digest: [u8; 20] = Sha1::digest(&blob).into();
                        let message = if digest == info_hash {
                            InfoDownloadMessage::Done {
                                peer,
                                info_bytes: Bytes::from(blob),
                            }
                        } else {
                            debug!(?peer, "metadata hash mismatch");
                            InfoDownloadMessage::Failed { peer }
                        };
                        let _ = result_tx.send(message).await;
                        return;
                    }
                }
                Some(MetadataEvent::Reject { piece }) => {
                    debug!(?peer, piece, "metadata request rejected");
                    let _ = result_tx.send(InfoDownloadMessage::Failed { peer }).await;
                    return;
                }
                None => return,
            },
            _ = tokio::time::sleep_until(snub_deadline), if !snub_reported => {
                snub_reported = true;
                if result_tx.send(InfoDownloadMessage::Snubbed { peer }).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn expected_len(piece: u32, piece_count: u32, total_size: u32) -> usize {
    if piece + 1 == piece_count {
        total_size as usize - piece as usize * METADATA_PIECE_SIZE
    } else {
        METADATA_PIECE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::InfoHash;

    fn fake_info_blob() -> (Vec<u8>, [u8; 20]) {
        let blob = vec![0x5au8; METADATA_PIECE_SIZE + 100];
        let hash = *InfoHash::from_info_bytes(&blob).as_bytes();
        (blob, hash)
    }

    async fn requested_piece(cmd_rx: &mut mpsc::Receiver<PeerCommand>) -> u32 {
        match cmd_rx.recv().await.unwrap() {
            PeerCommand::Send(Message::Extended { id, payload }) => {
                assert_eq!(id, 9);
                match MetadataMessage::decode(&payload).unwrap() {
                    MetadataMessage::Request { piece } => piece,
                    other => panic!("unexpected metadata message: {:?}", other),
                }
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn assembles_and_verifies_blob() {
        let (blob, hash) = fake_info_blob();
        let (cmd_tx, mut cmd_rx) = mpsc::channel(32);
        let (result_tx, mut result_rx) = mpsc::channel(8);
        let peer = PeerId::generate();

        let dl = spawn(
            peer,
            cmd_tx,
            9,
            blob.len() as u32,
            hash,
            4,
            Duration::from_secs(60),
            result_tx,
        );

        assert_eq!(requested_piece(&mut cmd_rx).await, 0);
        assert_eq!(requested_piece(&mut cmd_rx).await, 1);

        // deliver out of order
        dl.event_tx
            .send(MetadataEvent::Data {
                piece: 1,
                data: Bytes::copy_from_slice(&blob[METADATA_PIECE_SIZE..]),
            })
            .await
            .unwrap();
        dl.event_tx
            .send(MetadataEvent::Data {
                piece: 0,
                data: Bytes::copy_from_slice(&blob[..METADATA_PIECE_SIZE]),
            })
            .await
            .unwrap();

        match result_rx.recv().await.unwrap() {
            InfoDownloadMessage::Done { peer: p, info_bytes } => {
                assert_eq!(p, peer);
                assert_eq!(info_bytes.as_ref(), blob.as_slice());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn wrong_hash_fails() {
        let (blob, _) = fake_info_blob();
        let (cmd_tx, _cmd_rx) = mpsc::channel(32);
        let (result_tx, mut result_rx) = mpsc::channel(8);
        let peer = PeerId::generate();

        let dl = spawn(
            peer,
            cmd_tx,
            9,
            blob.len() as u32,
            [0xee; 20], // not the blob's hash
            4,
            Duration::from_secs(60),
            result_tx,
        );
        dl.event_tx
            .send(MetadataEvent::Data {
                piece: 0,
                data: Bytes::copy_from_slice(&blob[..METADATA_PIECE_SIZE]),
            })
            .await
            .unwrap();
        dl.event_tx
            .send(MetadataEvent::Data {
                piece: 1,
                data: Bytes::copy_from_slice(&blob[METADATA_PIECE_SIZE..]),
            })
            .await
            .unwrap();

        assert!(matches!(
            result_rx.recv().await.unwrap(),
            InfoDownloadMessage::Failed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_peer_is_reported_snubbed_once() {
        let (blob, hash) = fake_info_blob();
        let (cmd_tx, _cmd_rx) = mpsc::channel(32);
        let (result_tx, mut result_rx) = mpsc::channel(8);
        let peer = PeerId::generate();

        let _dl = spawn(
            peer,
            cmd_tx,
            9,
            blob.len() as u32,
            hash,
            4,
            Duration::from_secs(60),
            result_tx,
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(
            result_rx.recv().await.unwrap(),
            InfoDownloadMessage::Snubbed { peer: p } if p == peer
        ));
        // no repeat while the peer stays quiet
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(result_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reject_fails_the_download() {
        let (blob, hash) = fake_info_blob();
        let (cmd_tx, _cmd_rx) = mpsc::channel(32);
        let (result_tx, mut result_rx) = mpsc::channel(8);
        let peer = PeerId::generate();

        let dl = spawn(
            peer,
            cmd_tx,
            9,
            blob.len() as u32,
            hash,
            4,
            Duration::from_secs(60),
            result_tx,
        );
        dl.event_tx
            .send(MetadataEvent::Reject { piece: 0 })
            .await
            .unwrap();
        assert!(matches!(
            result_rx.recv().await.unwrap(),
            InfoDownloadMessage::Failed { .. }
        ));
    }
}

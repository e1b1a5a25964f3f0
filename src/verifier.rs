//! Initial hash verification.
//!
//! On start with an info but no bitfield, the verifier reads every piece
//! from storage, hashes it, and produces the possession bitfield. Hash
//! mismatches mark the piece absent; an I/O error is fatal for the
//! torrent.

use std::sync::Arc;

use sha1::{Digest, Sha1};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::metainfo::Info;
use crate::peer::Bitfield;
use crate::storage::{Storage, StorageError};

#[derive(Debug)]
pub enum VerifierMessage {
    /// A piece was hashed; `checked` counts from 1.
    Progress { checked: u32 },
    Done(Result<Bitfield, StorageError>),
}

/// Starts the verifier task. It reads pieces sequentially off the
/// runtime's blocking pool and reports on `tx`; flipping `stop` abandons
/// the scan without a result.
pub fn spawn(
    storage: Arc<Storage>,
    info: Arc<Info>,
    tx: mpsc::Sender<VerifierMessage>,
    stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || run(&storage, &info, &tx, &stop))
}

fn run(
    storage: &Storage,
    info: &Info,
    tx: &mpsc::Sender<VerifierMessage>,
    stop: &watch::Receiver<bool>,
) {
    let piece_count = info.piece_count();
    let mut bitfield = Bitfield::new(piece_count);
    let mut buf = vec![0u8; info.piece_length as usize];

    for index in 0..piece_count {
        if *stop.borrow() {
            return;
        }
        let len = info.piece_length_at(index) as usize;
        if let Err(err) = storage.read_at(info.piece_offset(index), &mut buf[..len]) {
            let _ = tx.blocking_send(VerifierMessage::Done(Err(err)));
            return;
        }
        let digest: [u8; 20] = Sha1::digest(&buf[..len]).into();
        if digest == info.piece_hash(index) {
            bitfield.set(index);
        } else {
            debug!(piece = index, "hash mismatch, marking absent");
        }
        if tx
            .blocking_send(VerifierMessage::Progress { checked: index + 1 })
            .is_err()
        {
            return;
        }
    }
    let _ = tx.blocking_send(VerifierMessage::Done(Ok(bitfield)));
}

//! Storage pre-allocation.
//!
//! Before anything touches disk, the allocator creates or extends every
//! backing file to the exact length the info dictionary declares. The
//! operation is idempotent, so restarted sessions pass through it
//! unchanged.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::storage::{Storage, StorageError};

#[derive(Debug)]
pub enum AllocatorMessage {
    /// Cumulative bytes laid out so far.
    Progress { bytes: u64 },
    Done(Result<(), StorageError>),
}

/// Starts the allocator task on the runtime's blocking pool.
pub fn spawn(
    storage: Arc<Storage>,
    tx: mpsc::Sender<AllocatorMessage>,
    stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || run(&storage, &tx, &stop))
}

fn run(storage: &Storage, tx: &mpsc::Sender<AllocatorMessage>, stop: &watch::Receiver<bool>) {
    let mut bytes = 0u64;
    for index in 0..storage.file_count() {
        if *stop.borrow() {
            return;
        }
        match storage.allocate_file(index) {
            Ok(len) => bytes += len,
            Err(err) => {
                let _ = tx.blocking_send(AllocatorMessage::Done(Err(err)));
                return;
            }
        }
        if tx
            .blocking_send(AllocatorMessage::Progress { bytes })
            .is_err()
        {
            return;
        }
    }
    let _ = tx.blocking_send(AllocatorMessage::Done(Ok(())));
}

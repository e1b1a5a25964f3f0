//! Inbound connection intake.
//!
//! The controller binds the listener (so the resolved port is known
//! before announcers start) and hands it to the acceptor task. Each
//! accepted socket gets a handshake worker; a bounded number may run at
//! once and connections beyond that are dropped on the floor rather than
//! queued.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::peer::{handshake_incoming, ConnectedPeer, PeerId};

/// Starts the acceptor on an already-bound listener.
pub fn spawn(
    listener: TcpListener,
    info_hash: [u8; 20],
    local_id: PeerId,
    max_accept: usize,
    incoming_tx: mpsc::Sender<ConnectedPeer>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            info!("listening for peers on tcp://{}", addr);
        }
        let workers = Arc::new(Semaphore::new(max_accept));
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = stop.changed() => return,
            };
            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    debug!(%err, "accept failed");
                    continue;
                }
            };
            let Ok(permit) = Arc::clone(&workers).try_acquire_owned() else {
                debug!(%addr, "handshake workers saturated, dropping connection");
                continue;
            };
            let incoming_tx = incoming_tx.clone();
            tokio::spawn(async move {
                match handshake_incoming(stream, info_hash, local_id).await {
                    Ok(peer) => {
                        let _ = incoming_tx.send(peer).await;
                    }
                    Err(err) => debug!(%addr, %err, "inbound handshake failed"),
                }
                drop(permit);
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::handshake_outgoing;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn accepted_peer_is_delivered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [9u8; 20];
        let local = PeerId::generate();
        let remote = PeerId::generate();

        let (incoming_tx, mut incoming_rx) = mpsc::channel(4);
        let (_stop_tx, stop_rx) = watch::channel(false);
        spawn(listener, info_hash, local, 4, incoming_tx, stop_rx);

        let out = handshake_outgoing(addr, info_hash, remote).await.unwrap();
        assert_eq!(out.id, local);
        let peer = incoming_rx.recv().await.unwrap();
        assert_eq!(peer.id, remote);
    }

    #[tokio::test]
    async fn saturated_acceptor_drops_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (incoming_tx, _incoming_rx) = mpsc::channel(4);
        let (_stop_tx, stop_rx) = watch::channel(false);
        spawn(listener, [9u8; 20], PeerId::generate(), 1, incoming_tx, stop_rx);

        // occupies the only handshake slot by never handshaking
        let _stalled = tokio::net::TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // the next connection is closed immediately
        let mut dropped = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), dropped.read(&mut buf)).await;
        assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));
    }
}

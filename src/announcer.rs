//! Announce scheduling.
//!
//! One periodical announcer per tracker drives the started/periodic/
//! completed announces on the tracker's interval, floored by
//! configuration, with exponential backoff on failure. A detached
//! stopped-event announcer delivers the final `stopped` on a short
//! deadline after the session shuts down, independent of the controller.
//! The DHT announcer drives a caller-supplied node on a fixed schedule.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::constants::{
    STOPPED_ANNOUNCE_TIMEOUT, TRACKER_BACKOFF_BASE, TRACKER_BACKOFF_MAX,
    TRACKER_FALLBACK_INTERVAL,
};
use crate::peer::PeerId;
use crate::tracker::{AnnounceParams, Tracker, TrackerEvent};

/// Transfer counters shared between the controller (writer) and the
/// announcers (readers at announce time).
#[derive(Debug, Default)]
pub struct TransferStats {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    left: AtomicU64,
}

impl TransferStats {
    pub fn new(left: u64) -> Self {
        Self {
            left: AtomicU64::new(left),
            ..Default::default()
        }
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set_left(&self, bytes: u64) {
        self.left.store(bytes, Ordering::Relaxed);
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn left(&self) -> u64 {
        self.left.load(Ordering::Relaxed)
    }
}

/// Exponential retry backoff with a ceiling.
struct Backoff {
    attempt: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { attempt: 0 }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next(&mut self) -> Duration {
        let delay = TRACKER_BACKOFF_BASE
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(TRACKER_BACKOFF_MAX);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }
}

/// The delay until the next announce: the tracker's value (or a fallback
/// when it sent none), never below the configured floor.
fn effective_interval(tracker_interval: Option<Duration>, config_min: Duration) -> Duration {
    tracker_interval
        .unwrap_or(TRACKER_FALLBACK_INTERVAL)
        .max(config_min)
}

/// Static identity of the announced torrent.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceIdentity {
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
    pub port: u16,
    pub num_want: i32,
}

impl AnnounceIdentity {
    fn params(&self, stats: &TransferStats, event: TrackerEvent) -> AnnounceParams {
        AnnounceParams {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: stats.uploaded(),
            downloaded: stats.downloaded(),
            left: stats.left(),
            event,
            num_want: self.num_want,
        }
    }
}

/// Starts the periodical announcer for one tracker.
///
/// Sends `started` first, then periodic announces on the effective
/// interval; flipping `completed` triggers one `completed` announce.
/// Returned peer addresses go to `addrs_tx`. Ends when `stop` flips.
pub fn spawn_periodical(
    mut tracker: Tracker,
    identity: AnnounceIdentity,
    min_interval: Duration,
    stats: Arc<TransferStats>,
    mut completed: watch::Receiver<bool>,
    addrs_tx: mpsc::Sender<Vec<SocketAddr>>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = Backoff::new();
        let mut event = TrackerEvent::Started;
        let mut completed_sent = *completed.borrow();

        loop {
            let params = identity.params(&stats, event);
            let delay = match tracker.announce(&params).await {
                Ok(response) => {
                    debug!(
                        url = tracker.url(),
                        peers = response.peers.len(),
                        "announce ok"
                    );
                    if !response.peers.is_empty() {
                        let _ = addrs_tx.send(response.peers).await;
                    }
                    backoff.reset();
                    event = TrackerEvent::None;
                    effective_interval(response.interval, min_interval)
                }
                Err(err) => {
                    warn!(url = tracker.url(), %err, "announce failed");
                    backoff.next()
                }
            };

            tokio::select! {
                _ = sleep(delay) => {}
                changed = completed.changed() => {
                    if changed.is_ok() && *completed.borrow() && !completed_sent {
                        completed_sent = true;
                        event = TrackerEvent::Completed;
                        continue;
                    }
                    if changed.is_err() {
                        // session gone; wait for the stop signal
                        let _ = stop.changed().await;
                        return;
                    }
                }
                _ = stop.changed() => return,
            }
        }
    })
}

/// Fires one best-effort `stopped` announce at every tracker, each under
/// its own deadline. Detached from the controller: it outlives `stop`.
pub fn spawn_stopped(
    tracker_urls: Vec<String>,
    identity: AnnounceIdentity,
    stats: Arc<TransferStats>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tasks = Vec::new();
        for url in tracker_urls {
            let params = identity.params(&stats, TrackerEvent::Stopped);
            tasks.push(tokio::spawn(async move {
                let Ok(mut tracker) = Tracker::new(&url) else {
                    return;
                };
                match timeout(STOPPED_ANNOUNCE_TIMEOUT, tracker.announce(&params)).await {
                    Ok(Ok(_)) => debug!(%url, "stopped announce delivered"),
                    Ok(Err(err)) => debug!(%url, %err, "stopped announce failed"),
                    Err(_) => debug!(%url, "stopped announce timed out"),
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    })
}

/// A caller-supplied DHT node. The engine only announces; peer addresses
/// come back through the session's external peer input.
pub trait DhtNode: Send + Sync {
    fn announce(&self, info_hash: [u8; 20], port: u16);
}

/// Drives `dht.announce` every `interval`, never more often than
/// `min_interval`.
pub fn spawn_dht(
    dht: Arc<dyn DhtNode>,
    info_hash: [u8; 20],
    port: u16,
    interval: Duration,
    min_interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let delay = interval.max(min_interval);
    tokio::spawn(async move {
        loop {
            dht.announce(info_hash, port);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = stop.changed() => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn interval_respects_config_floor() {
        let min = Duration::from_secs(60);
        assert_eq!(
            effective_interval(Some(Duration::from_secs(1800)), min),
            Duration::from_secs(1800)
        );
        assert_eq!(effective_interval(Some(Duration::from_secs(5)), min), min);
        assert_eq!(
            effective_interval(None, min),
            TRACKER_FALLBACK_INTERVAL.max(min)
        );
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff::new();
        let first = backoff.next();
        let second = backoff.next();
        assert_eq!(first, TRACKER_BACKOFF_BASE);
        assert_eq!(second, TRACKER_BACKOFF_BASE * 2);
        for _ in 0..20 {
            assert!(backoff.next() <= TRACKER_BACKOFF_MAX);
        }
        backoff.reset();
        assert_eq!(backoff.next(), TRACKER_BACKOFF_BASE);
    }

    /// Serves HTTP announce requests, recording each query string.
    async fn scripted_tracker(
        queries: Arc<parking_lot::Mutex<Vec<String>>>,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let queries = Arc::clone(&queries);
                tokio::spawn(async move {
                    let mut req = Vec::new();
                    let mut byte = [0u8; 1];
                    while !req.ends_with(b"\r\n\r\n") {
                        if stream.read_exact(&mut byte).await.is_err() {
                            return;
                        }
                        req.push(byte[0]);
                    }
                    let line = String::from_utf8_lossy(&req);
                    let query = line
                        .lines()
                        .next()
                        .and_then(|l| l.split_whitespace().nth(1))
                        .unwrap_or_default()
                        .to_string();
                    queries.lock().push(query);
                    let body = b"d8:intervali1800e5:peers6:\x7f\x00\x00\x01\x1a\xe1e";
                    let head = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                        body.len()
                    );
                    let _ = stream.write_all(head.as_bytes()).await;
                    let _ = stream.write_all(body).await;
                });
            }
        });
        format!("http://{}/announce", addr)
    }

    fn identity() -> AnnounceIdentity {
        AnnounceIdentity {
            info_hash: [1; 20],
            peer_id: PeerId::generate(),
            port: 6881,
            num_want: 50,
        }
    }

    #[tokio::test]
    async fn periodical_sends_started_and_surfaces_peers() {
        let queries = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let url = scripted_tracker(Arc::clone(&queries)).await;

        let (addrs_tx, mut addrs_rx) = mpsc::channel(8);
        let (_completed_tx, completed_rx) = watch::channel(false);
        let (stop_tx, stop_rx) = watch::channel(false);
        let tracker = Tracker::new(&url).unwrap();

        spawn_periodical(
            tracker,
            identity(),
            Duration::from_secs(60),
            Arc::new(TransferStats::new(1000)),
            completed_rx,
            addrs_tx,
            stop_rx,
        );

        let addrs = addrs_rx.recv().await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:6881".parse().unwrap()]);
        assert!(queries.lock()[0].contains("event=started"));
        assert!(queries.lock()[0].contains("left=1000"));
        let _ = stop_tx.send(true);
    }

    #[tokio::test]
    async fn stopped_announcer_reaches_every_tracker() {
        let queries = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let url_a = scripted_tracker(Arc::clone(&queries)).await;
        let url_b = scripted_tracker(Arc::clone(&queries)).await;

        spawn_stopped(
            vec![url_a, url_b, "udp://127.0.0.1:1".to_string()],
            identity(),
            Arc::new(TransferStats::new(0)),
        )
        .await
        .unwrap();

        let queries = queries.lock();
        assert_eq!(queries.len(), 2);
        assert!(queries.iter().all(|q| q.contains("event=stopped")));
    }

    #[tokio::test(start_paused = true)]
    async fn dht_announces_on_floored_interval() {
        struct Counting(AtomicUsize);
        impl DhtNode for Counting {
            fn announce(&self, _info_hash: [u8; 20], _port: u16) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dht = Arc::new(Counting(AtomicUsize::new(0)));
        let (_stop_tx, stop_rx) = watch::channel(false);
        spawn_dht(
            Arc::clone(&dht) as Arc<dyn DhtNode>,
            [0; 20],
            6881,
            Duration::from_secs(60),
            Duration::from_secs(300), // floor wins
            stop_rx,
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(dht.0.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(dht.0.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(dht.0.load(Ordering::SeqCst), 2);
    }
}

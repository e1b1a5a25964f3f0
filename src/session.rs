//! The per-torrent session controller.
//!
//! One [`TorrentSession`] owns all mutable state of one torrent and runs
//! it as a single event loop task. Workers (acceptor, announcers,
//! verifier, allocator, info/piece/webseed downloaders) run as separate
//! tasks and communicate with the loop exclusively through typed
//! channels; only the loop mutates torrent state.
//!
//! The loop moves through phases: a magnet session starts in
//! `AcquiringInfo` and downloads the info dictionary from peers, then
//! `Allocating` lays out storage, `Verifying` hashes what is on disk, and
//! `Downloading` runs the swarm until the torrent is complete and
//! `Seeding` begins. `stop` tears every worker down and returns the
//! machine to `Stopped`; the info and bitfield survive stop cycles and
//! restarts skip the phases they make redundant.

mod handlers;
mod start;
mod torrent;

#[cfg(test)]
mod tests;

pub use torrent::{Phase, SessionError, SessionOptions, SessionState, StartHandles, WebseedState};

use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot};

use crate::metainfo::{InfoHash, MagnetLink, Metainfo, MetainfoError};
use torrent::{Command, Torrent};

/// Handle to a running torrent session task.
///
/// Dropping the handle does not stop the torrent; call
/// [`TorrentSession::shutdown`] for that.
pub struct TorrentSession {
    cmd_tx: mpsc::Sender<Command>,
    info_hash: InfoHash,
}

impl TorrentSession {
    /// Builds a session and spawns its controller task.
    pub fn new(options: SessionOptions) -> Self {
        let info_hash = options.info_hash;
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let torrent = Torrent::new(options, cmd_rx);
        tokio::spawn(torrent.run());
        Self { cmd_tx, info_hash }
    }

    /// Session for a parsed `.torrent` file.
    pub fn from_metainfo(
        metainfo: Metainfo,
        data_dir: impl Into<std::path::PathBuf>,
        config: crate::config::Config,
    ) -> Self {
        let options = SessionOptions {
            info_hash: metainfo.info_hash(),
            info: Some(metainfo.info),
            trackers: metainfo.trackers,
            webseed_urls: metainfo.webseed_urls,
            data_dir: data_dir.into(),
            config,
            ..Default::default()
        };
        Self::new(options)
    }

    /// Session for a magnet link; starts without the info dictionary.
    pub fn from_magnet(
        uri: &str,
        data_dir: impl Into<std::path::PathBuf>,
        config: crate::config::Config,
    ) -> Result<Self, MetainfoError> {
        let magnet = MagnetLink::parse(uri)?;
        let options = SessionOptions {
            info_hash: magnet.info_hash,
            trackers: magnet.trackers,
            webseed_urls: magnet.webseed_urls,
            data_dir: data_dir.into(),
            config,
            ..Default::default()
        };
        Ok(Self::new(options))
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Starts the torrent. Returns the listen port (when a listener could
    /// be bound this cycle) and a one-shot error channel that yields
    /// `Ok(())` on clean stop or the fatal error otherwise. Starting an
    /// already-started session changes nothing and returns no new error
    /// channel.
    pub async fn start(&self) -> StartHandles {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Start { reply: reply_tx }).await;
        reply_rx.await.unwrap_or(StartHandles {
            port: None,
            err: None,
        })
    }

    /// Stops the torrent: workers are signaled, a detached announcer
    /// delivers the `stopped` event, and the machine returns to
    /// `Stopped`.
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop).await;
    }

    /// Feeds externally discovered peer addresses (e.g. from the DHT
    /// node's lookups) into the session.
    pub async fn add_peers(&self, addrs: Vec<SocketAddr>) {
        let _ = self.cmd_tx.send(Command::AddPeers(addrs)).await;
    }

    /// A snapshot of the session's current state.
    pub async fn state(&self) -> Option<SessionState> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::State { reply: reply_tx })
            .await
            .ok()?;
        reply_rx.await.ok()
    }

    /// Stops the torrent and ends the controller task.
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }
}

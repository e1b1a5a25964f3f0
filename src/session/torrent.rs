use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Interval;
use tracing::{debug, info, warn};

use crate::allocator::AllocatorMessage;
use crate::announcer::{DhtNode, TransferStats};
use crate::config::Config;
use crate::constants::{PEER_EVENT_CHANNEL_SIZE, SESSION_TICK_INTERVAL, WORKER_CHANNEL_SIZE};
use crate::infodownloader::{InfoDownload, InfoDownloadMessage};
use crate::metainfo::{Info, InfoHash, MetainfoError};
use crate::peer::{Bitfield, ConnectedPeer, PeerCommand, PeerEvent, PeerId};
use crate::picker::PiecePicker;
use crate::piecedownloader::{PieceDownload, PieceDownloadMessage};
use crate::pool::PiecePool;
use crate::ram::RamBroker;
use crate::storage::{Storage, StorageError};
use crate::verifier::VerifierMessage;
use crate::webseed::WebseedMessage;

/// The session's lifecycle phase. Transitions are monotonic within one
/// start cycle; `stop` returns the machine to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Stopping,
    AcquiringInfo,
    Allocating,
    Verifying,
    Downloading,
    Seeding,
}

/// Faults that end a start cycle. Everything else is recovered locally.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid metadata: {0}")]
    Metainfo(#[from] MetainfoError),
}

/// Construction parameters for a [`crate::session::TorrentSession`].
pub struct SessionOptions {
    pub info_hash: InfoHash,
    /// Known info dictionary; `None` starts the session in
    /// [`Phase::AcquiringInfo`].
    pub info: Option<Info>,
    pub trackers: Vec<String>,
    pub webseed_urls: Vec<String>,
    pub data_dir: PathBuf,
    pub config: Config,
    pub dht: Option<Arc<dyn DhtNode>>,
    /// Process-wide piece buffer pool shared across sessions.
    pub pool: Arc<PiecePool>,
    /// A previously persisted bitfield; skips verification after
    /// allocation.
    pub resume_bitfield: Option<Bitfield>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            info_hash: InfoHash::from_bytes([0; 20]),
            info: None,
            trackers: Vec::new(),
            webseed_urls: Vec::new(),
            data_dir: PathBuf::from("."),
            config: Config::default(),
            dht: None,
            pool: Arc::new(PiecePool::new()),
            resume_bitfield: None,
        }
    }
}

/// Result of a start request.
#[derive(Debug)]
pub struct StartHandles {
    /// The bound listen port, when a listener exists this cycle.
    pub port: Option<u16>,
    /// Yields `Ok(())` on clean stop or the fatal error, exactly once.
    /// `None` when the session was already started.
    pub err: Option<oneshot::Receiver<Result<(), SessionError>>>,
}

/// Observable snapshot for embedders.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: Phase,
    pub peer_count: usize,
    pub interested_peers: usize,
    pub snubbed_peers: usize,
    pub missing_pieces: Option<u32>,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub last_error: Option<String>,
    pub webseeds: Vec<WebseedState>,
    /// The bencoded info dictionary, once known. Survives stop cycles;
    /// persist it to resume magnet sessions without re-downloading.
    pub info_bytes: Option<Bytes>,
    /// The verified possession bitfield, once known. Survives stop
    /// cycles; persist it to skip verification on a later start.
    pub bitfield: Option<Bitfield>,
}

/// One webseed source's state in a [`SessionState`] snapshot.
#[derive(Debug, Clone)]
pub struct WebseedState {
    pub url: String,
    pub downloading: bool,
    pub disabled: bool,
    pub last_error: Option<String>,
}

pub(super) enum Command {
    Start { reply: oneshot::Sender<StartHandles> },
    Stop,
    AddPeers(Vec<SocketAddr>),
    State { reply: oneshot::Sender<SessionState> },
    Shutdown,
}

/// One connected peer, keyed by its 20-byte id.
pub(super) struct Peer {
    pub addr: SocketAddr,
    pub cmd_tx: mpsc::Sender<PeerCommand>,
    /// Remote bitfield; materialized once the piece count is known.
    pub bits: Option<Bitfield>,
    pub pending_bitfield: Option<Bytes>,
    pub pending_haves: Vec<u32>,
    pub have_all: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub am_choking: bool,
    pub am_interested: bool,
    pub downloading: bool,
    pub snubbed: bool,
    pub supports_extension: bool,
    pub supports_fast: bool,
    /// Pieces the peer allows us to request while choked.
    pub allowed_fast: HashSet<u32>,
    /// Pieces we allow the peer to request while choked.
    pub allowed_fast_outgoing: HashSet<u32>,
    /// The peer's ut_metadata message id, from its extension handshake.
    pub ut_metadata: Option<u8>,
    pub metadata_size: Option<u32>,
    pub metadata_failed: bool,
    /// Guard for a queued RAM request; dropping it cancels the entry.
    pub ram_cancel: Option<oneshot::Sender<()>>,
}

impl Peer {
    pub fn new(
        addr: SocketAddr,
        supports_extension: bool,
        supports_fast: bool,
        cmd_tx: mpsc::Sender<PeerCommand>,
    ) -> Self {
        Self {
            addr,
            cmd_tx,
            bits: None,
            pending_bitfield: None,
            pending_haves: Vec::new(),
            have_all: false,
            peer_choking: true,
            peer_interested: false,
            am_choking: true,
            am_interested: false,
            downloading: false,
            snubbed: false,
            supports_extension,
            supports_fast,
            allowed_fast: HashSet::new(),
            allowed_fast_outgoing: HashSet::new(),
            ut_metadata: None,
            metadata_size: None,
            metadata_failed: false,
            ram_cancel: None,
        }
    }

    /// The remote bitfield, building it from pre-info messages on first
    /// use once `piece_count` is known.
    pub fn bits_mut(&mut self, piece_count: u32) -> &mut Bitfield {
        if self.bits.is_none() {
            let mut bits = if self.have_all {
                let mut all = Bitfield::new(piece_count);
                all.set_all();
                all
            } else if let Some(raw) = self.pending_bitfield.take() {
                Bitfield::from_bytes(&raw, piece_count).unwrap_or_else(|| {
                    debug!("discarding malformed pre-info bitfield");
                    Bitfield::new(piece_count)
                })
            } else {
                Bitfield::new(piece_count)
            };
            for index in self.pending_haves.drain(..) {
                bits.set(index);
            }
            self.bits = Some(bits);
        }
        self.bits.as_mut().expect("just materialized")
    }
}

/// Where a pending storage write came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum WriteSource {
    Peer,
    Webseed,
}

#[derive(Debug)]
pub(super) struct WriteResult {
    pub index: u32,
    pub source: WriteSource,
    pub result: Result<(), StorageError>,
}

/// Per-start-cycle runtime state. Dropping it closes every worker
/// channel, which is how workers learn the cycle ended.
pub(super) struct Running {
    pub stop_tx: watch::Sender<bool>,
    pub err_tx: Option<oneshot::Sender<Result<(), SessionError>>>,
    pub completed_tx: watch::Sender<bool>,
    pub port: Option<u16>,

    pub peers: HashMap<PeerId, Peer>,
    pub known_addrs: HashSet<SocketAddr>,
    pub picker: Option<PiecePicker>,
    pub ram: RamBroker,
    pub piece_downloads: HashMap<PeerId, PieceDownload>,
    pub info_downloads: HashMap<PeerId, InfoDownload>,
    pub info_downloads_snubbed: HashSet<PeerId>,
    pub writing: HashSet<u32>,
    pub verifier_running: bool,
    pub allocator_running: bool,
    pub acceptor_running: bool,
    pub announcers_running: bool,

    pub peer_event_tx: mpsc::Sender<(PeerId, PeerEvent)>,
    pub peer_event_rx: mpsc::Receiver<(PeerId, PeerEvent)>,
    pub incoming_tx: mpsc::Sender<ConnectedPeer>,
    pub incoming_rx: mpsc::Receiver<ConnectedPeer>,
    pub addrs_tx: mpsc::Sender<Vec<SocketAddr>>,
    pub addrs_rx: mpsc::Receiver<Vec<SocketAddr>>,
    pub verifier_tx: mpsc::Sender<VerifierMessage>,
    pub verifier_rx: mpsc::Receiver<VerifierMessage>,
    pub allocator_tx: mpsc::Sender<AllocatorMessage>,
    pub allocator_rx: mpsc::Receiver<AllocatorMessage>,
    pub piece_result_tx: mpsc::Sender<PieceDownloadMessage>,
    pub piece_result_rx: mpsc::Receiver<PieceDownloadMessage>,
    pub info_result_tx: mpsc::Sender<InfoDownloadMessage>,
    pub info_result_rx: mpsc::Receiver<InfoDownloadMessage>,
    pub webseed_tx: mpsc::Sender<WebseedMessage>,
    pub webseed_rx: mpsc::Receiver<WebseedMessage>,
    pub ram_notify_tx: mpsc::Sender<PeerId>,
    pub ram_notify_rx: mpsc::Receiver<PeerId>,
    pub write_tx: mpsc::Sender<WriteResult>,
    pub write_rx: mpsc::Receiver<WriteResult>,
    pub tick: Interval,
}

impl Running {
    fn new(config: &Config) -> Self {
        let (peer_event_tx, peer_event_rx) = mpsc::channel(PEER_EVENT_CHANNEL_SIZE);
        let (incoming_tx, incoming_rx) = mpsc::channel(WORKER_CHANNEL_SIZE);
        let (addrs_tx, addrs_rx) = mpsc::channel(WORKER_CHANNEL_SIZE);
        let (verifier_tx, verifier_rx) = mpsc::channel(WORKER_CHANNEL_SIZE);
        let (allocator_tx, allocator_rx) = mpsc::channel(WORKER_CHANNEL_SIZE);
        let (piece_result_tx, piece_result_rx) = mpsc::channel(64);
        let (info_result_tx, info_result_rx) = mpsc::channel(WORKER_CHANNEL_SIZE);
        let (webseed_tx, webseed_rx) = mpsc::channel(WORKER_CHANNEL_SIZE);
        let (ram_notify_tx, ram_notify_rx) = mpsc::channel(WORKER_CHANNEL_SIZE);
        let (write_tx, write_rx) = mpsc::channel(64);
        Self {
            stop_tx: watch::channel(false).0,
            err_tx: None,
            completed_tx: watch::channel(false).0,
            port: None,
            peers: HashMap::new(),
            known_addrs: HashSet::new(),
            picker: None,
            ram: RamBroker::new(config.ram_budget),
            piece_downloads: HashMap::new(),
            info_downloads: HashMap::new(),
            info_downloads_snubbed: HashSet::new(),
            writing: HashSet::new(),
            verifier_running: false,
            allocator_running: false,
            acceptor_running: false,
            announcers_running: false,
            peer_event_tx,
            peer_event_rx,
            incoming_tx,
            incoming_rx,
            addrs_tx,
            addrs_rx,
            verifier_tx,
            verifier_rx,
            allocator_tx,
            allocator_rx,
            piece_result_tx,
            piece_result_rx,
            info_result_tx,
            info_result_rx,
            webseed_tx,
            webseed_rx,
            ram_notify_tx,
            ram_notify_rx,
            write_tx,
            write_rx,
            tick: tokio::time::interval(SESSION_TICK_INTERVAL),
        }
    }
}

/// One webseed source, kept across start cycles.
pub(super) struct WebseedSource {
    pub url: String,
    pub downloading: bool,
    pub disabled: bool,
    pub last_error: Option<String>,
    pub disabled_at: Option<tokio::time::Instant>,
}

/// The controller: single owner of all torrent state.
pub(super) struct Torrent {
    pub info_hash: InfoHash,
    pub local_id: PeerId,
    pub config: Config,
    pub data_dir: PathBuf,
    pub trackers: Vec<String>,
    pub dht: Option<Arc<dyn DhtNode>>,
    pub pool: Arc<PiecePool>,
    pub stats: Arc<TransferStats>,
    pub webseed_client: reqwest::Client,

    // Resumable state: survives stop cycles.
    pub info: Option<Arc<Info>>,
    pub storage: Option<Arc<Storage>>,
    pub allocated: bool,
    pub bitfield: Option<Bitfield>,
    pub resume_bitfield: Option<Bitfield>,
    pub webseed_sources: Vec<WebseedSource>,
    pub phase: Phase,
    pub last_error: Option<String>,

    pub running: Option<Running>,
    cmd_rx: mpsc::Receiver<Command>,
}

/// What woke the loop up; received first, handled with full ownership.
enum Wake {
    Command(Option<Command>),
    PeerEvent(PeerId, PeerEvent),
    Incoming(ConnectedPeer),
    Addrs(Vec<SocketAddr>),
    Verifier(VerifierMessage),
    Allocator(AllocatorMessage),
    PieceResult(PieceDownloadMessage),
    InfoResult(InfoDownloadMessage),
    Webseed(WebseedMessage),
    RamNotify(PeerId),
    WriteDone(WriteResult),
    Tick,
}

impl Torrent {
    pub fn new(options: SessionOptions, cmd_rx: mpsc::Receiver<Command>) -> Self {
        let info = options.info.map(Arc::new);
        let storage = info
            .as_ref()
            .map(|info| Arc::new(Storage::new(&options.data_dir, info)));
        let webseed_sources = options
            .webseed_urls
            .into_iter()
            .map(|url| WebseedSource {
                url,
                downloading: false,
                disabled: false,
                last_error: None,
                disabled_at: None,
            })
            .collect();
        Self {
            info_hash: options.info_hash,
            local_id: PeerId::generate(),
            config: options.config,
            data_dir: options.data_dir,
            trackers: options.trackers,
            dht: options.dht,
            pool: options.pool,
            stats: Arc::new(TransferStats::new(0)),
            webseed_client: reqwest::Client::new(),
            info,
            storage,
            allocated: false,
            bitfield: None,
            resume_bitfield: options.resume_bitfield,
            webseed_sources,
            phase: Phase::Stopped,
            last_error: None,
            running: None,
            cmd_rx,
        }
    }

    pub async fn run(mut self) {
        loop {
            let wake = match self.next_wake().await {
                Some(wake) => wake,
                None => break,
            };
            match wake {
                Wake::Command(None) => {
                    self.stop(None);
                    break;
                }
                Wake::Command(Some(cmd)) => {
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
                Wake::PeerEvent(peer, event) => self.handle_peer_event(peer, event),
                Wake::Incoming(connected) => self.handle_incoming(connected),
                Wake::Addrs(addrs) => self.handle_addrs(addrs),
                Wake::Verifier(msg) => self.handle_verifier(msg).await,
                Wake::Allocator(msg) => self.handle_allocator(msg).await,
                Wake::PieceResult(msg) => self.handle_piece_result(msg),
                Wake::InfoResult(msg) => self.handle_info_result(msg),
                Wake::Webseed(msg) => self.handle_webseed(msg),
                Wake::RamNotify(peer) => self.handle_ram_notify(peer),
                Wake::WriteDone(result) => self.handle_write_done(result),
                Wake::Tick => self.handle_tick(),
            }
        }
        debug!(info_hash = %self.info_hash, "session task ended");
    }

    /// Blocks on the multi-way select. `None` means the command channel
    /// closed while idle, i.e. the session handle is gone.
    async fn next_wake(&mut self) -> Option<Wake> {
        match self.running.as_mut() {
            None => match self.cmd_rx.recv().await {
                Some(cmd) => Some(Wake::Command(Some(cmd))),
                None => None,
            },
            Some(running) => {
                let wake = tokio::select! {
                    cmd = self.cmd_rx.recv() => Wake::Command(cmd),
                    Some((peer, event)) = running.peer_event_rx.recv() => {
                        Wake::PeerEvent(peer, event)
                    }
                    Some(connected) = running.incoming_rx.recv() => Wake::Incoming(connected),
                    Some(addrs) = running.addrs_rx.recv() => Wake::Addrs(addrs),
                    Some(msg) = running.verifier_rx.recv() => Wake::Verifier(msg),
                    Some(msg) = running.allocator_rx.recv() => Wake::Allocator(msg),
                    Some(msg) = running.piece_result_rx.recv() => Wake::PieceResult(msg),
                    Some(msg) = running.info_result_rx.recv() => Wake::InfoResult(msg),
                    Some(msg) = running.webseed_rx.recv() => Wake::Webseed(msg),
                    Some(peer) = running.ram_notify_rx.recv() => Wake::RamNotify(peer),
                    Some(result) = running.write_rx.recv() => Wake::WriteDone(result),
                    _ = running.tick.tick() => Wake::Tick,
                };
                Some(wake)
            }
        }
    }

    /// Returns false when the controller task should end.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Start { reply } => {
                let handles = self.start().await;
                let _ = reply.send(handles);
                true
            }
            Command::Stop => {
                self.stop(None);
                true
            }
            Command::AddPeers(addrs) => {
                self.handle_addrs(addrs);
                true
            }
            Command::State { reply } => {
                let _ = reply.send(self.snapshot());
                true
            }
            Command::Shutdown => {
                self.stop(None);
                false
            }
        }
    }

    fn snapshot(&self) -> SessionState {
        SessionState {
            phase: self.phase,
            peer_count: self.running.as_ref().map_or(0, |r| r.peers.len()),
            interested_peers: self
                .running
                .as_ref()
                .map_or(0, |r| r.peers.values().filter(|p| p.peer_interested).count()),
            snubbed_peers: self
                .running
                .as_ref()
                .map_or(0, |r| r.peers.values().filter(|p| p.snubbed).count()),
            missing_pieces: self
                .running
                .as_ref()
                .and_then(|r| r.picker.as_ref())
                .map(|p| p.missing_count())
                .or_else(|| {
                    self.bitfield
                        .as_ref()
                        .map(|bits| bits.len() - bits.count())
                }),
            uploaded: self.stats.uploaded(),
            downloaded: self.stats.downloaded(),
            left: self.stats.left(),
            last_error: self.last_error.clone(),
            webseeds: self
                .webseed_sources
                .iter()
                .map(|s| WebseedState {
                    url: s.url.clone(),
                    downloading: s.downloading,
                    disabled: s.disabled,
                    last_error: s.last_error.clone(),
                })
                .collect(),
            info_bytes: self.info.as_ref().map(|i| i.raw_bytes().clone()),
            bitfield: self.bitfield.clone(),
        }
    }

    /// Creates the run cycle state and routes into the entry set for the
    /// current (info, allocated, bitfield) combination.
    async fn start(&mut self) -> StartHandles {
        if let Some(running) = &self.running {
            return StartHandles {
                port: running.port,
                err: None,
            };
        }
        info!(info_hash = %self.info_hash, "starting torrent");
        self.last_error = None;

        let (err_tx, err_rx) = oneshot::channel();
        let mut running = Running::new(&self.config);
        running.err_tx = Some(err_tx);
        self.running = Some(running);

        self.route_start().await;

        StartHandles {
            port: self.running.as_ref().and_then(|r| r.port),
            err: Some(err_rx),
        }
    }

    /// Tears down the run cycle. With `error`, the cycle ends fatally and
    /// the error channel carries it; otherwise the stop is clean.
    pub(super) fn stop(&mut self, error: Option<SessionError>) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        self.phase = Phase::Stopping;
        info!(info_hash = %self.info_hash, "stopping torrent");

        let _ = running.stop_tx.send(true);

        // Close every peer connection; IO tasks exit when their command
        // channels drop with the `running` value below.
        for peer in running.peers.values() {
            let _ = peer.cmd_tx.try_send(PeerCommand::Close);
        }

        if running.announcers_running {
            crate::announcer::spawn_stopped(
                self.trackers.clone(),
                self.announce_identity(running.port.unwrap_or(0)),
                Arc::clone(&self.stats),
            );
        }

        if let Some(err_tx) = running.err_tx.take() {
            let result = match error {
                Some(err) => {
                    warn!(info_hash = %self.info_hash, %err, "torrent failed");
                    self.last_error = Some(err.to_string());
                    Err(err)
                }
                None => Ok(()),
            };
            let _ = err_tx.send(result);
        }

        for source in &mut self.webseed_sources {
            source.downloading = false;
        }

        drop(running);
        self.phase = Phase::Stopped;
    }

    pub(super) fn announce_identity(&self, port: u16) -> crate::announcer::AnnounceIdentity {
        crate::announcer::AnnounceIdentity {
            info_hash: *self.info_hash.as_bytes(),
            peer_id: self.local_id,
            port,
            num_want: self.config.tracker_num_want,
        }
    }

    /// Bytes still missing, from the possession bitfield.
    pub(super) fn left_bytes(&self) -> u64 {
        match (&self.info, &self.bitfield) {
            (Some(info), Some(bits)) => (0..info.piece_count())
                .filter(|i| !bits.has(*i))
                .map(|i| info.piece_length_at(i) as u64)
                .sum(),
            (Some(info), None) => info.total_length,
            _ => 0,
        }
    }
}

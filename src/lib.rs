//! torrid - a BitTorrent client engine
//!
//! The crate implements the per-torrent core of a BitTorrent client: a
//! single-owner session controller that coordinates peer connections,
//! metadata acquisition, piece selection, block downloads, webseeds, and
//! tracker/DHT announces. One process may run many [`TorrentSession`]s;
//! each is an independent event loop with its own worker tasks.
//!
//! # Modules
//!
//! - [`session`] - The torrent session controller and its phase machine
//! - [`picker`] - Rarest-first piece selection, endgame, webseed ranges
//! - [`ram`] - Byte-budgeted admission for in-flight piece buffers
//! - [`peer`] - BEP-3/6/9/10 wire protocol and per-peer I/O tasks
//! - [`tracker`] - BEP-3/15/23 HTTP and UDP tracker clients
//! - [`announcer`] - Announce scheduling, backoff, DHT driving
//! - [`webseed`] - BEP-19 HTTP range downloads
//! - [`metainfo`] - Torrent files, magnet links, info hashes
//! - [`bencode`] - BEP-3 bencode encoding/decoding
//! - [`storage`] - Multi-file positional disk I/O
//! - [`verifier`] / [`allocator`] - Initial hashing and file layout
//! - [`acceptor`] - Inbound connection intake
//! - [`pool`] - Process-wide piece buffer pool

pub mod acceptor;
pub mod allocator;
pub mod announcer;
pub mod bencode;
pub mod config;
mod constants;
pub mod infodownloader;
pub mod metainfo;
pub mod peer;
pub mod picker;
pub mod piecedownloader;
pub mod pool;
pub mod ram;
pub mod session;
pub mod storage;
pub mod tracker;
pub mod verifier;
pub mod webseed;

pub use announcer::{DhtNode, TransferStats};
pub use bencode::{decode, encode, BencodeError, Value};
pub use config::Config;
pub use metainfo::{Info, InfoHash, MagnetLink, Metainfo, MetainfoError};
pub use peer::{Bitfield, Message, PeerError, PeerId};
pub use picker::{PiecePick, PiecePicker, WebseedSpec};
pub use pool::PiecePool;
pub use ram::RamBroker;
pub use session::{
    Phase, SessionError, SessionOptions, SessionState, StartHandles, TorrentSession, WebseedState,
};
pub use storage::{Storage, StorageError};
pub use tracker::{AnnounceParams, AnnounceResponse, Tracker, TrackerError, TrackerEvent};

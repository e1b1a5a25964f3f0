//! Protocol constants and default tuning parameters.
//!
//! Session-level knobs live in [`crate::config::Config`]; the defaults
//! collected here follow the values common BitTorrent clients ship with.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style).
pub const CLIENT_PREFIX: &str = "-TD0001-";

// ============================================================================
// Block and piece sizes
// ============================================================================

/// Standard block size (16 KiB). The last block of a piece may be shorter.
pub const BLOCK_SIZE: u32 = 16384;

/// Maximum request length we accept from a peer (BEP-3 clients use 128 KiB).
pub const MAX_REQUEST_LENGTH: u32 = 131072;

/// Metadata extension piece size (BEP-9).
pub const METADATA_PIECE_SIZE: usize = 16384;

/// Maximum metadata blob size we will assemble (1 MiB).
pub const MAX_METADATA_SIZE: u32 = 1048576;

// ============================================================================
// Concurrency defaults
// ============================================================================

/// Outstanding block requests pipelined per downloader.
pub const DEFAULT_REQUEST_QUEUE_LENGTH: usize = 50;

/// Concurrent metadata downloads while the info dictionary is unknown.
pub const DEFAULT_PARALLEL_METADATA_DOWNLOADS: usize = 2;

/// Concurrent piece downloaders across all peers of one torrent.
pub const DEFAULT_MAX_PIECE_DOWNLOADS: usize = 50;

/// Concurrent inbound handshake workers; excess connections are dropped.
pub const DEFAULT_MAX_ACCEPT: usize = 40;

/// Connected peers per torrent.
pub const DEFAULT_MAX_PEERS: usize = 100;

/// Byte budget for in-flight piece buffers.
pub const DEFAULT_RAM_BUDGET: u64 = 64 * 1024 * 1024;

/// Concurrent endgame downloaders allowed on one piece.
pub const ENDGAME_MAX_DUPLICATE_DOWNLOADS: usize = 2;

/// Pieces advertised as allowed-fast to each peer (BEP-6).
pub const ALLOWED_FAST_SET_SIZE: usize = 10;

// ============================================================================
// Timeouts
// ============================================================================

/// Handshake timeout after TCP connect.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP connect timeout for outgoing peer connections.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A downloader that receives no block for this long reports its peer snubbed.
pub const DEFAULT_SNUB_TIMEOUT: Duration = Duration::from_secs(60);

/// Keepalive message interval on idle peer connections.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Webseed body read timeout between chunks.
pub const DEFAULT_WEBSEED_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for each tracker when announcing the final `stopped` event.
pub const STOPPED_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

/// A failed webseed source is retried after this long.
pub const WEBSEED_RETRY_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Announce intervals
// ============================================================================

/// Floor applied to tracker-returned announce intervals.
pub const DEFAULT_TRACKER_MIN_INTERVAL: Duration = Duration::from_secs(60);

/// Interval used when a tracker response carries none.
pub const TRACKER_FALLBACK_INTERVAL: Duration = Duration::from_secs(1800);

/// First retry delay after a failed announce.
pub const TRACKER_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Ceiling for announce retry backoff.
pub const TRACKER_BACKOFF_MAX: Duration = Duration::from_secs(1800);

/// Default DHT announce interval.
pub const DEFAULT_DHT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1800);

/// DHT announces never happen more often than this.
pub const DEFAULT_DHT_MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(300);

/// Peers requested per announce (`numwant`).
pub const DEFAULT_TRACKER_NUM_WANT: i32 = 50;

// ============================================================================
// Channel capacities
// ============================================================================

/// Peer event fan-in channel capacity.
pub const PEER_EVENT_CHANNEL_SIZE: usize = 256;

/// Capacity of the per-peer outgoing command channel.
pub const PEER_COMMAND_CHANNEL_SIZE: usize = 64;

/// Capacity of worker result channels.
pub const WORKER_CHANNEL_SIZE: usize = 16;

/// Controller housekeeping tick.
pub const SESSION_TICK_INTERVAL: Duration = Duration::from_secs(1);

//! Session configuration.

use std::time::Duration;

use crate::constants::*;

/// Tuning parameters for a torrent session.
///
/// The defaults are usable as-is; embedders typically override `port` and
/// `ram_budget` only.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP listen port for incoming peers. 0 binds an ephemeral port.
    pub port: u16,
    /// Outstanding block requests pipelined per piece/metadata downloader.
    pub request_queue_length: usize,
    /// Concurrent non-snubbed metadata downloads.
    pub parallel_metadata_downloads: usize,
    /// Concurrent piece downloaders across all peers.
    pub max_piece_downloads: usize,
    /// Concurrent inbound handshake workers.
    pub max_accept: usize,
    /// Connected peers per torrent.
    pub max_peers: usize,
    /// Byte budget for in-flight piece buffers.
    pub ram_budget: u64,
    /// Downloaders that receive no block for this long report their peer snubbed.
    pub snub_timeout: Duration,
    /// Peers requested per tracker announce.
    pub tracker_num_want: i32,
    /// Floor applied to tracker-returned announce intervals.
    pub tracker_min_announce_interval: Duration,
    /// DHT announce interval.
    pub dht_announce_interval: Duration,
    /// DHT announces never happen more often than this.
    pub dht_min_announce_interval: Duration,
    /// Webseed body read timeout between chunks.
    pub webseed_response_body_read_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 0,
            request_queue_length: DEFAULT_REQUEST_QUEUE_LENGTH,
            parallel_metadata_downloads: DEFAULT_PARALLEL_METADATA_DOWNLOADS,
            max_piece_downloads: DEFAULT_MAX_PIECE_DOWNLOADS,
            max_accept: DEFAULT_MAX_ACCEPT,
            max_peers: DEFAULT_MAX_PEERS,
            ram_budget: DEFAULT_RAM_BUDGET,
            snub_timeout: DEFAULT_SNUB_TIMEOUT,
            tracker_num_want: DEFAULT_TRACKER_NUM_WANT,
            tracker_min_announce_interval: DEFAULT_TRACKER_MIN_INTERVAL,
            dht_announce_interval: DEFAULT_DHT_ANNOUNCE_INTERVAL,
            dht_min_announce_interval: DEFAULT_DHT_MIN_ANNOUNCE_INTERVAL,
            webseed_response_body_read_timeout: DEFAULT_WEBSEED_READ_TIMEOUT,
        }
    }
}

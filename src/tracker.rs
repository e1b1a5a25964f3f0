//! Tracker protocols ([BEP-3], [BEP-15], [BEP-23]).
//!
//! Announcing registers the client in the swarm and returns peer
//! addresses. [`Tracker`] is the tagged variant over the two transports;
//! an announcer owns one exclusively and drives it on its schedule.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html
//! [BEP-15]: http://bittorrent.org/beps/bep_0015.html
//! [BEP-23]: http://bittorrent.org/beps/bep_0023.html

mod error;
mod http;
mod response;
mod udp;

pub use error::TrackerError;
pub use http::HttpTracker;
pub use response::{AnnounceResponse, TrackerEvent};
pub use udp::UdpTracker;

use crate::peer::PeerId;

/// Parameters of one announce request.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceParams {
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
    pub num_want: i32,
}

/// A tracker endpoint, HTTP or UDP depending on the URL scheme.
#[derive(Debug)]
pub enum Tracker {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl Tracker {
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Ok(Tracker::Http(HttpTracker::new(url)?))
        } else if url.starts_with("udp://") {
            Ok(Tracker::Udp(UdpTracker::new(url)?))
        } else {
            Err(TrackerError::UnsupportedScheme(url.to_string()))
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Tracker::Http(t) => t.url(),
            Tracker::Udp(t) => t.url(),
        }
    }

    pub async fn announce(
        &mut self,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse, TrackerError> {
        match self {
            Tracker::Http(t) => t.announce(params).await,
            Tracker::Udp(t) => t.announce(params).await,
        }
    }
}

//! Peer wire protocol ([BEP-3], [BEP-6], [BEP-9], [BEP-10]).
//!
//! The session controller never touches sockets. This module performs the
//! handshake, frames messages, and runs one I/O task per peer that turns
//! the connection into typed [`PeerEvent`]s on the controller's fan-in
//! channel and consumes [`PeerCommand`]s for the outgoing direction.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html
//! [BEP-6]: http://bittorrent.org/beps/bep_0006.html
//! [BEP-9]: http://bittorrent.org/beps/bep_0009.html
//! [BEP-10]: http://bittorrent.org/beps/bep_0010.html

mod bitfield;
mod error;
mod extension;
mod fast;
mod io;
mod message;
mod metadata;
mod peer_id;

pub use bitfield::Bitfield;
pub use error::PeerError;
pub use extension::{ExtensionHandshake, UT_METADATA_ID};
pub use fast::generate_allowed_fast_set;
pub use io::{handshake_incoming, handshake_outgoing, ConnectedPeer, PeerCommand, PeerEvent};
pub use message::{Handshake, Message};
pub use metadata::{MetadataMessage, metadata_piece_count};
pub use peer_id::PeerId;

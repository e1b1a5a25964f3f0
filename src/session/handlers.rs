//! Event handling for the controller loop.
//!
//! Every mutation of torrent state happens in these handlers, on the
//! controller task. Workers only ever see channels.

use std::net::SocketAddr;
use std::sync::Arc;

use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use super::torrent::{Peer, Phase, Torrent, WriteResult, WriteSource};
use crate::allocator::AllocatorMessage;
use crate::constants::{MAX_REQUEST_LENGTH, WEBSEED_RETRY_INTERVAL};
use crate::infodownloader::{InfoDownloadMessage, MetadataEvent};
use crate::metainfo::Info;
use crate::peer::{
    handshake_outgoing, Bitfield, ConnectedPeer, ExtensionHandshake, Message, MetadataMessage,
    PeerCommand, PeerEvent, PeerId, UT_METADATA_ID,
};
use crate::piecedownloader::{DownloaderEvent, PieceDownloadMessage};
use crate::storage::Storage;
use crate::verifier::VerifierMessage;
use crate::webseed::WebseedMessage;

fn send(peer: &Peer, msg: Message) {
    if let Err(err) = peer.cmd_tx.try_send(PeerCommand::Send(msg)) {
        debug!(%err, "dropping outgoing peer message");
    }
}

impl Torrent {
    // ------------------------------------------------------------------
    // Peer intake
    // ------------------------------------------------------------------

    /// Admits a handshaken connection: dedup by peer id (first wins),
    /// capacity check, then the I/O tasks and the opening messages.
    pub(super) fn handle_incoming(&mut self, connected: ConnectedPeer) {
        let metadata_size = self.info.as_ref().map(|i| i.raw_bytes().len() as u32);
        let Some(running) = self.running.as_mut() else {
            return;
        };
        if connected.id == self.local_id {
            debug!("dropping connection to ourselves");
            return;
        }
        if running.peers.contains_key(&connected.id) {
            debug!(peer = ?connected.id, "duplicate peer id, keeping first connection");
            return;
        }
        if running.peers.len() >= self.config.max_peers {
            debug!(peer = ?connected.id, "peer limit reached");
            return;
        }

        let id = connected.id;
        let (addr, supports_extension, supports_fast) = (
            connected.addr,
            connected.supports_extension,
            connected.supports_fast,
        );
        let cmd_tx = connected.spawn(running.peer_event_tx.clone());
        let peer = Peer::new(addr, supports_extension, supports_fast, cmd_tx);

        if let Some(bits) = &self.bitfield {
            if bits.count() > 0 {
                send(&peer, Message::Bitfield(bits.to_bytes()));
            } else if peer.supports_fast {
                send(&peer, Message::HaveNone);
            }
        }
        if peer.supports_extension {
            let handshake = ExtensionHandshake::ours(metadata_size);
            send(
                &peer,
                Message::Extended {
                    id: 0,
                    payload: handshake.encode(),
                },
            );
        }

        debug!(peer = ?id, addr = %peer.addr, "peer connected");
        running.peers.insert(id, peer);
        self.send_allowed_fast(id);
        self.start_info_downloaders();
    }

    /// New peer addresses from announcers, DHT, or the embedder. Each
    /// unseen address gets one outgoing connection attempt.
    pub(super) fn handle_addrs(&mut self, addrs: Vec<SocketAddr>) {
        let info_hash = *self.info_hash.as_bytes();
        let local_id = self.local_id;
        let max_peers = self.config.max_peers;
        let Some(running) = self.running.as_mut() else {
            return;
        };
        for addr in addrs {
            if running.peers.len() >= max_peers {
                return;
            }
            if !running.known_addrs.insert(addr) {
                continue;
            }
            let incoming_tx = running.incoming_tx.clone();
            tokio::spawn(async move {
                match handshake_outgoing(addr, info_hash, local_id).await {
                    Ok(peer) => {
                        let _ = incoming_tx.send(peer).await;
                    }
                    Err(err) => debug!(%addr, %err, "outgoing connection failed"),
                }
            });
        }
    }

    // ------------------------------------------------------------------
    // Peer events
    // ------------------------------------------------------------------

    pub(super) fn handle_peer_event(&mut self, id: PeerId, event: PeerEvent) {
        match event {
            PeerEvent::Message(msg) => self.handle_peer_message(id, msg),
            PeerEvent::Disconnected => self.remove_peer(&id),
        }
    }

    fn handle_peer_message(&mut self, id: PeerId, msg: Message) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        if !running.peers.contains_key(&id) {
            return;
        }
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                if let Some(peer) = running.peers.get_mut(&id) {
                    peer.peer_choking = true;
                }
                if let Some(download) = running.piece_downloads.get(&id) {
                    let _ = download.event_tx.try_send(DownloaderEvent::Choked);
                }
            }
            Message::Unchoke => {
                if let Some(peer) = running.peers.get_mut(&id) {
                    peer.peer_choking = false;
                }
                if let Some(download) = running.piece_downloads.get(&id) {
                    let _ = download.event_tx.try_send(DownloaderEvent::Unchoked);
                }
                // an unchoke opens download capacity everywhere
                self.start_piece_downloaders();
            }
            Message::Interested => {
                if let Some(peer) = running.peers.get_mut(&id) {
                    peer.peer_interested = true;
                    if peer.am_choking {
                        peer.am_choking = false;
                        send(peer, Message::Unchoke);
                    }
                }
            }
            Message::NotInterested => {
                if let Some(peer) = running.peers.get_mut(&id) {
                    peer.peer_interested = false;
                    if !peer.am_choking {
                        peer.am_choking = true;
                        send(peer, Message::Choke);
                    }
                }
            }
            Message::Have { index } => self.handle_have(id, index),
            Message::Bitfield(bytes) => self.handle_remote_bitfield(id, bytes),
            Message::HaveAll => {
                match self.info.as_ref().map(|i| i.piece_count()) {
                    Some(count) => {
                        let mut all = Bitfield::new(count);
                        all.set_all();
                        self.install_remote_bitfield(id, all);
                    }
                    None => {
                        if let Some(peer) = running.peers.get_mut(&id) {
                            peer.have_all = true;
                        }
                    }
                }
            }
            Message::HaveNone => {}
            Message::Request {
                index,
                begin,
                length,
            } => self.handle_request(id, index, begin, length),
            Message::Piece { index, begin, data } => {
                self.stats.add_downloaded(data.len() as u64);
                if let Some(peer) = running.peers.get_mut(&id) {
                    peer.snubbed = false;
                }
                let matching = running
                    .piece_downloads
                    .get(&id)
                    .filter(|d| d.index == index);
                let Some(download) = matching else {
                    return; // stale block of a cancelled download
                };
                let _ = download.event_tx.try_send(DownloaderEvent::Block {
                    begin,
                    data: data.clone(),
                });
                // endgame: feed the block to every racing downloader so
                // they cancel their own in-flight request for it
                let others = running
                    .picker
                    .as_ref()
                    .map(|p| p.requesters_of(index, &id))
                    .unwrap_or_default();
                for other in others {
                    if let Some(download) = running
                        .piece_downloads
                        .get(&other)
                        .filter(|d| d.index == index)
                    {
                        let _ = download.event_tx.try_send(DownloaderEvent::Mirrored {
                            begin,
                            data: data.clone(),
                        });
                    }
                }
            }
            Message::Cancel { .. } => {}
            Message::Reject { index, begin, .. } => {
                if let Some(download) = running
                    .piece_downloads
                    .get(&id)
                    .filter(|d| d.index == index)
                {
                    let _ = download
                        .event_tx
                        .try_send(DownloaderEvent::Rejected { begin });
                }
            }
            Message::AllowedFast { index } => {
                if let Some(peer) = running.peers.get_mut(&id) {
                    peer.allowed_fast.insert(index);
                }
                self.start_piece_downloader_for(id);
            }
            Message::Suggest { .. } => {}
            Message::Port(_) => {}
            Message::Extended { id: ext_id, payload } => {
                self.handle_extended(id, ext_id, &payload)
            }
        }
    }

    fn handle_have(&mut self, id: PeerId, index: u32) {
        match self.info.as_ref().map(|i| i.piece_count()) {
            Some(count) => {
                if index >= count {
                    debug!(peer = ?id, index, "have out of range");
                    self.disconnect_peer(&id);
                    return;
                }
                let Some(running) = self.running.as_mut() else {
                    return;
                };
                if let Some(peer) = running.peers.get_mut(&id) {
                    peer.bits_mut(count).set(index);
                }
                if let Some(picker) = running.picker.as_mut() {
                    picker.handle_have(id, index);
                }
                self.update_interest(&id);
                self.start_piece_downloaders();
            }
            None => {
                if let Some(running) = self.running.as_mut() {
                    if let Some(peer) = running.peers.get_mut(&id) {
                        peer.pending_haves.push(index);
                    }
                }
            }
        }
    }

    fn handle_remote_bitfield(&mut self, id: PeerId, bytes: bytes::Bytes) {
        match self.info.as_ref().map(|i| i.piece_count()) {
            Some(count) => match Bitfield::from_bytes(&bytes, count) {
                Some(bits) => self.install_remote_bitfield(id, bits),
                None => {
                    debug!(peer = ?id, "malformed bitfield");
                    self.disconnect_peer(&id);
                }
            },
            None => {
                if let Some(running) = self.running.as_mut() {
                    if let Some(peer) = running.peers.get_mut(&id) {
                        peer.pending_bitfield = Some(bytes);
                    }
                }
            }
        }
    }

    fn install_remote_bitfield(&mut self, id: PeerId, bits: Bitfield) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        if let Some(peer) = running.peers.get_mut(&id) {
            peer.bits = Some(bits.clone());
        }
        if let Some(picker) = running.picker.as_mut() {
            picker.handle_bitfield(id, &bits);
        }
        self.update_interest(&id);
        self.start_piece_downloaders();
    }

    /// Serves a block request when the peer is unchoked, or the piece is
    /// in its allowed-fast set; rejects otherwise when the peer speaks
    /// the fast extension.
    fn handle_request(&mut self, id: PeerId, index: u32, begin: u32, length: u32) {
        let (Some(info), Some(storage), Some(bits)) = (&self.info, &self.storage, &self.bitfield)
        else {
            return;
        };
        let valid = index < info.piece_count()
            && length > 0
            && length <= MAX_REQUEST_LENGTH
            && begin
                .checked_add(length)
                .is_some_and(|end| end <= info.piece_length_at(index));
        if !valid {
            debug!(peer = ?id, index, begin, length, "invalid block request");
            self.disconnect_peer(&id);
            return;
        }
        let have = bits.has(index);
        let offset = info.piece_offset(index) + begin as u64;
        let storage = Arc::clone(storage);
        let stats = Arc::clone(&self.stats);
        let Some(running) = self.running.as_mut() else {
            return;
        };
        let Some(peer) = running.peers.get(&id) else {
            return;
        };
        let allowed = !peer.am_choking || peer.allowed_fast_outgoing.contains(&index);
        if !have || !allowed {
            if peer.supports_fast {
                send(
                    peer,
                    Message::Reject {
                        index,
                        begin,
                        length,
                    },
                );
            }
            return;
        }

        let cmd_tx = peer.cmd_tx.clone();
        tokio::spawn(async move {
            let read = tokio::task::spawn_blocking(move || {
                let mut buf = vec![0u8; length as usize];
                storage.read_at(offset, &mut buf).map(|_| buf)
            })
            .await;
            match read {
                Ok(Ok(buf)) => {
                    stats.add_uploaded(buf.len() as u64);
                    let piece = Message::Piece {
                        index,
                        begin,
                        data: buf.into(),
                    };
                    let _ = cmd_tx.send(PeerCommand::Send(piece)).await;
                }
                Ok(Err(err)) => warn!(%err, "block read failed"),
                Err(_) => {}
            }
        });
    }

    fn handle_extended(&mut self, id: PeerId, ext_id: u8, payload: &[u8]) {
        if ext_id == 0 {
            match ExtensionHandshake::decode(payload) {
                Ok(handshake) => {
                    if let Some(running) = self.running.as_mut() {
                        if let Some(peer) = running.peers.get_mut(&id) {
                            peer.ut_metadata = handshake.ut_metadata();
                            peer.metadata_size = handshake
                                .metadata_size
                                .filter(|size| *size <= crate::constants::MAX_METADATA_SIZE);
                        }
                    }
                    self.start_info_downloaders();
                }
                Err(err) => {
                    debug!(peer = ?id, %err, "bad extension handshake");
                    self.disconnect_peer(&id);
                }
            }
            return;
        }
        if ext_id != UT_METADATA_ID {
            return;
        }
        match MetadataMessage::decode(payload) {
            Ok(MetadataMessage::Request { piece }) => self.serve_metadata(id, piece),
            Ok(MetadataMessage::Data { piece, data, .. }) => {
                if let Some(running) = self.running.as_mut() {
                    if let Some(download) = running.info_downloads.get(&id) {
                        let _ = download
                            .event_tx
                            .try_send(MetadataEvent::Data { piece, data });
                    }
                }
            }
            Ok(MetadataMessage::Reject { piece }) => {
                if let Some(running) = self.running.as_mut() {
                    if let Some(download) = running.info_downloads.get(&id) {
                        let _ = download.event_tx.try_send(MetadataEvent::Reject { piece });
                    }
                }
            }
            Err(err) => {
                debug!(peer = ?id, %err, "bad metadata message");
                self.disconnect_peer(&id);
            }
        }
    }

    /// Answers a ut_metadata request from what we downloaded ourselves.
    fn serve_metadata(&mut self, id: PeerId, piece: u32) {
        let blob = self.info.as_ref().map(|i| i.raw_bytes().clone());
        let Some(running) = self.running.as_mut() else {
            return;
        };
        let Some(peer) = running.peers.get(&id) else {
            return;
        };
        let Some(their_id) = peer.ut_metadata else {
            return;
        };
        let piece_size = crate::constants::METADATA_PIECE_SIZE;
        let reply = match blob {
            Some(blob) if (piece as usize) * piece_size < blob.len() => {
                let start = piece as usize * piece_size;
                let end = (start + piece_size).min(blob.len());
                MetadataMessage::Data {
                    piece,
                    total_size: blob.len() as u32,
                    data: blob.slice(start..end),
                }
            }
            _ => MetadataMessage::Reject { piece },
        };
        send(
            peer,
            Message::Extended {
                id: their_id,
                payload: reply.encode(),
            },
        );
    }

    // ------------------------------------------------------------------
    // Peer lifecycle
    // ------------------------------------------------------------------

    fn disconnect_peer(&mut self, id: &PeerId) {
        if let Some(running) = self.running.as_ref() {
            if let Some(peer) = running.peers.get(id) {
                let _ = peer.cmd_tx.try_send(PeerCommand::Close);
            }
        }
        self.remove_peer(id);
    }

    /// Forgets a departed peer and reclaims everything it held.
    pub(super) fn remove_peer(&mut self, id: &PeerId) {
        let piece_length = self.info.as_ref().map(|i| i.piece_length as u64);
        let Some(running) = self.running.as_mut() else {
            return;
        };
        if running.peers.remove(id).is_none() {
            return;
        }
        debug!(peer = ?id, "peer removed");
        if let Some(picker) = running.picker.as_mut() {
            picker.handle_peer_disconnect(id);
        }
        if running.piece_downloads.remove(id).is_some() {
            if let Some(piece_length) = piece_length {
                running.ram.release(piece_length);
            }
        }
        running.info_downloads.remove(id);
        running.info_downloads_snubbed.remove(id);
        self.start_piece_downloaders();
    }

    /// Sends Interested/NotInterested as the local need for this peer's
    /// pieces changes.
    fn update_interest(&mut self, id: &PeerId) {
        let Some(local) = self.bitfield.clone() else {
            return;
        };
        let Some(running) = self.running.as_mut() else {
            return;
        };
        let Some(peer) = running.peers.get_mut(id) else {
            return;
        };
        let Some(bits) = &peer.bits else {
            return;
        };
        let wanted = bits.iter_set().any(|i| !local.has(i));
        if wanted != peer.am_interested {
            peer.am_interested = wanted;
            send(
                peer,
                if wanted {
                    Message::Interested
                } else {
                    Message::NotInterested
                },
            );
        }
    }

    pub(super) fn refresh_interest(&mut self) {
        let ids: Vec<PeerId> = self
            .running
            .as_ref()
            .map(|r| r.peers.keys().copied().collect())
            .unwrap_or_default();
        for id in ids {
            self.update_interest(&id);
        }
    }

    // ------------------------------------------------------------------
    // Worker results
    // ------------------------------------------------------------------

    pub(super) async fn handle_verifier(&mut self, msg: VerifierMessage) {
        match msg {
            VerifierMessage::Progress { checked } => {
                debug!(checked, "verification progress");
            }
            VerifierMessage::Done(Ok(bitfield)) => {
                info!(
                    have = bitfield.count(),
                    total = bitfield.len(),
                    "verification complete"
                );
                if let Some(running) = self.running.as_mut() {
                    running.verifier_running = false;
                }
                self.bitfield = Some(bitfield);
                self.enter_swarm().await;
            }
            VerifierMessage::Done(Err(err)) => self.stop(Some(err.into())),
        }
    }

    pub(super) async fn handle_allocator(&mut self, msg: AllocatorMessage) {
        match msg {
            AllocatorMessage::Progress { bytes } => debug!(bytes, "allocation progress"),
            AllocatorMessage::Done(Ok(())) => {
                if let Some(running) = self.running.as_mut() {
                    running.allocator_running = false;
                }
                self.allocated = true;
                if let Some(resume) = self.resume_bitfield.take() {
                    let count = self.info.as_ref().map(|i| i.piece_count()).unwrap_or(0);
                    if resume.len() == count {
                        self.bitfield = Some(resume);
                    }
                }
                if self.bitfield.is_some() {
                    self.enter_swarm().await;
                } else {
                    self.start_verifier();
                }
            }
            AllocatorMessage::Done(Err(err)) => self.stop(Some(err.into())),
        }
    }

    pub(super) fn handle_info_result(&mut self, msg: InfoDownloadMessage) {
        match msg {
            InfoDownloadMessage::Snubbed { peer } => {
                if let Some(running) = self.running.as_mut() {
                    if running.info_downloads.contains_key(&peer) {
                        running.info_downloads_snubbed.insert(peer);
                    }
                }
                self.start_info_downloaders();
            }
            InfoDownloadMessage::Failed { peer } => {
                if let Some(running) = self.running.as_mut() {
                    running.info_downloads.remove(&peer);
                    running.info_downloads_snubbed.remove(&peer);
                    if let Some(state) = running.peers.get_mut(&peer) {
                        state.metadata_failed = true;
                    }
                }
                self.start_info_downloaders();
            }
            InfoDownloadMessage::Done { peer, info_bytes } => {
                if self.info.is_some() {
                    return; // a racing downloader already won
                }
                debug!(?peer, bytes = info_bytes.len(), "info dictionary acquired");
                match Info::from_bytes(&info_bytes) {
                    Ok(info) => {
                        let info = Arc::new(info);
                        self.storage =
                            Some(Arc::new(Storage::new(&self.data_dir, &info)));
                        self.info = Some(info);
                        if let Some(running) = self.running.as_mut() {
                            running.info_downloads.clear();
                            running.info_downloads_snubbed.clear();
                        }
                        self.start_allocator();
                    }
                    // hash matched but the dictionary is unusable; the
                    // torrent itself is broken
                    Err(err) => self.stop(Some(err.into())),
                }
            }
        }
    }

    pub(super) fn handle_piece_result(&mut self, msg: PieceDownloadMessage) {
        match msg {
            PieceDownloadMessage::Snubbed { peer } => {
                let Some(running) = self.running.as_mut() else {
                    return;
                };
                let index = running.piece_downloads.get(&peer).map(|d| d.index);
                if let Some(state) = running.peers.get_mut(&peer) {
                    state.snubbed = true;
                }
                if let (Some(index), Some(picker)) = (index, running.picker.as_mut()) {
                    debug!(?peer, index, "peer snubbed");
                    picker.handle_snubbed(&peer, index);
                }
                self.start_piece_downloaders();
            }
            PieceDownloadMessage::Abandoned { peer, index } => {
                if self.finish_piece_download(&peer, index) {
                    debug!(?peer, index, "piece download abandoned");
                    self.release_download_ram();
                    if let Some(running) = self.running.as_mut() {
                        if let Some(picker) = running.picker.as_mut() {
                            picker.handle_request_abandoned(&peer, index);
                        }
                    }
                }
                self.start_piece_downloaders();
            }
            PieceDownloadMessage::Done { peer, index, data } => {
                let Some(info) = self.info.clone() else {
                    return;
                };
                if !self.finish_piece_download(&peer, index) {
                    self.pool.put(data);
                    return; // result of an already-cancelled download
                }
                let digest: [u8; 20] = Sha1::digest(&data).into();
                if digest != info.piece_hash(index) {
                    warn!(?peer, index, "piece hash mismatch, dropping peer");
                    self.pool.put(data);
                    self.release_download_ram();
                    if let Some(running) = self.running.as_mut() {
                        if let Some(picker) = running.picker.as_mut() {
                            picker.handle_request_abandoned(&peer, index);
                        }
                    }
                    self.disconnect_peer(&peer);
                    self.start_piece_downloaders();
                    return;
                }
                self.cancel_racing_downloads(index, &peer);
                self.spawn_write(index, WriteSource::Peer, data);
                self.start_piece_downloaders();
            }
        }
    }

    /// Removes the peer's downloader entry. RAM is released here unless
    /// the piece goes on to be written, in which case the reservation
    /// rides along until the write finishes. Returns false when no entry
    /// matched (a cancelled or stale download).
    fn finish_piece_download(&mut self, peer: &PeerId, index: u32) -> bool {
        let Some(running) = self.running.as_mut() else {
            return false;
        };
        let matched = running
            .piece_downloads
            .get(peer)
            .is_some_and(|d| d.index == index);
        if !matched {
            return false;
        }
        running.piece_downloads.remove(peer);
        if let Some(state) = running.peers.get_mut(peer) {
            state.downloading = false;
        }
        true
    }

    /// First completion wins: every other endgame downloader of `index`
    /// is cancelled and its reservation returned.
    fn cancel_racing_downloads(&mut self, index: u32, winner: &PeerId) {
        let piece_length = self.info.as_ref().map(|i| i.piece_length as u64).unwrap_or(0);
        let Some(running) = self.running.as_mut() else {
            return;
        };
        let others = running
            .picker
            .as_ref()
            .map(|p| p.requesters_of(index, winner))
            .unwrap_or_default();
        for other in others {
            let matched = running
                .piece_downloads
                .get(&other)
                .is_some_and(|d| d.index == index);
            if !matched {
                continue;
            }
            debug!(peer = ?other, index, "cancelling racing download");
            running.piece_downloads.remove(&other);
            running.ram.release(piece_length);
            if let Some(state) = running.peers.get_mut(&other) {
                state.downloading = false;
            }
            if let Some(picker) = running.picker.as_mut() {
                picker.handle_request_abandoned(&other, index);
            }
        }
    }

    /// The downloader's RAM reservation is only returned on failure here;
    /// a verified piece keeps it until [`Torrent::handle_write_done`].
    fn release_download_ram(&mut self) {
        let piece_length = self.info.as_ref().map(|i| i.piece_length as u64).unwrap_or(0);
        if let Some(running) = self.running.as_mut() {
            running.ram.release(piece_length);
        }
    }

    fn spawn_write(&mut self, index: u32, source: WriteSource, data: bytes::BytesMut) {
        let Some(info) = &self.info else {
            return;
        };
        let Some(storage) = self.storage.clone() else {
            return;
        };
        let offset = info.piece_offset(index);
        let pool = Arc::clone(&self.pool);
        let Some(running) = self.running.as_mut() else {
            return;
        };
        running.writing.insert(index);
        let write_tx = running.write_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = storage.write_at(offset, &data);
            pool.put(data);
            let _ = write_tx.blocking_send(WriteResult {
                index,
                source,
                result,
            });
        });
    }

    pub(super) fn handle_write_done(&mut self, result: WriteResult) {
        if let Some(running) = self.running.as_mut() {
            running.writing.remove(&result.index);
        }
        if result.source == WriteSource::Peer {
            self.release_download_ram();
        }
        match result.result {
            Ok(()) => self.mark_piece_done(result.index),
            Err(err) => self.stop(Some(err.into())),
        }
    }

    /// A verified piece is on disk: update possession, tell the swarm,
    /// and either keep downloading or flip to seeding.
    fn mark_piece_done(&mut self, index: u32) {
        let Some(bits) = self.bitfield.as_mut() else {
            return;
        };
        if bits.has(index) {
            return;
        }
        bits.set(index);
        let complete = bits.is_complete();
        self.stats.set_left(self.left_bytes());

        if let Some(running) = self.running.as_mut() {
            if let Some(picker) = running.picker.as_mut() {
                picker.handle_piece_done(index);
            }
            for peer in running.peers.values() {
                send(peer, Message::Have { index });
            }
        }
        self.refresh_interest();

        if complete {
            info!(info_hash = %self.info_hash, "download complete, seeding");
            self.phase = Phase::Seeding;
            if let Some(running) = self.running.as_ref() {
                let _ = running.completed_tx.send(true);
            }
        } else {
            self.start_piece_downloaders();
        }
    }

    pub(super) fn handle_webseed(&mut self, msg: WebseedMessage) {
        match msg {
            WebseedMessage::Piece { index, data, .. } => {
                self.spawn_write(index, WriteSource::Webseed, data);
            }
            WebseedMessage::Done { url } => {
                self.release_webseed_range(&url);
                self.start_piece_downloaders();
            }
            WebseedMessage::Failed { url, error } => {
                warn!(%url, %error, "disabling webseed source");
                self.release_webseed_range(&url);
                if let Some(source) = self.webseed_sources.iter_mut().find(|s| s.url == url) {
                    source.disabled = true;
                    source.last_error = Some(error.to_string());
                    source.disabled_at = Some(tokio::time::Instant::now());
                }
                self.start_piece_downloaders();
            }
        }
    }

    fn release_webseed_range(&mut self, url: &str) {
        if let Some(source) = self.webseed_sources.iter_mut().find(|s| s.url == url) {
            source.downloading = false;
        }
        if let Some(running) = self.running.as_mut() {
            if let Some(picker) = running.picker.as_ref() {
                picker.webseed_ranges().lock().remove(url);
            }
        }
    }

    /// A queued RAM request was granted; the reservation already exists.
    pub(super) fn handle_ram_notify(&mut self, id: PeerId) {
        let eligible = self
            .running
            .as_mut()
            .and_then(|running| {
                let peer = running.peers.get_mut(&id)?;
                peer.ram_cancel = None;
                Some(!peer.downloading)
            })
            .unwrap_or(false);
        if eligible && self.phase == Phase::Downloading {
            self.start_single_piece_downloader(id);
        } else {
            // grantee went away between queueing and the grant
            self.release_download_ram();
        }
    }

    pub(super) fn handle_tick(&mut self) {
        let now = tokio::time::Instant::now();
        for source in &mut self.webseed_sources {
            let expired = source
                .disabled_at
                .is_some_and(|at| now.duration_since(at) >= WEBSEED_RETRY_INTERVAL);
            if source.disabled && expired {
                debug!(url = %source.url, "re-enabling webseed source");
                source.disabled = false;
                source.disabled_at = None;
            }
        }
        self.start_info_downloaders();
        self.start_piece_downloaders();
    }
}

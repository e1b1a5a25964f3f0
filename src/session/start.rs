//! Start routing and worker startup.
//!
//! `route_start` picks the entry set for the session's current state: no
//! info means acquiring it from peers, an unallocated torrent allocates
//! first, an unverified one verifies, and a verified one goes straight
//! into the swarm. Starting a verifier or allocator twice is a
//! programming error and panics.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, warn};

use super::torrent::{Phase, Torrent};
use crate::constants::ALLOWED_FAST_SET_SIZE;
use crate::peer::{generate_allowed_fast_set, Message, PeerCommand, PeerId};
use crate::picker::PiecePicker;
use crate::tracker::Tracker;
use crate::{acceptor, allocator, announcer, infodownloader, piecedownloader, verifier, webseed};

impl Torrent {
    pub(super) async fn route_start(&mut self) {
        match (&self.info, self.allocated, &self.bitfield) {
            (None, _, _) => {
                self.phase = Phase::AcquiringInfo;
                self.start_acceptor().await;
                self.start_announcers();
                // info downloaders follow as peers arrive
            }
            (Some(_), false, _) => self.start_allocator(),
            (Some(_), true, None) => self.start_verifier(),
            (Some(_), true, Some(_)) => self.enter_swarm().await,
        }
    }

    /// The torrent has an info and a verified bitfield: build the picker,
    /// open the swarm surface, and fan out downloaders.
    pub(super) async fn enter_swarm(&mut self) {
        let bitfield = self.bitfield.clone().expect("bitfield present");
        self.stats.set_left(self.left_bytes());
        let complete = bitfield.is_complete();

        if let Some(running) = self.running.as_mut() {
            let mut picker = PiecePicker::new(&bitfield);
            let ids: Vec<PeerId> = running.peers.keys().copied().collect();
            for id in ids {
                if let Some(peer) = running.peers.get_mut(&id) {
                    let bits = peer.bits_mut(bitfield.len()).clone();
                    picker.handle_bitfield(id, &bits);
                }
            }
            running.picker = Some(picker);
            if complete {
                // pre-set so announcers do not send a spurious `completed`
                let _ = running.completed_tx.send(true);
            }
        }

        self.phase = if complete {
            Phase::Seeding
        } else {
            Phase::Downloading
        };
        self.start_acceptor().await;
        self.start_announcers();
        self.refresh_interest();
        self.start_piece_downloaders();
    }

    pub(super) async fn start_acceptor(&mut self) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        if running.acceptor_running {
            return;
        }
        match TcpListener::bind(("0.0.0.0", self.config.port)).await {
            Ok(listener) => {
                let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
                running.port = Some(port);
                running.acceptor_running = true;
                acceptor::spawn(
                    listener,
                    *self.info_hash.as_bytes(),
                    self.local_id,
                    self.config.max_accept,
                    running.incoming_tx.clone(),
                    running.stop_tx.subscribe(),
                );
            }
            Err(err) => warn!(port = self.config.port, %err, "cannot bind listener"),
        }
    }

    pub(super) fn start_announcers(&mut self) {
        let port = self
            .running
            .as_ref()
            .and_then(|r| r.port)
            .unwrap_or(self.config.port);
        let identity = self.announce_identity(port);
        let Some(running) = self.running.as_mut() else {
            return;
        };
        if running.announcers_running {
            return;
        }
        running.announcers_running = true;
        for url in &self.trackers {
            match Tracker::new(url) {
                Ok(tracker) => {
                    announcer::spawn_periodical(
                        tracker,
                        identity,
                        self.config.tracker_min_announce_interval,
                        Arc::clone(&self.stats),
                        running.completed_tx.subscribe(),
                        running.addrs_tx.clone(),
                        running.stop_tx.subscribe(),
                    );
                }
                Err(err) => warn!(%url, %err, "skipping tracker"),
            }
        }
        if let Some(dht) = &self.dht {
            announcer::spawn_dht(
                Arc::clone(dht),
                *self.info_hash.as_bytes(),
                port,
                self.config.dht_announce_interval,
                self.config.dht_min_announce_interval,
                running.stop_tx.subscribe(),
            );
        }
    }

    pub(super) fn start_verifier(&mut self) {
        let info = Arc::clone(self.info.as_ref().expect("verifier needs info"));
        let storage = Arc::clone(self.storage.as_ref().expect("verifier needs storage"));
        let Some(running) = self.running.as_mut() else {
            return;
        };
        assert!(!running.verifier_running, "verifier already running");
        running.verifier_running = true;
        self.phase = Phase::Verifying;
        verifier::spawn(
            storage,
            info,
            running.verifier_tx.clone(),
            running.stop_tx.subscribe(),
        );
    }

    pub(super) fn start_allocator(&mut self) {
        let storage = Arc::clone(self.storage.as_ref().expect("allocator needs storage"));
        let Some(running) = self.running.as_mut() else {
            return;
        };
        assert!(!running.allocator_running, "allocator already running");
        running.allocator_running = true;
        self.phase = Phase::Allocating;
        allocator::spawn(
            storage,
            running.allocator_tx.clone(),
            running.stop_tx.subscribe(),
        );
    }

    /// Keeps `parallel_metadata_downloads` non-snubbed metadata downloads
    /// going while the info dictionary is unknown.
    pub(super) fn start_info_downloaders(&mut self) {
        if self.info.is_some() {
            return;
        }
        let Some(running) = self.running.as_mut() else {
            return;
        };
        loop {
            let active = running.info_downloads.len() - running.info_downloads_snubbed.len();
            if active >= self.config.parallel_metadata_downloads {
                return;
            }
            let candidate = running.peers.iter().find_map(|(id, peer)| {
                let ut_metadata = peer.ut_metadata?;
                let total_size = peer.metadata_size?;
                (!peer.metadata_failed && !running.info_downloads.contains_key(id))
                    .then_some((*id, peer.cmd_tx.clone(), ut_metadata, total_size))
            });
            let Some((id, cmd_tx, ut_metadata, total_size)) = candidate else {
                return;
            };
            debug!(peer = ?id, "starting metadata download");
            let download = infodownloader::spawn(
                id,
                cmd_tx,
                ut_metadata,
                total_size,
                *self.info_hash.as_bytes(),
                self.config.request_queue_length,
                self.config.snub_timeout,
                running.info_result_tx.clone(),
            );
            running.info_downloads.insert(id, download);
        }
    }

    /// The fan-out pass: give every idle webseed source a range and every
    /// idle peer a piece, within the global downloader cap.
    pub(super) fn start_piece_downloaders(&mut self) {
        if self.phase != Phase::Downloading {
            return;
        }
        self.start_webseed_downloaders();

        let Some(running) = self.running.as_ref() else {
            return;
        };
        let idle: Vec<PeerId> = running
            .peers
            .iter()
            .filter(|(_, peer)| !peer.downloading && peer.ram_cancel.is_none())
            .map(|(id, _)| *id)
            .collect();
        for id in idle {
            self.start_piece_downloader_for(id);
        }
    }

    fn start_webseed_downloaders(&mut self) {
        let Some(info) = self.info.clone() else {
            return;
        };
        let mut idle: Vec<String> = self
            .webseed_sources
            .iter()
            .filter(|s| !s.downloading && !s.disabled)
            .map(|s| s.url.clone())
            .collect();
        while let Some(url) = idle.pop() {
            let Some(running) = self.running.as_mut() else {
                return;
            };
            let Some(picker) = running.picker.as_mut() else {
                return;
            };
            let Some(spec) = picker.pick_webseed(&url, idle.len() + 1) else {
                return;
            };
            debug!(
                url = %spec.url,
                begin = spec.begin,
                end = spec.end,
                "starting webseed download"
            );
            let ranges = picker.webseed_ranges();
            webseed::spawn(
                self.webseed_client.clone(),
                spec,
                Arc::clone(&info),
                ranges,
                Arc::clone(&self.pool),
                self.config.webseed_response_body_read_timeout,
                running.webseed_tx.clone(),
                running.stop_tx.subscribe(),
            );
            if let Some(source) = self.webseed_sources.iter_mut().find(|s| s.url == url) {
                source.downloading = true;
                source.last_error = None;
            }
        }
    }

    /// Gates one peer's downloader start on the RAM budget.
    pub(super) fn start_piece_downloader_for(&mut self, id: PeerId) {
        if self.phase != Phase::Downloading {
            return;
        }
        let Some(info) = &self.info else {
            return;
        };
        let piece_length = info.piece_length as u64;
        let Some(running) = self.running.as_mut() else {
            return;
        };
        if running.piece_downloads.len() >= self.config.max_piece_downloads {
            return;
        }
        let Some(peer) = running.peers.get_mut(&id) else {
            return;
        };
        if peer.downloading || peer.ram_cancel.is_some() {
            return;
        }
        if peer.peer_choking && peer.allowed_fast.is_empty() {
            return;
        }

        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
        let notify = running.ram_notify_tx.clone();
        if running.ram.request(id, piece_length, &notify, cancel_rx) {
            self.start_single_piece_downloader(id);
        } else {
            peer.ram_cancel = Some(cancel_tx);
        }
    }

    /// Starts a downloader with an already-made RAM reservation; the
    /// reservation is returned when nothing starts.
    pub(super) fn start_single_piece_downloader(&mut self, id: PeerId) {
        let piece_length = match &self.info {
            Some(info) => info.piece_length as u64,
            None => return,
        };
        if !self.try_start_piece_downloader(id) {
            if let Some(running) = self.running.as_mut() {
                running.ram.release(piece_length);
            }
        }
    }

    fn try_start_piece_downloader(&mut self, id: PeerId) -> bool {
        if self.phase != Phase::Downloading {
            return false;
        }
        let Some(info) = self.info.clone() else {
            return false;
        };
        let Some(running) = self.running.as_mut() else {
            return false;
        };
        let Some(peer) = running.peers.get_mut(&id) else {
            return false;
        };
        if peer.downloading {
            return false;
        }
        if running.piece_downloads.contains_key(&id) {
            panic!("peer already has a piece downloader");
        }
        peer.ram_cancel = None;

        let allowed_fast = peer.allowed_fast.clone();
        let Some(pick) = running
            .picker
            .as_mut()
            .and_then(|picker| picker.pick_for(id, &allowed_fast))
        else {
            return false;
        };
        let peer = running.peers.get_mut(&id).expect("peer checked above");
        if peer.peer_choking && !pick.allowed_fast {
            if let Some(picker) = running.picker.as_mut() {
                picker.handle_request_abandoned(&id, pick.index);
            }
            return false;
        }

        debug!(peer = ?id, piece = pick.index, "starting piece download");
        let buf = self.pool.get(info.piece_length_at(pick.index) as usize);
        let download = piecedownloader::spawn(
            id,
            peer.cmd_tx.clone(),
            pick.index,
            pick.allowed_fast,
            peer.peer_choking,
            buf,
            self.config.request_queue_length,
            self.config.snub_timeout,
            running.piece_result_tx.clone(),
        );
        peer.downloading = true;
        running.piece_downloads.insert(id, download);
        true
    }

    /// Sends the fast-extension allowed-fast set to a fresh peer.
    pub(super) fn send_allowed_fast(&mut self, id: PeerId) {
        let Some(info) = &self.info else {
            return;
        };
        let piece_count = info.piece_count();
        let info_hash = *self.info_hash.as_bytes();
        let Some(running) = self.running.as_mut() else {
            return;
        };
        let Some(peer) = running.peers.get_mut(&id) else {
            return;
        };
        if !peer.supports_fast {
            return;
        }
        let set = generate_allowed_fast_set(
            &info_hash,
            peer.addr.ip(),
            piece_count,
            ALLOWED_FAST_SET_SIZE,
        );
        for index in &set {
            let _ = peer
                .cmd_tx
                .try_send(PeerCommand::Send(Message::AllowedFast { index: *index }));
        }
        peer.allowed_fast_outgoing = set.into_iter().collect();
    }
}

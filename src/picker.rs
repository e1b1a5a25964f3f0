//! Piece selection policy.
//!
//! The picker tracks per-piece availability and in-flight requests and
//! decides what each peer downloads next: rarest first with a uniform
//! random choice inside the rarest group, an allowed-fast short-circuit,
//! snub-driven reassignment, and an endgame mode that duplicates the last
//! missing pieces across peers.
//!
//! Webseed downloads run outside the controller loop, so their range
//! registry sits behind a shared lock that the downloader holds while it
//! assembles response bodies.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};

use crate::constants::ENDGAME_MAX_DUPLICATE_DOWNLOADS;
use crate::peer::{Bitfield, PeerId};

/// A piece assignment returned by [`PiecePicker::pick_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PiecePick {
    pub index: u32,
    /// The peer advertised this piece as allowed-fast, so it may be
    /// requested while choked.
    pub allowed_fast: bool,
}

/// A contiguous run of pieces assigned to one webseed source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebseedSpec {
    /// The source URL this run belongs to.
    pub url: String,
    /// First piece of the run.
    pub begin: u32,
    /// One past the last piece of the run.
    pub end: u32,
}

/// Live webseed assignments. The owning downloader advances its range as
/// pieces complete and re-reads its end each iteration, because the picker
/// may shrink it to feed another source.
#[derive(Debug, Default)]
pub struct WebseedRanges {
    ranges: Vec<WebseedRange>,
}

#[derive(Debug)]
struct WebseedRange {
    url: String,
    /// Next piece the downloader will produce.
    current: u32,
    end: u32,
}

impl WebseedRanges {
    fn covers(&self, index: u32) -> bool {
        self.ranges
            .iter()
            .any(|r| (r.current..r.end).contains(&index))
    }

    /// Called by the downloader when it finished a piece.
    pub fn advance(&mut self, url: &str, next: u32) {
        if let Some(range) = self.ranges.iter_mut().find(|r| r.url == url) {
            range.current = next;
        }
    }

    /// The downloader's current end; shrinks when the run is split.
    pub fn end_of(&self, url: &str) -> Option<u32> {
        self.ranges.iter().find(|r| r.url == url).map(|r| r.end)
    }

    pub fn remove(&mut self, url: &str) {
        self.ranges.retain(|r| r.url != url);
    }

    pub fn is_downloading(&self, url: &str) -> bool {
        self.ranges.iter().any(|r| r.url == url)
    }
}

#[derive(Debug, Default)]
struct PieceState {
    have: bool,
    /// Peers advertising the piece; availability is the set size.
    holders: HashSet<PeerId>,
    /// Peers with an active downloader on the piece.
    requesters: HashSet<PeerId>,
    /// Requesters declared unproductive; their request is reassignable.
    snubbed: HashSet<PeerId>,
}

impl PieceState {
    fn active_requesters(&self) -> usize {
        self.requesters.len() - self.snubbed.len()
    }
}

/// Tracks availability and request state for every piece and implements
/// the selection policy.
pub struct PiecePicker {
    pieces: Vec<PieceState>,
    missing: u32,
    endgame: bool,
    rng: StdRng,
    webseed: Arc<Mutex<WebseedRanges>>,
}

impl PiecePicker {
    /// Builds a picker from the local possession bitfield.
    pub fn new(have: &Bitfield) -> Self {
        Self::with_rng(have, StdRng::from_os_rng())
    }

    /// Deterministic variant for tests.
    pub fn with_seed(have: &Bitfield, seed: u64) -> Self {
        Self::with_rng(have, StdRng::seed_from_u64(seed))
    }

    fn with_rng(have: &Bitfield, rng: StdRng) -> Self {
        let pieces: Vec<PieceState> = (0..have.len())
            .map(|i| PieceState {
                have: have.has(i),
                ..Default::default()
            })
            .collect();
        let missing = pieces.iter().filter(|p| !p.have).count() as u32;
        Self {
            pieces,
            missing,
            endgame: false,
            rng,
            webseed: Arc::new(Mutex::new(WebseedRanges::default())),
        }
    }

    pub fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    pub fn missing_count(&self) -> u32 {
        self.missing
    }

    pub fn is_endgame(&self) -> bool {
        self.endgame
    }

    /// The shared webseed range registry, cloned into webseed downloaders.
    pub fn webseed_ranges(&self) -> Arc<Mutex<WebseedRanges>> {
        Arc::clone(&self.webseed)
    }

    /// Records that `peer` has `index`. Idempotent per pair.
    pub fn handle_have(&mut self, peer: PeerId, index: u32) {
        if let Some(piece) = self.pieces.get_mut(index as usize) {
            piece.holders.insert(peer);
        }
    }

    /// Bulk form of [`PiecePicker::handle_have`].
    pub fn handle_bitfield(&mut self, peer: PeerId, bits: &Bitfield) {
        for index in bits.iter_set() {
            self.handle_have(peer, index);
        }
    }

    /// Drops every trace of a departed peer: availability and requests.
    pub fn handle_peer_disconnect(&mut self, peer: &PeerId) {
        for piece in &mut self.pieces {
            piece.holders.remove(peer);
            piece.requesters.remove(peer);
            piece.snubbed.remove(peer);
        }
    }

    /// Marks `peer`'s in-flight request on `index` reassignable.
    pub fn handle_snubbed(&mut self, peer: &PeerId, index: u32) {
        if let Some(piece) = self.pieces.get_mut(index as usize) {
            if piece.requesters.contains(peer) {
                piece.snubbed.insert(*peer);
            }
        }
    }

    /// A downloader ended without completing its piece; the request
    /// returns to the pool.
    pub fn handle_request_abandoned(&mut self, peer: &PeerId, index: u32) {
        if let Some(piece) = self.pieces.get_mut(index as usize) {
            piece.requesters.remove(peer);
            piece.snubbed.remove(peer);
        }
    }

    /// A piece was downloaded, verified, and written.
    pub fn handle_piece_done(&mut self, index: u32) {
        let Some(piece) = self.pieces.get_mut(index as usize) else {
            return;
        };
        if !piece.have {
            piece.have = true;
            self.missing -= 1;
        }
        piece.requesters.clear();
        piece.snubbed.clear();
        if self.missing == 0 {
            self.endgame = false;
        }
    }

    /// Other peers with an active downloader on `index`, for endgame
    /// cross-cancellation.
    pub fn requesters_of(&self, index: u32, except: &PeerId) -> Vec<PeerId> {
        self.pieces
            .get(index as usize)
            .map(|p| {
                p.requesters
                    .iter()
                    .filter(|r| *r != except)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Selects the next piece for `peer` and registers the request.
    ///
    /// `allowed_fast` is the set of pieces the peer advertised as
    /// allowed-fast.
    pub fn pick_for(&mut self, peer: PeerId, allowed_fast: &HashSet<u32>) -> Option<PiecePick> {
        if self.endgame {
            return self.pick_endgame(peer);
        }

        let webseed = self.webseed.lock();
        let candidates: Vec<u32> = (0..self.pieces.len() as u32)
            .filter(|i| {
                let piece = &self.pieces[*i as usize];
                !piece.have
                    && piece.holders.contains(&peer)
                    && piece.active_requesters() == 0
                    && !webseed.covers(*i)
            })
            .collect();
        drop(webseed);

        if candidates.is_empty() {
            self.maybe_enter_endgame();
            if self.endgame {
                return self.pick_endgame(peer);
            }
            return None;
        }

        // Allowed-fast pieces are servable while choked, so they win.
        let fast: Vec<u32> = candidates
            .iter()
            .copied()
            .filter(|i| allowed_fast.contains(i))
            .collect();
        let (pool, is_fast) = if fast.is_empty() {
            (candidates, false)
        } else {
            (fast, true)
        };

        let index = self.pick_rarest(&pool)?;
        self.register(peer, index);
        Some(PiecePick {
            index,
            allowed_fast: is_fast,
        })
    }

    /// In endgame a missing piece may be handed to several peers at once,
    /// bounded per piece; downloaders race and the first one wins. Webseed
    /// ranges stay exclusive even here.
    fn pick_endgame(&mut self, peer: PeerId) -> Option<PiecePick> {
        let webseed = self.webseed.lock();
        let candidates: Vec<u32> = (0..self.pieces.len() as u32)
            .filter(|i| {
                let piece = &self.pieces[*i as usize];
                !piece.have
                    && piece.holders.contains(&peer)
                    && !piece.requesters.contains(&peer)
                    && piece.requesters.len() < ENDGAME_MAX_DUPLICATE_DOWNLOADS
                    && !webseed.covers(*i)
            })
            .collect();
        drop(webseed);
        let index = self.pick_rarest(&candidates)?;
        self.register(peer, index);
        Some(PiecePick {
            index,
            allowed_fast: false,
        })
    }

    /// Endgame starts once every missing piece already has an active
    /// downloader, i.e. the missing count is covered by in-flight work.
    fn maybe_enter_endgame(&mut self) {
        if self.missing == 0 {
            return;
        }
        let in_flight = self
            .pieces
            .iter()
            .filter(|p| !p.have && p.active_requesters() > 0)
            .count() as u32;
        if self.missing <= in_flight {
            self.endgame = true;
        }
    }

    /// Uniform random choice within the group of lowest availability.
    /// The randomization keeps peers from converging on the same piece.
    fn pick_rarest(&mut self, candidates: &[u32]) -> Option<u32> {
        let min_avail = candidates
            .iter()
            .map(|i| self.pieces[*i as usize].holders.len())
            .min()?;
        let rarest: Vec<u32> = candidates
            .iter()
            .copied()
            .filter(|i| self.pieces[*i as usize].holders.len() == min_avail)
            .collect();
        let choice = self.rng.random_range(0..rarest.len());
        Some(rarest[choice])
    }

    fn register(&mut self, peer: PeerId, index: u32) {
        let piece = &mut self.pieces[index as usize];
        piece.requesters.insert(peer);
        piece.snubbed.remove(&peer);
    }

    /// Picks a piece run for the webseed source `url`.
    ///
    /// Prefers the longest run of missing pieces that no peer and no other
    /// source is on, split evenly when several sources are idle. With no
    /// free run left it halves the largest active range, shrinking the
    /// other source's end under the shared lock.
    pub fn pick_webseed(&mut self, url: &str, idle_sources: usize) -> Option<WebseedSpec> {
        let mut webseed = self.webseed.lock();
        if webseed.is_downloading(url) {
            return None;
        }

        if let Some((begin, end)) = self.longest_free_run(&webseed) {
            let share = ((end - begin) as usize).div_ceil(idle_sources.max(1)) as u32;
            let end = end.min(begin + share.max(1));
            webseed.ranges.push(WebseedRange {
                url: url.to_string(),
                current: begin,
                end,
            });
            return Some(WebseedSpec {
                url: url.to_string(),
                begin,
                end,
            });
        }

        // No free run: take the second half of the largest remaining range.
        let victim = webseed
            .ranges
            .iter_mut()
            .filter(|r| r.end - r.current >= 2)
            .max_by_key(|r| r.end - r.current)?;
        let mid = victim.current + (victim.end - victim.current) / 2;
        let end = victim.end;
        victim.end = mid;
        webseed.ranges.push(WebseedRange {
            url: url.to_string(),
            current: mid,
            end,
        });
        Some(WebseedSpec {
            url: url.to_string(),
            begin: mid,
            end,
        })
    }

    fn longest_free_run(&self, webseed: &WebseedRanges) -> Option<(u32, u32)> {
        let mut best: Option<(u32, u32)> = None;
        let mut run_start: Option<u32> = None;
        for i in 0..=self.pieces.len() as u32 {
            let free = (i as usize) < self.pieces.len() && {
                let piece = &self.pieces[i as usize];
                !piece.have && piece.requesters.is_empty() && !webseed.covers(i)
            };
            match (free, run_start) {
                (true, None) => run_start = Some(i),
                (false, Some(start)) => {
                    if best.is_none_or(|(b, e)| i - start > e - b) {
                        best = Some((start, i));
                    }
                    run_start = None;
                }
                _ => {}
            }
        }
        best
    }
}

use std::{
    collections::HashMap,
    ops::Range,
    sync::{Arc, Mutex},
};
use rand::{rngs::StdRng, seq::SliceRandom};
use crate::{Bitfield, ID};

/*
Pieces are picked rarest first: candidates are grouped by how many peers
hold them and the choice is made uniformly at random within the lowest
group. The randomization matters; without it every peer converges on the
same "rarest" piece. Allowed-fast pieces take priority since they can be
requested even while choked. Once every missing piece is already being
fetched the picker enters endgame and hands out duplicates.
*/

pub type SharedWebseedRanges = Arc<Mutex<WebseedRanges>>;

// What a peer was told to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pick {

    pub piece: u32,

    // Piece was advertised via allowed-fast, so it may be requested while
    // choked.
    pub allowed_fast: bool,

    // Another peer may be fetching the same piece.
    pub endgame: bool,

}

#[derive(Debug, Clone, Copy)]
struct Assignment {
    peer: ID,
    snubbed: bool,
}

#[derive(Debug, Default)]
struct PieceState {

    // Number of connected peers holding this piece.
    availability: u32,

    assignments: Vec<Assignment>,

}

impl PieceState {
    fn active_assignments(&self) -> usize {
        self.assignments.iter().filter(|a| !a.snubbed).count()
    }
}

#[derive(Debug)]
struct PeerPieces {
    bitfield: Bitfield,
    allowed_fast: Vec<u32>,
}

#[derive(Debug)]
pub struct PiecePicker {

    pieces: Vec<PieceState>,

    // Pieces we possess.
    have: Bitfield,

    peers: HashMap<ID, PeerPieces>,

    endgame: bool,

    rng: StdRng,

    // Shared with webseed downloaders, which advance their range cursor
    // outside the controller loop.
    webseed: SharedWebseedRanges,

}

impl PiecePicker {

    pub fn new(have: Bitfield, rng: StdRng) -> Self {
        let num_pieces = have.len();
        let mut pieces = Vec::with_capacity(num_pieces);
        pieces.resize_with(num_pieces, PieceState::default);
        Self {
            pieces,
            have,
            peers: HashMap::new(),
            endgame: false,
            rng,
            webseed: Arc::new(Mutex::new(WebseedRanges::default())),
        }
    }

    pub fn num_pieces(&self) -> u32 {
        self.pieces.len() as u32
    }

    pub fn num_missing(&self) -> usize {
        self.have.count_zeros()
    }

    pub fn is_complete(&self) -> bool {
        self.have.all()
    }

    pub fn endgame(&self) -> bool {
        self.endgame
    }

    pub fn own_bitfield(&self) -> &Bitfield {
        &self.have
    }

    pub fn webseed_ranges(&self) -> SharedWebseedRanges {
        Arc::clone(&self.webseed)
    }

    // Number of peers fetching a piece right now, snubbed ones excluded.
    pub fn in_flight(&self, idx: u32) -> usize {
        self.pieces[idx as usize].active_assignments()
    }

    pub fn peer_has(&self, peer: &ID, idx: u32) -> bool {
        self.peers.get(peer).map_or(false, |p| p.bitfield[idx as usize])
    }

    // True if the peer holds a piece we are missing.
    pub fn interested_in(&self, peer: &ID) -> bool {
        match self.peers.get(peer) {
            Some(p) => p.bitfield.iter_ones().any(|i| !self.have[i]),
            None => false,
        }
    }

    pub fn handle_have(&mut self, peer: ID, idx: u32) {
        let num_pieces = self.pieces.len();
        let entry = self.peers.entry(peer).or_insert_with(|| PeerPieces {
            bitfield: Bitfield::repeat(false, num_pieces),
            allowed_fast: Vec::new(),
        });
        // Idempotent per (peer, piece).
        if !entry.bitfield[idx as usize] {
            entry.bitfield.set(idx as usize, true);
            self.pieces[idx as usize].availability += 1;
        }
    }

    pub fn handle_bitfield(&mut self, peer: ID, bits: &Bitfield) {
        for idx in bits.iter_ones() {
            if idx < self.pieces.len() {
                self.handle_have(peer, idx as u32);
            }
        }
    }

    pub fn handle_have_all(&mut self, peer: ID) {
        for idx in 0..self.pieces.len() as u32 {
            self.handle_have(peer, idx);
        }
    }

    pub fn handle_allowed_fast(&mut self, peer: ID, idx: u32) {
        if idx as usize >= self.pieces.len() {
            return;
        }
        let num_pieces = self.pieces.len();
        let entry = self.peers.entry(peer).or_insert_with(|| PeerPieces {
            bitfield: Bitfield::repeat(false, num_pieces),
            allowed_fast: Vec::new(),
        });
        if !entry.allowed_fast.contains(&idx) {
            entry.allowed_fast.push(idx);
        }
    }

    pub fn handle_peer_disconnect(&mut self, peer: &ID) {
        if let Some(pieces) = self.peers.remove(peer) {
            for idx in pieces.bitfield.iter_ones() {
                self.pieces[idx].availability -= 1;
            }
        }
        for piece in self.pieces.iter_mut() {
            piece.assignments.retain(|a| a.peer != *peer);
        }
    }

    // The peer stopped producing blocks for this piece; its in-flight
    // request becomes reassignable. The original download keeps running and
    // may still complete first.
    pub fn handle_snubbed(&mut self, peer: &ID, idx: u32) {
        for a in self.pieces[idx as usize].assignments.iter_mut() {
            if a.peer == *peer {
                a.snubbed = true;
            }
        }
    }

    // The peer's download of this piece ended without a verified piece.
    pub fn release(&mut self, peer: &ID, idx: u32) {
        self.pieces[idx as usize].assignments.retain(|a| a.peer != *peer);
    }

    pub fn mark_piece_done(&mut self, idx: u32) {
        self.have.set(idx as usize, true);
        self.pieces[idx as usize].assignments.clear();
        if self.is_complete() {
            self.endgame = false;
        }
    }

    pub fn pick_for(&mut self, peer: ID) -> Option<Pick> {

        if self.is_complete() {
            return None;
        }
        let peer_pieces = self.peers.get(&peer)?;

        let webseed = self.webseed.lock().expect("webseed range lock poisoned");
        let candidates: Vec<u32> = peer_pieces.bitfield
            .iter_ones()
            .filter(|&i| !self.have[i] && !webseed.covers(i as u32))
            .map(|i| i as u32)
            .collect();
        drop(webseed);
        if candidates.is_empty() {
            return None;
        }

        // A piece is free when nobody is actively fetching it. Pieces this
        // peer already has in flight are never handed back to it.
        let free: Vec<u32> = candidates
            .iter()
            .copied()
            .filter(|&i| {
                let state = &self.pieces[i as usize];
                state.active_assignments() == 0
                    && !state.assignments.iter().any(|a| a.peer == peer)
            })
            .collect();

        if !free.is_empty() {
            let allowed: Vec<u32> = free
                .iter()
                .copied()
                .filter(|i| peer_pieces.allowed_fast.contains(i))
                .collect();
            let (pool, allowed_fast) = if allowed.is_empty() {
                (free, false)
            } else {
                (allowed, true)
            };

            let min_avail = pool
                .iter()
                .map(|&i| self.pieces[i as usize].availability)
                .min()
                .unwrap();
            let rarest: Vec<u32> = pool
                .into_iter()
                .filter(|&i| self.pieces[i as usize].availability == min_avail)
                .collect();
            let piece = *rarest.choose(&mut self.rng).unwrap();

            self.pieces[piece as usize].assignments.push(Assignment { peer, snubbed: false });
            return Some(Pick { piece, allowed_fast, endgame: self.endgame });
        }

        // Nothing free for this peer; duplicate an in-flight piece if the
        // swarm is in the endgame.
        self.update_endgame();
        if !self.endgame {
            return None;
        }

        let duplicates: Vec<u32> = candidates
            .into_iter()
            .filter(|&i| !self.pieces[i as usize].assignments.iter().any(|a| a.peer == peer))
            .collect();
        if duplicates.is_empty() {
            return None;
        }
        let least = duplicates
            .iter()
            .map(|&i| self.pieces[i as usize].active_assignments())
            .min()
            .unwrap();
        let pool: Vec<u32> = duplicates
            .into_iter()
            .filter(|&i| self.pieces[i as usize].active_assignments() == least)
            .collect();
        let piece = *pool.choose(&mut self.rng).unwrap();

        self.pieces[piece as usize].assignments.push(Assignment { peer, snubbed: false });
        Some(Pick { piece, allowed_fast: false, endgame: true })
    }

    // Endgame begins once the tail of the download is already fully in
    // flight: either every missing piece is being fetched, or there are at
    // least as many active downloads as missing pieces. It ends when the
    // torrent completes.
    fn update_endgame(&mut self) {
        if self.endgame || self.is_complete() {
            return;
        }
        let missing = self.num_missing();
        let active: usize = self.pieces.iter().map(|p| p.active_assignments()).sum();
        if missing <= active {
            self.endgame = true;
            tracing::debug!("entering endgame, {} pieces missing", missing);
            return;
        }
        let all_in_flight = self.have
            .iter_zeros()
            .all(|i| self.pieces[i].active_assignments() > 0);
        if all_in_flight {
            self.endgame = true;
            tracing::debug!("entering endgame, {} pieces missing", missing);
        }
    }

    // Picks the longest run of missing, unassigned pieces for a webseed
    // source. When nothing is free, the largest active webseed range is
    // split in half so the sources share the remaining work.
    pub fn pick_webseed(&mut self, source: usize) -> Option<Range<u32>> {

        let mut webseed = self.webseed.lock().expect("webseed range lock poisoned");
        if webseed.ranges.contains_key(&source) {
            return None;
        }

        let mut best: Option<Range<u32>> = None;
        let mut run_start: Option<u32> = None;
        for idx in 0..=self.pieces.len() as u32 {
            let free = (idx as usize) < self.pieces.len()
                && !self.have[idx as usize]
                && self.pieces[idx as usize].assignments.is_empty()
                && !webseed.covers(idx);
            match (free, run_start) {
                (true, None) => run_start = Some(idx),
                (false, Some(start)) => {
                    if best.as_ref().map_or(true, |b| idx - start > b.end - b.start) {
                        best = Some(start..idx);
                    }
                    run_start = None;
                },
                _ => {},
            }
        }

        if let Some(range) = best {
            webseed.insert(source, range.clone());
            return Some(range);
        }

        // Steal the second half of the largest remaining range.
        let victim = webseed.ranges
            .iter()
            .filter(|(key, r)| **key != source && r.end - r.pos >= 2)
            .max_by_key(|(_, r)| r.end - r.pos)
            .map(|(key, _)| *key)?;
        let stolen = webseed.split(victim)?;
        webseed.insert(source, stolen.clone());
        Some(stolen)
    }

    pub fn webseed_done(&mut self, source: usize) {
        self.webseed
            .lock()
            .expect("webseed range lock poisoned")
            .ranges
            .remove(&source);
    }
}

// Piece ranges currently assigned to webseed sources. [begin, pos) has been
// fetched, [pos, end) is pending. The downloader advances pos as pieces
// stream in, so access is guarded by a lock rather than the controller task.
#[derive(Debug, Default)]
pub struct WebseedRanges {
    ranges: HashMap<usize, WebseedRange>,
}

#[derive(Debug, Clone)]
pub struct WebseedRange {
    pub begin: u32,
    pub end: u32,
    pub pos: u32,
}

impl WebseedRanges {

    fn insert(&mut self, source: usize, range: Range<u32>) {
        self.ranges.insert(source, WebseedRange {
            begin: range.start,
            end: range.end,
            pos: range.start,
        });
    }

    // Pending part of any range.
    pub fn covers(&self, idx: u32) -> bool {
        self.ranges.values().any(|r| idx >= r.pos && idx < r.end)
    }

    // One piece of the source's range finished downloading. Returns the
    // next pending piece, or None when the (possibly shrunk) range is done.
    pub fn advance(&mut self, source: usize) -> Option<u32> {
        let range = self.ranges.get_mut(&source)?;
        range.pos += 1;
        if range.pos < range.end { Some(range.pos) } else { None }
    }

    pub fn current_end(&self, source: usize) -> Option<u32> {
        self.ranges.get(&source).map(|r| r.end)
    }

    // Hands the second half of a source's pending work to someone else.
    fn split(&mut self, source: usize) -> Option<Range<u32>> {
        let range = self.ranges.get_mut(&source)?;
        let pending = range.end - range.pos;
        if pending < 2 {
            return None;
        }
        let mid = range.pos + (pending + 1) / 2;
        let stolen = mid..range.end;
        range.end = mid;
        Some(stolen)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use super::*;

    fn bitfield(num_pieces: usize, set: &[usize]) -> Bitfield {
        let mut bf = Bitfield::repeat(false, num_pieces);
        for &i in set {
            bf.set(i, true);
        }
        bf
    }

    fn peer(n: u8) -> ID {
        [n; 20]
    }

    fn picker(num_pieces: usize, have: &[usize]) -> PiecePicker {
        PiecePicker::new(bitfield(num_pieces, have), StdRng::seed_from_u64(0))
    }

    // 7 pieces, we have {0,2,3}. A has {1,3,4}, B has {1}, C has {5}.
    fn rarest_first_setup() -> PiecePicker {
        let mut p = picker(7, &[0, 2, 3]);
        p.handle_bitfield(peer(1), &bitfield(7, &[1, 3, 4]));
        p.handle_bitfield(peer(2), &bitfield(7, &[1]));
        p.handle_bitfield(peer(3), &bitfield(7, &[5]));
        p
    }

    #[test]
    fn test_rarest_first_single_choice() {
        let mut p = rarest_first_setup();

        // Piece 4 is uniquely rarest among A's pieces.
        assert_eq!(p.pick_for(peer(1)), Some(Pick { piece: 4, allowed_fast: false, endgame: false }));
        assert_eq!(p.pick_for(peer(2)), Some(Pick { piece: 1, allowed_fast: false, endgame: false }));
        assert_eq!(p.pick_for(peer(3)), Some(Pick { piece: 5, allowed_fast: false, endgame: false }));
        assert!(!p.endgame());
    }

    #[test]
    fn test_no_choice_when_in_flight() {
        let mut p = rarest_first_setup();
        p.pick_for(peer(1));
        p.pick_for(peer(2));
        p.pick_for(peer(3));

        // D only has piece 5, which C is already fetching.
        p.handle_bitfield(peer(4), &bitfield(7, &[5]));
        assert_eq!(p.pick_for(peer(4)), None);
        assert!(!p.endgame());
    }

    #[test]
    fn test_snubbing_reassigns() {
        let mut p = rarest_first_setup();
        p.pick_for(peer(1));
        p.pick_for(peer(2));
        p.pick_for(peer(3));
        p.handle_bitfield(peer(4), &bitfield(7, &[5]));

        p.handle_snubbed(&peer(3), 5);
        assert_eq!(p.pick_for(peer(4)), Some(Pick { piece: 5, allowed_fast: false, endgame: false }));
        assert!(!p.endgame());
        // Snubbed original plus the replacement, only one counted in flight.
        assert_eq!(p.in_flight(5), 1);
    }

    #[test]
    fn test_endgame_entry() {
        // Only piece 6 missing, already in flight to E; F arrives with it.
        let mut p = picker(7, &[0, 1, 2, 3, 4, 5]);
        p.handle_bitfield(peer(5), &bitfield(7, &[6]));
        assert_eq!(p.pick_for(peer(5)), Some(Pick { piece: 6, allowed_fast: false, endgame: false }));

        p.handle_bitfield(peer(6), &bitfield(7, &[6]));
        assert_eq!(p.pick_for(peer(6)), Some(Pick { piece: 6, allowed_fast: false, endgame: true }));
        assert!(p.endgame());
        assert_eq!(p.in_flight(6), 2);

        // Completion ends the endgame.
        p.mark_piece_done(6);
        assert!(!p.endgame());
        assert!(p.is_complete());
        assert_eq!(p.pick_for(peer(6)), None);
    }

    #[test]
    fn test_have_is_idempotent() {
        let mut p = picker(4, &[]);
        p.handle_have(peer(1), 2);
        p.handle_have(peer(1), 2);
        p.handle_bitfield(peer(1), &bitfield(4, &[2]));
        assert_eq!(p.pieces[2].availability, 1);
    }

    #[test]
    fn test_bitfield_equals_haves() {
        let mut by_bits = picker(5, &[]);
        by_bits.handle_bitfield(peer(1), &bitfield(5, &[0, 3, 4]));

        let mut by_haves = picker(5, &[]);
        for idx in [0u32, 3, 4] {
            by_haves.handle_have(peer(1), idx);
        }

        for idx in 0..5 {
            assert_eq!(by_bits.pieces[idx].availability, by_haves.pieces[idx].availability);
            assert_eq!(by_bits.peer_has(&peer(1), idx as u32), by_haves.peer_has(&peer(1), idx as u32));
        }
    }

    #[test]
    fn test_disconnect_decrements() {
        let mut p = picker(3, &[]);
        p.handle_bitfield(peer(1), &bitfield(3, &[0, 1]));
        p.handle_bitfield(peer(2), &bitfield(3, &[1]));
        p.pick_for(peer(1));

        p.handle_peer_disconnect(&peer(1));
        assert_eq!(p.pieces[0].availability, 0);
        assert_eq!(p.pieces[1].availability, 1);
        // Its in-flight piece is free again.
        assert_eq!(p.in_flight(0), 0);
        assert_eq!(p.in_flight(1), 0);
    }

    #[test]
    fn test_empty_peer_set_picks_nothing() {
        let mut p = picker(4, &[]);
        assert_eq!(p.pick_for(peer(9)), None);
    }

    #[test]
    fn test_allowed_fast_preferred() {
        let mut p = picker(4, &[]);
        p.handle_bitfield(peer(1), &bitfield(4, &[0, 1, 2]));
        // Piece 2 is common but allowed-fast.
        p.handle_bitfield(peer(2), &bitfield(4, &[2]));
        p.handle_allowed_fast(peer(1), 2);
        let pick = p.pick_for(peer(1)).unwrap();
        assert_eq!(pick.piece, 2);
        assert!(pick.allowed_fast);
    }

    #[test]
    fn test_webseed_longest_run() {
        // Missing runs: {1}, {3,4,5}; the longer one wins.
        let mut p = picker(7, &[0, 2, 6]);
        assert_eq!(p.pick_webseed(0), Some(3..6));
        // Next source gets the next-longest run.
        assert_eq!(p.pick_webseed(1), Some(1..2));
    }

    #[test]
    fn test_webseed_split() {
        let mut p = picker(8, &[]);
        assert_eq!(p.pick_webseed(0), Some(0..8));
        // Nothing free, so the second source takes half of the first's work.
        assert_eq!(p.pick_webseed(1), Some(4..8));
        assert_eq!(p.webseed_ranges().lock().unwrap().current_end(0), Some(4));
    }

    #[test]
    fn test_webseed_excluded_from_peer_picks() {
        let mut p = picker(4, &[]);
        p.handle_bitfield(peer(1), &bitfield(4, &[0, 1, 2, 3]));
        assert_eq!(p.pick_webseed(0), Some(0..4));
        assert_eq!(p.pick_for(peer(1)), None);
    }
}

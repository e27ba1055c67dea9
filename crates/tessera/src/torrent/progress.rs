//! The download state of a torrent: which pieces we have, which blocks are
//! in flight and to whom, and the buffers of the pieces being assembled.
//!
//! Only the torrent actor owns a [`Progress`], peers never touch it.

use std::{collections::BTreeMap, net::SocketAddr, time::Duration};

use hashbrown::{HashMap, HashSet};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::PieceStrategy;
use crate::{
    bitfield::{Bitfield, BitfieldExt},
    metainfo::Info,
    tcp_wire::{Block, BlockInfo},
};

/// A piece that is being downloaded.
#[derive(Debug)]
struct PieceBuffer {
    data: Vec<u8>,
    /// One bit per block of the piece.
    received: Bitfield,
    /// Peers that sent at least one block of this piece.
    contributors: HashSet<SocketAddr>,
}

impl PieceBuffer {
    fn new(info: &Info, index: usize) -> Self {
        Self {
            data: vec![0u8; info.piece_size(index) as usize],
            received: Bitfield::from_piece(info.blocks_per_piece(index)),
            contributors: HashSet::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.received.all()
    }
}

/// What happened to a block given to [`Progress::receive_block`].
#[derive(Debug, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The block was not requested from this peer, or is not in flight
    /// anymore. Nothing changed.
    Ignored,

    /// The block was written in its piece buffer, the piece is not complete
    /// yet.
    Stored,

    /// The block completed its piece and the piece matches its hash. The
    /// piece is now marked as downloaded and `data` must go to the disk.
    PieceVerified { index: usize, data: Vec<u8> },

    /// The block completed its piece but the piece does not match its hash.
    /// The buffer was dropped and every block of the piece is needed again.
    /// `banned` are the contributors that crossed the failure threshold,
    /// their in-flight blocks were released.
    HashMismatch { index: usize, banned: Vec<SocketAddr> },
}

#[derive(Debug)]
pub struct Progress {
    info: Info,
    strategy: PieceStrategy,
    max_failures: u32,

    /// Pieces that we downloaded and verified. A bit is never unset.
    have: Bitfield,

    /// Blocks requested to a peer and not received yet, with the time of
    /// the request.
    in_flight: HashMap<BlockInfo, (SocketAddr, Instant)>,

    assemblies: BTreeMap<usize, PieceBuffer>,

    /// Hash failures per peer.
    failures: HashMap<SocketAddr, u32>,
    banned: HashSet<SocketAddr>,

    /// How many known peers have each piece.
    availability: Vec<u32>,
    peer_pieces: HashMap<SocketAddr, Bitfield>,

    /// Bytes of verified pieces.
    downloaded: u64,
}

impl Progress {
    pub fn new(info: Info, strategy: PieceStrategy, max_failures: u32) -> Self {
        let pieces = info.pieces();
        Self {
            info,
            strategy,
            max_failures: max_failures.max(1),
            have: Bitfield::from_piece(pieces),
            in_flight: HashMap::new(),
            assemblies: BTreeMap::new(),
            failures: HashMap::new(),
            banned: HashSet::new(),
            availability: vec![0; pieces],
            peer_pieces: HashMap::new(),
            downloaded: 0,
        }
    }

    /// Replace the pieces known for `peer`, usually from a bitfield message.
    pub fn set_peer_pieces(&mut self, peer: SocketAddr, pieces: Bitfield) {
        if let Some(old) = self.peer_pieces.remove(&peer) {
            for i in old.iter_ones() {
                self.availability[i] = self.availability[i].saturating_sub(1);
            }
        }
        let n = self.availability.len();
        for i in pieces.iter_ones().filter(|i| *i < n) {
            self.availability[i] += 1;
        }
        self.peer_pieces.insert(peer, pieces);
    }

    /// Record that `peer` has `piece`, usually from a have message.
    pub fn peer_has(&mut self, peer: SocketAddr, piece: usize) {
        if piece >= self.info.pieces() {
            return;
        }
        let pieces = self
            .peer_pieces
            .entry(peer)
            .or_insert_with(|| Bitfield::from_piece(self.info.pieces()));

        if !pieces.has(piece) {
            pieces.set(piece, true);
            self.availability[piece] += 1;
        }
    }

    /// If `peer` has a piece that we don't.
    pub fn is_interesting(&self, peer: &SocketAddr) -> bool {
        self.peer_pieces
            .get(peer)
            .is_some_and(|p| !p.missing_in(&self.have).is_empty())
    }

    /// Order in which pieces are considered for new requests.
    fn piece_order(&self, peer_pieces: &Bitfield) -> Vec<usize> {
        let mut order: Vec<usize> = peer_pieces
            .iter_ones()
            .filter(|i| !self.have.has(*i))
            .collect();

        if self.strategy == PieceStrategy::Rarest {
            // stable, ties keep ascending index
            order.sort_by_key(|i| self.availability[*i]);
        }

        order
    }

    /// Pick up to `max` blocks to request from `peer`, minus what is already
    /// in flight to it, and mark them in flight.
    ///
    /// A block is never in flight to two peers at the same time.
    pub fn next_blocks(
        &mut self,
        peer: SocketAddr,
        max: usize,
        now: Instant,
    ) -> Vec<BlockInfo> {
        if self.banned.contains(&peer) {
            return Vec::new();
        }

        let budget = max.saturating_sub(self.in_flight_of(&peer));
        if budget == 0 {
            return Vec::new();
        }

        let Some(peer_pieces) = self.peer_pieces.get(&peer) else {
            return Vec::new();
        };

        let mut picked = Vec::with_capacity(budget);

        for index in self.piece_order(peer_pieces) {
            for block_info in self.info.block_infos_of_piece(index) {
                if picked.len() == budget {
                    break;
                }
                if self.in_flight.contains_key(&block_info) {
                    continue;
                }
                let received = self
                    .assemblies
                    .get(&index)
                    .is_some_and(|p| p.received.has(block_info.block_index()));
                if received {
                    continue;
                }
                picked.push(block_info);
            }
            if picked.len() == budget {
                break;
            }
        }

        for block_info in &picked {
            self.in_flight.insert(*block_info, (peer, now));
            let index = block_info.index as usize;
            if !self.assemblies.contains_key(&index) {
                self.assemblies.insert(index, PieceBuffer::new(&self.info, index));
            }
        }

        picked
    }

    /// Store a block sent by `peer`, and verify its piece once complete.
    pub fn receive_block(
        &mut self,
        peer: SocketAddr,
        block: Block,
    ) -> BlockOutcome {
        let block_info = block.info();

        match self.in_flight.get(&block_info) {
            Some((owner, _)) if *owner == peer => {}
            _ => return BlockOutcome::Ignored,
        }
        self.in_flight.remove(&block_info);

        let index = block.index;
        let Some(piece) = self.assemblies.get_mut(&index) else {
            return BlockOutcome::Ignored;
        };

        let begin = block.begin as usize;
        piece.data[begin..begin + block.block.len()].copy_from_slice(&block.block);
        piece.received.set(block_info.block_index(), true);
        piece.contributors.insert(peer);

        if !piece.is_full() {
            return BlockOutcome::Stored;
        }

        let Some(piece) = self.assemblies.remove(&index) else {
            return BlockOutcome::Ignored;
        };

        let valid = self
            .info
            .piece_hash(index)
            .is_some_and(|hash| hash.matches(&piece.data));

        if valid {
            debug!("piece {index} verified");
            self.have.set(index, true);
            self.downloaded += piece.data.len() as u64;
            return BlockOutcome::PieceVerified { index, data: piece.data };
        }

        warn!(
            "piece {index} failed the hash check, contributors {:?}",
            piece.contributors
        );

        // nothing of this piece may stay in flight after a rollback
        self.in_flight.retain(|b, _| b.index as usize != index);

        let mut banned = Vec::new();
        for peer in piece.contributors {
            let failures = self.failures.entry(peer).or_default();
            *failures += 1;

            if *failures >= self.max_failures && self.banned.insert(peer) {
                warn!("{peer} banned after {failures} hash failures");
                self.remove_peer(&peer);
                banned.push(peer);
            }
        }

        BlockOutcome::HashMismatch { index, banned }
    }

    /// Return every block in flight to `peer` to the pool. The returned
    /// blocks are sorted.
    pub fn release_peer(&mut self, peer: &SocketAddr) -> Vec<BlockInfo> {
        let mut released: Vec<BlockInfo> = self
            .in_flight
            .iter()
            .filter(|(_, (owner, _))| owner == peer)
            .map(|(b, _)| *b)
            .collect();

        for b in &released {
            self.in_flight.remove(b);
        }

        released.sort();
        released
    }

    /// Forget a peer that disconnected, its blocks return to the pool.
    pub fn remove_peer(&mut self, peer: &SocketAddr) -> Vec<BlockInfo> {
        if let Some(pieces) = self.peer_pieces.remove(peer) {
            for i in pieces.iter_ones() {
                self.availability[i] = self.availability[i].saturating_sub(1);
            }
        }
        self.release_peer(peer)
    }

    /// Return one block to the pool if it is in flight to `peer`.
    pub fn release_block(
        &mut self,
        peer: &SocketAddr,
        block_info: &BlockInfo,
    ) -> bool {
        match self.in_flight.get(block_info) {
            Some((owner, _)) if owner == peer => {
                self.in_flight.remove(block_info);
                true
            }
            _ => false,
        }
    }

    /// Return to the pool every block requested more than `timeout` ago.
    pub fn take_timed_out(
        &mut self,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(SocketAddr, BlockInfo)> {
        let mut timed_out: Vec<(SocketAddr, BlockInfo)> = self
            .in_flight
            .iter()
            .filter(|(_, (_, at))| now.saturating_duration_since(*at) >= timeout)
            .map(|(b, (peer, _))| (*peer, *b))
            .collect();

        for (_, b) in &timed_out {
            self.in_flight.remove(b);
        }

        timed_out.sort();
        timed_out
    }

    /// Number of blocks in flight to `peer`.
    pub fn in_flight_of(&self, peer: &SocketAddr) -> usize {
        self.in_flight.values().filter(|(owner, _)| owner == peer).count()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_complete(&self) -> bool {
        self.have.all()
    }

    pub fn have(&self) -> &Bitfield {
        &self.have
    }

    /// Blocks that were not received yet, in flight ones included.
    pub fn needed_blocks(&self) -> usize {
        self.have
            .iter_zeros()
            .map(|i| {
                let received = self
                    .assemblies
                    .get(&i)
                    .map(|p| p.received.count_ones())
                    .unwrap_or(0);
                self.info.blocks_per_piece(i) - received
            })
            .sum()
    }

    /// Bytes of verified pieces.
    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Bytes that we still need.
    pub fn left(&self) -> u64 {
        self.info.length - self.downloaded
    }

    pub fn is_banned(&self, peer: &SocketAddr) -> bool {
        self.banned.contains(peer)
    }
}

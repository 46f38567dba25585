use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::torrent_protocol::wire_protocol::BlockRequest;

pub type PeerAddr = String;

/// Authoritative piece/block state machine. Owns the per-piece buffers, the
/// request ledger, and the cross-peer availability counts driving
/// rarest-first selection. Everything here is single-owner state mutated only
/// from the swarm control loop.
pub struct PieceScheduler {
    piece_hashes: Vec<[u8; 20]>,
    piece_length: u64,
    total_length: u64,
    block_size: u64,
    pieces: Vec<PieceProgress>,
    availability: Vec<u32>, // per piece: how many connected peers have it
    have_count: usize,
    // peer -> (piece idx, block begin) -> request time
    ledger: HashMap<PeerAddr, HashMap<(u32, u32), SystemTime>>,
}

enum PieceProgress {
    Needed,
    InProgress(InProgressPiece),
    Have,
}

struct InProgressPiece {
    buffer: Vec<u8>,
    requested: Vec<bool>, // per block: handed out and not yet answered
    received: Vec<bool>,  // per block: data accepted into the buffer
    received_count: usize,
}

impl InProgressPiece {
    fn new(piece_len: u64, num_blocks: usize) -> Self {
        InProgressPiece {
            buffer: vec![0; piece_len as usize],
            requested: vec![false; num_blocks],
            received: vec![false; num_blocks],
            received_count: 0,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum BlockReject {
    #[error("the piece is already verified")]
    AlreadyHave,
    #[error("the block range exceeds the piece length")]
    OutOfRange,
    #[error("the block does not match the expected block boundary or size")]
    UnexpectedLength,
    #[error("the block was already received")]
    Duplicate,
    #[error("the completed piece did not match its digest and was reset")]
    DigestMismatch,
}

/// What became of a delivered block. Completion is returned as a value so the
/// caller dispatches the side effects (persist, announce, broadcast) without
/// the scheduler holding callbacks into the rest of the engine.
#[derive(Debug, PartialEq)]
pub enum BlockOutcome {
    Accepted,
    PieceComplete { piece_idx: u32, data: Vec<u8> },
    Rejected(BlockReject),
}

impl PieceScheduler {
    pub fn new(
        piece_hashes: Vec<[u8; 20]>,
        piece_length: u64,
        total_length: u64,
        block_size: u64,
        already_have: &[bool],
    ) -> Self {
        let num_pieces = piece_hashes.len();
        let mut pieces = Vec::with_capacity(num_pieces);
        let mut have_count = 0;
        for idx in 0..num_pieces {
            if already_have.get(idx).copied().unwrap_or(false) {
                pieces.push(PieceProgress::Have);
                have_count += 1;
            } else {
                pieces.push(PieceProgress::Needed);
            }
        }
        PieceScheduler {
            piece_hashes,
            piece_length,
            total_length,
            block_size,
            pieces,
            availability: vec![0; num_pieces],
            have_count,
            ledger: HashMap::new(),
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn is_complete(&self) -> bool {
        self.have_count == self.num_pieces()
    }

    pub fn have_piece(&self, piece_idx: u32) -> bool {
        matches!(
            self.pieces.get(piece_idx as usize),
            Some(PieceProgress::Have)
        )
    }

    /// The first piece we still need, used to drive web-seed fetches.
    pub fn first_missing_piece(&self) -> Option<u32> {
        self.pieces
            .iter()
            .position(|p| !matches!(p, PieceProgress::Have))
            .map(|idx| idx as u32)
    }

    /// Packed bitmap of verified pieces, MSB-first within each byte, for
    /// outgoing BITFIELD messages.
    pub fn have_bitfield(&self) -> Vec<u8> {
        let mut packed = vec![0u8; self.num_pieces().div_ceil(8)];
        for (idx, piece) in self.pieces.iter().enumerate() {
            if matches!(piece, PieceProgress::Have) {
                packed[idx / 8] |= 0b10000000 >> (idx % 8);
            }
        }
        packed
    }

    pub fn have_vec(&self) -> Vec<bool> {
        self.pieces
            .iter()
            .map(|p| matches!(p, PieceProgress::Have))
            .collect()
    }

    pub fn piece_length_for(&self, piece_idx: u32) -> u64 {
        if piece_idx as usize + 1 == self.num_pieces() {
            self.total_length - self.piece_length * (self.num_pieces() as u64 - 1)
        } else {
            self.piece_length
        }
    }

    pub fn piece_offset(&self, piece_idx: u32) -> u64 {
        self.piece_length * piece_idx as u64
    }

    fn blocks_in_piece(&self, piece_idx: u32) -> usize {
        self.piece_length_for(piece_idx).div_ceil(self.block_size) as usize
    }

    fn block_length(&self, piece_idx: u32, block: usize) -> u64 {
        let begin = block as u64 * self.block_size;
        std::cmp::min(self.block_size, self.piece_length_for(piece_idx) - begin)
    }

    /// Does the remote have any piece we still need.
    pub fn peer_has_needed(&self, peer_haves: &[bool]) -> bool {
        self.pieces.iter().enumerate().any(|(idx, piece)| {
            !matches!(piece, PieceProgress::Have) && peer_haves.get(idx).copied().unwrap_or(false)
        })
    }

    // availability upkeep, driven by bitfield/have messages and disconnects

    pub fn add_peer_bitfield(&mut self, peer_haves: &[bool]) {
        for (idx, has) in peer_haves.iter().take(self.num_pieces()).enumerate() {
            if *has {
                self.availability[idx] += 1;
            }
        }
    }

    pub fn remove_peer_bitfield(&mut self, peer_haves: &[bool]) {
        for (idx, has) in peer_haves.iter().take(self.num_pieces()).enumerate() {
            if *has {
                self.availability[idx] = self.availability[idx].saturating_sub(1);
            }
        }
    }

    pub fn peer_has_piece(&mut self, piece_idx: u32) {
        if let Some(count) = self.availability.get_mut(piece_idx as usize) {
            *count += 1;
        }
    }

    /// Picks the next block to ask this peer for: rarest piece first among
    /// those the peer has and we still need, lowest index on ties, skipping
    /// blocks already requested from anyone or already received. The block is
    /// marked requested and entered into the peer's ledger.
    pub fn next_request(&mut self, peer_addr: &str, peer_haves: &[bool]) -> Option<BlockRequest> {
        let mut best: Option<(u32, usize, u32)> = None; // availability, piece idx, block
        for idx in 0..self.num_pieces() {
            if !peer_haves.get(idx).copied().unwrap_or(false) {
                continue;
            }
            let block = match &self.pieces[idx] {
                PieceProgress::Have => continue,
                PieceProgress::Needed => 0,
                PieceProgress::InProgress(p) => {
                    match (0..p.requested.len()).find(|b| !p.requested[*b] && !p.received[*b]) {
                        Some(block) => block,
                        None => continue, // piece fully in flight
                    }
                }
            };
            let availability = self.availability[idx];
            if best.map_or(true, |(best_avail, _, _)| availability < best_avail) {
                best = Some((availability, idx, block as u32));
            }
        }

        let (_, piece_idx, block) = best?;
        let piece_idx_u32 = piece_idx as u32;
        let piece_len = self.piece_length_for(piece_idx_u32);
        let num_blocks = self.blocks_in_piece(piece_idx_u32);
        let data_len = self.block_length(piece_idx_u32, block as usize) as u32;
        let block_begin = block * self.block_size as u32;

        if let PieceProgress::Needed = self.pieces[piece_idx] {
            self.pieces[piece_idx] =
                PieceProgress::InProgress(InProgressPiece::new(piece_len, num_blocks));
        }
        if let PieceProgress::InProgress(p) = &mut self.pieces[piece_idx] {
            p.requested[block as usize] = true;
        }
        self.ledger
            .entry(peer_addr.to_string())
            .or_default()
            .insert((piece_idx_u32, block_begin), SystemTime::now());

        Some(BlockRequest {
            piece_idx: piece_idx_u32,
            block_begin,
            data_len,
        })
    }

    /// Accepts a delivered block, from a peer or a web seed. On the last
    /// block of a piece the digest is checked: a match hands the verified
    /// bytes back to the caller, a mismatch resets the whole piece.
    pub fn handle_block(&mut self, piece_idx: u32, begin: u32, data: &[u8]) -> BlockOutcome {
        if piece_idx as usize >= self.num_pieces() {
            return BlockOutcome::Rejected(BlockReject::OutOfRange);
        }
        if self.have_piece(piece_idx) {
            return BlockOutcome::Rejected(BlockReject::AlreadyHave);
        }
        let piece_len = self.piece_length_for(piece_idx);
        if begin as u64 + data.len() as u64 > piece_len {
            return BlockOutcome::Rejected(BlockReject::OutOfRange);
        }
        if begin as u64 % self.block_size != 0 {
            return BlockOutcome::Rejected(BlockReject::UnexpectedLength);
        }
        let block = (begin as u64 / self.block_size) as usize;
        if data.len() as u64 != self.block_length(piece_idx, block) {
            return BlockOutcome::Rejected(BlockReject::UnexpectedLength);
        }

        let num_blocks = self.blocks_in_piece(piece_idx);
        if let PieceProgress::Needed = self.pieces[piece_idx as usize] {
            self.pieces[piece_idx as usize] =
                PieceProgress::InProgress(InProgressPiece::new(piece_len, num_blocks));
        }
        let complete_now = {
            let progress = match &mut self.pieces[piece_idx as usize] {
                PieceProgress::InProgress(p) => p,
                _ => unreachable!("just initialized above"),
            };
            if progress.received[block] {
                return BlockOutcome::Rejected(BlockReject::Duplicate);
            }
            progress.buffer[begin as usize..begin as usize + data.len()].copy_from_slice(data);
            progress.received[block] = true;
            progress.requested[block] = false;
            progress.received_count += 1;
            progress.received_count == num_blocks
        };
        self.forget_ledger_entries(piece_idx, Some(begin));

        if !complete_now {
            return BlockOutcome::Accepted;
        }

        // last block landed: verify the piece digest
        let digest: [u8; 20] = match &self.pieces[piece_idx as usize] {
            PieceProgress::InProgress(p) => Sha1::digest(&p.buffer).into(),
            _ => unreachable!("completed right above"),
        };
        if digest != self.piece_hashes[piece_idx as usize] {
            log::warn!("piece {piece_idx} failed its digest check, resetting it");
            self.reset_piece(piece_idx);
            return BlockOutcome::Rejected(BlockReject::DigestMismatch);
        }

        let data = match &mut self.pieces[piece_idx as usize] {
            PieceProgress::InProgress(p) => std::mem::take(&mut p.buffer),
            _ => unreachable!("completed right above"),
        };
        self.pieces[piece_idx as usize] = PieceProgress::Have;
        self.have_count += 1;
        BlockOutcome::PieceComplete { piece_idx, data }
    }

    /// Returns a piece to the Needed state: buffer dropped, block bookkeeping
    /// cleared, have bit withdrawn if it was set (the storage-write-failure
    /// path), in-flight requests for it forgotten. Idempotent.
    pub fn reset_piece(&mut self, piece_idx: u32) {
        let idx = piece_idx as usize;
        if idx >= self.num_pieces() {
            return;
        }
        if matches!(self.pieces[idx], PieceProgress::Have) {
            self.have_count -= 1;
        }
        self.pieces[idx] = PieceProgress::Needed;
        self.forget_ledger_entries(piece_idx, None);
    }

    /// Returns every block requested from a closing session to the pool.
    pub fn cancel_requests(&mut self, peer_addr: &str) {
        let Some(requests) = self.ledger.remove(peer_addr) else {
            return;
        };
        for (piece_idx, begin) in requests.keys() {
            self.unmark_requested(*piece_idx, *begin);
        }
    }

    /// Expires requests a peer never answered so the blocks can be handed to
    /// someone else.
    pub fn remove_stale_requests(&mut self, request_timeout: Duration) {
        let now = SystemTime::now();
        let mut expired = Vec::new();
        for (peer_addr, requests) in self.ledger.iter_mut() {
            requests.retain(|(piece_idx, begin), requested_at| {
                if now.duration_since(*requested_at).unwrap_or_default() < request_timeout {
                    true
                } else {
                    log::debug!(
                        "request to {peer_addr} for piece {piece_idx} begin {begin} went stale"
                    );
                    expired.push((*piece_idx, *begin));
                    false
                }
            });
        }
        self.ledger.retain(|_, requests| !requests.is_empty());
        for (piece_idx, begin) in expired {
            self.unmark_requested(piece_idx, begin);
        }
    }

    pub fn pending_request_count(&self, peer_addr: &str) -> usize {
        self.ledger.get(peer_addr).map_or(0, |reqs| reqs.len())
    }

    fn unmark_requested(&mut self, piece_idx: u32, begin: u32) {
        let block = (begin as u64 / self.block_size) as usize;
        if let Some(PieceProgress::InProgress(p)) = self.pieces.get_mut(piece_idx as usize) {
            if !p.received[block] {
                p.requested[block] = false;
            }
        }
    }

    // drop ledger entries for one block (or a whole piece) across all peers
    fn forget_ledger_entries(&mut self, piece_idx: u32, begin: Option<u32>) {
        for requests in self.ledger.values_mut() {
            requests.retain(|(req_piece, req_begin), _| {
                *req_piece != piece_idx || begin.is_some_and(|b| *req_begin != b)
            });
        }
        self.ledger.retain(|_, requests| !requests.is_empty());
    }
}

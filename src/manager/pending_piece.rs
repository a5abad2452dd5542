use std::time::{Duration, Instant};

use crate::manager::peer::PeerAddr;
use crate::torrent_protocol::wire_protocol::{Block, BlockRequest, BLOCK_SIZE};

/// A block request sent to a peer and not yet reclaimed.
#[derive(Debug, Clone)]
pub struct TimedRequest {
    pub request: BlockRequest,
    pub sent_to: PeerAddr,
    pub sent_at: Instant,
    pub received: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BlockOutcome {
    /// no in-flight request matches the block
    Untracked,
    Duplicate,
    Accepted { piece_complete: bool },
}

/// One piece being downloaded: which of its blocks still have to be requested, which are
/// requested and waiting for a reply, and which arrived.
#[derive(Debug)]
pub struct PendingPiece {
    pub index: u32,
    pub size: u64,
    pub downloaded: u64,
    pub pending: Vec<BlockRequest>,
    pub in_flight: Vec<TimedRequest>,
    pub received: Vec<Block>,
}

fn split_in_blocks(index: u32, size: u64) -> Vec<BlockRequest> {
    (0..size)
        .step_by(BLOCK_SIZE as usize)
        .map(|begin| BlockRequest {
            piece_idx: index,
            block_begin: begin as u32,
            data_len: (size - begin).min(BLOCK_SIZE as u64) as u32,
        })
        .collect()
}

impl PendingPiece {
    pub fn new(index: u32, size: u64) -> Self {
        PendingPiece {
            index,
            size,
            downloaded: 0,
            pending: split_in_blocks(index, size),
            in_flight: Vec::new(),
            received: Vec::new(),
        }
    }

    /// Moves back to pending every in-flight request not answered within `request_timeout`,
    /// returning the moved requests with the peer each one was sent to.
    pub fn reclaim_expired(&mut self, request_timeout: Duration) -> Vec<(PeerAddr, BlockRequest)> {
        let now = Instant::now();
        let (expired, in_flight): (Vec<_>, Vec<_>) = self
            .in_flight
            .drain(..)
            .partition(|r| !r.received && now.duration_since(r.sent_at) > request_timeout);
        self.in_flight = in_flight;
        self.pending.extend(expired.iter().map(|r| r.request.clone()));
        expired.into_iter().map(|r| (r.sent_to, r.request)).collect()
    }

    /// Records that `request`, taken from pending, was sent to `peer`.
    pub fn mark_sent(&mut self, request: &BlockRequest, peer: &PeerAddr) {
        if let Some(pos) = self.pending.iter().position(|r| r == request) {
            let request = self.pending.remove(pos);
            self.in_flight.push(TimedRequest {
                request,
                sent_to: peer.clone(),
                sent_at: Instant::now(),
                received: false,
            });
        }
    }

    /// Accounts for an arrived block.
    ///
    /// # Panics
    ///
    /// If accepting the block would exceed the piece size, which means the scheduler state is
    /// corrupted.
    pub fn accept(&mut self, block: Block) -> BlockOutcome {
        let request = block.request();
        let Some(in_flight) = self.in_flight.iter_mut().find(|r| r.request == request) else {
            return BlockOutcome::Untracked;
        };
        if self
            .received
            .iter()
            .any(|other| other.block_begin == block.block_begin && other.data.len() == block.data.len())
        {
            return BlockOutcome::Duplicate;
        }
        in_flight.received = true;
        self.downloaded += block.data.len() as u64;
        if self.downloaded > self.size {
            panic!(
                "received more data than expected for piece {}: {} > {}",
                self.index, self.downloaded, self.size
            );
        }
        self.received.push(block);
        BlockOutcome::Accepted {
            piece_complete: self.downloaded == self.size,
        }
    }

    /// Received blocks ordered by offset and concatenated.
    pub fn assemble(&mut self) -> Vec<u8> {
        self.received.sort_by_key(|b| b.block_begin);
        let mut data = Vec::with_capacity(self.size as usize);
        for b in &self.received {
            data.extend_from_slice(&b.data);
        }
        data
    }

    /// Forgets everything downloaded and queues every block of the piece again.
    ///
    /// # Panics
    ///
    /// If blocks are still pending: a piece is only retried once all its blocks arrived.
    pub fn retry(&mut self) {
        assert!(
            self.pending.is_empty(),
            "malformed state, expected no pending requests when rescheduling piece {} for retry download",
            self.index
        );
        self.downloaded = 0;
        self.in_flight.clear();
        self.received.clear();
        self.pending = split_in_blocks(self.index, self.size);
    }
}

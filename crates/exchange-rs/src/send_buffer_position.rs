//! Write cursor over the rank chunks a packing thread owns.

use spikenet_core::AssignedRanks;

/// Tracks the next free slot in each assigned rank's chunk of the send
/// buffer. Chunk `r` spans `[r * per_rank, (r + 1) * per_rank)`.
#[derive(Debug, Clone)]
pub struct SendBufferPosition {
    assigned: AssignedRanks,
    per_rank: usize,
    idx: Vec<usize>,
    num_filled: usize,
    overflowed: Vec<bool>,
}

impl SendBufferPosition {
    pub fn new(assigned: AssignedRanks, per_rank: usize) -> Self {
        let idx = (assigned.begin..assigned.end)
            .map(|r| r * per_rank)
            .collect();
        Self {
            assigned,
            per_rank,
            idx,
            num_filled: 0,
            overflowed: vec![false; assigned.size],
        }
    }

    fn local(&self, rank: usize) -> usize {
        debug_assert!(self.assigned.contains(rank), "rank {} not assigned", rank);
        rank - self.assigned.begin
    }

    /// Next free slot of `rank`'s chunk
    pub fn idx(&self, rank: usize) -> usize {
        self.idx[self.local(rank)]
    }

    pub fn begin(&self, rank: usize) -> usize {
        rank * self.per_rank
    }

    pub fn end(&self, rank: usize) -> usize {
        (rank + 1) * self.per_rank
    }

    pub fn is_chunk_filled(&self, rank: usize) -> bool {
        self.idx(rank) == self.end(rank)
    }

    pub fn are_all_chunks_filled(&self) -> bool {
        self.num_filled == self.assigned.size
    }

    pub fn increase(&mut self, rank: usize) {
        let i = self.local(rank);
        self.idx[i] += 1;
        if self.idx[i] == self.end(rank) {
            self.num_filled += 1;
        }
    }

    /// Remember that `rank` had more data than fits
    pub fn mark_overflow(&mut self, rank: usize) {
        let i = self.local(rank);
        self.overflowed[i] = true;
    }

    pub fn overflowed(&self, rank: usize) -> bool {
        self.overflowed[self.local(rank)]
    }

    /// Records written into `rank`'s chunk so far
    pub fn num_written(&self, rank: usize) -> usize {
        self.idx(rank) - self.begin(rank)
    }

    pub fn assigned(&self) -> AssignedRanks {
        self.assigned
    }
}

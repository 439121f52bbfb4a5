//! Packed address of a synapse on some rank.

use crate::{LCID_BITS, MAX_LCID, MAX_RANK, MAX_SYN_ID, MAX_TID, RANK_BITS, TID_BITS};
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::fmt;

const RANK_SHIFT: u32 = LCID_BITS;
const TID_SHIFT: u32 = RANK_SHIFT + RANK_BITS;
const SYN_ID_SHIFT: u32 = TID_SHIFT + TID_BITS;
const PROCESSED_SHIFT: u32 = 63;

const LCID_MASK: u64 = MAX_LCID as u64;
const RANK_MASK: u64 = (MAX_RANK as u64) << RANK_SHIFT;
const TID_MASK: u64 = ((1u64 << TID_BITS) - 1) << TID_SHIFT;
const SYN_ID_MASK: u64 = (MAX_SYN_ID as u64) << SYN_ID_SHIFT;
const PROCESSED_MASK: u64 = 1 << PROCESSED_SHIFT;

/// Where a spike must be delivered: `(rank, tid, syn_id, lcid)` plus a
/// processed flag used while packing send buffers.
///
/// | bits    | field     |
/// |---------|-----------|
/// | 0..25   | lcid      |
/// | 25..45  | rank      |
/// | 45..55  | tid       |
/// | 55..61  | syn_id    |
/// | 63      | processed |
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable, Serialize, Deserialize)]
pub struct Target(u64);

impl Target {
    pub fn new(tid: usize, rank: usize, syn_id: usize, lcid: usize) -> Self {
        debug_assert!(tid as u64 <= MAX_TID as u64, "tid {} out of range", tid);
        debug_assert!(rank as u64 <= MAX_RANK as u64, "rank {} out of range", rank);
        debug_assert!(syn_id as u64 <= MAX_SYN_ID as u64, "syn_id {} out of range", syn_id);
        debug_assert!(lcid as u64 <= MAX_LCID as u64, "lcid {} out of range", lcid);
        let mut t = Target(0);
        t.set_lcid(lcid);
        t.set_rank(rank);
        t.set_tid(tid);
        t.set_syn_id(syn_id);
        t
    }

    pub fn lcid(&self) -> usize {
        (self.0 & LCID_MASK) as usize
    }

    pub fn set_lcid(&mut self, lcid: usize) {
        self.0 = (self.0 & !LCID_MASK) | (lcid as u64 & LCID_MASK);
    }

    pub fn rank(&self) -> usize {
        ((self.0 & RANK_MASK) >> RANK_SHIFT) as usize
    }

    pub fn set_rank(&mut self, rank: usize) {
        self.0 = (self.0 & !RANK_MASK) | (((rank as u64) << RANK_SHIFT) & RANK_MASK);
    }

    pub fn tid(&self) -> usize {
        ((self.0 & TID_MASK) >> TID_SHIFT) as usize
    }

    pub fn set_tid(&mut self, tid: usize) {
        self.0 = (self.0 & !TID_MASK) | (((tid as u64) << TID_SHIFT) & TID_MASK);
    }

    pub fn syn_id(&self) -> usize {
        ((self.0 & SYN_ID_MASK) >> SYN_ID_SHIFT) as usize
    }

    pub fn set_syn_id(&mut self, syn_id: usize) {
        self.0 = (self.0 & !SYN_ID_MASK) | (((syn_id as u64) << SYN_ID_SHIFT) & SYN_ID_MASK);
    }

    pub fn is_processed(&self) -> bool {
        self.0 & PROCESSED_MASK != 0
    }

    pub fn set_processed(&mut self, processed: bool) {
        if processed {
            self.0 |= PROCESSED_MASK;
        } else {
            self.0 &= !PROCESSED_MASK;
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("rank", &self.rank())
            .field("tid", &self.tid())
            .field("syn_id", &self.syn_id())
            .field("lcid", &self.lcid())
            .field("processed", &self.is_processed())
            .finish()
    }
}

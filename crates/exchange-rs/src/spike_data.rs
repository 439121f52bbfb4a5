//! Spike record sent between ranks.

use crate::{
    ExchangeRecord, Target, COMPLETE_MARKER, END_MARKER, LAG_BITS, LCID_BITS, MAX_LAG, MAX_LCID,
    MAX_SYN_ID, SYN_ID_BITS, TID_BITS,
};
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::fmt;

const LAG_SHIFT: u32 = LCID_BITS;
const TID_SHIFT: u32 = LAG_SHIFT + LAG_BITS;
const SYN_ID_SHIFT: u32 = TID_SHIFT + TID_BITS;

const LCID_MASK: u64 = MAX_LCID as u64;
const LAG_MASK: u64 = (MAX_LAG as u64) << LAG_SHIFT;
const TID_MASK: u64 = ((1u64 << TID_BITS) - 1) << TID_SHIFT;
const SYN_ID_MASK: u64 = ((1u64 << SYN_ID_BITS) - 1) << SYN_ID_SHIFT;

/// One spike addressed to a synapse on the receiving rank.
///
/// Layout: lcid in bits 0..25, lag 25..31, tid 31..41, syn_id 41..47.
/// A tid of [`COMPLETE_MARKER`] or [`END_MARKER`] turns the record into a
/// chunk terminator.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable, Serialize, Deserialize)]
pub struct SpikeData(u64);

impl SpikeData {
    pub fn new(tid: usize, syn_id: usize, lcid: usize, lag: usize) -> Self {
        debug_assert!(syn_id as u64 <= MAX_SYN_ID as u64);
        debug_assert!(lcid as u64 <= MAX_LCID as u64);
        debug_assert!(lag as u64 <= MAX_LAG as u64);
        let mut s = SpikeData(0);
        s.set(tid, syn_id, lcid, lag);
        s
    }

    /// Spike for the synapse `target` points at, emitted `lag` steps into
    /// the interval
    pub fn from_target(target: &Target, lag: usize) -> Self {
        Self::new(target.tid(), target.syn_id(), target.lcid(), lag)
    }

    pub fn set(&mut self, tid: usize, syn_id: usize, lcid: usize, lag: usize) {
        self.0 = (lcid as u64 & LCID_MASK)
            | (((lag as u64) << LAG_SHIFT) & LAG_MASK)
            | (((tid as u64) << TID_SHIFT) & TID_MASK)
            | (((syn_id as u64) << SYN_ID_SHIFT) & SYN_ID_MASK);
    }

    pub fn tid(&self) -> usize {
        ((self.0 & TID_MASK) >> TID_SHIFT) as usize
    }

    pub fn syn_id(&self) -> usize {
        ((self.0 & SYN_ID_MASK) >> SYN_ID_SHIFT) as usize
    }

    pub fn lcid(&self) -> usize {
        (self.0 & LCID_MASK) as usize
    }

    pub fn lag(&self) -> usize {
        ((self.0 & LAG_MASK) >> LAG_SHIFT) as usize
    }

    fn set_tid(&mut self, tid: u32) {
        self.0 = (self.0 & !TID_MASK) | (((tid as u64) << TID_SHIFT) & TID_MASK);
    }
}

impl ExchangeRecord for SpikeData {
    fn set_complete_marker(&mut self) {
        self.set_tid(COMPLETE_MARKER);
    }

    fn set_end_marker(&mut self) {
        self.set_tid(END_MARKER);
    }

    fn is_complete_marker(&self) -> bool {
        self.tid() == COMPLETE_MARKER as usize
    }

    fn is_end_marker(&self) -> bool {
        self.tid() == END_MARKER as usize
    }
}

impl fmt::Debug for SpikeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_complete_marker() {
            return f.write_str("SpikeData(complete)");
        }
        if self.is_end_marker() {
            return f.write_str("SpikeData(end)");
        }
        f.debug_struct("SpikeData")
            .field("tid", &self.tid())
            .field("syn_id", &self.syn_id())
            .field("lcid", &self.lcid())
            .field("lag", &self.lag())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_TID;
    use proptest::prelude::*;

    #[test]
    fn test_markers_do_not_touch_payload() {
        let mut s = SpikeData::new(4, 2, 99, 7);
        s.set_end_marker();
        assert!(s.is_end_marker());
        assert!(!s.is_complete_marker());
        assert_eq!((s.syn_id(), s.lcid(), s.lag()), (2, 99, 7));
        s.set_complete_marker();
        assert!(s.is_complete_marker());
        assert!(!s.is_end_marker());
    }

    #[test]
    fn test_default_is_not_a_marker() {
        let s = SpikeData::default();
        assert!(!s.is_complete_marker());
        assert!(!s.is_end_marker());
    }

    #[test]
    fn test_from_target() {
        let t = Target::new(6, 3, 1, 42);
        let s = SpikeData::from_target(&t, 5);
        assert_eq!((s.tid(), s.syn_id(), s.lcid(), s.lag()), (6, 1, 42, 5));
    }

    proptest! {
        #[test]
        fn prop_legal_threads_are_never_markers(
            tid in 0..=MAX_TID as usize,
            syn_id in 0..=MAX_SYN_ID as usize,
            lcid in 0..=MAX_LCID as usize,
            lag in 0..=MAX_LAG as usize,
        ) {
            let s = SpikeData::new(tid, syn_id, lcid, lag);
            prop_assert!(!s.is_complete_marker());
            prop_assert!(!s.is_end_marker());
            prop_assert_eq!((s.tid(), s.syn_id(), s.lcid(), s.lag()), (tid, syn_id, lcid, lag));
        }
    }
}

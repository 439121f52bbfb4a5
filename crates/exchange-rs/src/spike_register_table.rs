//! Spikes emitted during one interval, waiting to be packed.

use crate::{ExchangeSource, SpikeData, Target};
use parking_lot::Mutex;
use spikenet_core::{AssignedRanks, NestError, Result, ThreadId};

/// Cursor into the register: registering thread, lag, entry index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterPosition {
    pub tid: usize,
    pub lag: usize,
    pub sid: usize,
}

/// Per-thread, per-lag lists of targets that must receive a spike.
///
/// Writers (`add_spike`) take the owning thread's lock. Packing reads all
/// threads' lists; each packing thread only claims entries addressed to its
/// assigned ranks, so the processed flags partition the work.
#[derive(Debug)]
pub struct SpikeRegisterTable {
    register: Vec<Mutex<Vec<Vec<Target>>>>,
    num_lags: usize,
    current: Vec<RegisterPosition>,
    saved: Vec<RegisterPosition>,
    saved_entry_point: Vec<bool>,
}

impl SpikeRegisterTable {
    pub fn new(num_threads: usize, num_lags: usize) -> Self {
        Self {
            register: (0..num_threads)
                .map(|_| Mutex::new(vec![Vec::new(); num_lags]))
                .collect(),
            num_lags,
            current: vec![RegisterPosition::default(); num_threads],
            saved: vec![RegisterPosition::default(); num_threads],
            saved_entry_point: vec![false; num_threads],
        }
    }

    pub fn num_threads(&self) -> usize {
        self.register.len()
    }

    pub fn num_lags(&self) -> usize {
        self.num_lags
    }

    /// Register a spike emitted by a neuron on thread `tid`, `lag` steps
    /// into the interval, for every synapse in `targets`
    pub fn add_spike<'a>(
        &self,
        tid: ThreadId,
        lag: usize,
        targets: impl IntoIterator<Item = &'a Target>,
    ) -> Result<()> {
        if lag >= self.num_lags {
            return Err(NestError::BadParameter(format!(
                "lag {} outside interval of {} steps",
                lag, self.num_lags
            )));
        }
        let slot = self.register.get(tid).ok_or_else(|| {
            NestError::BadParameter(format!("thread {} out of range", tid))
        })?;
        let mut lags = slot.lock();
        lags[lag].extend(targets.into_iter().map(|t| {
            let mut t = *t;
            t.set_processed(false);
            t
        }));
        Ok(())
    }

    /// Entries registered by all threads
    pub fn num_entries(&self) -> usize {
        self.register
            .iter()
            .map(|m| m.lock().iter().map(Vec::len).sum::<usize>())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries() == 0
    }

    /// Next unprocessed spike addressed to a rank in `[rank_start, rank_end)`,
    /// scanning from packing thread `tid`'s cursor. The entry is marked
    /// processed.
    pub fn get_next_spike_data(
        &mut self,
        tid: ThreadId,
        rank_start: usize,
        rank_end: usize,
    ) -> Option<(usize, SpikeData)> {
        let num_threads = self.register.len();
        let pos = &mut self.current[tid];
        while pos.tid < num_threads {
            let lags = self.register[pos.tid].get_mut();
            if pos.lag >= lags.len() {
                pos.lag = 0;
                pos.sid = 0;
                pos.tid += 1;
                continue;
            }
            let entries = &mut lags[pos.lag];
            if pos.sid >= entries.len() {
                pos.sid = 0;
                pos.lag += 1;
                continue;
            }
            let target = &mut entries[pos.sid];
            pos.sid += 1;
            if target.is_processed() {
                continue;
            }
            let rank = target.rank();
            if rank_start <= rank && rank < rank_end {
                target.set_processed(true);
                return Some((rank, SpikeData::from_target(target, pos.lag)));
            }
        }
        None
    }

    /// Put back the entry most recently returned to packing thread `tid`
    pub fn reject_last_spike_data(&mut self, tid: ThreadId) {
        let pos = self.current[tid];
        if pos.sid == 0 {
            return;
        }
        let lags = self.register[pos.tid].get_mut();
        lags[pos.lag][pos.sid - 1].set_processed(false);
    }

    /// Remember the entry just rejected as the place to resume from.
    /// Only the first save per round counts.
    pub fn save_entry_point(&mut self, tid: ThreadId) {
        if !self.saved_entry_point[tid] {
            let mut pos = self.current[tid];
            pos.sid = pos.sid.saturating_sub(1);
            self.saved[tid] = pos;
            self.saved_entry_point[tid] = true;
        }
    }

    /// Jump back to the saved entry point, or keep going from the current
    /// position if none was saved
    pub fn restore_entry_point(&mut self, tid: ThreadId) {
        if self.saved_entry_point[tid] {
            self.current[tid] = self.saved[tid];
            self.saved_entry_point[tid] = false;
        }
    }

    pub fn reset_entry_point(&mut self, tid: ThreadId) {
        self.current[tid] = RegisterPosition::default();
        self.saved[tid] = RegisterPosition::default();
        self.saved_entry_point[tid] = false;
    }

    pub fn position(&self, tid: ThreadId) -> RegisterPosition {
        self.current[tid]
    }

    /// Drop everything thread `tid` registered
    pub fn clear(&self, tid: ThreadId) {
        for entries in self.register[tid].lock().iter_mut() {
            entries.clear();
        }
    }

    pub fn clear_all(&self) {
        for tid in 0..self.register.len() {
            self.clear(tid);
        }
    }

    /// Make thread `tid`'s entries eligible for packing again
    pub fn toggle_target_processed_flags(&self, tid: ThreadId) {
        for entries in self.register[tid].lock().iter_mut() {
            for t in entries.iter_mut() {
                t.set_processed(false);
            }
        }
    }
}

impl ExchangeSource<SpikeData> for SpikeRegisterTable {
    fn next_record(&mut self, tid: usize, assigned: AssignedRanks) -> Option<(usize, SpikeData)> {
        self.get_next_spike_data(tid, assigned.begin, assigned.end)
    }

    fn reject_last(&mut self, tid: usize) {
        self.reject_last_spike_data(tid);
    }

    fn save_entry_point(&mut self, tid: usize) {
        SpikeRegisterTable::save_entry_point(self, tid);
    }

    fn restore_entry_point(&mut self, tid: usize) {
        SpikeRegisterTable::restore_entry_point(self, tid);
    }

    fn reset_entry_point(&mut self, tid: usize) {
        SpikeRegisterTable::reset_entry_point(self, tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SpikeRegisterTable {
        let t = SpikeRegisterTable::new(2, 3);
        t.add_spike(0, 0, &[Target::new(0, 0, 0, 1), Target::new(0, 1, 0, 2)])
            .unwrap();
        t.add_spike(1, 2, &[Target::new(1, 0, 0, 3)]).unwrap();
        t
    }

    #[test]
    fn test_iterates_thread_lag_entry_order() {
        let mut t = table();
        let got: Vec<_> = std::iter::from_fn(|| t.get_next_spike_data(0, 0, 2))
            .map(|(r, s)| (r, s.lcid(), s.lag()))
            .collect();
        assert_eq!(got, vec![(0, 1, 0), (1, 2, 0), (0, 3, 2)]);
        assert!(t.get_next_spike_data(0, 0, 2).is_none());
    }

    #[test]
    fn test_rank_filter_leaves_other_entries() {
        let mut t = table();
        let got: Vec<_> = std::iter::from_fn(|| t.get_next_spike_data(0, 1, 2))
            .map(|(_, s)| s.lcid())
            .collect();
        assert_eq!(got, vec![2]);
        let got: Vec<_> = std::iter::from_fn(|| t.get_next_spike_data(1, 0, 1))
            .map(|(_, s)| s.lcid())
            .collect();
        assert_eq!(got, vec![1, 3]);
    }

    #[test]
    fn test_reject_and_resume() {
        let mut t = table();
        let (_, first) = t.get_next_spike_data(0, 0, 2).unwrap();
        assert_eq!(first.lcid(), 1);
        let (_, second) = t.get_next_spike_data(0, 0, 2).unwrap();
        t.reject_last_spike_data(0);
        t.save_entry_point(0);
        // a later save in the same round is ignored
        t.get_next_spike_data(0, 0, 2);
        t.reject_last_spike_data(0);
        t.save_entry_point(0);

        t.restore_entry_point(0);
        let (_, again) = t.get_next_spike_data(0, 0, 2).unwrap();
        assert_eq!(again, second);
        let (_, third) = t.get_next_spike_data(0, 0, 2).unwrap();
        assert_eq!(third.lcid(), 3);
        assert!(t.get_next_spike_data(0, 0, 2).is_none());
    }

    #[test]
    fn test_restore_without_save_keeps_position() {
        let mut t = table();
        t.get_next_spike_data(0, 0, 2);
        let before = t.position(0);
        t.restore_entry_point(0);
        assert_eq!(t.position(0), before);
    }

    #[test]
    fn test_clear_and_toggle() {
        let mut t = table();
        while t.get_next_spike_data(0, 0, 2).is_some() {}
        t.toggle_target_processed_flags(0);
        t.toggle_target_processed_flags(1);
        t.reset_entry_point(0);
        assert_eq!(std::iter::from_fn(|| t.get_next_spike_data(0, 0, 2)).count(), 3);
        t.clear(0);
        assert_eq!(t.num_entries(), 1);
        t.clear_all();
        assert!(t.is_empty());
    }

    #[test]
    fn test_lag_out_of_range() {
        let t = SpikeRegisterTable::new(1, 2);
        assert!(t.add_spike(0, 2, std::iter::empty()).is_err());
    }
}

//! Remote and local synapses reached by each local neuron.

use crate::{SpikeRegisterTable, Target, TargetData};
use parking_lot::Mutex;
use spikenet_core::{NestError, Result, ThreadId};

/// `targets[tid][lid]` lists every synapse, on any rank, whose source is
/// the neuron with local id `lid` on thread `tid`.
#[derive(Debug)]
pub struct TargetTable {
    targets: Vec<Mutex<Vec<Vec<Target>>>>,
}

impl TargetTable {
    pub fn new(num_threads: usize) -> Self {
        Self {
            targets: (0..num_threads).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    pub fn add_target(&self, tid: ThreadId, source_lid: usize, target: Target) -> Result<()> {
        let slot = self.targets.get(tid).ok_or_else(|| {
            NestError::BadParameter(format!("thread {} out of range", tid))
        })?;
        let mut lids = slot.lock();
        if lids.len() <= source_lid {
            lids.resize_with(source_lid + 1, Vec::new);
        }
        lids[source_lid].push(target);
        Ok(())
    }

    /// File a record received during the target exchange
    pub fn add_target_data(&self, td: &TargetData) -> Result<()> {
        self.add_target(td.source_tid as usize, td.source_lid as usize, td.target)
    }

    pub fn targets(&self, tid: ThreadId, source_lid: usize) -> Vec<Target> {
        self.targets
            .get(tid)
            .and_then(|slot| slot.lock().get(source_lid).cloned())
            .unwrap_or_default()
    }

    pub fn num_targets(&self) -> usize {
        self.targets
            .iter()
            .map(|slot| slot.lock().iter().map(Vec::len).sum::<usize>())
            .sum()
    }

    /// Register a spike of neuron `source_lid` on thread `tid` for all its
    /// targets
    pub fn register_spike(
        &self,
        register: &SpikeRegisterTable,
        tid: ThreadId,
        source_lid: usize,
        lag: usize,
    ) -> Result<()> {
        let slot = self.targets.get(tid).ok_or_else(|| {
            NestError::BadParameter(format!("thread {} out of range", tid))
        })?;
        let lids = slot.lock();
        match lids.get(source_lid) {
            Some(targets) => register.add_spike(tid, lag, targets),
            None => Ok(()),
        }
    }

    pub fn clear(&self) {
        for slot in &self.targets {
            slot.lock().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_spike_copies_targets() {
        let table = TargetTable::new(2);
        table.add_target(1, 3, Target::new(0, 0, 0, 7)).unwrap();
        table.add_target(1, 3, Target::new(1, 1, 0, 8)).unwrap();
        assert_eq!(table.targets(1, 3).len(), 2);
        assert!(table.targets(0, 3).is_empty());
        assert_eq!(table.num_targets(), 2);

        let register = SpikeRegisterTable::new(2, 4);
        table.register_spike(&register, 1, 3, 2).unwrap();
        // silent neuron without targets
        table.register_spike(&register, 1, 0, 2).unwrap();
        assert_eq!(register.num_entries(), 2);
    }

    #[test]
    fn test_bad_thread() {
        let table = TargetTable::new(1);
        assert!(table.add_target(1, 0, Target::default()).is_err());
    }
}

//! Sources of the synapses stored on this rank.

use crate::{ExchangeSource, Target, TargetData};
use parking_lot::Mutex;
use spikenet_core::{AssignedRanks, NestError, NodeId, Result, ThreadId, Topology};

/// One incoming connection as seen from the thread holding the synapse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceEntry {
    pub source: NodeId,
    pub syn_id: usize,
    pub lcid: usize,
    processed: bool,
}

impl SourceEntry {
    pub fn new(source: NodeId, syn_id: usize, lcid: usize) -> Self {
        Self {
            source,
            syn_id,
            lcid,
            processed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SourcePosition {
    tid: usize,
    idx: usize,
}

/// Per-thread list of connection sources, turned into [`TargetData`] for
/// the ranks owning those sources.
#[derive(Debug)]
pub struct SourceTable {
    topology: Topology,
    sources: Vec<Mutex<Vec<SourceEntry>>>,
    current: Vec<SourcePosition>,
    saved: Vec<SourcePosition>,
    saved_entry_point: Vec<bool>,
}

impl SourceTable {
    pub fn new(topology: Topology) -> Self {
        let n = topology.num_threads();
        Self {
            topology,
            sources: (0..n).map(|_| Mutex::new(Vec::new())).collect(),
            current: vec![SourcePosition::default(); n],
            saved: vec![SourcePosition::default(); n],
            saved_entry_point: vec![false; n],
        }
    }

    /// Record that thread `tid` holds connection `lcid` of model `syn_id`
    /// whose source is `source`
    pub fn add_source(&self, tid: ThreadId, source: NodeId, syn_id: usize, lcid: usize) -> Result<()> {
        let slot = self.sources.get(tid).ok_or_else(|| {
            NestError::BadParameter(format!("thread {} out of range", tid))
        })?;
        slot.lock().push(SourceEntry::new(source, syn_id, lcid));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sources.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for s in &self.sources {
            s.lock().clear();
        }
    }

    /// Allow every entry to be packed again
    pub fn reset_processed_flags(&self) {
        for s in &self.sources {
            for e in s.lock().iter_mut() {
                e.processed = false;
            }
        }
    }

    fn target_data(&self, tid: usize, entry: &SourceEntry) -> TargetData {
        let target = Target::new(tid, self.topology.rank(), entry.syn_id, entry.lcid);
        TargetData::new(
            self.topology.node_local_id(entry.source),
            self.topology.thread_of_node(entry.source),
            target,
        )
    }
}

impl ExchangeSource<TargetData> for SourceTable {
    fn next_record(&mut self, tid: usize, assigned: AssignedRanks) -> Option<(usize, TargetData)> {
        let num_threads = self.sources.len();
        let topology = self.topology;
        let mut pos = self.current[tid];
        let mut found = None;
        while pos.tid < num_threads {
            let entries = self.sources[pos.tid].get_mut();
            if pos.idx >= entries.len() {
                pos.idx = 0;
                pos.tid += 1;
                continue;
            }
            let entry = &mut entries[pos.idx];
            pos.idx += 1;
            if entry.processed {
                continue;
            }
            let rank = topology.process_of_node(entry.source);
            if assigned.contains(rank) {
                entry.processed = true;
                found = Some((rank, pos.tid, *entry));
                break;
            }
        }
        self.current[tid] = pos;
        found.map(|(rank, holder, entry)| (rank, self.target_data(holder, &entry)))
    }

    fn reject_last(&mut self, tid: usize) {
        let pos = self.current[tid];
        if pos.idx == 0 {
            return;
        }
        self.sources[pos.tid].get_mut()[pos.idx - 1].processed = false;
    }

    fn save_entry_point(&mut self, tid: usize) {
        if !self.saved_entry_point[tid] {
            let mut pos = self.current[tid];
            pos.idx = pos.idx.saturating_sub(1);
            self.saved[tid] = pos;
            self.saved_entry_point[tid] = true;
        }
    }

    fn restore_entry_point(&mut self, tid: usize) {
        if self.saved_entry_point[tid] {
            self.current[tid] = self.saved[tid];
            self.saved_entry_point[tid] = false;
        }
    }

    fn reset_entry_point(&mut self, tid: usize) {
        self.current[tid] = SourcePosition::default();
        self.saved[tid] = SourcePosition::default();
        self.saved_entry_point[tid] = false;
    }
}

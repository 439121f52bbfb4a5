//! Rank/thread layout and node-to-VP assignment.

use crate::{NestError, NodeId, NodeRef, Result, ThreadId};
use serde::{Deserialize, Serialize};

/// Rank and thread layout of one process.
///
/// Nodes are dealt to virtual processes round-robin: `vp = id % num_vps`.
/// VPs are dealt to ranks round-robin as well, so thread `t` on rank `r`
/// runs VP `t * num_processes + r`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    num_processes: usize,
    rank: usize,
    local_num_threads: usize,
}

impl Topology {
    pub fn new(num_processes: usize, rank: usize, local_num_threads: usize) -> Result<Self> {
        if num_processes == 0 {
            return Err(NestError::Config("number of processes must be positive".into()));
        }
        if rank >= num_processes {
            return Err(NestError::Config(format!(
                "rank {} out of range for {} processes",
                rank, num_processes
            )));
        }
        if local_num_threads == 0 {
            return Err(NestError::Config("number of threads must be positive".into()));
        }
        Ok(Self {
            num_processes,
            rank,
            local_num_threads,
        })
    }

    /// One rank, `threads` threads
    pub fn single_process(threads: usize) -> Result<Self> {
        Self::new(1, 0, threads)
    }

    pub fn num_processes(&self) -> usize {
        self.num_processes
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_threads(&self) -> usize {
        self.local_num_threads
    }

    pub fn num_virtual_processes(&self) -> usize {
        self.num_processes * self.local_num_threads
    }

    pub fn node_id_to_vp(&self, node_id: NodeId) -> usize {
        node_id % self.num_virtual_processes()
    }

    pub fn vp_to_thread(&self, vp: usize) -> ThreadId {
        vp / self.num_processes
    }

    pub fn thread_to_vp(&self, tid: ThreadId) -> usize {
        tid * self.num_processes + self.rank
    }

    pub fn is_local_vp(&self, vp: usize) -> bool {
        self.process_of_vp(vp) == self.rank
    }

    pub fn process_of_vp(&self, vp: usize) -> usize {
        vp % self.num_processes
    }

    pub fn process_of_node(&self, node_id: NodeId) -> usize {
        self.process_of_vp(self.node_id_to_vp(node_id))
    }

    /// True if the node lives on this rank (on any of its threads)
    pub fn is_local_node(&self, node_id: NodeId) -> bool {
        self.process_of_node(node_id) == self.rank
    }

    /// Thread owning the node on its rank
    pub fn thread_of_node(&self, node_id: NodeId) -> ThreadId {
        self.vp_to_thread(self.node_id_to_vp(node_id))
    }

    /// Index of a node among the nodes of its VP
    pub fn node_local_id(&self, node_id: NodeId) -> usize {
        node_id / self.num_virtual_processes()
    }

    /// Inverse of [`Topology::node_local_id`] for a given VP
    pub fn node_id_from_local(&self, vp: usize, local_id: usize) -> NodeId {
        local_id * self.num_virtual_processes() + vp
    }

    /// The node as seen from thread `tid` of this rank
    pub fn get_node_or_proxy(&self, node_id: NodeId, tid: ThreadId) -> NodeRef {
        let vp = self.node_id_to_vp(node_id);
        NodeRef {
            node_id,
            thread: self.vp_to_thread(vp),
            is_proxy: vp != self.thread_to_vp(tid),
        }
    }

    /// Ranks whose send-buffer chunks thread `tid` fills during an exchange
    pub fn assigned_ranks(&self, tid: ThreadId) -> AssignedRanks {
        let max_size = self.num_processes.div_ceil(self.local_num_threads);
        let begin = (tid * max_size).min(self.num_processes);
        let end = ((tid + 1) * max_size).min(self.num_processes);
        AssignedRanks {
            begin,
            end,
            size: end - begin,
            max_size,
        }
    }
}

/// Contiguous block of ranks handled by one thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignedRanks {
    pub begin: usize,
    pub end: usize,
    pub size: usize,
    pub max_size: usize,
}

impl AssignedRanks {
    pub fn contains(&self, rank: usize) -> bool {
        self.begin <= rank && rank < self.end
    }
}

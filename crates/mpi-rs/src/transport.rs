//! Byte-level collective transports.
//!
//! A [`Transport`] moves raw bytes between ranks. Every method is a
//! blocking collective: all ranks must call the same methods in the same
//! order, otherwise the program deadlocks.

use parking_lot::Mutex;
use spikenet_core::{NestError, Result};
use std::fmt::Debug;
use std::sync::{Arc, Barrier};

pub trait Transport: Send + Sync + Debug {
    fn num_processes(&self) -> usize;

    fn rank(&self) -> usize;

    /// Every rank contributes `send`; `recv` receives all contributions in
    /// rank order and must be `num_processes * send.len()` long.
    fn all_gather(&self, send: &[u8], recv: &mut [u8]) -> Result<()>;

    /// Variable-size gather: rank `r` contributes `counts[r]` bytes which land
    /// at `recv[displacements[r]..]`.
    fn all_gather_v(
        &self,
        send: &[u8],
        recv: &mut [u8],
        counts: &[usize],
        displacements: &[usize],
    ) -> Result<()>;

    /// Rank `r` receives block `r` of every rank's `send`, each block being
    /// `bytes_per_rank` long.
    fn all_to_all(&self, send: &[u8], recv: &mut [u8], bytes_per_rank: usize) -> Result<()>;

    fn barrier(&self) -> Result<()>;
}

fn size_mismatch(what: &str, expected: usize, got: usize) -> NestError {
    NestError::Communication(format!(
        "{}: expected {} bytes, got {}",
        what, expected, got
    ))
}

// ============================================================================
// SINGLE PROCESS
// ============================================================================

/// Transport for a run with exactly one rank; all collectives are copies
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Transport for SingleProcess {
    fn num_processes(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn all_gather(&self, send: &[u8], recv: &mut [u8]) -> Result<()> {
        if recv.len() != send.len() {
            return Err(size_mismatch("all_gather", send.len(), recv.len()));
        }
        recv.copy_from_slice(send);
        Ok(())
    }

    fn all_gather_v(
        &self,
        send: &[u8],
        recv: &mut [u8],
        counts: &[usize],
        displacements: &[usize],
    ) -> Result<()> {
        if counts.first() != Some(&send.len()) {
            return Err(size_mismatch("all_gather_v", counts.first().copied().unwrap_or(0), send.len()));
        }
        let start = displacements.first().copied().unwrap_or(0);
        recv[start..start + send.len()].copy_from_slice(send);
        Ok(())
    }

    fn all_to_all(&self, send: &[u8], recv: &mut [u8], bytes_per_rank: usize) -> Result<()> {
        if send.len() != bytes_per_rank || recv.len() != bytes_per_rank {
            return Err(size_mismatch("all_to_all", bytes_per_rank, send.len()));
        }
        recv.copy_from_slice(send);
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// IN-PROCESS CLUSTER
// ============================================================================

#[derive(Debug)]
struct ClusterShared {
    size: usize,
    barrier: Barrier,
    slots: Vec<Mutex<Vec<u8>>>,
}

/// Several ranks living as threads of one process.
///
/// Each rank gets one [`LocalTransport`]; the handles must be moved to
/// distinct OS threads, since every collective blocks until all ranks
/// arrive.
#[derive(Debug)]
pub struct LocalCluster;

impl LocalCluster {
    pub fn new(num_processes: usize) -> Vec<LocalTransport> {
        let shared = Arc::new(ClusterShared {
            size: num_processes,
            barrier: Barrier::new(num_processes),
            slots: (0..num_processes).map(|_| Mutex::new(Vec::new())).collect(),
        });
        (0..num_processes)
            .map(|rank| LocalTransport {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// One rank's endpoint of a [`LocalCluster`]
#[derive(Debug, Clone)]
pub struct LocalTransport {
    rank: usize,
    shared: Arc<ClusterShared>,
}

impl LocalTransport {
    /// Publish `send`, wait for all ranks, run `read`, wait again so no rank
    /// overwrites its slot while others still read it.
    fn exchange<F>(&self, send: &[u8], read: F) -> Result<()>
    where
        F: FnOnce(&[Mutex<Vec<u8>>]) -> Result<()>,
    {
        {
            let mut slot = self.shared.slots[self.rank].lock();
            slot.clear();
            slot.extend_from_slice(send);
        }
        self.shared.barrier.wait();
        let result = read(&self.shared.slots);
        self.shared.barrier.wait();
        result
    }
}

impl Transport for LocalTransport {
    fn num_processes(&self) -> usize {
        self.shared.size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn all_gather(&self, send: &[u8], recv: &mut [u8]) -> Result<()> {
        let block = send.len();
        self.exchange(send, |slots| {
            if recv.len() != block * slots.len() {
                return Err(size_mismatch("all_gather", block * slots.len(), recv.len()));
            }
            for (r, slot) in slots.iter().enumerate() {
                let data = slot.lock();
                if data.len() != block {
                    return Err(size_mismatch("all_gather block", block, data.len()));
                }
                recv[r * block..(r + 1) * block].copy_from_slice(&data);
            }
            Ok(())
        })
    }

    fn all_gather_v(
        &self,
        send: &[u8],
        recv: &mut [u8],
        counts: &[usize],
        displacements: &[usize],
    ) -> Result<()> {
        self.exchange(send, |slots| {
            for (r, slot) in slots.iter().enumerate() {
                let data = slot.lock();
                if data.len() != counts[r] {
                    return Err(size_mismatch("all_gather_v block", counts[r], data.len()));
                }
                let start = displacements[r];
                recv[start..start + counts[r]].copy_from_slice(&data);
            }
            Ok(())
        })
    }

    fn all_to_all(&self, send: &[u8], recv: &mut [u8], bytes_per_rank: usize) -> Result<()> {
        let me = self.rank;
        self.exchange(send, |slots| {
            let expected = bytes_per_rank * slots.len();
            if recv.len() != expected {
                return Err(size_mismatch("all_to_all", expected, recv.len()));
            }
            for (r, slot) in slots.iter().enumerate() {
                let data = slot.lock();
                if data.len() != expected {
                    return Err(size_mismatch("all_to_all block", expected, data.len()));
                }
                recv[r * bytes_per_rank..(r + 1) * bytes_per_rank]
                    .copy_from_slice(&data[me * bytes_per_rank..(me + 1) * bytes_per_rank]);
            }
            Ok(())
        })
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_single_process_copies() {
        let t = SingleProcess;
        let mut recv = [0u8; 3];
        t.all_gather(&[1, 2, 3], &mut recv).unwrap();
        assert_eq!(recv, [1, 2, 3]);
        assert!(t.all_gather(&[1, 2], &mut recv).is_err());
    }

    #[test]
    fn test_local_cluster_all_gather() {
        let handles: Vec<_> = LocalCluster::new(3)
            .into_iter()
            .map(|t| {
                thread::spawn(move || {
                    let send = [t.rank() as u8; 2];
                    let mut recv = [0u8; 6];
                    t.all_gather(&send, &mut recv).unwrap();
                    recv
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), [0, 0, 1, 1, 2, 2]);
        }
    }

    #[test]
    fn test_local_cluster_all_to_all() {
        let handles: Vec<_> = LocalCluster::new(2)
            .into_iter()
            .map(|t| {
                thread::spawn(move || {
                    let r = t.rank() as u8;
                    // block for rank 0, block for rank 1
                    let send = [10 * r, 10 * r + 1];
                    let mut recv = [0u8; 2];
                    t.all_to_all(&send, &mut recv, 1).unwrap();
                    (t.rank(), recv)
                })
            })
            .collect();
        for h in handles {
            let (rank, recv) = h.join().unwrap();
            if rank == 0 {
                assert_eq!(recv, [0, 10]);
            } else {
                assert_eq!(recv, [1, 11]);
            }
        }
    }
}

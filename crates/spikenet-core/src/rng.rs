//! Random stream provisioning.
//!
//! Two kinds of stream exist and they are deliberately different types:
//!
//! - [`VpSpecificRng`]: one independent stream per virtual process, used
//!   for decisions about locally owned targets.
//! - [`SyncedRng`]: a stream that yields the same sequence on every rank
//!   (rank-synchronized) or on every VP (VP-synchronized), used for
//!   decisions that all ranks must agree on without communicating.
//!
//! Handing a builder the wrong kind breaks rank-count invariance silently,
//! so functions state which one they need in their signature.

use crate::{Result, ThreadId, Topology};
use parking_lot::{Mutex, MutexGuard};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

const RANK_SYNCED_STREAM: u64 = 0;
const VP_SYNCED_STREAM: u64 = u64::MAX;

fn stream(seed: u64, stream: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(stream);
    rng
}

macro_rules! delegate_rng_core {
    ($ty:ty) => {
        impl RngCore for $ty {
            fn next_u32(&mut self) -> u32 {
                self.0.next_u32()
            }

            fn next_u64(&mut self) -> u64 {
                self.0.next_u64()
            }

            fn fill_bytes(&mut self, dest: &mut [u8]) {
                self.0.fill_bytes(dest)
            }

            fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
                self.0.try_fill_bytes(dest)
            }
        }
    };
}

/// Stream private to one virtual process
#[derive(Debug, Clone)]
pub struct VpSpecificRng(ChaCha8Rng);

impl VpSpecificRng {
    pub fn new(seed: u64, vp: usize) -> Self {
        Self(stream(seed, vp as u64 + 1))
    }
}

delegate_rng_core!(VpSpecificRng);

/// Stream replicated identically across ranks or VPs
#[derive(Debug, Clone)]
pub struct SyncedRng(ChaCha8Rng);

impl SyncedRng {
    pub fn rank_synced(seed: u64) -> Self {
        Self(stream(seed, RANK_SYNCED_STREAM))
    }

    pub fn vp_synced(seed: u64) -> Self {
        Self(stream(seed, VP_SYNCED_STREAM))
    }
}

delegate_rng_core!(SyncedRng);

/// All random streams of one rank
#[derive(Debug)]
pub struct RngManager {
    seed: u64,
    vp_specific: Vec<Mutex<VpSpecificRng>>,
    vp_synced: Vec<Mutex<SyncedRng>>,
    rank_synced: Mutex<SyncedRng>,
}

impl RngManager {
    pub fn new(topology: &Topology, seed: u64) -> Self {
        let threads = topology.num_threads();
        Self {
            seed,
            vp_specific: (0..threads)
                .map(|tid| Mutex::new(VpSpecificRng::new(seed, topology.thread_to_vp(tid))))
                .collect(),
            vp_synced: (0..threads)
                .map(|_| Mutex::new(SyncedRng::vp_synced(seed)))
                .collect(),
            rank_synced: Mutex::new(SyncedRng::rank_synced(seed)),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Stream of the VP run by thread `tid`
    pub fn vp_specific(&self, tid: ThreadId) -> MutexGuard<'_, VpSpecificRng> {
        self.vp_specific[tid].lock()
    }

    /// Stream shared by all VPs; each thread holds its own copy
    pub fn vp_synced(&self, tid: ThreadId) -> MutexGuard<'_, SyncedRng> {
        self.vp_synced[tid].lock()
    }

    /// Stream shared by all ranks; only the master thread should draw from it
    pub fn rank_synced(&self) -> MutexGuard<'_, SyncedRng> {
        self.rank_synced.lock()
    }

    /// Restart every stream from a new master seed
    pub fn reseed(&mut self, topology: &Topology, seed: u64) -> Result<()> {
        *self = Self::new(topology, seed);
        Ok(())
    }
}

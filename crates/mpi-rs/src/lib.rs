//! # SpikeNet MPI
//!
//! Typed collectives on top of a byte [`Transport`].
//!
//! Two payload shapes are supported:
//!
//! - **variable-length all-gather** ([`MpiManager::communicate`]): a fast
//!   fixed-size all-gather whose slot size is learned over time, with a
//!   two-phase overflow protocol when some rank's payload does not fit;
//! - **fixed-size all-to-all** ([`MpiManager::communicate_alltoall`]): the
//!   chunk size is negotiated by the caller, used for the per-step spike
//!   and target exchange.
//!
//! With one rank every collective degenerates to a copy and the transport
//! is never touched.

pub mod transport;

use bytemuck::Pod;
use num_traits::{Bounded, NumCast, ToPrimitive};
use rand::Rng;
use spikenet_core::{CommunicationConfig, NestError, Result, RngManager};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

pub use transport::{LocalCluster, LocalTransport, SingleProcess, Transport};

/// Element types usable in the variable-length all-gather.
///
/// The largest representable value marks an overflowing slot, and counts are
/// encoded in the element type itself.
pub trait CollectiveElement: Pod + Bounded + NumCast + PartialEq {}

impl<T: Pod + Bounded + NumCast + PartialEq> CollectiveElement for T {}

/// Result of a variable-length all-gather
#[derive(Debug, Clone, PartialEq)]
pub struct Gathered<T> {
    /// Payloads of all ranks, concatenated in rank order
    pub data: Vec<T>,
    /// Number of elements contributed by each rank
    pub counts: Vec<usize>,
    /// `displacements[r]` is the offset of rank `r`'s payload in `data`
    pub displacements: Vec<usize>,
}

impl<T> Gathered<T> {
    pub fn rank_data(&self, rank: usize) -> &[T] {
        let start = self.displacements[rank];
        &self.data[start..start + self.counts[rank]]
    }
}

fn displacements_of(counts: &[usize]) -> Vec<usize> {
    let mut displacements = Vec::with_capacity(counts.len());
    let mut disp = 0;
    for &c in counts {
        displacements.push(disp);
        disp += c;
    }
    displacements
}

fn cast<T: NumCast>(n: usize) -> Result<T> {
    T::from(n).ok_or_else(|| {
        NestError::Communication(format!("count {} not representable in element type", n))
    })
}

fn uncast<T: ToPrimitive>(v: T) -> Result<usize> {
    v.to_usize()
        .ok_or_else(|| NestError::Communication("corrupt count in all-gather slot".into()))
}

/// Collective communication for one rank
#[derive(Debug)]
pub struct MpiManager {
    transport: Box<dyn Transport>,
    /// Elements per rank in the fixed all-gather slot, including the header
    send_buffer_size: AtomicUsize,
    recv_buffer_size: AtomicUsize,
}

impl MpiManager {
    pub fn new(transport: Box<dyn Transport>, config: &CommunicationConfig) -> Self {
        let np = transport.num_processes();
        let send = config.send_buffer_size.max(2);
        Self {
            transport,
            send_buffer_size: AtomicUsize::new(send),
            recv_buffer_size: AtomicUsize::new(send * np),
        }
    }

    pub fn single_process(config: &CommunicationConfig) -> Self {
        Self::new(Box::new(SingleProcess), config)
    }

    pub fn num_processes(&self) -> usize {
        self.transport.num_processes()
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn send_buffer_size(&self) -> usize {
        self.send_buffer_size.load(Ordering::Relaxed)
    }

    pub fn recv_buffer_size(&self) -> usize {
        self.recv_buffer_size.load(Ordering::Relaxed)
    }

    // ========================================================================
    // VARIABLE-LENGTH ALL-GATHER
    // ========================================================================

    /// Gather every rank's `send` payload on every rank.
    pub fn communicate<T: CollectiveElement>(&self, send: &[T]) -> Result<Gathered<T>> {
        if self.num_processes() == 1 {
            if self.recv_buffer_size() < send.len() {
                self.send_buffer_size.store(send.len() + 1, Ordering::Relaxed);
                self.recv_buffer_size.store(send.len(), Ordering::Relaxed);
            }
            return Ok(Gathered {
                data: send.to_vec(),
                counts: vec![send.len()],
                displacements: vec![0],
            });
        }
        self.communicate_allgather(send)
    }

    /// Fixed-slot all-gather, falling back to [`Self::communicate_allgatherv`]
    /// when any rank overflows its slot.
    ///
    /// Slot layout is `[count, payload..., padding]`, or
    /// `[OVERFLOW_MARKER, count, padding]` when the payload does not fit.
    /// After an overflow every rank adopts the largest payload seen, so all
    /// ranks keep identical slot sizes.
    pub fn communicate_allgather<T: CollectiveElement>(&self, send: &[T]) -> Result<Gathered<T>> {
        let np = self.num_processes();
        let slot = self.send_buffer_size();
        let marker = T::max_value();

        // a count equal to the marker would read as overflow
        let count_fits = uncast(marker).map_or(true, |m| send.len() < m);
        let mut block = vec![T::zeroed(); slot];
        if send.len() < slot && count_fits {
            block[0] = cast(send.len())?;
            block[1..=send.len()].copy_from_slice(send);
        } else {
            block[0] = marker;
            block[1] = cast(send.len())?;
        }

        let mut recv = vec![T::zeroed(); slot * np];
        self.transport.all_gather(
            bytemuck::cast_slice(&block),
            bytemuck::cast_slice_mut(&mut recv),
        )?;

        let mut counts = Vec::with_capacity(np);
        let mut overflow = false;
        for r in 0..np {
            let head = &recv[r * slot..(r + 1) * slot];
            if head[0] == marker {
                overflow = true;
                counts.push(uncast(head[1])?);
            } else {
                counts.push(uncast(head[0])?);
            }
        }
        let displacements = displacements_of(&counts);

        if overflow {
            let max_count = counts.iter().copied().max().unwrap_or(0);
            debug!(
                rank = self.rank(),
                old_slot = slot,
                new_slot = max_count + 1,
                "all-gather overflow, switching to variable-size transfer"
            );
            let data = self.communicate_allgatherv(send, &counts, &displacements)?;
            self.send_buffer_size.store(max_count + 1, Ordering::Relaxed);
            self.recv_buffer_size.store((max_count + 1) * np, Ordering::Relaxed);
            return Ok(Gathered {
                data,
                counts,
                displacements,
            });
        }

        let mut data = Vec::with_capacity(counts.iter().sum());
        for (r, &c) in counts.iter().enumerate() {
            data.extend_from_slice(&recv[r * slot + 1..r * slot + 1 + c]);
        }
        Ok(Gathered {
            data,
            counts,
            displacements,
        })
    }

    /// Variable-size gather with counts known on every rank
    pub fn communicate_allgatherv<T: Pod>(
        &self,
        send: &[T],
        counts: &[usize],
        displacements: &[usize],
    ) -> Result<Vec<T>> {
        let total: usize = counts.iter().sum();
        let mut recv = vec![T::zeroed(); total];
        let size = std::mem::size_of::<T>();
        let byte_counts: Vec<usize> = counts.iter().map(|c| c * size).collect();
        let byte_displs: Vec<usize> = displacements.iter().map(|d| d * size).collect();
        self.transport.all_gather_v(
            bytemuck::cast_slice(send),
            bytemuck::cast_slice_mut(&mut recv),
            &byte_counts,
            &byte_displs,
        )?;
        Ok(recv)
    }

    // ========================================================================
    // FIXED-SIZE COLLECTIVES
    // ========================================================================

    /// Gather one value from every rank
    pub fn communicate_value<T: Pod>(&self, value: T) -> Result<Vec<T>> {
        let np = self.num_processes();
        if np == 1 {
            return Ok(vec![value]);
        }
        let mut recv = vec![T::zeroed(); np];
        self.transport.all_gather(
            bytemuck::bytes_of(&value),
            bytemuck::cast_slice_mut(&mut recv),
        )?;
        Ok(recv)
    }

    /// Each rank fills `buffer[rank]`; afterwards all entries are filled
    pub fn communicate_in_place<T: Pod>(&self, buffer: &mut [T]) -> Result<()> {
        let np = self.num_processes();
        if buffer.len() != np {
            return Err(NestError::Communication(format!(
                "in-place gather needs one entry per rank, got {}",
                buffer.len()
            )));
        }
        let gathered = self.communicate_value(buffer[self.rank()])?;
        buffer.copy_from_slice(&gathered);
        Ok(())
    }

    /// Exchange `count_per_rank` elements with every rank.
    ///
    /// `send[r * count_per_rank..]` goes to rank `r`; data from rank `r`
    /// arrives at `recv[r * count_per_rank..]`.
    pub fn communicate_alltoall<T: Pod>(
        &self,
        send: &[T],
        recv: &mut [T],
        count_per_rank: usize,
    ) -> Result<()> {
        let np = self.num_processes();
        if send.len() != np * count_per_rank || recv.len() != np * count_per_rank {
            return Err(NestError::Communication(format!(
                "all-to-all buffers must hold {} elements",
                np * count_per_rank
            )));
        }
        if np == 1 {
            recv.copy_from_slice(send);
            return Ok(());
        }
        self.transport.all_to_all(
            bytemuck::cast_slice(send),
            bytemuck::cast_slice_mut(recv),
            count_per_rank * std::mem::size_of::<T>(),
        )
    }

    pub fn any_true(&self, value: bool) -> Result<bool> {
        let flags = self.communicate_value(value as u8)?;
        Ok(flags.iter().any(|&f| f != 0))
    }

    pub fn max_cross_ranks<T: Pod + PartialOrd>(&self, value: T) -> Result<T> {
        let values = self.communicate_value(value)?;
        Ok(values
            .into_iter()
            .fold(value, |acc, v| if v > acc { v } else { acc }))
    }

    pub fn min_cross_ranks<T: Pod + PartialOrd>(&self, value: T) -> Result<T> {
        let values = self.communicate_value(value)?;
        Ok(values
            .into_iter()
            .fold(value, |acc, v| if v < acc { v } else { acc }))
    }

    pub fn sum_cross_ranks<T: Pod + std::iter::Sum<T>>(&self, value: T) -> Result<T> {
        Ok(self.communicate_value(value)?.into_iter().sum())
    }

    pub fn synchronize(&self) -> Result<()> {
        if self.num_processes() == 1 {
            return Ok(());
        }
        self.transport.barrier()
    }

    /// Draw from the rank-synchronized stream on every rank and compare.
    pub fn check_rng_synchrony(&self, rng: &RngManager) -> Result<()> {
        let draw: u64 = rng.rank_synced().gen();
        let draws = self.communicate_value(draw)?;
        if draws.iter().any(|&d| d != draw) {
            return Err(NestError::Communication(
                "rank-synchronized random streams are out of sync".into(),
            ));
        }
        Ok(())
    }
}

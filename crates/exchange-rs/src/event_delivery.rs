//! Multi-round spike and target exchange.

use crate::{
    ExchangeRecord, ExchangeSource, SourceTable, SpikeData, SpikeRegisterTable, TargetData,
    TargetTable, MAX_TID,
};
use serde::{Deserialize, Serialize};
use spikenet_core::{CommunicationConfig, NestError, Result, Topology};
use spikenet_mpi::MpiManager;
use tracing::{debug, info};

/// Counters accumulated over the lifetime of an [`EventDeliveryManager`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangeStats {
    pub spike_exchanges: u64,
    pub spike_rounds: u64,
    pub spikes_sent: u64,
    pub target_exchanges: u64,
    pub target_rounds: u64,
    pub target_data_sent: u64,
    pub max_rounds: usize,
    pub buffer_resizes: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct RoundOutcome {
    rounds: usize,
    sent: usize,
    /// Most records written to a single chunk in any round
    peak_chunk: usize,
}

/// Owns the all-to-all buffer sizes and drives the exchange loop.
///
/// Each round every thread packs records for its assigned ranks into fixed
/// chunks of the send buffer, then one all-to-all moves all chunks. A chunk
/// ends with a complete marker when its sender had nothing more for that
/// rank; otherwise another round follows on every rank.
#[derive(Debug)]
pub struct EventDeliveryManager {
    topology: Topology,
    config: CommunicationConfig,
    buffer_size_spike_data: usize,
    buffer_size_target_data: usize,
    spike_needs_growth: bool,
    peak_spike_chunk: usize,
    stats: ExchangeStats,
}

impl EventDeliveryManager {
    pub fn new(topology: Topology, config: &CommunicationConfig) -> Result<Self> {
        config.validate()?;
        if topology.num_threads() > MAX_TID as usize + 1 {
            return Err(NestError::Config(format!(
                "at most {} threads can be addressed by spike records",
                MAX_TID + 1
            )));
        }
        let np = topology.num_processes();
        Ok(Self {
            topology,
            config: config.clone(),
            buffer_size_spike_data: config.buffer_size_spike_data.max(np),
            buffer_size_target_data: config.buffer_size_target_data.max(np),
            spike_needs_growth: false,
            peak_spike_chunk: 0,
            stats: ExchangeStats::default(),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn stats(&self) -> &ExchangeStats {
        &self.stats
    }

    pub fn buffer_size_spike_data(&self) -> usize {
        self.buffer_size_spike_data
    }

    pub fn buffer_size_target_data(&self) -> usize {
        self.buffer_size_target_data
    }

    pub fn send_recv_count_spike_data_per_rank(&self) -> usize {
        (self.buffer_size_spike_data / self.topology.num_processes()).max(1)
    }

    pub fn send_recv_count_target_data_per_rank(&self) -> usize {
        (self.buffer_size_target_data / self.topology.num_processes()).max(1)
    }

    /// Move every spike in `register` to the rank holding its synapse.
    ///
    /// `deliver(source_rank, spike)` runs on the receiving side for each
    /// spike, in rank order within a round. Returns the number of rounds.
    /// The register is left untouched apart from processed flags; the caller
    /// clears it once the interval is done.
    pub fn gather_spike_data<F>(
        &mut self,
        mpi: &MpiManager,
        register: &mut SpikeRegisterTable,
        deliver: F,
    ) -> Result<usize>
    where
        F: FnMut(usize, SpikeData) -> Result<()>,
    {
        self.check_layout(mpi)?;
        let per_rank = self.send_recv_count_spike_data_per_rank();
        let outcome = exchange_rounds(mpi, &self.topology, per_rank, register, deliver)?;
        for tid in 0..register.num_threads() {
            register.reset_entry_point(tid);
        }

        self.spike_needs_growth |= outcome.rounds > 1;
        self.peak_spike_chunk = self.peak_spike_chunk.max(outcome.peak_chunk);
        self.stats.spike_exchanges += 1;
        self.stats.spike_rounds += outcome.rounds as u64;
        self.stats.spikes_sent += outcome.sent as u64;
        self.stats.max_rounds = self.stats.max_rounds.max(outcome.rounds);
        debug!(
            rounds = outcome.rounds,
            sent = outcome.sent,
            per_rank,
            "spike exchange finished"
        );
        Ok(outcome.rounds)
    }

    /// Send every entry of `sources` to the rank owning its source neuron
    /// and file what arrives in `targets`.
    ///
    /// With adaptive target buffers an exchange that needed more than one
    /// round grows the chunk size for the next exchange.
    pub fn gather_target_data(
        &mut self,
        mpi: &MpiManager,
        sources: &mut SourceTable,
        targets: &TargetTable,
    ) -> Result<usize> {
        self.check_layout(mpi)?;
        let np = self.topology.num_processes();
        let per_rank = self.send_recv_count_target_data_per_rank();
        sources.reset_processed_flags();
        let outcome = exchange_rounds(mpi, &self.topology, per_rank, sources, |_, td: TargetData| {
            targets.add_target_data(&td)
        })?;
        for tid in 0..self.topology.num_threads() {
            sources.reset_entry_point(tid);
        }

        let new_size = if self.config.adaptive_target_buffers && outcome.rounds > 1 {
            grown(
                per_rank,
                self.config.growth_factor_buffer_target_data,
                self.config.max_buffer_size_target_data / np,
            ) * np
        } else {
            self.buffer_size_target_data
        };
        if new_size != self.buffer_size_target_data {
            info!(
                from = self.buffer_size_target_data,
                to = new_size,
                "target data buffer resized"
            );
            self.buffer_size_target_data = new_size;
            self.stats.buffer_resizes += 1;
        }
        self.stats.target_exchanges += 1;
        self.stats.target_rounds += outcome.rounds as u64;
        self.stats.target_data_sent += outcome.sent as u64;
        self.stats.max_rounds = self.stats.max_rounds.max(outcome.rounds);
        debug!(rounds = outcome.rounds, sent = outcome.sent, "target exchange finished");
        Ok(outcome.rounds)
    }

    /// Adapt the spike buffer to recent traffic. Collective: call on every
    /// rank between intervals.
    ///
    /// Grows after any exchange that needed more than one round. Shrinks
    /// towards the busiest chunk seen on any rank, never below the
    /// configured initial size.
    pub fn update_spike_buffer_size(&mut self, mpi: &MpiManager) -> Result<()> {
        if !self.config.adaptive_spike_buffers {
            return Ok(());
        }
        let np = self.topology.num_processes();
        let per_rank = self.send_recv_count_spike_data_per_rank();
        let peak = mpi.max_cross_ranks(self.peak_spike_chunk as u64)? as usize;
        let grow = self.spike_needs_growth;
        self.spike_needs_growth = false;
        self.peak_spike_chunk = 0;

        let new_per_rank = if grow {
            grown(
                per_rank,
                self.config.growth_factor_buffer_spike_data,
                self.config.max_buffer_size_spike_data / np,
            )
        } else {
            let floor = (self.config.buffer_size_spike_data / np).max(1);
            let shrunk = (per_rank as f64 * self.config.shrink_factor_buffer_spike_data) as usize;
            if peak + 1 < shrunk {
                shrunk.max(peak + 1).max(floor)
            } else {
                per_rank
            }
        };

        if new_per_rank != per_rank {
            info!(
                from = self.buffer_size_spike_data,
                to = new_per_rank * np,
                "spike data buffer resized"
            );
            self.buffer_size_spike_data = new_per_rank * np;
            self.stats.buffer_resizes += 1;
        }
        Ok(())
    }

    fn check_layout(&self, mpi: &MpiManager) -> Result<()> {
        if mpi.num_processes() != self.topology.num_processes()
            || mpi.rank() != self.topology.rank()
        {
            return Err(NestError::Communication(format!(
                "communicator is rank {} of {}, topology expects rank {} of {}",
                mpi.rank(),
                mpi.num_processes(),
                self.topology.rank(),
                self.topology.num_processes()
            )));
        }
        Ok(())
    }
}

fn grown(per_rank: usize, factor: f64, max_per_rank: usize) -> usize {
    let cap = max_per_rank.max(1).max(per_rank);
    let target = ((per_rank as f64 * factor).ceil() as usize).max(per_rank + 1);
    target.min(cap)
}

/// Run rounds until no rank has anything left for anyone.
fn exchange_rounds<R, S, F>(
    mpi: &MpiManager,
    topology: &Topology,
    per_rank: usize,
    source: &mut S,
    mut deliver: F,
) -> Result<RoundOutcome>
where
    R: ExchangeRecord,
    S: ExchangeSource<R>,
    F: FnMut(usize, R) -> Result<()>,
{
    let np = mpi.num_processes();
    for tid in 0..topology.num_threads() {
        source.reset_entry_point(tid);
    }
    let mut outcome = RoundOutcome::default();
    loop {
        outcome.rounds += 1;
        let mut send = vec![R::default(); np * per_rank];
        for tid in 0..topology.num_threads() {
            let (sent, peak) = collocate(source, tid, topology, per_rank, &mut send);
            outcome.sent += sent;
            outcome.peak_chunk = outcome.peak_chunk.max(peak);
        }

        let mut recv = vec![R::default(); np * per_rank];
        mpi.communicate_alltoall(&send, &mut recv, per_rank)?;
        let complete = deliver_chunks(&recv, per_rank, &mut deliver)?;

        if !mpi.any_true(!complete)? {
            return Ok(outcome);
        }
    }
}

/// Pack records for thread `tid`'s ranks. Returns records written and the
/// fullest chunk.
fn collocate<R, S>(
    source: &mut S,
    tid: usize,
    topology: &Topology,
    per_rank: usize,
    send: &mut [R],
) -> (usize, usize)
where
    R: ExchangeRecord,
    S: ExchangeSource<R>,
{
    let assigned = topology.assigned_ranks(tid);
    if assigned.size == 0 {
        return (0, 0);
    }
    let mut pos = crate::SendBufferPosition::new(assigned, per_rank);
    source.restore_entry_point(tid);

    while let Some((rank, record)) = source.next_record(tid, assigned) {
        if pos.is_chunk_filled(rank) {
            source.reject_last(tid);
            source.save_entry_point(tid);
            pos.mark_overflow(rank);
            if pos.are_all_chunks_filled() {
                break;
            }
        } else {
            send[pos.idx(rank)] = record;
            pos.increase(rank);
        }
    }

    let mut sent = 0;
    let mut peak = 0;
    for rank in assigned.begin..assigned.end {
        let written = pos.num_written(rank);
        sent += written;
        peak = peak.max(written);
        if !pos.is_chunk_filled(rank) {
            let mut marker = R::default();
            if pos.overflowed(rank) {
                marker.set_end_marker();
            } else {
                marker.set_complete_marker();
            }
            send[pos.idx(rank)] = marker;
        }
    }
    (sent, peak)
}

/// Hand every record before a marker to `deliver`. True when every sender
/// marked its chunk complete.
fn deliver_chunks<R, F>(recv: &[R], per_rank: usize, deliver: &mut F) -> Result<bool>
where
    R: ExchangeRecord,
    F: FnMut(usize, R) -> Result<()>,
{
    let mut all_complete = true;
    for (rank, chunk) in recv.chunks(per_rank).enumerate() {
        let mut complete = false;
        for record in chunk {
            if record.is_complete_marker() {
                complete = true;
                break;
            }
            if record.is_end_marker() {
                break;
            }
            deliver(rank, *record)?;
        }
        all_complete &= complete;
    }
    Ok(all_complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Target;

    fn manager(threads: usize, buffer: usize) -> (EventDeliveryManager, MpiManager) {
        let config = CommunicationConfig {
            buffer_size_spike_data: buffer,
            buffer_size_target_data: buffer,
            max_buffer_size_spike_data: 64,
            max_buffer_size_target_data: 64,
            ..Default::default()
        };
        let topo = Topology::single_process(threads).unwrap();
        (
            EventDeliveryManager::new(topo, &config).unwrap(),
            MpiManager::single_process(&config),
        )
    }

    #[test]
    fn test_empty_register_needs_one_round() {
        let (mut edm, mpi) = manager(2, 4);
        let mut register = SpikeRegisterTable::new(2, 3);
        let mut got = 0;
        let rounds = edm
            .gather_spike_data(&mpi, &mut register, |_, _| {
                got += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(rounds, 1);
        assert_eq!(got, 0);
    }

    #[test]
    fn test_small_buffer_takes_several_rounds() {
        let (mut edm, mpi) = manager(1, 2);
        let mut register = SpikeRegisterTable::new(1, 4);
        let targets: Vec<Target> = (0..5).map(|i| Target::new(0, 0, 0, i)).collect();
        register.add_spike(0, 1, &targets).unwrap();

        let mut lcids = Vec::new();
        let rounds = edm
            .gather_spike_data(&mpi, &mut register, |rank, s| {
                assert_eq!(rank, 0);
                assert_eq!(s.lag(), 1);
                lcids.push(s.lcid());
                Ok(())
            })
            .unwrap();
        assert_eq!(lcids, vec![0, 1, 2, 3, 4]);
        // chunk of 2: two full rounds plus one with a record and a marker
        assert_eq!(rounds, 3);
        assert_eq!(edm.stats().spikes_sent, 5);

        edm.update_spike_buffer_size(&mpi).unwrap();
        assert_eq!(edm.buffer_size_spike_data(), 3);
    }

    #[test]
    fn test_buffer_shrinks_towards_floor() {
        let (mut edm, mpi) = manager(1, 2);
        edm.buffer_size_spike_data = 40;
        let mut register = SpikeRegisterTable::new(1, 1);
        register.add_spike(0, 0, &[Target::new(0, 0, 0, 1)]).unwrap();
        edm.gather_spike_data(&mpi, &mut register, |_, _| Ok(())).unwrap();
        edm.update_spike_buffer_size(&mpi).unwrap();
        assert_eq!(edm.buffer_size_spike_data(), 32);
    }

    #[test]
    fn test_growth_is_capped() {
        assert_eq!(grown(2, 1.5, 64), 3);
        assert_eq!(grown(10, 1.5, 64), 15);
        assert_eq!(grown(60, 1.5, 64), 64);
        assert_eq!(grown(64, 1.5, 64), 64);
        assert_eq!(grown(1, 1.5, 0), 1);
    }

    #[test]
    fn test_target_exchange_fills_table() {
        let (mut edm, mpi) = manager(2, 2);
        let topo = *edm.topology();
        let mut sources = SourceTable::new(topo);
        // nodes 1..=6 are all local; synapses live on thread 1
        for (lcid, src) in (1..=6).enumerate() {
            sources.add_source(1, src, 0, lcid).unwrap();
        }
        let targets = TargetTable::new(2);
        let rounds = edm.gather_target_data(&mpi, &mut sources, &targets).unwrap();
        // three full chunks, then a lone complete marker
        assert_eq!(rounds, 4);
        assert_eq!(targets.num_targets(), 6);
        // node 3 -> vp 1 (thread 1), lid 1
        assert_eq!(targets.targets(1, 1), vec![Target::new(1, 0, 0, 2)]);
        assert_eq!(edm.buffer_size_target_data(), 3);
    }

    #[test]
    fn test_layout_mismatch() {
        let config = CommunicationConfig::default();
        let topo = Topology::new(2, 0, 1).unwrap();
        let mut edm = EventDeliveryManager::new(topo, &config).unwrap();
        let mpi = MpiManager::single_process(&config);
        let mut register = SpikeRegisterTable::new(1, 1);
        assert!(matches!(
            edm.gather_spike_data(&mpi, &mut register, |_, _| Ok(())),
            Err(NestError::Communication(_))
        ));
    }
}

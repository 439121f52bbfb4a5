//! # SpikeNet Exchange
//!
//! Compact records and the per-step exchange that routes spikes from the
//! thread where a neuron fired to the threads owning its synapses, across
//! ranks.
//!
//! ## Flow per communication interval
//!
//! ```text
//! neuron fires ── TargetTable lookup ──> SpikeRegisterTable::add_spike
//!                                               │
//!                 collocate into rank chunks ◄──┘ (may stop when a chunk is full)
//!                                               │
//!                 all-to-all ──> drain chunks ──> deliver(tid, syn_id, lcid, lag)
//!                       ▲                               │
//!                       └──── another round if any rank still has data
//! ```
//!
//! The same machinery moves [`TargetData`] once after connectivity is built,
//! filling each rank's [`TargetTable`].

pub mod event_delivery;
pub mod send_buffer_position;
pub mod source_table;
pub mod spike_data;
pub mod spike_register_table;
pub mod target;
pub mod target_data;
pub mod target_table;

pub use event_delivery::{EventDeliveryManager, ExchangeStats};
pub use send_buffer_position::SendBufferPosition;
pub use source_table::{SourceEntry, SourceTable};
pub use spike_data::SpikeData;
pub use spike_register_table::{RegisterPosition, SpikeRegisterTable};
pub use target::Target;
pub use target_data::TargetData;
pub use target_table::TargetTable;

use spikenet_core::AssignedRanks;

/// Bits of the thread field in packed records
pub const TID_BITS: u32 = 10;
/// Bits of the synapse-model index
pub const SYN_ID_BITS: u32 = 6;
/// Bits of the local connection id
pub const LCID_BITS: u32 = 25;
/// Bits of the lag within a communication interval
pub const LAG_BITS: u32 = 6;
/// Bits of the rank in a [`Target`]
pub const RANK_BITS: u32 = 20;

/// Thread value meaning "sender has no more data for this rank this step"
pub const COMPLETE_MARKER: u32 = (1 << TID_BITS) - 1;
/// Thread value meaning "valid data in this chunk ends here"
pub const END_MARKER: u32 = (1 << TID_BITS) - 2;
/// Largest thread index a record can carry
pub const MAX_TID: u32 = END_MARKER - 1;

pub const MAX_SYN_ID: u32 = (1 << SYN_ID_BITS) - 1;
pub const MAX_LCID: u32 = (1 << LCID_BITS) - 1;
pub const MAX_LAG: u32 = (1 << LAG_BITS) - 1;
pub const MAX_RANK: u32 = (1 << RANK_BITS) - 1;

/// A fixed-width record that can travel through the chunked all-to-all.
///
/// Markers are encoded in the thread field and never collide with a thread
/// index below [`END_MARKER`].
pub trait ExchangeRecord: bytemuck::Pod + Default {
    fn set_complete_marker(&mut self);
    fn set_end_marker(&mut self);
    fn is_complete_marker(&self) -> bool;
    fn is_end_marker(&self) -> bool;
}

/// Resumable producer of records for the exchange.
///
/// Each packing thread `tid` owns a cursor. A record yielded and then
/// rejected (its chunk was full) must be yielded again after
/// `save_entry_point` + `restore_entry_point`, and no accepted record may
/// be yielded twice.
pub trait ExchangeSource<R> {
    /// Next record addressed to one of `assigned` ranks, with its rank
    fn next_record(&mut self, tid: usize, assigned: AssignedRanks) -> Option<(usize, R)>;

    /// Undo the last yield of thread `tid`
    fn reject_last(&mut self, tid: usize);

    fn save_entry_point(&mut self, tid: usize);

    fn restore_entry_point(&mut self, tid: usize);

    fn reset_entry_point(&mut self, tid: usize);
}

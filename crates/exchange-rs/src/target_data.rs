//! Record telling a source's rank where the source's synapses live.

use crate::{ExchangeRecord, Target, COMPLETE_MARKER, END_MARKER};
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Sent from the rank holding a synapse to the rank holding its source
/// neuron, once after connectivity has changed.
///
/// The receiver files `target` under `(source_tid, source_lid)` in its
/// target table. Markers are stored in `source_tid`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable, Serialize, Deserialize)]
pub struct TargetData {
    /// Local id of the source on its own rank
    pub source_lid: u32,
    /// Thread of the source on its own rank
    pub source_tid: u16,
    _reserved: u16,
    pub target: Target,
}

impl TargetData {
    pub fn new(source_lid: usize, source_tid: usize, target: Target) -> Self {
        Self {
            source_lid: source_lid as u32,
            source_tid: source_tid as u16,
            _reserved: 0,
            target,
        }
    }
}

impl ExchangeRecord for TargetData {
    fn set_complete_marker(&mut self) {
        self.source_tid = COMPLETE_MARKER as u16;
    }

    fn set_end_marker(&mut self) {
        self.source_tid = END_MARKER as u16;
    }

    fn is_complete_marker(&self) -> bool {
        self.source_tid as u32 == COMPLETE_MARKER
    }

    fn is_end_marker(&self) -> bool {
        self.source_tid as u32 == END_MARKER
    }
}

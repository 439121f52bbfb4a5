//! Adapter for external connection generators.
//!
//! A generator works on dense indices `0..n` of the source and target
//! populations. Node ids are split into maximal contiguous ranges, and each
//! rank gets a mask selecting the target indices it owns (every `np`-th id)
//! and all source indices.

use crate::network::Network;
use crate::node_collection::NodeCollection;
use serde::{Deserialize, Serialize};
use spikenet_core::{NestError, NodeId, ParamDict, Result};
use tracing::debug;

// ============================================================================
// MASKS
// ============================================================================

/// Closed index intervals, each walked with a common stride
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSet {
    intervals: Vec<(usize, usize)>,
    skip: usize,
}

impl Default for IntervalSet {
    fn default() -> Self {
        Self::new()
    }
}

impl IntervalSet {
    pub fn new() -> Self {
        Self {
            intervals: Vec::new(),
            skip: 1,
        }
    }

    pub fn insert(&mut self, first: usize, last: usize) {
        self.intervals.push((first, last));
    }

    pub fn skip(&self) -> usize {
        self.skip
    }

    pub fn set_skip(&mut self, skip: usize) {
        self.skip = skip.max(1);
    }

    pub fn intervals(&self) -> &[(usize, usize)] {
        &self.intervals
    }

    pub fn contains(&self, idx: usize) -> bool {
        self.intervals
            .iter()
            .any(|&(first, last)| first <= idx && idx <= last && (idx - first) % self.skip == 0)
    }

    /// Every selected index in insertion order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.intervals
            .iter()
            .filter(|(first, last)| first <= last)
            .flat_map(move |&(first, last)| (first..=last).step_by(self.skip))
    }
}

/// Source and target selection for one rank
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mask {
    pub sources: IntervalSet,
    pub targets: IntervalSet,
}

impl Default for Mask {
    fn default() -> Self {
        Self {
            sources: IntervalSet::new(),
            targets: IntervalSet::new(),
        }
    }
}

// ============================================================================
// RANGES
// ============================================================================

/// Contiguous node ids `first..=last`
#[allow(clippy::len_without_is_empty)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRange {
    pub first: NodeId,
    pub last: NodeId,
}

impl NodeRange {
    pub fn len(&self) -> usize {
        self.last - self.first + 1
    }
}

/// Index of the last element of the contiguous run starting at `left`.
///
/// Gallops forward with a doubling stride starting at `step`, then halves
/// the bracket. `ids` must be strictly increasing.
pub fn cg_get_right_border(ids: &[NodeId], left: usize, step: usize) -> usize {
    let last = ids.len().saturating_sub(1);
    if left >= last {
        return last;
    }
    let contiguous = |i: usize| ids[i] - ids[left] == i - left;

    let mut lo = left;
    let mut stride = step.max(1);
    let mut hi;
    loop {
        let i = lo + stride;
        if i > last {
            if contiguous(last) {
                return last;
            }
            hi = last;
            break;
        }
        if contiguous(i) {
            lo = i;
            stride *= 2;
        } else {
            hi = i;
            break;
        }
    }
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if contiguous(mid) {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Split a population into maximal contiguous ranges
pub fn cg_get_ranges(nodes: &NodeCollection) -> Result<Vec<NodeRange>> {
    let ids = nodes.to_vec();
    if ids.windows(2).any(|w| w[0] >= w[1]) {
        return Err(NestError::BadProperty(
            "connection generators need strictly increasing node ids".into(),
        ));
    }
    let step = (ids.len() / 100).max(1);
    let mut ranges = Vec::new();
    let mut left = 0;
    while left < ids.len() {
        let right = cg_get_right_border(&ids, left, step);
        ranges.push(NodeRange {
            first: ids[left],
            last: ids[right],
        });
        left = right + 1;
    }
    Ok(ranges)
}

/// Masks for all `np` ranks: sources are visible everywhere, targets only
/// on the rank owning them.
pub fn cg_set_masks(np: usize, sources: &[NodeRange], targets: &[NodeRange]) -> Vec<Mask> {
    let mut masks = vec![Mask::default(); np];

    let mut idx_left = 0;
    for range in sources {
        let right = idx_left + range.len() - 1;
        for mask in masks.iter_mut() {
            mask.sources.insert(idx_left, right);
        }
        idx_left += range.len();
    }

    idx_left = 0;
    for range in targets {
        let num_elements = range.len();
        let right = idx_left + num_elements - 1;
        for (proc, mask) in masks.iter_mut().enumerate() {
            // ranges shorter than np have no node on some ranks
            let left = idx_left + (proc + np - range.first % np) % np;
            if left <= right {
                mask.targets.insert(left, right);
            }
            mask.targets.set_skip(np);
        }
        idx_left += num_elements;
    }
    masks
}

// ============================================================================
// GENERATORS
// ============================================================================

/// Connection produced by a generator: indices plus `arity` values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedConnection {
    pub source: usize,
    pub target: usize,
    #[serde(default)]
    pub values: Vec<f64>,
}

/// External source of connectivity in index space
pub trait ConnectionGenerator {
    /// Number of values attached to each connection
    fn arity(&self) -> usize;

    /// Restrict iteration to `masks[local]`
    fn set_mask(&mut self, masks: &[Mask], local: usize);

    /// Rewind to the first connection
    fn start(&mut self);

    fn next(&mut self) -> Option<GeneratedConnection>;
}

/// Generator over a fixed list of connections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExplicitConnectionSet {
    arity: usize,
    connections: Vec<GeneratedConnection>,
    #[serde(skip)]
    mask: Option<Mask>,
    #[serde(skip)]
    position: usize,
}

impl ExplicitConnectionSet {
    pub fn new(arity: usize, connections: Vec<GeneratedConnection>) -> Result<Self> {
        if let Some(c) = connections.iter().find(|c| c.values.len() != arity) {
            return Err(NestError::DimensionMismatch {
                expected: arity,
                got: c.values.len(),
            });
        }
        Ok(Self {
            arity,
            connections,
            mask: None,
            position: 0,
        })
    }
}

impl ConnectionGenerator for ExplicitConnectionSet {
    fn arity(&self) -> usize {
        self.arity
    }

    fn set_mask(&mut self, masks: &[Mask], local: usize) {
        self.mask = masks.get(local).cloned();
    }

    fn start(&mut self) {
        self.position = 0;
    }

    fn next(&mut self) -> Option<GeneratedConnection> {
        while let Some(c) = self.connections.get(self.position) {
            self.position += 1;
            let selected = self
                .mask
                .as_ref()
                .map_or(true, |m| m.sources.contains(c.source) && m.targets.contains(c.target));
            if selected {
                return Some(c.clone());
            }
        }
        None
    }
}

/// Positions of weight and delay among a generator's values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgParams {
    pub weight: usize,
    pub delay: usize,
}

/// Create the connections a generator describes for this rank.
///
/// Returns the number of connections made locally.
pub fn cg_connect(
    net: &dyn Network,
    cg: &mut dyn ConnectionGenerator,
    sources: &NodeCollection,
    targets: &NodeCollection,
    params: Option<CgParams>,
    synapse_model: &str,
) -> Result<usize> {
    let syn_id = net.synapses().id_of(synapse_model)?;
    let arity = cg.arity();
    match (arity, params) {
        (0, _) => {}
        (2, Some(p)) if p.weight < 2 && p.delay < 2 => {}
        (2, _) => {
            return Err(NestError::BadProperty(
                "the parameter map has to contain the indices of weight and delay".into(),
            ))
        }
        (n, _) => return Err(NestError::DimensionMismatch { expected: 2, got: n }),
    }

    let topology = *net.topology();
    let masks = cg_set_masks(
        topology.num_processes(),
        &cg_get_ranges(sources)?,
        &cg_get_ranges(targets)?,
    );
    cg.set_mask(&masks, topology.rank());
    cg.start();

    let dict = ParamDict::new();
    let mut made = 0;
    while let Some(c) = cg.next() {
        let source = sources.get(c.source).ok_or(NestError::UnknownNode(c.source))?;
        let target = targets.get(c.target).ok_or(NestError::UnknownNode(c.target))?;
        if !topology.is_local_node(target) {
            return Err(NestError::IllegalConnection(format!(
                "generator produced target {} outside the mask of rank {}",
                target,
                topology.rank()
            )));
        }
        let tid = topology.thread_of_node(target);
        let target_ref = net.get_node_or_proxy(target, tid);
        let (weight, delay) = match params {
            Some(p) if arity == 2 => (Some(c.values[p.weight]), Some(c.values[p.delay])),
            _ => (None, None),
        };
        net.connect(source, &target_ref, tid, syn_id, &dict, delay, weight)?;
        made += 1;
    }
    debug!(made, rank = topology.rank(), "connection generator done");
    Ok(made)
}

//! Populations of nodes.

use serde::{Deserialize, Serialize};
use spikenet_core::{NestError, NodeId, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Ordered, immutable sequence of node ids (like NEST's NodeCollection).
///
/// Cloning is cheap; explicit id lists are shared.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "NodeCollectionSpec", into = "NodeCollectionSpec")]
pub struct NodeCollection {
    repr: Repr,
}

#[derive(Debug, Clone)]
enum Repr {
    /// `first, first + step, ...` with `len` elements
    Range { first: NodeId, len: usize, step: usize },
    Explicit {
        ids: Arc<Vec<NodeId>>,
        positions: Arc<HashMap<NodeId, usize>>,
    },
}

/// Serialized form: either an id list or a (possibly strided) range
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeCollectionSpec {
    Ids(Vec<NodeId>),
    Range {
        first: NodeId,
        last: NodeId,
        #[serde(default = "default_step")]
        step: usize,
    },
}

fn default_step() -> usize {
    1
}

impl NodeCollection {
    /// Contiguous ids `first..=last`
    pub fn range(first: NodeId, last: NodeId) -> Result<Self> {
        Self::strided(first, last, 1)
    }

    /// `first, first + step, ...` up to and including `last` if it is hit
    pub fn strided(first: NodeId, last: NodeId, step: usize) -> Result<Self> {
        if first == 0 {
            return Err(NestError::BadProperty("node ids start at 1".into()));
        }
        if last < first {
            return Err(NestError::BadProperty(format!(
                "empty range {}..={}",
                first, last
            )));
        }
        if step == 0 {
            return Err(NestError::BadProperty("step must be positive".into()));
        }
        Ok(Self {
            repr: Repr::Range {
                first,
                len: (last - first) / step + 1,
                step,
            },
        })
    }

    pub fn from_ids(ids: Vec<NodeId>) -> Result<Self> {
        if ids.contains(&0) {
            return Err(NestError::BadProperty("node ids start at 1".into()));
        }
        let mut positions = HashMap::with_capacity(ids.len());
        for (i, &id) in ids.iter().enumerate() {
            positions.entry(id).or_insert(i);
        }
        Ok(Self {
            repr: Repr::Explicit {
                ids: Arc::new(ids),
                positions: Arc::new(positions),
            },
        })
    }

    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Range { len, .. } => *len,
            Repr::Explicit { ids, .. } => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Node at position `i`
    pub fn get(&self, i: usize) -> Option<NodeId> {
        match &self.repr {
            Repr::Range { first, len, step } => (i < *len).then(|| first + i * step),
            Repr::Explicit { ids, .. } => ids.get(i).copied(),
        }
    }

    /// Position of `id` in the collection (its local index)
    pub fn get_lid(&self, id: NodeId) -> Option<usize> {
        match &self.repr {
            Repr::Range { first, len, step } => {
                if id < *first || (id - first) % step != 0 {
                    return None;
                }
                let i = (id - first) / step;
                (i < *len).then_some(i)
            }
            Repr::Explicit { positions, .. } => positions.get(&id).copied(),
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get_lid(id).is_some()
    }

    /// True for a contiguous, step-one range
    pub fn is_range(&self) -> bool {
        matches!(self.repr, Repr::Range { step: 1, .. })
    }

    pub fn first(&self) -> Option<NodeId> {
        self.get(0)
    }

    pub fn last(&self) -> Option<NodeId> {
        self.len().checked_sub(1).and_then(|i| self.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    pub fn to_vec(&self) -> Vec<NodeId> {
        self.iter().collect()
    }

    /// Elements `start..end`
    pub fn slice(&self, start: usize, end: usize) -> Result<Self> {
        if start > end || end > self.len() {
            return Err(NestError::BadParameter(format!(
                "slice {}..{} out of bounds for {} nodes",
                start,
                end,
                self.len()
            )));
        }
        match &self.repr {
            Repr::Range { first, step, .. } if start < end => Ok(Self {
                repr: Repr::Range {
                    first: first + start * step,
                    len: end - start,
                    step: *step,
                },
            }),
            _ => Self::from_ids(self.to_vec()[start..end].to_vec()),
        }
    }

    /// True if both collections contain the same ids in the same order
    pub fn same_nodes(&self, other: &NodeCollection) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }

    /// True if any id appears in both collections
    pub fn intersects(&self, other: &NodeCollection) -> bool {
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        small.iter().any(|id| large.contains(id))
    }

    /// True if ids strictly increase
    pub fn is_sorted(&self) -> bool {
        match &self.repr {
            Repr::Range { .. } => true,
            Repr::Explicit { ids, .. } => ids.windows(2).all(|w| w[0] < w[1]),
        }
    }
}

impl PartialEq for NodeCollection {
    fn eq(&self, other: &Self) -> bool {
        self.same_nodes(other)
    }
}

impl TryFrom<NodeCollectionSpec> for NodeCollection {
    type Error = NestError;

    fn try_from(spec: NodeCollectionSpec) -> Result<Self> {
        match spec {
            NodeCollectionSpec::Ids(ids) => Self::from_ids(ids),
            NodeCollectionSpec::Range { first, last, step } => Self::strided(first, last, step),
        }
    }
}

impl From<NodeCollection> for NodeCollectionSpec {
    fn from(nc: NodeCollection) -> Self {
        match nc.repr {
            Repr::Range { first, len, step } => NodeCollectionSpec::Range {
                first,
                last: first + (len - 1) * step,
                step,
            },
            Repr::Explicit { ids, .. } => NodeCollectionSpec::Ids(ids.as_ref().clone()),
        }
    }
}

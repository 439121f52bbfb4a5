//! # SpikeNet Core
//!
//! Shared types for building and wiring large spiking networks that are
//! distributed over MPI-style ranks and threads.
//!
//! ## Parallel layout
//!
//! | Concept | Meaning |
//! |---------|---------|
//! | rank | one process taking part in collective communication |
//! | thread | one worker inside a rank |
//! | virtual process (VP) | one (rank, thread) pair; nodes are dealt round-robin over VPs |
//!
//! Everything random that influences connectivity is drawn from streams
//! that depend only on the master seed and the VP index, so a network
//! built with 4 ranks × 2 threads is identical to one built with
//! 1 rank × 8 threads.

pub mod config;
pub mod logging;
pub mod rng;
pub mod topology;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use config::{CommunicationConfig, KernelConfig};
pub use rng::{RngManager, SyncedRng, VpSpecificRng};
pub use topology::{AssignedRanks, Topology};

/// Errors raised while building connectivity or exchanging events
#[derive(Debug, Error)]
pub enum NestError {
    #[error("Bad property: {0}")]
    BadProperty(String),

    #[error("Bad parameter: {0}")]
    BadParameter(String),

    #[error("Unknown synapse type: {0}")]
    UnknownSynapseType(String),

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Illegal connection: {0}")]
    IllegalConnection(String),

    #[error("Connection {source_id} -> {target_id} does not exist")]
    InexistentConnection { source_id: NodeId, target_id: NodeId },

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Exception in thread {thread}: {source}")]
    WrappedThreadException {
        thread: usize,
        #[source]
        source: Box<NestError>,
    },

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl NestError {
    /// Strip thread wrappers and return the error raised by the worker
    pub fn root(&self) -> &NestError {
        match self {
            NestError::WrappedThreadException { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, NestError>;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Global node identifier. Valid ids start at 1; 0 is never a node.
pub type NodeId = usize;

/// Thread index within a rank
pub type ThreadId = usize;

/// Index of a synapse model in the registry
pub type SynapseModelId = usize;

/// Reference to a node as seen from one thread.
///
/// A node is "real" on exactly one virtual process; every other thread
/// only ever sees a proxy for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub node_id: NodeId,
    /// Thread owning the node on its rank
    pub thread: ThreadId,
    /// True if the node is not owned by the thread that asked for it
    pub is_proxy: bool,
}

// ============================================================================
// PARAMETER DICTIONARIES
// ============================================================================

/// Value stored in a synapse parameter dictionary
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Integer(i64),
    Double(f64),
}

impl ParamValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            ParamValue::Integer(i) => i as f64,
            ParamValue::Double(d) => d,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            ParamValue::Integer(i) => Some(i),
            ParamValue::Double(d) if d.fract() == 0.0 => Some(d as i64),
            ParamValue::Double(_) => None,
        }
    }
}

/// Ordered name → value dictionary handed to the low-level connect call
pub type ParamDict = std::collections::BTreeMap<String, ParamValue>;

//! The network the builders write into.

use crate::synapse_registry::SynapseRegistry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use spikenet_core::{
    NestError, NodeId, NodeRef, ParamDict, Result, RngManager, SynapseModelId, ThreadId, Topology,
};
use spikenet_exchange::{SourceTable, TargetTable};
use spikenet_mpi::MpiManager;
use std::collections::{HashMap, HashSet};

/// Node lookup, random streams and the low-level connect primitive.
///
/// `connect` and `disconnect` are called from worker threads, each with its
/// own `tid`, and must be safe for distinct threads at the same time.
pub trait Network: Send + Sync {
    fn topology(&self) -> &Topology;

    fn rng(&self) -> &RngManager;

    fn mpi(&self) -> &MpiManager;

    fn synapses(&self) -> &SynapseRegistry;

    /// Nodes are `1..=num_nodes()`
    fn num_nodes(&self) -> usize;

    /// Devices have no proxies and cannot be reached by rules that pick
    /// targets globally
    fn has_proxies(&self, node: NodeId) -> bool;

    fn get_node_or_proxy(&self, node: NodeId, tid: ThreadId) -> NodeRef {
        self.topology().get_node_or_proxy(node, tid)
    }

    fn is_local_node(&self, node: NodeId) -> bool {
        self.topology().is_local_node(node)
    }

    /// Create one connection. `None` weight/delay take the model defaults.
    #[allow(clippy::too_many_arguments)]
    fn connect(
        &self,
        source: NodeId,
        target: &NodeRef,
        tid: ThreadId,
        syn_id: SynapseModelId,
        params: &ParamDict,
        delay: Option<f64>,
        weight: Option<f64>,
    ) -> Result<()>;

    /// Remove one connection of model `syn_id` from `source` to `target`
    fn disconnect(
        &self,
        source: NodeId,
        target: &NodeRef,
        tid: ThreadId,
        syn_id: SynapseModelId,
    ) -> Result<()>;

    /// Adjust the count of connected synaptic elements `element` of `node`,
    /// called on the thread owning `node`
    fn connect_synaptic_element(
        &self,
        node: NodeId,
        tid: ThreadId,
        element: &str,
        delta: i64,
    ) -> Result<()>;
}

/// One stored connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub source: NodeId,
    pub target: NodeId,
    pub syn_id: SynapseModelId,
    pub weight: f64,
    pub delay: f64,
    #[serde(default, skip_serializing_if = "ParamDict::is_empty")]
    pub params: ParamDict,
}

/// Per-thread connection store: `[syn_id][lcid]`; `None` marks a removed
/// connection so later lcids stay valid
type ThreadConnections = Vec<Vec<Option<Connection>>>;

/// In-memory network of one rank.
///
/// Connections are stored on the thread owning their target, grouped by
/// synapse model; the index within a group is the connection's lcid.
#[derive(Debug)]
pub struct LocalNetwork {
    topology: Topology,
    rng: RngManager,
    mpi: MpiManager,
    synapses: SynapseRegistry,
    num_nodes: usize,
    devices: HashSet<NodeId>,
    connections: Vec<Mutex<ThreadConnections>>,
    elements: Vec<Mutex<HashMap<(NodeId, String), i64>>>,
}

impl LocalNetwork {
    pub fn new(topology: Topology, mpi: MpiManager, seed: u64, num_nodes: usize) -> Result<Self> {
        if mpi.num_processes() != topology.num_processes() || mpi.rank() != topology.rank() {
            return Err(NestError::Config(format!(
                "communicator rank {} of {} does not match topology rank {} of {}",
                mpi.rank(),
                mpi.num_processes(),
                topology.rank(),
                topology.num_processes()
            )));
        }
        let threads = topology.num_threads();
        Ok(Self {
            rng: RngManager::new(&topology, seed),
            topology,
            mpi,
            synapses: SynapseRegistry::with_builtins(),
            num_nodes,
            devices: HashSet::new(),
            connections: (0..threads).map(|_| Mutex::new(Vec::new())).collect(),
            elements: (0..threads).map(|_| Mutex::new(HashMap::new())).collect(),
        })
    }

    /// Single rank with `threads` threads
    pub fn single_process(threads: usize, seed: u64, num_nodes: usize) -> Result<Self> {
        let topology = Topology::single_process(threads)?;
        let mpi = MpiManager::single_process(&Default::default());
        Self::new(topology, mpi, seed, num_nodes)
    }

    pub fn synapses_mut(&mut self) -> &mut SynapseRegistry {
        &mut self.synapses
    }

    /// Grow the node range to `1..=num_nodes`
    pub fn create_nodes(&mut self, num_nodes: usize) {
        self.num_nodes = self.num_nodes.max(num_nodes);
    }

    /// Mark `node` as a device without proxies
    pub fn add_device(&mut self, node: NodeId) {
        self.devices.insert(node);
    }

    /// Connections on every thread of this rank, by thread then model then lcid
    pub fn connections(&self) -> Vec<Connection> {
        self.connections
            .iter()
            .flat_map(|c| c.lock().iter().flatten().flatten().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn connections_on(&self, tid: ThreadId) -> Vec<Connection> {
        self.connections
            .get(tid)
            .map(|c| c.lock().iter().flatten().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn num_connections(&self) -> usize {
        self.connections
            .iter()
            .map(|c| c.lock().iter().flatten().filter(|c| c.is_some()).count())
            .sum()
    }

    /// Connected count of `element` on `node`
    pub fn synaptic_elements(&self, node: NodeId, element: &str) -> i64 {
        if !self.topology.is_local_node(node) {
            return 0;
        }
        let tid = self.topology.thread_of_node(node);
        self.elements[tid]
            .lock()
            .get(&(node, element.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Describe every stored connection by source, ready for the target
    /// exchange
    pub fn source_table(&self) -> Result<SourceTable> {
        let table = SourceTable::new(self.topology);
        for (tid, store) in self.connections.iter().enumerate() {
            for (syn_id, conns) in store.lock().iter().enumerate() {
                for (lcid, c) in conns.iter().enumerate() {
                    let Some(c) = c else { continue };
                    table.add_source(tid, c.source, syn_id, lcid)?;
                }
            }
        }
        Ok(table)
    }

    /// Fresh target table sized for this rank
    pub fn target_table(&self) -> TargetTable {
        TargetTable::new(self.topology.num_threads())
    }

    /// Connection a delivered spike refers to
    pub fn connection(&self, tid: ThreadId, syn_id: SynapseModelId, lcid: usize) -> Option<Connection> {
        self.connections
            .get(tid)?
            .lock()
            .get(syn_id)?
            .get(lcid)?
            .clone()
    }

    fn check_node(&self, node: NodeId) -> Result<()> {
        if node == 0 || node > self.num_nodes {
            return Err(NestError::UnknownNode(node));
        }
        Ok(())
    }

    fn check_owner(&self, target: &NodeRef, tid: ThreadId) -> Result<()> {
        if target.is_proxy || target.thread != tid || !self.topology.is_local_node(target.node_id) {
            return Err(NestError::IllegalConnection(format!(
                "node {} is not owned by thread {} of rank {}",
                target.node_id,
                tid,
                self.topology.rank()
            )));
        }
        Ok(())
    }
}

impl Network for LocalNetwork {
    fn topology(&self) -> &Topology {
        &self.topology
    }

    fn rng(&self) -> &RngManager {
        &self.rng
    }

    fn mpi(&self) -> &MpiManager {
        &self.mpi
    }

    fn synapses(&self) -> &SynapseRegistry {
        &self.synapses
    }

    fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    fn has_proxies(&self, node: NodeId) -> bool {
        !self.devices.contains(&node)
    }

    fn connect(
        &self,
        source: NodeId,
        target: &NodeRef,
        tid: ThreadId,
        syn_id: SynapseModelId,
        params: &ParamDict,
        delay: Option<f64>,
        weight: Option<f64>,
    ) -> Result<()> {
        self.check_node(source)?;
        self.check_node(target.node_id)?;
        self.check_owner(target, tid)?;
        let model = self.synapses.get(syn_id)?;
        let delay = delay.unwrap_or_else(|| model.default_delay());
        if !(delay > 0.0) {
            return Err(NestError::BadProperty(format!("delay must be positive, got {}", delay)));
        }
        let connection = Connection {
            source,
            target: target.node_id,
            syn_id,
            weight: weight.unwrap_or_else(|| model.default_weight()),
            delay,
            params: params.clone(),
        };
        let mut store = self.connections[tid].lock();
        if store.len() <= syn_id {
            store.resize_with(syn_id + 1, Vec::new);
        }
        store[syn_id].push(Some(connection));
        Ok(())
    }

    fn disconnect(
        &self,
        source: NodeId,
        target: &NodeRef,
        tid: ThreadId,
        syn_id: SynapseModelId,
    ) -> Result<()> {
        self.check_owner(target, tid)?;
        let mut store = self.connections[tid].lock();
        let slot = store.get_mut(syn_id).and_then(|conns| {
            conns.iter_mut().find(|c| {
                c.as_ref()
                    .is_some_and(|c| c.source == source && c.target == target.node_id)
            })
        });
        match slot {
            Some(slot) => {
                *slot = None;
                Ok(())
            }
            None => Err(NestError::InexistentConnection {
                source_id: source,
                target_id: target.node_id,
            }),
        }
    }

    fn connect_synaptic_element(
        &self,
        node: NodeId,
        tid: ThreadId,
        element: &str,
        delta: i64,
    ) -> Result<()> {
        self.check_node(node)?;
        self.check_owner(&self.get_node_or_proxy(node, tid), tid)?;
        *self.elements[tid]
            .lock()
            .entry((node, element.to_string()))
            .or_insert(0) += delta;
        Ok(())
    }
}

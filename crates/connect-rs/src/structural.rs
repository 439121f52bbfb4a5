//! Connection builder used by structural plasticity during simulation.
//!
//! Pairs are decided elsewhere; this builder wires them while keeping the
//! connected synaptic element counts of both endpoints in step.

use crate::builders::{parallel_region, BuilderCore};
use crate::network::Network;
use crate::node_collection::NodeCollection;
use crate::spec::{ConnSpec, ConnectivityRule, SynSpec};
use spikenet_core::{NestError, NodeId, Result};
use tracing::debug;

/// Wires explicit `(source, target)` lists with element bookkeeping
#[derive(Debug)]
pub struct SpBuilder {
    core: BuilderCore,
}

impl SpBuilder {
    pub fn new(syn_spec: SynSpec, allow_autapses: bool, net: &dyn Network) -> Result<Self> {
        let empty = NodeCollection::from_ids(Vec::new())?;
        let flags = ConnSpec::new(ConnectivityRule::OneToOne).autapses(allow_autapses);
        let mut core = BuilderCore::new(empty.clone(), empty, &flags, &[syn_spec], net)?;
        if !core.uses_structural_plasticity() {
            return Err(NestError::BadProperty(
                "structural plasticity needs pre_synaptic_element and post_synaptic_element".into(),
            ));
        }
        core.check_array_lengths("structural plasticity", None)?;
        core.set_requires_proxies(false);
        Ok(Self { core })
    }

    /// Always fails; this builder only wires explicit pairs
    pub fn connect(&self, _net: &dyn Network) -> Result<()> {
        Err(NestError::NotImplemented(
            "structural plasticity builder needs explicit source and target lists".into(),
        ))
    }

    /// Connect `sources[i] → targets[i]` for every `i`
    pub fn sp_connect(&self, net: &dyn Network, sources: &[NodeId], targets: &[NodeId]) -> Result<()> {
        check_lengths(sources, targets)?;
        debug!(pairs = sources.len(), "structural plasticity connect");
        let core = &self.core;
        parallel_region(net.topology().num_threads(), |tid| {
            let mut rng = net.rng().vp_specific(tid);
            let mut state = core.thread_state(tid);
            for (&source, &target) in sources.iter().zip(targets) {
                if !core.allow_autapses() && source == target {
                    core.skip_conn_parameter(&mut state, 1);
                    continue;
                }
                if !core.change_connected_synaptic_elements(net, source, target, tid, 1)? {
                    core.skip_conn_parameter(&mut state, 1);
                    continue;
                }
                let target_ref = net.get_node_or_proxy(target, tid);
                core.single_connect(net, &mut state, &mut rng, tid, source, &target_ref)?;
            }
            Ok(())
        })
    }

    /// Remove `sources[i] → targets[i]` for every `i`
    pub fn sp_disconnect(
        &self,
        net: &dyn Network,
        sources: &[NodeId],
        targets: &[NodeId],
    ) -> Result<()> {
        check_lengths(sources, targets)?;
        let core = &self.core;
        parallel_region(net.topology().num_threads(), |tid| {
            for (&source, &target) in sources.iter().zip(targets) {
                if !core.change_connected_synaptic_elements(net, source, target, tid, -1)? {
                    continue;
                }
                let target_ref = net.get_node_or_proxy(target, tid);
                core.single_disconnect(net, tid, source, &target_ref)?;
            }
            Ok(())
        })
    }
}

fn check_lengths(sources: &[NodeId], targets: &[NodeId]) -> Result<()> {
    if sources.len() != targets.len() {
        return Err(NestError::DimensionMismatch {
            expected: sources.len(),
            got: targets.len(),
        });
    }
    Ok(())
}

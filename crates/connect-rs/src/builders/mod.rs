//! Connection builders.
//!
//! A [`ConnBuilder`] pairs the state every rule shares ([`BuilderCore`]:
//! populations, policy flags, parameter slots, per-thread scratch) with a
//! rule strategy implementing [`RuleStrategy`]. All validation happens in
//! [`ConnBuilder::new`]; [`ConnBuilder::connect`] only fails for per-pair
//! problems raised inside a parallel region.

mod all_to_all;
mod bernoulli;
mod fixed_indegree;
mod fixed_outdegree;
mod fixed_total_number;
mod one_to_one;
mod symmetric_bernoulli;
pub mod third_factor;

pub use all_to_all::AllToAll;
pub use bernoulli::{PairwiseBernoulli, PairwisePoisson};
pub use fixed_indegree::FixedIndegree;
pub use fixed_outdegree::FixedOutdegree;
pub use fixed_total_number::FixedTotalNumber;
pub use one_to_one::OneToOne;
pub use symmetric_bernoulli::SymmetricPairwiseBernoulli;
pub use third_factor::ThirdOutBuilder;

use crate::network::Network;
use crate::node_collection::NodeCollection;
use crate::parameter::ConnParameter;
use crate::spec::{ConnSpec, ConnectivityRule, SynSpec, ThirdFactorSpec};
use parking_lot::{Mutex, MutexGuard};
use rayon::prelude::*;
use spikenet_core::{
    NestError, NodeId, NodeRef, ParamDict, ParamValue, Result, SynapseModelId, ThreadId,
    VpSpecificRng,
};
use std::fmt;
use tracing::debug;

/// Synapse parameters that only take integer values
const INTEGER_PARAMS: [&str; 3] = ["receptor_type", "music_channel", "synapse_label"];

// ============================================================================
// PARALLEL REGIONS
// ============================================================================

/// Run `f` once per thread and re-raise the first failure on the caller.
///
/// Every thread runs to completion; connections made before a failure are
/// kept.
pub(crate) fn parallel_region<F>(num_threads: usize, f: F) -> Result<()>
where
    F: Fn(ThreadId) -> Result<()> + Sync,
{
    let results: Vec<Result<()>> = (0..num_threads).into_par_iter().map(|tid| f(tid)).collect();
    for (thread, result) in results.into_iter().enumerate() {
        if let Err(e) = result {
            return Err(NestError::WrappedThreadException {
                thread,
                source: Box::new(e),
            });
        }
    }
    Ok(())
}

// ============================================================================
// BUILDER CORE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum SlotKind {
    Weight,
    Delay,
    Extra { integer: bool },
}

/// One parameter of one synapse spec
#[derive(Debug, Clone)]
struct ParamSlot {
    syn_idx: usize,
    name: String,
    param: ConnParameter,
    kind: SlotKind,
}

/// Per-thread scratch: array cursors and parameter dictionaries
#[derive(Debug, Default)]
pub struct ThreadState {
    cursors: Vec<usize>,
    dicts: Vec<ParamDict>,
}

/// State shared by all rules
#[derive(Debug)]
pub struct BuilderCore {
    sources: NodeCollection,
    targets: NodeCollection,
    allow_autapses: bool,
    allow_multapses: bool,
    make_symmetric: bool,
    requires_proxies: bool,
    syn_ids: Vec<SynapseModelId>,
    slots: Vec<ParamSlot>,
    threads: Vec<Mutex<ThreadState>>,
    pre_synaptic_element: Option<String>,
    post_synaptic_element: Option<String>,
    third_out: Option<Box<ThirdOutBuilder>>,
}

impl BuilderCore {
    pub(crate) fn new(
        sources: NodeCollection,
        targets: NodeCollection,
        conn_spec: &ConnSpec,
        syn_specs: &[SynSpec],
        net: &dyn Network,
    ) -> Result<Self> {
        let default_spec = [SynSpec::default()];
        let syn_specs = if syn_specs.is_empty() {
            &default_spec[..]
        } else {
            syn_specs
        };

        let mut syn_ids = Vec::with_capacity(syn_specs.len());
        let mut slots = Vec::new();
        let mut elements = None;
        for (syn_idx, spec) in syn_specs.iter().enumerate() {
            let syn_id = net.synapses().id_of(&spec.synapse_model)?;
            let names = spec
                .weight
                .as_ref()
                .map(|_| "weight")
                .into_iter()
                .chain(spec.delay.as_ref().map(|_| "delay"))
                .chain(spec.params.keys().map(String::as_str));
            net.synapses().check_synapse_params(syn_id, names)?;
            syn_ids.push(syn_id);

            for (name, param) in &spec.params {
                let integer = INTEGER_PARAMS.contains(&name.as_str());
                if integer {
                    if let Some(v) = param.scalar() {
                        if v.fract() != 0.0 {
                            return Err(NestError::BadParameter(format!(
                                "{} must be an integer, got {}",
                                name, v
                            )));
                        }
                    }
                }
                slots.push(ParamSlot {
                    syn_idx,
                    name: name.clone(),
                    param: param.clone(),
                    kind: SlotKind::Extra { integer },
                });
            }
            if let Some(w) = &spec.weight {
                slots.push(ParamSlot {
                    syn_idx,
                    name: "weight".into(),
                    param: w.clone(),
                    kind: SlotKind::Weight,
                });
            }
            if let Some(d) = &spec.delay {
                slots.push(ParamSlot {
                    syn_idx,
                    name: "delay".into(),
                    param: d.clone(),
                    kind: SlotKind::Delay,
                });
            }

            match (&spec.pre_synaptic_element, &spec.post_synaptic_element) {
                (None, None) => {}
                (Some(pre), Some(post)) if !pre.is_empty() && !post.is_empty() => {
                    elements.get_or_insert((pre.clone(), post.clone()));
                }
                _ => {
                    return Err(NestError::BadProperty(
                        "structural plasticity needs both pre_synaptic_element and post_synaptic_element".into(),
                    ))
                }
            }
        }
        for slot in &slots {
            slot.param.validate()?;
        }

        let num_threads = net.topology().num_threads();
        let threads = (0..num_threads)
            .map(|_| {
                Mutex::new(ThreadState {
                    cursors: vec![0; slots.len()],
                    dicts: vec![ParamDict::new(); syn_ids.len()],
                })
            })
            .collect();
        let (pre_synaptic_element, post_synaptic_element) = match elements {
            Some((pre, post)) => (Some(pre), Some(post)),
            None => (None, None),
        };

        Ok(Self {
            sources,
            targets,
            allow_autapses: conn_spec.allow_autapses,
            allow_multapses: conn_spec.allow_multapses,
            make_symmetric: conn_spec.make_symmetric,
            requires_proxies: true,
            syn_ids,
            slots,
            threads,
            pre_synaptic_element,
            post_synaptic_element,
            third_out: None,
        })
    }

    pub fn sources(&self) -> &NodeCollection {
        &self.sources
    }

    pub fn targets(&self) -> &NodeCollection {
        &self.targets
    }

    pub fn allow_autapses(&self) -> bool {
        self.allow_autapses
    }

    pub fn allow_multapses(&self) -> bool {
        self.allow_multapses
    }

    pub fn make_symmetric(&self) -> bool {
        self.make_symmetric
    }

    pub fn syn_ids(&self) -> &[SynapseModelId] {
        &self.syn_ids
    }

    pub fn uses_structural_plasticity(&self) -> bool {
        self.pre_synaptic_element.is_some()
    }

    pub(crate) fn set_requires_proxies(&mut self, requires: bool) {
        self.requires_proxies = requires;
    }

    pub(crate) fn thread_state(&self, tid: ThreadId) -> MutexGuard<'_, ThreadState> {
        self.threads[tid].lock()
    }

    /// True if no weight, delay or extra parameter varies per connection
    pub fn all_parameters_scalar(&self) -> bool {
        self.slots.iter().all(|s| s.param.is_scalar())
    }

    fn has_arrays(&self) -> bool {
        self.slots.iter().any(|s| s.param.is_array())
    }

    /// Check every array parameter holds exactly `expected` values;
    /// `None` means the rule takes no arrays
    pub(crate) fn check_array_lengths(&self, rule: &str, expected: Option<usize>) -> Result<()> {
        for slot in self.slots.iter().filter(|s| s.param.is_array()) {
            let got = slot.param.number_of_values().unwrap_or(0);
            match expected {
                None => {
                    return Err(NestError::BadProperty(format!(
                        "array parameter {} is not supported by {}",
                        slot.name, rule
                    )))
                }
                Some(n) if n != got => {
                    return Err(NestError::BadProperty(format!(
                        "array parameter {} must hold {} values for {}, got {}",
                        slot.name, n, rule, got
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub(crate) fn reset_cursors(&self) {
        for state in &self.threads {
            state.lock().cursors.iter_mut().for_each(|c| *c = 0);
        }
    }

    pub(crate) fn swap_populations(&mut self) {
        std::mem::swap(&mut self.sources, &mut self.targets);
    }

    /// Advance every array parameter's cursor of this thread by `n`
    pub(crate) fn skip_conn_parameter(&self, state: &mut ThreadState, n: usize) {
        for (slot, cursor) in self.slots.iter().zip(state.cursors.iter_mut()) {
            slot.param.skip(cursor, n);
        }
    }

    /// Evaluate all parameters and create one connection per synapse spec
    pub(crate) fn single_connect(
        &self,
        net: &dyn Network,
        state: &mut ThreadState,
        rng: &mut VpSpecificRng,
        tid: ThreadId,
        source: NodeId,
        target: &NodeRef,
    ) -> Result<()> {
        if self.requires_proxies && !net.has_proxies(target.node_id) {
            return Err(NestError::IllegalConnection(format!(
                "target {} has no proxies and cannot be reached by this rule",
                target.node_id
            )));
        }

        let ThreadState { cursors, dicts } = state;
        for (syn_idx, &syn_id) in self.syn_ids.iter().enumerate() {
            let dict = &mut dicts[syn_idx];
            dict.clear();
            let mut weight = None;
            let mut delay = None;
            for (slot, cursor) in self.slots.iter().zip(cursors.iter_mut()) {
                if slot.syn_idx != syn_idx {
                    continue;
                }
                match slot.kind {
                    SlotKind::Weight => {
                        weight = Some(slot.param.value_double(cursor, rng, source, target.node_id)?)
                    }
                    SlotKind::Delay => {
                        delay = Some(slot.param.value_double(cursor, rng, source, target.node_id)?)
                    }
                    SlotKind::Extra { integer: true } => {
                        let v = slot
                            .param
                            .value_int(cursor, rng, source, target.node_id)
                            .map_err(|_| {
                                NestError::BadParameter(format!("{} must be an integer", slot.name))
                            })?;
                        dict.insert(slot.name.clone(), ParamValue::Integer(v));
                    }
                    SlotKind::Extra { integer: false } => {
                        let v = slot.param.value_double(cursor, rng, source, target.node_id)?;
                        dict.insert(slot.name.clone(), ParamValue::Double(v));
                    }
                }
            }
            net.connect(source, target, tid, syn_id, dict, delay, weight)?;
        }

        if let Some(third) = &self.third_out {
            third.third_connect(net, tid, rng, source, target)?;
        }
        Ok(())
    }

    /// Remove the connection `source → target`; only one synapse spec allowed
    pub(crate) fn single_disconnect(
        &self,
        net: &dyn Network,
        tid: ThreadId,
        source: NodeId,
        target: &NodeRef,
    ) -> Result<()> {
        if self.syn_ids.len() != 1 {
            return Err(NestError::NotImplemented(
                "disconnect with more than one synapse spec".into(),
            ));
        }
        net.disconnect(source, target, tid, self.syn_ids[0])
    }

    /// Update connected synaptic element counts of both endpoints on this
    /// thread. Returns true if the target is owned by `tid`.
    pub(crate) fn change_connected_synaptic_elements(
        &self,
        net: &dyn Network,
        source: NodeId,
        target: NodeId,
        tid: ThreadId,
        delta: i64,
    ) -> Result<bool> {
        let (Some(pre), Some(post)) = (&self.pre_synaptic_element, &self.post_synaptic_element)
        else {
            return Err(NestError::BadProperty("no synaptic elements configured".into()));
        };
        if net.is_local_node(source) && !net.get_node_or_proxy(source, tid).is_proxy {
            net.connect_synaptic_element(source, tid, pre, delta)?;
        }
        if !net.is_local_node(target) {
            return Ok(false);
        }
        if net.get_node_or_proxy(target, tid).is_proxy {
            return Ok(false);
        }
        net.connect_synaptic_element(target, tid, post, delta)?;
        Ok(true)
    }
}

// ============================================================================
// RULE STRATEGIES
// ============================================================================

fn not_implemented(rule: &str, what: &str) -> NestError {
    NestError::NotImplemented(format!("{} does not support {}", rule, what))
}

/// One connectivity rule.
///
/// Rules read populations and flags from the core at call time, so the
/// symmetric pass can rerun them with sources and targets swapped.
pub trait RuleStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn connect_(&self, core: &BuilderCore, net: &dyn Network) -> Result<()>;

    fn sp_connect_(&self, _core: &BuilderCore, _net: &dyn Network) -> Result<()> {
        Err(not_implemented(self.name(), "structural plasticity"))
    }

    fn disconnect_(&self, _core: &BuilderCore, _net: &dyn Network) -> Result<()> {
        Err(not_implemented(self.name(), "disconnect"))
    }

    fn sp_disconnect_(&self, _core: &BuilderCore, _net: &dyn Network) -> Result<()> {
        Err(not_implemented(self.name(), "structural plasticity disconnect"))
    }

    /// Rule can be mirrored by `make_symmetric`
    fn supports_symmetric(&self) -> bool {
        false
    }

    /// Connectivity produced is symmetric without a mirror pass
    fn is_symmetric(&self, _core: &BuilderCore) -> bool {
        false
    }

    /// Rule creates both directions itself
    fn creates_symmetric_connections(&self) -> bool {
        false
    }

    /// Targets are chosen globally, so they must have proxies
    fn requires_proxies(&self) -> bool {
        true
    }

    /// Number of values each array parameter must hold, `None` if arrays
    /// are not supported
    fn expected_array_len(&self, _core: &BuilderCore, _net: &dyn Network) -> Option<usize> {
        None
    }
}

fn make_rule(
    spec: &ConnSpec,
    core: &BuilderCore,
    net: &dyn Network,
) -> Result<Box<dyn RuleStrategy>> {
    Ok(match &spec.rule {
        ConnectivityRule::OneToOne => Box::new(OneToOne::new(core)?),
        ConnectivityRule::AllToAll => Box::new(AllToAll),
        ConnectivityRule::FixedIndegree { indegree } => {
            Box::new(FixedIndegree::new(core, indegree.clone())?)
        }
        ConnectivityRule::FixedOutdegree { outdegree } => {
            Box::new(FixedOutdegree::new(core, outdegree.clone())?)
        }
        ConnectivityRule::FixedTotalNumber { n } => {
            Box::new(FixedTotalNumber::new(core, net, *n)?)
        }
        ConnectivityRule::PairwiseBernoulli { p } => Box::new(PairwiseBernoulli::new(p.clone())?),
        ConnectivityRule::PairwisePoisson {
            pairwise_avg_num_conns,
        } => Box::new(PairwisePoisson::new(core, pairwise_avg_num_conns.clone())?),
        ConnectivityRule::SymmetricPairwiseBernoulli { p } => {
            Box::new(SymmetricPairwiseBernoulli::new(core, *p)?)
        }
    })
}

// ============================================================================
// CONN BUILDER
// ============================================================================

/// Connects two populations with one rule and one or more synapse specs
#[derive(Debug)]
pub struct ConnBuilder {
    core: BuilderCore,
    rule: Box<dyn RuleStrategy>,
}

impl ConnBuilder {
    pub fn new(
        sources: NodeCollection,
        targets: NodeCollection,
        conn_spec: &ConnSpec,
        syn_specs: &[SynSpec],
        net: &dyn Network,
    ) -> Result<Self> {
        let mut core = BuilderCore::new(sources, targets, conn_spec, syn_specs, net)?;
        let rule = make_rule(conn_spec, &core, net)?;
        core.set_requires_proxies(rule.requires_proxies());

        if core.has_arrays() {
            core.check_array_lengths(rule.name(), rule.expected_array_len(&core, net))?;
        }
        if core.uses_structural_plasticity() && core.make_symmetric {
            return Err(NestError::NotImplemented(
                "symmetric connections with structural plasticity".into(),
            ));
        }
        if core.make_symmetric && !rule.supports_symmetric() {
            return Err(not_implemented(rule.name(), "make_symmetric"));
        }
        if core.make_symmetric && !core.all_parameters_scalar() {
            return Err(NestError::BadProperty(
                "make_symmetric requires scalar weight, delay and synapse parameters".into(),
            ));
        }
        for &syn_id in &core.syn_ids {
            let model = net.synapses().get(syn_id)?;
            if model.requires_symmetric && !(core.make_symmetric || rule.is_symmetric(&core)) {
                return Err(NestError::BadProperty(format!(
                    "{} requires symmetric connectivity; set make_symmetric or use a symmetric rule",
                    model.name
                )));
            }
        }

        Ok(Self { core, rule })
    }

    /// Builder that also wires a third population to each primary connection.
    ///
    /// `third_in` is used for `source → third`, `third_out` for
    /// `third → target`.
    #[allow(clippy::too_many_arguments)]
    pub fn with_third_factor(
        sources: NodeCollection,
        targets: NodeCollection,
        third: NodeCollection,
        conn_spec: &ConnSpec,
        syn_specs: &[SynSpec],
        third_spec: &ThirdFactorSpec,
        third_in: SynSpec,
        third_out: SynSpec,
        net: &dyn Network,
    ) -> Result<Self> {
        if conn_spec.make_symmetric {
            return Err(NestError::NotImplemented(
                "third-factor connectivity cannot be combined with make_symmetric".into(),
            ));
        }
        let mut builder = Self::new(sources.clone(), targets.clone(), conn_spec, syn_specs, net)?;
        let third_out =
            ThirdOutBuilder::new(sources, targets, third, third_spec, third_in, third_out, net)?;
        builder.core.third_out = Some(Box::new(third_out));
        Ok(builder)
    }

    pub fn rule_name(&self) -> &'static str {
        self.rule.name()
    }

    pub fn core(&self) -> &BuilderCore {
        &self.core
    }

    /// Create all connections. Collective: every rank must call it.
    pub fn connect(&mut self, net: &dyn Network) -> Result<()> {
        debug!(
            rule = self.rule.name(),
            sources = self.core.sources.len(),
            targets = self.core.targets.len(),
            "connecting"
        );
        if self.core.uses_structural_plasticity() {
            self.rule.sp_connect_(&self.core, net)?;
        } else {
            self.rule.connect_(&self.core, net)?;
            if self.core.make_symmetric && !self.rule.creates_symmetric_connections() {
                self.core.reset_cursors();
                self.core.swap_populations();
                let mirrored = self.rule.connect_(&self.core, net);
                self.core.swap_populations();
                mirrored?;
            }
        }
        if let Some(third) = &self.core.third_out {
            third.connect_third_in(net)?;
        }
        Ok(())
    }

    /// Remove the connections this rule describes
    pub fn disconnect(&mut self, net: &dyn Network) -> Result<()> {
        if self.core.third_out.is_some() {
            return Err(NestError::NotImplemented(
                "disconnect with a third-factor builder".into(),
            ));
        }
        self.core.reset_cursors();
        if self.core.uses_structural_plasticity() {
            self.rule.sp_disconnect_(&self.core, net)
        } else {
            self.rule.disconnect_(&self.core, net)
        }
    }
}

/// Build and run a connection in one call
pub fn connect(
    net: &dyn Network,
    sources: &NodeCollection,
    targets: &NodeCollection,
    conn_spec: &ConnSpec,
    syn_specs: &[SynSpec],
) -> Result<()> {
    ConnBuilder::new(sources.clone(), targets.clone(), conn_spec, syn_specs, net)?.connect(net)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LocalNetwork;

    fn net(threads: usize) -> LocalNetwork {
        LocalNetwork::single_process(threads, 42, 20).unwrap()
    }

    fn range(a: usize, b: usize) -> NodeCollection {
        NodeCollection::range(a, b).unwrap()
    }

    #[test]
    fn test_parallel_region_wraps_first_error() {
        let err = parallel_region(3, |tid| {
            if tid >= 1 {
                Err(NestError::BadParameter(format!("thread {}", tid)))
            } else {
                Ok(())
            }
        })
        .unwrap_err();
        match err {
            NestError::WrappedThreadException { thread, source } => {
                assert_eq!(thread, 1);
                assert!(matches!(*source, NestError::BadParameter(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_model_rejected() {
        let net = net(1);
        let err = ConnBuilder::new(
            range(1, 3),
            range(4, 6),
            &ConnSpec::new(ConnectivityRule::AllToAll),
            &[SynSpec::new("nonexistent_synapse")],
            &net,
        )
        .unwrap_err();
        assert!(matches!(err, NestError::UnknownSynapseType(_)));
    }

    #[test]
    fn test_integer_param_must_be_integral() {
        let net = net(1);
        let err = ConnBuilder::new(
            range(1, 3),
            range(4, 6),
            &ConnSpec::new(ConnectivityRule::AllToAll),
            &[SynSpec::default().param("receptor_type", 1.5)],
            &net,
        )
        .unwrap_err();
        assert!(matches!(err, NestError::BadParameter(_)));
    }

    #[test]
    fn test_half_specified_synaptic_elements() {
        let net = net(1);
        let mut syn = SynSpec::default();
        syn.pre_synaptic_element = Some("Axon".into());
        let err = ConnBuilder::new(
            range(1, 3),
            range(4, 6),
            &ConnSpec::new(ConnectivityRule::OneToOne),
            &[syn],
            &net,
        )
        .unwrap_err();
        assert!(matches!(err, NestError::BadProperty(_)));
    }

    #[test]
    fn test_symmetric_checks() {
        let net = net(1);
        let spec = ConnSpec::new(ConnectivityRule::PairwiseBernoulli { p: 0.5.into() }).symmetric(true);
        assert!(matches!(
            ConnBuilder::new(range(1, 3), range(1, 3), &spec, &[], &net),
            Err(NestError::NotImplemented(_))
        ));

        let spec = ConnSpec::new(ConnectivityRule::AllToAll).symmetric(true);
        let syn = SynSpec::default().weight(vec![1.0; 9]);
        assert!(matches!(
            ConnBuilder::new(range(1, 3), range(1, 3), &spec, &[syn], &net),
            Err(NestError::BadProperty(_))
        ));
    }

    #[test]
    fn test_array_lengths_checked() {
        let net = net(1);
        let syn = SynSpec::default().weight(vec![1.0, 2.0]);
        let err = ConnBuilder::new(
            range(1, 3),
            range(4, 6),
            &ConnSpec::new(ConnectivityRule::OneToOne),
            &[syn],
            &net,
        )
        .unwrap_err();
        assert!(matches!(err, NestError::BadProperty(_)));

        let syn = SynSpec::default().weight(vec![1.0, 2.0]);
        let err = ConnBuilder::new(
            range(1, 2),
            range(4, 5),
            &ConnSpec::new(ConnectivityRule::PairwiseBernoulli { p: 0.5.into() }),
            &[syn],
            &net,
        )
        .unwrap_err();
        assert!(matches!(err, NestError::BadProperty(_)));
    }

    #[test]
    fn test_multiple_syn_specs_connect_each() {
        let net = net(2);
        let specs = [
            SynSpec::default().weight(2.0),
            SynSpec::new("stdp_synapse").weight(3.0).param("receptor_type", 2i64),
        ];
        connect(
            &net,
            &range(1, 2),
            &range(3, 4),
            &ConnSpec::new(ConnectivityRule::OneToOne),
            &specs,
        )
        .unwrap();
        let conns = net.connections();
        assert_eq!(conns.len(), 4);
        let stdp = net.synapses().id_of("stdp_synapse").unwrap();
        for c in conns.iter().filter(|c| c.syn_id == stdp) {
            assert_eq!(c.weight, 3.0);
            assert_eq!(c.params["receptor_type"], ParamValue::Integer(2));
        }
    }
}

use super::{parallel_region, BuilderCore, RuleStrategy, ThreadState};
use crate::network::Network;
use crate::parameter::ConnParameter;
use rand::Rng;
use spikenet_core::{NestError, NodeId, NodeRef, Result, ThreadId, VpSpecificRng};
use std::collections::HashSet;
use tracing::warn;

/// Validate a scalar degree against the population it samples from.
///
/// Returns true if sampling can never finish: every candidate is needed,
/// self-connections are forbidden, and the populations overlap.
pub(super) fn check_degree(
    core: &BuilderCore,
    degree: &ConnParameter,
    pool_size: usize,
    what: &str,
) -> Result<bool> {
    if degree.is_array() {
        return Err(NestError::BadProperty(format!("{} cannot be an array", what)));
    }
    degree.validate()?;
    let Some(k) = degree.scalar() else {
        return Ok(false);
    };
    if k < 0.0 {
        return Err(NestError::BadProperty(format!("{} cannot be less than zero", what)));
    }
    let k = k.round() as usize;
    if !core.allow_multapses() && k > pool_size {
        return Err(NestError::BadProperty(format!(
            "{} cannot be larger than population size {} without multapses",
            what, pool_size
        )));
    }
    if !core.allow_multapses()
        && !core.allow_autapses()
        && k == pool_size
        && core.sources().intersects(core.targets())
    {
        warn!(
            degree = k,
            population = pool_size,
            "{} equals population size with autapses and multapses disallowed; no connections will be made",
            what
        );
        return Ok(true);
    }
    Ok(false)
}

/// Draw a degree value and round it to a count
pub(super) fn draw_degree<R: Rng + ?Sized>(
    degree: &ConnParameter,
    rng: &mut R,
    what: &str,
) -> Result<usize> {
    let v = degree.value_double(&mut 0, rng, 0, 0)?.round();
    if v < 0.0 {
        return Err(NestError::BadProperty(format!("{} cannot be less than zero, got {}", what, v)));
    }
    Ok(v as usize)
}

/// Each target receives `indegree` randomly chosen sources
#[derive(Debug, Clone)]
pub struct FixedIndegree {
    indegree: ConnParameter,
    never_terminates: bool,
}

impl FixedIndegree {
    pub fn new(core: &BuilderCore, indegree: ConnParameter) -> Result<Self> {
        let never_terminates = check_degree(core, &indegree, core.sources().len(), "indegree")?;
        Ok(Self {
            indegree,
            never_terminates,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn inner_connect(
        &self,
        core: &BuilderCore,
        net: &dyn Network,
        state: &mut ThreadState,
        rng: &mut VpSpecificRng,
        tid: ThreadId,
        target: &NodeRef,
        indegree: usize,
    ) -> Result<()> {
        let sources = core.sources();
        let mut chosen: HashSet<usize> = HashSet::new();
        for _ in 0..indegree {
            let source: NodeId = loop {
                let idx = rng.gen_range(0..sources.len());
                let Some(source) = sources.get(idx) else {
                    continue;
                };
                if !core.allow_autapses() && source == target.node_id {
                    continue;
                }
                if !core.allow_multapses() && !chosen.insert(idx) {
                    continue;
                }
                break source;
            };
            core.single_connect(net, state, rng, tid, source, target)?;
        }
        Ok(())
    }
}

impl RuleStrategy for FixedIndegree {
    fn name(&self) -> &'static str {
        "fixed_indegree"
    }

    fn connect_(&self, core: &BuilderCore, net: &dyn Network) -> Result<()> {
        if self.never_terminates || core.sources().is_empty() {
            return Ok(());
        }
        parallel_region(net.topology().num_threads(), |tid| {
            let mut rng = net.rng().vp_specific(tid);
            let mut state = core.thread_state(tid);
            for target in core.targets().iter() {
                let target_ref = net.get_node_or_proxy(target, tid);
                let indegree = draw_degree(&self.indegree, &mut *rng, "indegree")?;
                if target_ref.is_proxy {
                    core.skip_conn_parameter(&mut state, indegree);
                    continue;
                }
                self.inner_connect(core, net, &mut state, &mut rng, tid, &target_ref, indegree)?;
            }
            Ok(())
        })
    }

    fn requires_proxies(&self) -> bool {
        false
    }

    fn expected_array_len(&self, core: &BuilderCore, _net: &dyn Network) -> Option<usize> {
        let k = self.indegree.scalar()?.round() as usize;
        Some(core.targets().len() * k)
    }
}

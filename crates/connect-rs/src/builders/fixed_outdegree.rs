use super::fixed_indegree::{check_degree, draw_degree};
use super::{parallel_region, BuilderCore, RuleStrategy};
use crate::network::Network;
use crate::parameter::ConnParameter;
use rand::Rng;
use spikenet_core::{NodeId, Result, SyncedRng};
use std::collections::HashSet;

/// Each source projects to `outdegree` randomly chosen targets.
///
/// Target lists are drawn from the rank-synchronized stream so every rank
/// sees the same lists and keeps the connections landing on its own nodes.
#[derive(Debug, Clone)]
pub struct FixedOutdegree {
    outdegree: ConnParameter,
    never_terminates: bool,
}

impl FixedOutdegree {
    pub fn new(core: &BuilderCore, outdegree: ConnParameter) -> Result<Self> {
        let never_terminates = check_degree(core, &outdegree, core.targets().len(), "outdegree")?;
        Ok(Self {
            outdegree,
            never_terminates,
        })
    }

    fn draw_targets(&self, core: &BuilderCore, rng: &mut SyncedRng) -> Result<Vec<(NodeId, Vec<NodeId>)>> {
        let targets = core.targets();
        let mut lists = Vec::with_capacity(core.sources().len());
        for source in core.sources().iter() {
            let outdegree = draw_degree(&self.outdegree, rng, "outdegree")?;
            let mut chosen: HashSet<usize> = HashSet::new();
            let mut list = Vec::with_capacity(outdegree);
            while list.len() < outdegree {
                let idx = rng.gen_range(0..targets.len());
                let Some(target) = targets.get(idx) else {
                    continue;
                };
                if !core.allow_autapses() && target == source {
                    continue;
                }
                if !core.allow_multapses() && !chosen.insert(idx) {
                    continue;
                }
                list.push(target);
            }
            lists.push((source, list));
        }
        Ok(lists)
    }
}

impl RuleStrategy for FixedOutdegree {
    fn name(&self) -> &'static str {
        "fixed_outdegree"
    }

    fn connect_(&self, core: &BuilderCore, net: &dyn Network) -> Result<()> {
        if self.never_terminates || core.targets().is_empty() {
            return Ok(());
        }
        let lists = self.draw_targets(core, &mut net.rng().rank_synced())?;
        parallel_region(net.topology().num_threads(), |tid| {
            let mut rng = net.rng().vp_specific(tid);
            let mut state = core.thread_state(tid);
            for (source, targets) in &lists {
                for &target in targets {
                    let target_ref = net.get_node_or_proxy(target, tid);
                    if target_ref.is_proxy {
                        core.skip_conn_parameter(&mut state, 1);
                        continue;
                    }
                    core.single_connect(net, &mut state, &mut rng, tid, *source, &target_ref)?;
                }
            }
            Ok(())
        })
    }

    fn expected_array_len(&self, core: &BuilderCore, _net: &dyn Network) -> Option<usize> {
        let k = self.outdegree.scalar()?.round() as usize;
        Some(core.sources().len() * k)
    }
}

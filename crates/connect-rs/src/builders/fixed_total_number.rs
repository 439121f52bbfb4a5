use super::{parallel_region, BuilderCore, RuleStrategy};
use crate::network::Network;
use rand::Rng;
use rand_distr::{Binomial, Distribution};
use spikenet_core::{NestError, NodeId, Result, Topology};
use tracing::debug;

/// Exactly `n` connections between the two populations.
///
/// The total is split over virtual processes by successive conditional
/// binomial draws on the rank-synchronized stream, weighted by how many
/// targets each VP owns. Each VP then draws its share of random pairs.
#[derive(Debug, Clone, Copy)]
pub struct FixedTotalNumber {
    n: u64,
}

impl FixedTotalNumber {
    pub fn new(core: &BuilderCore, _net: &dyn Network, n: u64) -> Result<Self> {
        if !core.allow_multapses() {
            return Err(NestError::NotImplemented(
                "fixed_total_number without multapses".into(),
            ));
        }
        if n > 0 && (core.sources().is_empty() || core.targets().is_empty()) {
            return Err(NestError::BadProperty(format!(
                "cannot make {} connections between empty populations",
                n
            )));
        }
        if n > 0
            && excluded_target(core)
                .is_some_and(|lone| core.targets().iter().all(|t| t == lone))
        {
            return Err(NestError::BadProperty(
                "the only candidate pair is an autapse".into(),
            ));
        }
        Ok(Self { n })
    }

    /// Connections assigned to each virtual process
    pub fn partition<R: Rng + ?Sized>(
        n: u64,
        targets_on_vp: &[usize],
        num_targets: usize,
        rng: &mut R,
    ) -> Result<Vec<u64>> {
        let mut per_vp = vec![0u64; targets_on_vp.len()];
        let mut sum_dist = 0.0;
        let mut sum_partitions = 0u64;
        for (vp, &count) in targets_on_vp.iter().enumerate() {
            if sum_partitions == n {
                break;
            }
            if count > 0 {
                let p = (count as f64 / (num_targets as f64 - sum_dist)).clamp(0.0, 1.0);
                let dist = Binomial::new(n - sum_partitions, p)
                    .map_err(|e| NestError::BadParameter(e.to_string()))?;
                per_vp[vp] = dist.sample(rng);
            }
            sum_dist += count as f64;
            sum_partitions += per_vp[vp];
        }
        Ok(per_vp)
    }
}

/// The lone source node when autapses are off; it can never be a target
fn excluded_target(core: &BuilderCore) -> Option<NodeId> {
    if core.allow_autapses() {
        return None;
    }
    let first = core.sources().get(0)?;
    core.sources().iter().all(|s| s == first).then_some(first)
}

fn targets_on_vp(topology: &Topology, core: &BuilderCore) -> Vec<usize> {
    let excluded = excluded_target(core);
    let mut counts = vec![0usize; topology.num_virtual_processes()];
    for t in core.targets().iter().filter(|&t| Some(t) != excluded) {
        counts[topology.node_id_to_vp(t)] += 1;
    }
    counts
}

impl RuleStrategy for FixedTotalNumber {
    fn name(&self) -> &'static str {
        "fixed_total_number"
    }

    fn connect_(&self, core: &BuilderCore, net: &dyn Network) -> Result<()> {
        let topology = *net.topology();
        let counts = targets_on_vp(&topology, core);
        let per_vp = Self::partition(
            self.n,
            &counts,
            counts.iter().sum(),
            &mut *net.rng().rank_synced(),
        )?;
        debug!(n = self.n, ?per_vp, "partitioned connections over virtual processes");

        let num_sources = core.sources().len();
        let excluded = excluded_target(core);
        parallel_region(topology.num_threads(), |tid| {
            let vp = topology.thread_to_vp(tid);
            let local_targets: Vec<_> = core
                .targets()
                .iter()
                .filter(|&t| topology.node_id_to_vp(t) == vp && Some(t) != excluded)
                .collect();
            let mut remaining = per_vp[vp];
            if remaining == 0 {
                return Ok(());
            }
            if local_targets.is_empty() {
                return Err(NestError::BadProperty(format!(
                    "virtual process {} has {} connections to make but no usable target",
                    vp, remaining
                )));
            }
            let mut rng = net.rng().vp_specific(tid);
            let mut state = core.thread_state(tid);
            while remaining > 0 {
                let s = rng.gen_range(0..num_sources);
                let t = rng.gen_range(0..local_targets.len());
                let Some(source) = core.sources().get(s) else {
                    continue;
                };
                let target = local_targets[t];
                if !core.allow_autapses() && source == target {
                    continue;
                }
                let target_ref = net.get_node_or_proxy(target, tid);
                core.single_connect(net, &mut state, &mut rng, tid, source, &target_ref)?;
                remaining -= 1;
            }
            Ok(())
        })
    }

    fn expected_array_len(&self, _core: &BuilderCore, net: &dyn Network) -> Option<usize> {
        // values are consumed in VP order, so arrays only make sense on one VP
        (net.topology().num_virtual_processes() == 1).then_some(self.n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::ConnBuilder;
    use crate::network::LocalNetwork;
    use crate::node_collection::NodeCollection;
    use crate::spec::{ConnSpec, ConnectivityRule, SynSpec};
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn range(a: usize, b: usize) -> NodeCollection {
        NodeCollection::range(a, b).unwrap()
    }

    fn spec(n: u64) -> ConnSpec {
        ConnSpec::new(ConnectivityRule::FixedTotalNumber { n })
    }

    #[test]
    fn test_exact_total() {
        let net = LocalNetwork::single_process(3, 2, 50).unwrap();
        let mut b = ConnBuilder::new(range(1, 20), range(21, 50), &spec(137), &[], &net).unwrap();
        b.connect(&net).unwrap();
        assert_eq!(net.num_connections(), 137);
    }

    #[test]
    fn test_without_autapses() {
        let net = LocalNetwork::single_process(2, 2, 50).unwrap();
        let conn = spec(40).autapses(false);
        let mut b = ConnBuilder::new(range(1, 5), range(1, 5), &conn, &[], &net).unwrap();
        b.connect(&net).unwrap();
        let conns = net.connections();
        assert_eq!(conns.len(), 40);
        assert!(conns.iter().all(|c| c.source != c.target));
    }

    #[test]
    fn test_multapses_required() {
        let net = LocalNetwork::single_process(1, 2, 50).unwrap();
        assert!(matches!(
            ConnBuilder::new(range(1, 5), range(6, 9), &spec(3).multapses(false), &[], &net),
            Err(NestError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_arrays_only_on_single_vp() {
        let syn = SynSpec::default().weight(vec![0.5; 4]);
        let single = LocalNetwork::single_process(1, 2, 50).unwrap();
        let mut b = ConnBuilder::new(range(1, 5), range(6, 9), &spec(4), &[syn.clone()], &single).unwrap();
        b.connect(&single).unwrap();
        assert!(single.connections().iter().all(|c| c.weight == 0.5));

        let multi = LocalNetwork::single_process(2, 2, 50).unwrap();
        assert!(matches!(
            ConnBuilder::new(range(1, 5), range(6, 9), &spec(4), &[syn], &multi),
            Err(NestError::BadProperty(_))
        ));
    }

    #[test]
    fn test_lone_source_never_targets_itself() {
        for threads in [1, 2, 3] {
            let net = LocalNetwork::single_process(threads, 2, 10).unwrap();
            let sources = NodeCollection::from_ids(vec![5]).unwrap();
            let targets = NodeCollection::from_ids(vec![5, 6]).unwrap();
            let conn = spec(10).autapses(false);
            let mut b = ConnBuilder::new(sources, targets, &conn, &[], &net).unwrap();
            b.connect(&net).unwrap();
            let conns = net.connections();
            assert_eq!(conns.len(), 10, "{} threads", threads);
            assert!(conns.iter().all(|c| c.source == 5 && c.target == 6));
        }
    }

    #[test]
    fn test_only_autapse_candidates_rejected() {
        let net = LocalNetwork::single_process(2, 2, 10).unwrap();
        let sources = NodeCollection::from_ids(vec![5]).unwrap();
        let targets = NodeCollection::from_ids(vec![5]).unwrap();
        assert!(matches!(
            ConnBuilder::new(sources, targets, &spec(3).autapses(false), &[], &net),
            Err(NestError::BadProperty(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_partition_sums_to_total(
            n in 0u64..5000,
            counts in prop::collection::vec(0usize..50, 1..16),
            seed in any::<u64>(),
        ) {
            let total: usize = counts.iter().sum();
            prop_assume!(total > 0);
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let per_vp = FixedTotalNumber::partition(n, &counts, total, &mut rng).unwrap();
            prop_assert_eq!(per_vp.iter().sum::<u64>(), n);
            for (share, count) in per_vp.iter().zip(&counts) {
                if *count == 0 {
                    prop_assert_eq!(*share, 0);
                }
            }
        }
    }
}

//! Third-factor connectivity.
//!
//! Each primary connection `source → target` may recruit one node of a
//! third population from a per-target pool, creating `third → target` on
//! the spot and `source → third` after an all-to-all exchange, since the
//! third node may live on another rank.

use super::{parallel_region, BuilderCore};
use crate::network::Network;
use crate::node_collection::NodeCollection;
use crate::spec::{ConnSpec, ConnectivityRule, PoolType, SynSpec, ThirdFactorSpec};
use parking_lot::Mutex;
use rand::seq::index;
use rand::Rng;
use spikenet_core::{NestError, NodeId, NodeRef, Result, ThreadId, VpSpecificRng};
use std::collections::HashMap;
use tracing::debug;

const RULE_NAME: &str = "third_factor_bernoulli_with_pool";

#[derive(Debug, Default)]
struct PoolState {
    /// Pool of third-factor candidates per primary target
    pools: HashMap<NodeId, Vec<NodeId>>,
    /// `(third, source)` pairs still to be wired `source → third`
    pairs: Vec<(NodeId, NodeId)>,
}

/// Third-factor builder attached to a primary [`ConnBuilder`](super::ConnBuilder)
#[derive(Debug)]
pub struct ThirdOutBuilder {
    /// `third → target`
    out_core: BuilderCore,
    /// `source → third`
    in_core: BuilderCore,
    third: NodeCollection,
    targets: NodeCollection,
    p: f64,
    pool_type: PoolType,
    pool_size: usize,
    state: Vec<Mutex<PoolState>>,
}

impl ThirdOutBuilder {
    pub(crate) fn new(
        sources: NodeCollection,
        targets: NodeCollection,
        third: NodeCollection,
        spec: &ThirdFactorSpec,
        third_in: SynSpec,
        third_out: SynSpec,
        net: &dyn Network,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&spec.p) {
            return Err(NestError::BadProperty(format!(
                "third-factor probability must be in [0, 1], got {}",
                spec.p
            )));
        }
        if spec.pool_size < 1 || spec.pool_size > third.len() {
            return Err(NestError::BadProperty(format!(
                "pool_size must be between 1 and {}, got {}",
                third.len(),
                spec.pool_size
            )));
        }
        if spec.pool_type == PoolType::Block {
            let fits = if spec.pool_size == 1 {
                targets.len() % third.len() == 0
            } else {
                targets.len() * spec.pool_size == third.len()
            };
            if !fits {
                return Err(NestError::BadProperty(format!(
                    "block pools need pool_size * {} targets == {} third-factor nodes, \
                     or pool_size 1 and a multiple of {} targets",
                    targets.len(),
                    third.len(),
                    third.len()
                )));
            }
        }

        let flags = ConnSpec::new(ConnectivityRule::OneToOne);
        let mut out_core = BuilderCore::new(third.clone(), targets.clone(), &flags, &[third_out], net)?;
        let mut in_core = BuilderCore::new(sources, third.clone(), &flags, &[third_in], net)?;
        for core in [&mut out_core, &mut in_core] {
            core.check_array_lengths(RULE_NAME, None)?;
            core.set_requires_proxies(false);
        }

        Ok(Self {
            out_core,
            in_core,
            third,
            targets,
            p: spec.p,
            pool_type: spec.pool_type,
            pool_size: spec.pool_size,
            state: (0..net.topology().num_threads())
                .map(|_| Mutex::new(PoolState::default()))
                .collect(),
        })
    }

    fn make_pool(&self, target: NodeId, rng: &mut VpSpecificRng) -> Result<Vec<NodeId>> {
        let target_idx = self.targets.get_lid(target).ok_or_else(|| {
            NestError::IllegalConnection(format!("node {} is not a primary target", target))
        })?;
        let indices: Vec<usize> = match self.pool_type {
            PoolType::Random => {
                let mut picked = index::sample(rng, self.third.len(), self.pool_size).into_vec();
                picked.sort_unstable();
                picked
            }
            PoolType::Block => {
                let start = if self.pool_size > 1 {
                    target_idx * self.pool_size
                } else {
                    target_idx / (self.targets.len() / self.third.len())
                };
                (start..start + self.pool_size).collect()
            }
        };
        indices
            .into_iter()
            .map(|i| {
                self.third
                    .get(i)
                    .ok_or_else(|| NestError::BadProperty(format!("pool index {} out of range", i)))
            })
            .collect()
    }

    /// Called for every primary connection made on `tid`
    pub(crate) fn third_connect(
        &self,
        net: &dyn Network,
        tid: ThreadId,
        rng: &mut VpSpecificRng,
        source: NodeId,
        target: &NodeRef,
    ) -> Result<()> {
        if rng.gen::<f64>() >= self.p {
            return Ok(());
        }
        let third = {
            let mut st = self.state[tid].lock();
            if !st.pools.contains_key(&target.node_id) {
                let pool = self.make_pool(target.node_id, rng)?;
                st.pools.insert(target.node_id, pool);
            }
            let pool = &st.pools[&target.node_id];
            let idx = if pool.len() > 1 {
                rng.gen_range(0..pool.len())
            } else {
                0
            };
            let third = pool[idx];
            st.pairs.push((third, source));
            third
        };
        let mut out_state = self.out_core.thread_state(tid);
        self.out_core
            .single_connect(net, &mut out_state, rng, tid, third, target)
    }

    /// Ship collected `(third, source)` pairs to the ranks owning the third
    /// nodes and connect `source → third` there. Collective.
    pub(crate) fn connect_third_in(&self, net: &dyn Network) -> Result<()> {
        let topo = *net.topology();
        let np = topo.num_processes();

        let mut per_rank: Vec<Vec<u64>> = vec![Vec::new(); np];
        for state in &self.state {
            for (third, source) in state.lock().pairs.drain(..) {
                per_rank[topo.process_of_node(third)].extend([third as u64, source as u64]);
            }
        }
        let local_max = per_rank.iter().map(Vec::len).max().unwrap_or(0) as u64;
        let slots = net.mpi().max_cross_ranks(local_max)? as usize;

        let mut send = vec![0u64; np * slots];
        for (rank, words) in per_rank.iter().enumerate() {
            send[rank * slots..rank * slots + words.len()].copy_from_slice(words);
        }
        let mut recv = vec![0u64; np * slots];
        net.mpi().communicate_alltoall(&send, &mut recv, slots)?;

        let mut by_thread: Vec<Vec<(NodeId, NodeId)>> = vec![Vec::new(); topo.num_threads()];
        for pair in recv.chunks_exact(2) {
            // 0 is never a node id and pads unused slots
            if pair[0] == 0 {
                continue;
            }
            let third = pair[0] as NodeId;
            by_thread[topo.thread_of_node(third)].push((third, pair[1] as NodeId));
        }
        debug!(
            pairs = by_thread.iter().map(Vec::len).sum::<usize>(),
            slots, "third-factor pairs received"
        );

        parallel_region(topo.num_threads(), |tid| {
            let mut rng = net.rng().vp_specific(tid);
            let mut state = self.in_core.thread_state(tid);
            for &(third, source) in &by_thread[tid] {
                let third_ref = net.get_node_or_proxy(third, tid);
                self.in_core
                    .single_connect(net, &mut state, &mut rng, tid, source, &third_ref)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::ConnBuilder;
    use crate::network::LocalNetwork;
    use std::collections::HashSet;

    fn range(a: usize, b: usize) -> NodeCollection {
        NodeCollection::range(a, b).unwrap()
    }

    fn build(net: &LocalNetwork, spec: ThirdFactorSpec) -> Result<ConnBuilder> {
        ConnBuilder::with_third_factor(
            range(1, 4),
            range(5, 8),
            range(9, 10),
            &ConnSpec::new(ConnectivityRule::AllToAll),
            &[SynSpec::default()],
            &spec,
            SynSpec::default().weight(2.0),
            SynSpec::default().weight(3.0),
            net,
        )
    }

    #[test]
    fn test_every_edge_recruits_third_factor() {
        let net = LocalNetwork::single_process(2, 5, 10).unwrap();
        let spec = ThirdFactorSpec {
            p: 1.0,
            pool_type: PoolType::Random,
            pool_size: 1,
        };
        build(&net, spec).unwrap().connect(&net).unwrap();
        let conns = net.connections();
        assert_eq!(conns.len(), 48);
        assert_eq!(conns.iter().filter(|c| c.weight == 2.0).count(), 16);
        assert_eq!(conns.iter().filter(|c| c.weight == 3.0).count(), 16);
        // a size-one pool is fixed per target
        for t in 5..=8 {
            let thirds: HashSet<_> = conns
                .iter()
                .filter(|c| c.weight == 3.0 && c.target == t)
                .map(|c| c.source)
                .collect();
            assert_eq!(thirds.len(), 1);
        }
    }

    #[test]
    fn test_block_pools() {
        let net = LocalNetwork::single_process(1, 5, 10).unwrap();
        let spec = ThirdFactorSpec {
            p: 1.0,
            pool_type: PoolType::Block,
            pool_size: 1,
        };
        build(&net, spec).unwrap().connect(&net).unwrap();
        for c in net.connections().iter().filter(|c| c.weight == 3.0) {
            let expected = if c.target <= 6 { 9 } else { 10 };
            assert_eq!(c.source, expected);
        }
    }

    #[test]
    fn test_zero_probability_adds_nothing() {
        let net = LocalNetwork::single_process(2, 5, 10).unwrap();
        let spec = ThirdFactorSpec {
            p: 0.0,
            pool_type: PoolType::Random,
            pool_size: 2,
        };
        build(&net, spec).unwrap().connect(&net).unwrap();
        assert_eq!(net.num_connections(), 16);
    }

    #[test]
    fn test_invalid_pools() {
        let net = LocalNetwork::single_process(1, 5, 10).unwrap();
        let bad = [
            ThirdFactorSpec { p: 1.5, pool_type: PoolType::Random, pool_size: 1 },
            ThirdFactorSpec { p: 0.5, pool_type: PoolType::Random, pool_size: 3 },
            ThirdFactorSpec { p: 0.5, pool_type: PoolType::Block, pool_size: 2 },
        ];
        for spec in bad {
            assert!(matches!(build(&net, spec), Err(NestError::BadProperty(_))));
        }
    }

    #[test]
    fn test_disconnect_not_supported() {
        let net = LocalNetwork::single_process(1, 5, 10).unwrap();
        let spec = ThirdFactorSpec { p: 0.5, pool_type: PoolType::Random, pool_size: 1 };
        let mut builder = build(&net, spec).unwrap();
        assert!(matches!(builder.disconnect(&net), Err(NestError::NotImplemented(_))));
    }

    #[test]
    fn test_symmetric_rejected_before_connecting() {
        let net = LocalNetwork::single_process(1, 5, 10).unwrap();
        let spec = ThirdFactorSpec { p: 1.0, pool_type: PoolType::Random, pool_size: 1 };
        let result = ConnBuilder::with_third_factor(
            range(1, 3),
            range(4, 6),
            range(7, 9),
            &ConnSpec::new(ConnectivityRule::AllToAll).symmetric(true),
            &[SynSpec::default()],
            &spec,
            SynSpec::default(),
            SynSpec::default(),
            &net,
        );
        assert!(matches!(result, Err(NestError::NotImplemented(_))));
        assert_eq!(net.num_connections(), 0);
    }
}

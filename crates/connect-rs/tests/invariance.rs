//! The same seed must give the same network however virtual processes are
//! split into ranks and threads.

use spikenet_connect::{
    connect, ConnBuilder, ConnSpec, ConnectivityRule, LocalNetwork, NodeCollection, PoolType,
    RandomParameter, SynSpec, ThirdFactorSpec,
};
use spikenet_core::{CommunicationConfig, Topology};
use spikenet_mpi::{LocalCluster, MpiManager};
use std::collections::{HashMap, HashSet};
use std::thread;

const SEED: u64 = 20240611;
const NUM_NODES: usize = 60;

/// (source, target, weight bits, delay bits)
type Edge = (usize, usize, u64, u64);

/// Run `build` on every rank of an `np × threads` layout and merge the edges
fn run_layout(np: usize, threads: usize, build: fn(&LocalNetwork)) -> Vec<Edge> {
    let config = CommunicationConfig::default();
    let handles: Vec<_> = LocalCluster::new(np)
        .into_iter()
        .map(|t| {
            let config = config.clone();
            thread::spawn(move || {
                let mpi = MpiManager::new(Box::new(t), &config);
                let topo = Topology::new(np, mpi.rank(), threads).unwrap();
                let net = LocalNetwork::new(topo, mpi, SEED, NUM_NODES).unwrap();
                build(&net);
                net.connections()
                    .iter()
                    .map(|c| (c.source, c.target, c.weight.to_bits(), c.delay.to_bits()))
                    .collect::<Vec<Edge>>()
            })
        })
        .collect();
    let mut edges: Vec<Edge> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    edges.sort_unstable();
    edges
}

fn assert_invariant(build: fn(&LocalNetwork)) -> Vec<Edge> {
    let reference = run_layout(1, 4, build);
    assert!(!reference.is_empty());
    for (np, threads) in [(2, 2), (4, 1)] {
        assert_eq!(
            run_layout(np, threads, build),
            reference,
            "{} ranks x {} threads differs from 1 x 4",
            np,
            threads
        );
    }
    reference
}

fn all() -> NodeCollection {
    NodeCollection::range(1, NUM_NODES).unwrap()
}

fn random_weight() -> SynSpec {
    SynSpec::default()
        .weight(RandomParameter::Uniform { min: 0.5, max: 1.5 })
        .delay(RandomParameter::Uniform { min: 1.0, max: 3.0 })
}

#[test]
fn test_fixed_indegree_invariant() {
    let edges = assert_invariant(|net| {
        let spec = ConnSpec::new(ConnectivityRule::FixedIndegree { indegree: 7i64.into() })
            .autapses(false)
            .multapses(false);
        let syn = SynSpec::default().weight(RandomParameter::Uniform { min: 0.5, max: 1.5 });
        connect(net, &all(), &all(), &spec, &[syn]).unwrap();
    });
    let mut indegree: HashMap<usize, HashSet<usize>> = HashMap::new();
    for (s, t, ..) in &edges {
        assert_ne!(s, t);
        indegree.entry(*t).or_default().insert(*s);
    }
    assert_eq!(edges.len(), NUM_NODES * 7);
    assert!(indegree.values().all(|s| s.len() == 7));
}

#[test]
fn test_fixed_outdegree_invariant() {
    let edges = assert_invariant(|net| {
        let spec = ConnSpec::new(ConnectivityRule::FixedOutdegree { outdegree: 5i64.into() })
            .autapses(false)
            .multapses(false);
        let sources = NodeCollection::range(1, 20).unwrap();
        connect(net, &sources, &all(), &spec, &[SynSpec::default().weight(RandomParameter::Normal {
            mean: 1.0,
            std: 0.2,
        })])
        .unwrap();
    });
    let mut outdegree: HashMap<usize, HashSet<usize>> = HashMap::new();
    for (s, t, ..) in &edges {
        outdegree.entry(*s).or_default().insert(*t);
    }
    assert_eq!(outdegree.len(), 20);
    assert!(outdegree.values().all(|t| t.len() == 5));
}

#[test]
fn test_fixed_total_number_invariant() {
    let edges = assert_invariant(|net| {
        let spec = ConnSpec::new(ConnectivityRule::FixedTotalNumber { n: 333 }).autapses(false);
        connect(net, &all(), &all(), &spec, &[random_weight()]).unwrap();
    });
    assert_eq!(edges.len(), 333);
    assert!(edges.iter().all(|(s, t, ..)| s != t));
}

#[test]
fn test_symmetric_bernoulli_invariant() {
    let edges = assert_invariant(|net| {
        let spec = ConnSpec::new(ConnectivityRule::SymmetricPairwiseBernoulli { p: 0.1 })
            .autapses(false)
            .symmetric(true);
        connect(net, &all(), &all(), &spec, &[SynSpec::new("gap_junction").weight(0.3)]).unwrap();
    });
    let pairs: HashSet<_> = edges.iter().map(|(s, t, ..)| (*s, *t)).collect();
    for (s, t) in &pairs {
        assert!(pairs.contains(&(*t, *s)));
    }
}

#[test]
fn test_bernoulli_and_all_to_all_invariant() {
    assert_invariant(|net| {
        let spec = ConnSpec::new(ConnectivityRule::PairwiseBernoulli { p: 0.2.into() });
        connect(net, &all(), &all(), &spec, &[random_weight()]).unwrap();
    });
    assert_invariant(|net| {
        let spec = ConnSpec::new(ConnectivityRule::AllToAll).autapses(false);
        let weights: Vec<f64> = (0..20 * 20).map(|i| i as f64).collect();
        let nodes = NodeCollection::range(11, 30).unwrap();
        connect(net, &nodes, &nodes, &spec, &[SynSpec::default().weight(weights)]).unwrap();
    });
}

#[test]
fn test_one_to_one_arrays_invariant() {
    let edges = assert_invariant(|net| {
        let sources = NodeCollection::range(1, 30).unwrap();
        let targets = NodeCollection::range(31, 60).unwrap();
        let weights: Vec<f64> = (1..=30).map(f64::from).collect();
        let spec = ConnSpec::new(ConnectivityRule::OneToOne);
        connect(net, &sources, &targets, &spec, &[SynSpec::default().weight(weights)]).unwrap();
    });
    for (s, t, w, _) in edges {
        assert_eq!(t, s + 30);
        assert_eq!(f64::from_bits(w), s as f64);
    }
}

#[test]
fn test_third_factor_across_ranks() {
    let count = |np, threads| {
        run_layout(np, threads, |net| {
            let spec = ThirdFactorSpec {
                p: 1.0,
                pool_type: PoolType::Block,
                pool_size: 1,
            };
            let mut b = ConnBuilder::with_third_factor(
                NodeCollection::range(1, 8).unwrap(),
                NodeCollection::range(9, 16).unwrap(),
                NodeCollection::range(17, 20).unwrap(),
                &ConnSpec::new(ConnectivityRule::OneToOne),
                &[SynSpec::default().weight(1.0)],
                &spec,
                SynSpec::default().weight(2.0),
                SynSpec::default().weight(3.0),
                net,
            )
            .unwrap();
            b.connect(net).unwrap();
        })
    };
    let reference = count(1, 2);
    assert_eq!(reference.len(), 24);
    assert_eq!(count(2, 2), reference);
    assert_eq!(count(3, 1), reference);
    // block pools: targets 9,10 -> 17; 11,12 -> 18; ...
    for (s, t, w, _) in &reference {
        match f64::from_bits(*w) {
            w if w == 3.0 => assert_eq!(*s, 17 + (t - 9) / 2),
            w if w == 2.0 => assert_eq!(*t, 17 + (s - 1) / 2),
            _ => assert_eq!(*t, s + 8),
        }
    }
}

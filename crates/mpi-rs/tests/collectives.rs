//! Multi-rank collectives on an in-process cluster.

use proptest::prelude::*;
use spikenet_core::{CommunicationConfig, RngManager, Topology};
use spikenet_mpi::{LocalCluster, MpiManager};
use std::thread;

/// Run `f` once per rank on its own thread and collect the results in rank order
fn run_ranks<R, F>(np: usize, config: CommunicationConfig, f: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(MpiManager) -> R + Send + Sync + Clone + 'static,
{
    let handles: Vec<_> = LocalCluster::new(np)
        .into_iter()
        .map(|t| {
            let f = f.clone();
            let config = config.clone();
            thread::spawn(move || f(MpiManager::new(Box::new(t), &config)))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn payload(rank: usize, len: usize) -> Vec<i64> {
    (0..len).map(|i| (rank * 1000 + i) as i64).collect()
}

#[test]
fn test_fast_path_concatenates_in_rank_order() {
    let config = CommunicationConfig {
        send_buffer_size: 8,
        ..Default::default()
    };
    let results = run_ranks(3, config, |mpi| {
        let send = payload(mpi.rank(), mpi.rank() + 1);
        let g = mpi.communicate(&send).unwrap();
        (g, mpi.send_buffer_size())
    });
    let expected: Vec<i64> = (0..3).flat_map(|r| payload(r, r + 1)).collect();
    for (g, slot) in results {
        assert_eq!(g.data, expected);
        assert_eq!(g.displacements, vec![0, 1, 3]);
        assert_eq!(slot, 8);
    }
}

#[test]
fn test_overflow_resizes_all_ranks_identically() {
    let config = CommunicationConfig {
        send_buffer_size: 4,
        ..Default::default()
    };
    let sizes = [2usize, 10, 0, 3];
    let results = run_ranks(4, config, move |mpi| {
        let send = payload(mpi.rank(), sizes[mpi.rank()]);
        let first = mpi.communicate(&send).unwrap();
        let slot_after = mpi.send_buffer_size();
        // second round fits in the enlarged slot
        let second = mpi.communicate(&send).unwrap();
        (first, second, slot_after)
    });
    let expected: Vec<i64> = (0..4).flat_map(|r| payload(r, sizes[r])).collect();
    for (first, second, slot) in results {
        assert_eq!(first.data, expected);
        assert_eq!(first.counts, sizes.to_vec());
        assert_eq!(first.displacements, vec![0, 2, 12, 12]);
        assert_eq!(first.rank_data(1), payload(1, 10).as_slice());
        assert_eq!(second, first);
        assert_eq!(slot, 11);
    }
}

#[test]
fn test_count_equal_to_marker_takes_overflow_path() {
    let config = CommunicationConfig {
        send_buffer_size: 300,
        ..Default::default()
    };
    let results = run_ranks(2, config, |mpi| {
        let len = if mpi.rank() == 0 { u8::MAX as usize } else { 3 };
        let send: Vec<u8> = (0..len).map(|i| (i % 200) as u8).collect();
        mpi.communicate(&send).unwrap()
    });
    for g in results {
        assert_eq!(g.counts, vec![255, 3]);
        assert_eq!(g.displacements, vec![0, 255]);
        assert_eq!(g.rank_data(0).len(), 255);
        assert_eq!(g.rank_data(1), &[0u8, 1, 2]);
    }
}

#[test]
fn test_alltoall_routes_blocks() {
    let results = run_ranks(3, CommunicationConfig::default(), |mpi| {
        let r = mpi.rank() as u32;
        let send: Vec<u32> = (0..3).flat_map(|dst| [r * 10 + dst, 100 + r]).collect();
        let mut recv = vec![0u32; 6];
        mpi.communicate_alltoall(&send, &mut recv, 2).unwrap();
        recv
    });
    for (me, recv) in results.into_iter().enumerate() {
        for src in 0..3u32 {
            assert_eq!(recv[2 * src as usize], src * 10 + me as u32);
            assert_eq!(recv[2 * src as usize + 1], 100 + src);
        }
    }
}

#[test]
fn test_reductions_across_ranks() {
    let results = run_ranks(3, CommunicationConfig::default(), |mpi| {
        let r = mpi.rank();
        (
            mpi.any_true(r == 2).unwrap(),
            mpi.any_true(false).unwrap(),
            mpi.max_cross_ranks(r as u64).unwrap(),
            mpi.min_cross_ranks(r as i32 - 1).unwrap(),
            mpi.sum_cross_ranks(r as u64).unwrap(),
        )
    });
    for r in results {
        assert_eq!(r, (true, false, 2, -1, 3));
    }
}

#[test]
fn test_rng_synchrony_across_ranks() {
    let results = run_ranks(2, CommunicationConfig::default(), |mpi| {
        let topo = Topology::new(2, mpi.rank(), 1).unwrap();
        let rng = RngManager::new(&topo, 42);
        let same = mpi.check_rng_synchrony(&rng).is_ok();
        // a different seed on one rank must be detected
        let rng = RngManager::new(&topo, 42 + mpi.rank() as u64);
        let diverged = mpi.check_rng_synchrony(&rng).is_err();
        (same, diverged)
    });
    for r in results {
        assert_eq!(r, (true, true));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_allgather_delivers_exact_concatenation(
        sizes in prop::collection::vec(0usize..20, 2..4),
        slot in 2usize..8,
    ) {
        let np = sizes.len();
        let config = CommunicationConfig { send_buffer_size: slot, ..Default::default() };
        let s = sizes.clone();
        let results = run_ranks(np, config, move |mpi| {
            mpi.communicate(&payload(mpi.rank(), s[mpi.rank()])).unwrap()
        });
        let expected: Vec<i64> = (0..np).flat_map(|r| payload(r, sizes[r])).collect();
        for g in results {
            prop_assert_eq!(&g.data, &expected);
            for r in 0..np {
                let want = payload(r, sizes[r]);
                prop_assert_eq!(g.rank_data(r), want.as_slice());
            }
        }
    }
}

//! # SpikeNet CLI
//!
//! Builds networks and pushes spikes through them on an in-process cluster,
//! one OS thread per rank.

mod scenario;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;
use rand::Rng;
use scenario::Scenario;
use spikenet_connect::{
    connect, ConnSpec, ConnectivityRule, Connection, LocalNetwork, Network, NodeCollection,
    SynSpec,
};
use spikenet_core::{CommunicationConfig, Topology};
use spikenet_exchange::{EventDeliveryManager, ExchangeStats, SpikeRegisterTable};
use spikenet_mpi::{LocalCluster, MpiManager};
use std::path::PathBuf;
use std::thread;
use tracing::info;

#[derive(Parser)]
#[command(name = "spikenet")]
#[command(version = "0.1.0")]
#[command(about = "Distributed connection building and spike exchange", long_about = None)]
struct Cli {
    /// Log filter, e.g. "debug" or "spikenet_exchange=trace"
    #[arg(long, global = true, default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the network described by a scenario file
    Connect {
        /// Scenario JSON
        scenario: PathBuf,
        /// Number of ranks
        #[arg(short, long, default_value_t = 1)]
        ranks: usize,
        /// Threads per rank, overrides the scenario
        #[arg(short, long)]
        threads: Option<usize>,
        /// Print every edge
        #[arg(long)]
        edges: bool,
    },

    /// Send random spike traffic through a Bernoulli network
    Exchange {
        #[arg(short, long, default_value_t = 2)]
        ranks: usize,
        #[arg(short, long, default_value_t = 2)]
        threads: usize,
        #[arg(short, long, default_value_t = 200)]
        nodes: usize,
        /// Connection probability
        #[arg(short, long, default_value_t = 0.1)]
        p: f64,
        /// Firing probability per node and lag
        #[arg(long, default_value_t = 0.05)]
        rate: f64,
        /// Lags per communication interval
        #[arg(long, default_value_t = 10)]
        lags: usize,
        /// Communication intervals to run
        #[arg(short, long, default_value_t = 5)]
        intervals: usize,
        /// Initial spike buffer size
        #[arg(long, default_value_t = 8)]
        buffer: usize,
        #[arg(long, default_value_t = 12345)]
        seed: u64,
    },

    /// List connectivity rules
    Rules,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    spikenet_core::logging::init(&cli.log);

    match cli.command {
        Commands::Connect {
            scenario,
            ranks,
            threads,
            edges,
        } => {
            let mut scenario = Scenario::from_path(&scenario)?;
            if let Some(threads) = threads {
                scenario.kernel.local_num_threads = threads;
            }
            scenario.kernel.validate()?;
            println!(
                "{} {} nodes, {} projections on {} ranks x {} threads",
                "Connecting:".green().bold(),
                scenario.num_nodes,
                scenario.projections.len(),
                ranks,
                scenario.kernel.local_num_threads
            );
            run_connect(&scenario, ranks, edges)?;
        }

        Commands::Exchange {
            ranks,
            threads,
            nodes,
            p,
            rate,
            lags,
            intervals,
            buffer,
            seed,
        } => {
            if !(0.0..=1.0).contains(&rate) {
                return Err(anyhow!("rate must be in [0, 1], got {}", rate));
            }
            let params = ExchangeParams {
                threads,
                nodes,
                p,
                rate,
                lags,
                intervals,
                seed,
            };
            let config = CommunicationConfig {
                buffer_size_spike_data: buffer,
                buffer_size_target_data: buffer,
                ..Default::default()
            };
            println!(
                "{} {} nodes, p = {}, {} ranks x {} threads",
                "Exchanging:".green().bold(),
                nodes,
                p,
                ranks,
                threads
            );
            run_exchange(params, ranks, config)?;
        }

        Commands::Rules => {
            println!("{}", "Connectivity rules:".green().bold());
            println!();
            for name in ConnectivityRule::all_names() {
                println!("  {:<30} {}", name.cyan(), describe(name));
            }
        }
    }

    Ok(())
}

fn describe(rule: &str) -> &'static str {
    match rule {
        "one_to_one" => "i-th source to i-th target",
        "all_to_all" => "every source to every target",
        "fixed_indegree" => "each target draws `indegree` sources",
        "fixed_outdegree" => "each source draws `outdegree` targets",
        "fixed_total_number" => "exactly `n` edges, multapses required",
        "pairwise_bernoulli" => "independent coin flip with probability `p` per pair",
        "pairwise_poisson" => "Poisson number of edges per pair",
        "symmetric_pairwise_bernoulli" => "undirected Bernoulli graph",
        _ => "",
    }
}

/// Run `f` once per rank of an in-process cluster
fn run_cluster<R, F>(ranks: usize, config: &CommunicationConfig, f: F) -> anyhow::Result<Vec<R>>
where
    R: Send + 'static,
    F: Fn(MpiManager) -> anyhow::Result<R> + Send + Sync + Clone + 'static,
{
    if ranks == 0 {
        return Err(anyhow!("at least one rank is needed"));
    }
    let mut handles = Vec::with_capacity(ranks);
    for (rank, transport) in LocalCluster::new(ranks).into_iter().enumerate() {
        let f = f.clone();
        let config = config.clone();
        let handle = thread::Builder::new()
            .name(format!("rank-{}", rank))
            .spawn(move || f(MpiManager::new(Box::new(transport), &config)))
            .context("spawning rank thread")?;
        handles.push(handle);
    }
    handles
        .into_iter()
        .enumerate()
        .map(|(rank, h)| {
            h.join()
                .map_err(|_| anyhow!("rank {} panicked", rank))?
                .with_context(|| format!("rank {}", rank))
        })
        .collect()
}

fn run_connect(scenario: &Scenario, ranks: usize, print_edges: bool) -> anyhow::Result<()> {
    let shared = scenario.clone();
    let per_rank = run_cluster(ranks, &scenario.kernel.communication, move |mpi| {
        let s = &shared;
        let topo = Topology::new(mpi.num_processes(), mpi.rank(), s.kernel.local_num_threads)?;
        let mut net = LocalNetwork::new(topo, mpi, s.kernel.rng_seed, s.num_nodes)?;
        for &d in &s.devices {
            net.add_device(d);
        }
        for (i, proj) in s.projections.iter().enumerate() {
            let sources = NodeCollection::try_from(proj.sources.clone())?;
            let targets = NodeCollection::try_from(proj.targets.clone())?;
            connect(&net, &sources, &targets, &proj.conn_spec, &proj.syn_spec)
                .with_context(|| format!("projection {} ({})", i, proj.conn_spec.rule.name()))?;
        }
        let names: Vec<String> = net.synapses().names().map(str::to_string).collect();
        info!(rank = topo.rank(), edges = net.num_connections(), "network built");
        Ok((net.connections(), names))
    })?;

    let mut all: Vec<Connection> = Vec::new();
    for (rank, (conns, names)) in per_rank.into_iter().enumerate() {
        println!("  rank {}: {} edges", rank, conns.len().to_string().cyan());
        if print_edges {
            for c in &conns {
                let model = names.get(c.syn_id).map_or("?", String::as_str);
                println!(
                    "    {:>6} -> {:<6} w={:<10.4} d={:<6.2} {}",
                    c.source, c.target, c.weight, c.delay, model
                );
            }
        }
        all.extend(conns);
    }

    println!();
    println!("{} {}", "Total edges:".green().bold(), all.len());
    let mut indegree = vec![0usize; scenario.num_nodes + 1];
    let mut outdegree = vec![0usize; scenario.num_nodes + 1];
    for c in &all {
        indegree[c.target] += 1;
        outdegree[c.source] += 1;
    }
    print_degrees("in-degree", &indegree[1..]);
    print_degrees("out-degree", &outdegree[1..]);
    Ok(())
}

fn print_degrees(label: &str, degrees: &[usize]) {
    let min = degrees.iter().min().copied().unwrap_or(0);
    let max = degrees.iter().max().copied().unwrap_or(0);
    let mean = if degrees.is_empty() {
        0.0
    } else {
        degrees.iter().sum::<usize>() as f64 / degrees.len() as f64
    };
    println!("  {:<10} min {:<6} mean {:<8.2} max {}", label, min, mean, max);
}

#[derive(Debug, Clone, Copy)]
struct ExchangeParams {
    threads: usize,
    nodes: usize,
    p: f64,
    rate: f64,
    lags: usize,
    intervals: usize,
    seed: u64,
}

/// Per interval: (rounds, spikes delivered, spike buffer size afterwards)
type IntervalReport = (usize, usize, usize);

fn run_exchange(
    params: ExchangeParams,
    ranks: usize,
    config: CommunicationConfig,
) -> anyhow::Result<()> {
    let edm_config = config.clone();
    let per_rank = run_cluster(ranks, &config, move |mpi| {
        let ExchangeParams {
            threads,
            nodes,
            p,
            rate,
            lags,
            intervals,
            seed,
        } = params;
        let topo = Topology::new(mpi.num_processes(), mpi.rank(), threads)?;
        let net = LocalNetwork::new(topo, mpi, seed, nodes)?;
        let all = NodeCollection::range(1, nodes)?;
        let spec = ConnSpec::new(ConnectivityRule::PairwiseBernoulli { p: p.into() });
        connect(&net, &all, &all, &spec, &[SynSpec::default()])?;

        let mut edm = EventDeliveryManager::new(topo, &edm_config)?;
        let mut sources = net.source_table()?;
        let targets = net.target_table();
        edm.gather_target_data(net.mpi(), &mut sources, &targets)?;

        let mut register = SpikeRegisterTable::new(threads, lags);
        let mut reports: Vec<IntervalReport> = Vec::with_capacity(intervals);
        for _ in 0..intervals {
            for tid in 0..threads {
                let mut rng = net.rng().vp_specific(tid);
                for node in (1..=nodes).filter(|&n| topo.is_local_node(n) && topo.thread_of_node(n) == tid) {
                    for lag in 0..lags {
                        if rng.gen_bool(rate) {
                            targets.register_spike(&register, tid, topo.node_local_id(node), lag)?;
                        }
                    }
                }
            }
            let mut delivered = 0;
            let rounds = edm.gather_spike_data(net.mpi(), &mut register, |_, _| {
                delivered += 1;
                Ok(())
            })?;
            register.clear_all();
            edm.update_spike_buffer_size(net.mpi())?;
            reports.push((rounds, delivered, edm.buffer_size_spike_data()));
        }
        Ok((reports, edm.stats().clone()))
    })?;

    for (rank, (reports, stats)) in per_rank.iter().enumerate() {
        println!("{}", format!("rank {}", rank).cyan().bold());
        for (i, (rounds, delivered, buffer)) in reports.iter().enumerate() {
            let rounds = if *rounds > 1 {
                rounds.to_string().yellow()
            } else {
                rounds.to_string().normal()
            };
            println!(
                "  interval {:<3} rounds {:<4} delivered {:<8} buffer {}",
                i, rounds, delivered, buffer
            );
        }
        print_stats(stats);
    }
    Ok(())
}

fn print_stats(stats: &ExchangeStats) {
    println!(
        "  spikes sent {}, target records sent {}, max rounds {}, buffer resizes {}",
        stats.spikes_sent, stats.target_data_sent, stats.max_rounds, stats.buffer_resizes
    );
}

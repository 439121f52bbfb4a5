//! # SpikeNet Connect
//!
//! Connection rules for spiking networks distributed over ranks and
//! threads, in the style of NEST's `Connect`.
//!
//! Every virtual process (rank × thread) only creates connections whose
//! target it owns. Random choices come from one of two stream kinds:
//!
//! - VP-specific streams for decisions about local targets
//!   (one_to_one, all_to_all, fixed_indegree, pairwise_bernoulli, ...)
//! - synchronized streams for decisions every rank must agree on
//!   (fixed_outdegree target lists, fixed_total_number partitioning,
//!   symmetric_pairwise_bernoulli)
//!
//! With a fixed number of virtual processes the resulting network does not
//! depend on how they are split into ranks and threads.
//!
//! ```no_run
//! use spikenet_connect::{connect, ConnSpec, ConnectivityRule, LocalNetwork, NodeCollection, SynSpec};
//!
//! let net = LocalNetwork::single_process(4, 12345, 200).unwrap();
//! let exc = NodeCollection::range(1, 160).unwrap();
//! let all = NodeCollection::range(1, 200).unwrap();
//! let spec = ConnSpec::new(ConnectivityRule::FixedIndegree { indegree: 20i64.into() })
//!     .autapses(false);
//! connect(&net, &exc, &all, &spec, &[SynSpec::default().weight(0.1).delay(1.5)]).unwrap();
//! ```

pub mod builders;
pub mod conngen;
pub mod network;
pub mod node_collection;
pub mod parameter;
pub mod spec;
pub mod structural;
pub mod synapse_registry;

pub use builders::{connect, BuilderCore, ConnBuilder, RuleStrategy};
pub use conngen::{cg_connect, CgParams, ConnectionGenerator, ExplicitConnectionSet, Mask};
pub use network::{Connection, LocalNetwork, Network};
pub use node_collection::{NodeCollection, NodeCollectionSpec};
pub use parameter::{ConnParameter, RandomParameter};
pub use spec::{ConnSpec, ConnectivityRule, PoolType, SynSpec, ThirdFactorSpec};
pub use structural::SpBuilder;
pub use synapse_registry::{SynapseModel, SynapseRegistry};

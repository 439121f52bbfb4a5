use super::{parallel_region, BuilderCore, RuleStrategy};
use crate::network::Network;
use rand::Rng;
use rand_distr::{Binomial, Distribution};
use spikenet_core::{NestError, Result};
use std::collections::HashSet;

/// Undirected Bernoulli graph built in one pass.
///
/// Every thread walks the same VP-synchronized stream, draws a truncated
/// binomial indegree per target and the same sources, and creates each
/// direction whose endpoint it owns.
#[derive(Debug, Clone, Copy)]
pub struct SymmetricPairwiseBernoulli {
    p: f64,
}

impl SymmetricPairwiseBernoulli {
    pub fn new(core: &BuilderCore, p: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(NestError::BadProperty(format!(
                "connection probability 0 <= p < 1 required, got {}",
                p
            )));
        }
        if !core.allow_multapses() {
            return Err(NestError::BadProperty("multapses must be enabled".into()));
        }
        if core.allow_autapses() {
            return Err(NestError::BadProperty("autapses must be disabled".into()));
        }
        if !core.make_symmetric() {
            return Err(NestError::BadProperty(
                "symmetric connections must be enabled".into(),
            ));
        }
        Ok(Self { p })
    }
}

impl RuleStrategy for SymmetricPairwiseBernoulli {
    fn name(&self) -> &'static str {
        "symmetric_pairwise_bernoulli"
    }

    fn connect_(&self, core: &BuilderCore, net: &dyn Network) -> Result<()> {
        let sources = core.sources();
        if sources.is_empty() {
            return Ok(());
        }
        let binomial = Binomial::new(sources.len() as u64, self.p)
            .map_err(|e| NestError::BadParameter(e.to_string()))?;

        parallel_region(net.topology().num_threads(), |tid| {
            let mut synced = net.rng().vp_synced(tid);
            let mut rng = net.rng().vp_specific(tid);
            let mut state = core.thread_state(tid);
            let mut previous: HashSet<usize> = HashSet::new();

            for target in core.targets().iter() {
                let indegree = loop {
                    let k = binomial.sample(&mut *synced) as usize;
                    if k < sources.len() {
                        break k;
                    }
                };
                let target_ref = net.get_node_or_proxy(target, tid);

                previous.clear();
                let mut i = 0;
                while i < indegree {
                    let Some(source) = sources.get(synced.gen_range(0..sources.len())) else {
                        continue;
                    };
                    if source == target || !previous.insert(source) {
                        continue;
                    }
                    if !target_ref.is_proxy {
                        core.single_connect(net, &mut state, &mut rng, tid, source, &target_ref)?;
                    }
                    let source_ref = net.get_node_or_proxy(source, tid);
                    if !source_ref.is_proxy {
                        core.single_connect(net, &mut state, &mut rng, tid, target, &source_ref)?;
                    }
                    i += 1;
                }
            }
            Ok(())
        })
    }

    fn supports_symmetric(&self) -> bool {
        true
    }

    fn is_symmetric(&self, _core: &BuilderCore) -> bool {
        true
    }

    fn creates_symmetric_connections(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::builders::ConnBuilder;
    use crate::network::LocalNetwork;
    use crate::node_collection::NodeCollection;
    use crate::spec::{ConnSpec, ConnectivityRule, SynSpec};
    use spikenet_core::NestError;
    use std::collections::HashSet;

    fn range(a: usize, b: usize) -> NodeCollection {
        NodeCollection::range(a, b).unwrap()
    }

    fn spec(p: f64) -> ConnSpec {
        ConnSpec::new(ConnectivityRule::SymmetricPairwiseBernoulli { p })
            .autapses(false)
            .symmetric(true)
    }

    #[test]
    fn test_every_edge_has_its_reverse() {
        let net = LocalNetwork::single_process(3, 9, 30).unwrap();
        let syn = [SynSpec::new("gap_junction").weight(0.5)];
        let mut b = ConnBuilder::new(range(1, 30), range(1, 30), &spec(0.2), &syn, &net).unwrap();
        b.connect(&net).unwrap();
        let edges: HashSet<_> = net.connections().iter().map(|c| (c.source, c.target)).collect();
        assert!(!edges.is_empty());
        for &(s, t) in &edges {
            assert_ne!(s, t);
            assert!(edges.contains(&(t, s)), "missing reverse of {} -> {}", s, t);
        }
    }

    #[test]
    fn test_flag_requirements() {
        let net = LocalNetwork::single_process(1, 9, 30).unwrap();
        let bad = [
            spec(1.0),
            spec(0.1).autapses(true),
            spec(0.1).multapses(false),
            spec(0.1).symmetric(false),
        ];
        for conn in bad {
            assert!(matches!(
                ConnBuilder::new(range(1, 5), range(1, 5), &conn, &[], &net),
                Err(NestError::BadProperty(_))
            ));
        }
    }
}

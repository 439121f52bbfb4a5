use super::{parallel_region, BuilderCore, RuleStrategy};
use crate::network::Network;
use crate::parameter::ConnParameter;
use rand::Rng;
use rand_distr::{Distribution, Poisson};
use spikenet_core::{NestError, Result};

/// Independent coin flip per candidate pair with probability `p`
#[derive(Debug, Clone)]
pub struct PairwiseBernoulli {
    p: ConnParameter,
}

impl PairwiseBernoulli {
    pub fn new(p: ConnParameter) -> Result<Self> {
        if p.is_array() {
            return Err(NestError::BadProperty("p cannot be an array".into()));
        }
        p.validate()?;
        if let Some(v) = p.scalar() {
            if !(0.0..=1.0).contains(&v) {
                return Err(NestError::BadProperty(format!(
                    "connection probability must be in [0, 1], got {}",
                    v
                )));
            }
        }
        Ok(Self { p })
    }
}

impl RuleStrategy for PairwiseBernoulli {
    fn name(&self) -> &'static str {
        "pairwise_bernoulli"
    }

    fn connect_(&self, core: &BuilderCore, net: &dyn Network) -> Result<()> {
        parallel_region(net.topology().num_threads(), |tid| {
            let mut rng = net.rng().vp_specific(tid);
            let mut state = core.thread_state(tid);
            for target in core.targets().iter() {
                let target_ref = net.get_node_or_proxy(target, tid);
                if target_ref.is_proxy {
                    continue;
                }
                for source in core.sources().iter() {
                    if !core.allow_autapses() && source == target {
                        continue;
                    }
                    let p = self.p.value_double(&mut 0, &mut *rng, source, target)?;
                    if rng.gen::<f64>() >= p {
                        continue;
                    }
                    core.single_connect(net, &mut state, &mut rng, tid, source, &target_ref)?;
                }
            }
            Ok(())
        })
    }

    fn requires_proxies(&self) -> bool {
        false
    }
}

/// Poisson-distributed number of connections per candidate pair
#[derive(Debug, Clone)]
pub struct PairwisePoisson {
    mean: ConnParameter,
}

impl PairwisePoisson {
    pub fn new(core: &BuilderCore, mean: ConnParameter) -> Result<Self> {
        if !core.allow_multapses() {
            return Err(NestError::BadProperty(
                "multapses must be allowed for pairwise_poisson".into(),
            ));
        }
        if mean.is_array() {
            return Err(NestError::BadProperty(
                "pairwise_avg_num_conns cannot be an array".into(),
            ));
        }
        mean.validate()?;
        if let Some(v) = mean.scalar() {
            if v < 0.0 {
                return Err(NestError::BadProperty(format!(
                    "pairwise_avg_num_conns cannot be negative, got {}",
                    v
                )));
            }
        }
        Ok(Self { mean })
    }
}

impl RuleStrategy for PairwisePoisson {
    fn name(&self) -> &'static str {
        "pairwise_poisson"
    }

    fn connect_(&self, core: &BuilderCore, net: &dyn Network) -> Result<()> {
        parallel_region(net.topology().num_threads(), |tid| {
            let mut rng = net.rng().vp_specific(tid);
            let mut state = core.thread_state(tid);
            for target in core.targets().iter() {
                let target_ref = net.get_node_or_proxy(target, tid);
                if target_ref.is_proxy {
                    continue;
                }
                for source in core.sources().iter() {
                    if !core.allow_autapses() && source == target {
                        continue;
                    }
                    let mean = self.mean.value_double(&mut 0, &mut *rng, source, target)?;
                    let count = if mean == 0.0 {
                        0
                    } else {
                        Poisson::new(mean)
                            .map_err(|e| {
                                NestError::BadParameter(format!(
                                    "invalid pairwise_avg_num_conns {}: {}",
                                    mean, e
                                ))
                            })?
                            .sample(&mut *rng) as u64
                    };
                    for _ in 0..count {
                        core.single_connect(net, &mut state, &mut rng, tid, source, &target_ref)?;
                    }
                }
            }
            Ok(())
        })
    }

    fn requires_proxies(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use crate::builders::ConnBuilder;
    use crate::network::LocalNetwork;
    use crate::node_collection::NodeCollection;
    use crate::parameter::ConnParameter;
    use crate::spec::{ConnSpec, ConnectivityRule};
    use spikenet_core::NestError;
    use std::collections::HashSet;

    fn range(a: usize, b: usize) -> NodeCollection {
        NodeCollection::range(a, b).unwrap()
    }

    fn bernoulli(p: impl Into<ConnParameter>) -> ConnSpec {
        ConnSpec::new(ConnectivityRule::PairwiseBernoulli { p: p.into() })
    }

    #[test]
    fn test_extreme_probabilities() {
        let net = LocalNetwork::single_process(2, 4, 20).unwrap();
        let mut b = ConnBuilder::new(range(1, 4), range(5, 9), &bernoulli(1.0), &[], &net).unwrap();
        b.connect(&net).unwrap();
        assert_eq!(net.num_connections(), 20);

        let net = LocalNetwork::single_process(2, 4, 20).unwrap();
        let mut b = ConnBuilder::new(range(1, 4), range(5, 9), &bernoulli(0.0), &[], &net).unwrap();
        b.connect(&net).unwrap();
        assert_eq!(net.num_connections(), 0);
    }

    #[test]
    fn test_probability_range() {
        let net = LocalNetwork::single_process(1, 4, 20).unwrap();
        for p in [-0.1, 1.5] {
            assert!(matches!(
                ConnBuilder::new(range(1, 4), range(5, 9), &bernoulli(p), &[], &net),
                Err(NestError::BadProperty(_))
            ));
        }
    }

    #[test]
    fn test_no_autapses_or_multapses() {
        let net = LocalNetwork::single_process(3, 4, 20).unwrap();
        let spec = bernoulli(0.5).autapses(false);
        let mut b = ConnBuilder::new(range(1, 20), range(1, 20), &spec, &[], &net).unwrap();
        b.connect(&net).unwrap();
        let conns = net.connections();
        assert!(conns.iter().all(|c| c.source != c.target));
        let unique: HashSet<_> = conns.iter().map(|c| (c.source, c.target)).collect();
        assert_eq!(unique.len(), conns.len());
        assert!(conns.len() > 100 && conns.len() < 280);
    }

    #[test]
    fn test_pair_dependent_probability() {
        let net = LocalNetwork::single_process(2, 4, 20).unwrap();
        // only pairs with an even sum connect
        let p = ConnParameter::pair(|s, t| if (s + t) % 2 == 0 { 1.0 } else { 0.0 });
        let mut b = ConnBuilder::new(range(1, 4), range(5, 8), &bernoulli(p), &[], &net).unwrap();
        b.connect(&net).unwrap();
        assert_eq!(net.num_connections(), 8);
        assert!(net.connections().iter().all(|c| (c.source + c.target) % 2 == 0));
    }

    #[test]
    fn test_poisson() {
        let spec = |mean: f64| {
            ConnSpec::new(ConnectivityRule::PairwisePoisson {
                pairwise_avg_num_conns: mean.into(),
            })
        };
        let net = LocalNetwork::single_process(2, 4, 20).unwrap();
        assert!(matches!(
            ConnBuilder::new(range(1, 4), range(5, 8), &spec(1.0).multapses(false), &[], &net),
            Err(NestError::BadProperty(_))
        ));
        assert!(matches!(
            ConnBuilder::new(range(1, 4), range(5, 8), &spec(-1.0), &[], &net),
            Err(NestError::BadProperty(_))
        ));

        let mut b = ConnBuilder::new(range(1, 4), range(5, 8), &spec(0.0), &[], &net).unwrap();
        b.connect(&net).unwrap();
        assert_eq!(net.num_connections(), 0);

        let mut b = ConnBuilder::new(range(1, 10), range(11, 20), &spec(2.0), &[], &net).unwrap();
        b.connect(&net).unwrap();
        // mean 200 connections
        let n = net.num_connections();
        assert!(n > 140 && n < 260, "got {}", n);
    }
}

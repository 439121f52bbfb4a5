use super::{parallel_region, BuilderCore, RuleStrategy};
use crate::network::Network;
use spikenet_core::{NestError, Result};

/// Connects `sources[i] → targets[i]`
#[derive(Debug, Clone, Copy)]
pub struct OneToOne;

impl OneToOne {
    pub fn new(core: &BuilderCore) -> Result<Self> {
        if core.sources().len() != core.targets().len() {
            return Err(NestError::DimensionMismatch {
                expected: core.sources().len(),
                got: core.targets().len(),
            });
        }
        Ok(Self)
    }
}

impl RuleStrategy for OneToOne {
    fn name(&self) -> &'static str {
        "one_to_one"
    }

    fn connect_(&self, core: &BuilderCore, net: &dyn Network) -> Result<()> {
        parallel_region(net.topology().num_threads(), |tid| {
            let mut rng = net.rng().vp_specific(tid);
            let mut state = core.thread_state(tid);
            for (source, target) in core.sources().iter().zip(core.targets().iter()) {
                if !core.allow_autapses() && source == target {
                    core.skip_conn_parameter(&mut state, 1);
                    continue;
                }
                let target_ref = net.get_node_or_proxy(target, tid);
                if target_ref.is_proxy {
                    core.skip_conn_parameter(&mut state, 1);
                    continue;
                }
                core.single_connect(net, &mut state, &mut rng, tid, source, &target_ref)?;
            }
            Ok(())
        })
    }

    fn sp_connect_(&self, core: &BuilderCore, net: &dyn Network) -> Result<()> {
        parallel_region(net.topology().num_threads(), |tid| {
            let mut rng = net.rng().vp_specific(tid);
            let mut state = core.thread_state(tid);
            for (source, target) in core.sources().iter().zip(core.targets().iter()) {
                if !core.allow_autapses() && source == target {
                    core.skip_conn_parameter(&mut state, 1);
                    continue;
                }
                if !core.change_connected_synaptic_elements(net, source, target, tid, 1)? {
                    core.skip_conn_parameter(&mut state, 1);
                    continue;
                }
                let target_ref = net.get_node_or_proxy(target, tid);
                core.single_connect(net, &mut state, &mut rng, tid, source, &target_ref)?;
            }
            Ok(())
        })
    }

    fn disconnect_(&self, core: &BuilderCore, net: &dyn Network) -> Result<()> {
        parallel_region(net.topology().num_threads(), |tid| {
            for (source, target) in core.sources().iter().zip(core.targets().iter()) {
                let target_ref = net.get_node_or_proxy(target, tid);
                if !net.is_local_node(target) || target_ref.is_proxy {
                    continue;
                }
                core.single_disconnect(net, tid, source, &target_ref)?;
            }
            Ok(())
        })
    }

    fn sp_disconnect_(&self, core: &BuilderCore, net: &dyn Network) -> Result<()> {
        parallel_region(net.topology().num_threads(), |tid| {
            for (source, target) in core.sources().iter().zip(core.targets().iter()) {
                if !core.change_connected_synaptic_elements(net, source, target, tid, -1)? {
                    continue;
                }
                let target_ref = net.get_node_or_proxy(target, tid);
                core.single_disconnect(net, tid, source, &target_ref)?;
            }
            Ok(())
        })
    }

    fn supports_symmetric(&self) -> bool {
        true
    }

    fn is_symmetric(&self, core: &BuilderCore) -> bool {
        core.sources().same_nodes(core.targets()) && core.all_parameters_scalar()
    }

    fn requires_proxies(&self) -> bool {
        false
    }

    fn expected_array_len(&self, core: &BuilderCore, _net: &dyn Network) -> Option<usize> {
        Some(core.sources().len())
    }
}

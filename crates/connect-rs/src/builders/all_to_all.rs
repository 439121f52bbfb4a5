use super::{parallel_region, BuilderCore, RuleStrategy};
use crate::network::Network;
use spikenet_core::Result;

/// Connects every source to every target
#[derive(Debug, Clone, Copy)]
pub struct AllToAll;

impl RuleStrategy for AllToAll {
    fn name(&self) -> &'static str {
        "all_to_all"
    }

    fn connect_(&self, core: &BuilderCore, net: &dyn Network) -> Result<()> {
        let num_sources = core.sources().len();
        parallel_region(net.topology().num_threads(), |tid| {
            let mut rng = net.rng().vp_specific(tid);
            let mut state = core.thread_state(tid);
            for target in core.targets().iter() {
                let target_ref = net.get_node_or_proxy(target, tid);
                if target_ref.is_proxy {
                    core.skip_conn_parameter(&mut state, num_sources);
                    continue;
                }
                for source in core.sources().iter() {
                    if !core.allow_autapses() && source == target {
                        core.skip_conn_parameter(&mut state, 1);
                        continue;
                    }
                    core.single_connect(net, &mut state, &mut rng, tid, source, &target_ref)?;
                }
            }
            Ok(())
        })
    }

    fn sp_connect_(&self, core: &BuilderCore, net: &dyn Network) -> Result<()> {
        parallel_region(net.topology().num_threads(), |tid| {
            let mut rng = net.rng().vp_specific(tid);
            let mut state = core.thread_state(tid);
            for target in core.targets().iter() {
                for source in core.sources().iter() {
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
            }
            Ok(())
        })
    }

    fn disconnect_(&self, core: &BuilderCore, net: &dyn Network) -> Result<()> {
        parallel_region(net.topology().num_threads(), |tid| {
            for target in core.targets().iter() {
                let target_ref = net.get_node_or_proxy(target, tid);
                if !net.is_local_node(target) || target_ref.is_proxy {
                    continue;
                }
                for source in core.sources().iter() {
                    core.single_disconnect(net, tid, source, &target_ref)?;
                }
            }
            Ok(())
        })
    }

    fn sp_disconnect_(&self, core: &BuilderCore, net: &dyn Network) -> Result<()> {
        parallel_region(net.topology().num_threads(), |tid| {
            for target in core.targets().iter() {
                for source in core.sources().iter() {
                    if !core.change_connected_synaptic_elements(net, source, target, tid, -1)? {
                        continue;
                    }
                    let target_ref = net.get_node_or_proxy(target, tid);
                    core.single_disconnect(net, tid, source, &target_ref)?;
                }
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
        Some(core.sources().len() * core.targets().len())
    }
}

//! Scenario files for `spikenet connect`.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use spikenet_connect::{ConnSpec, NodeCollectionSpec, SynSpec};
use spikenet_core::{KernelConfig, NodeId};
use std::path::Path;

/// A network description: node count, devices and projections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub kernel: KernelConfig,
    pub num_nodes: usize,
    /// Nodes without proxies
    #[serde(default)]
    pub devices: Vec<NodeId>,
    pub projections: Vec<Projection>,
}

/// One `Connect` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Projection {
    pub sources: NodeCollectionSpec,
    pub targets: NodeCollectionSpec,
    pub conn_spec: ConnSpec,
    #[serde(default)]
    pub syn_spec: Vec<SynSpec>,
}

impl Scenario {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        let scenario: Scenario = serde_json::from_str(&text)
            .with_context(|| format!("parsing scenario {}", path.display()))?;
        scenario.kernel.validate()?;
        Ok(scenario)
    }
}

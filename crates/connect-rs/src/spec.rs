//! Connection and synapse specifications.

use crate::parameter::ConnParameter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Connectivity rule with its rule-specific parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ConnectivityRule {
    /// Pair sources and targets by position
    OneToOne,

    /// Every source to every target
    AllToAll,

    /// Each target draws `indegree` sources
    FixedIndegree { indegree: ConnParameter },

    /// Each source draws `outdegree` targets
    FixedOutdegree { outdegree: ConnParameter },

    /// Exactly `n` connections between the populations
    FixedTotalNumber { n: u64 },

    /// Independent coin flip per pair
    PairwiseBernoulli { p: ConnParameter },

    /// Poisson-distributed number of connections per pair
    PairwisePoisson { pairwise_avg_num_conns: ConnParameter },

    /// Undirected Bernoulli graph, both directions created at once
    SymmetricPairwiseBernoulli { p: f64 },
}

impl ConnectivityRule {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectivityRule::OneToOne => "one_to_one",
            ConnectivityRule::AllToAll => "all_to_all",
            ConnectivityRule::FixedIndegree { .. } => "fixed_indegree",
            ConnectivityRule::FixedOutdegree { .. } => "fixed_outdegree",
            ConnectivityRule::FixedTotalNumber { .. } => "fixed_total_number",
            ConnectivityRule::PairwiseBernoulli { .. } => "pairwise_bernoulli",
            ConnectivityRule::PairwisePoisson { .. } => "pairwise_poisson",
            ConnectivityRule::SymmetricPairwiseBernoulli { .. } => "symmetric_pairwise_bernoulli",
        }
    }

    /// Names of every rule, for listings
    pub fn all_names() -> &'static [&'static str] {
        &[
            "one_to_one",
            "all_to_all",
            "fixed_indegree",
            "fixed_outdegree",
            "fixed_total_number",
            "pairwise_bernoulli",
            "pairwise_poisson",
            "symmetric_pairwise_bernoulli",
        ]
    }
}

fn default_true() -> bool {
    true
}

/// Rule plus the policy flags shared by every rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnSpec {
    #[serde(flatten)]
    pub rule: ConnectivityRule,
    #[serde(default = "default_true")]
    pub allow_autapses: bool,
    #[serde(default = "default_true")]
    pub allow_multapses: bool,
    #[serde(default)]
    pub make_symmetric: bool,
}

impl ConnSpec {
    pub fn new(rule: ConnectivityRule) -> Self {
        Self {
            rule,
            allow_autapses: true,
            allow_multapses: true,
            make_symmetric: false,
        }
    }

    pub fn autapses(mut self, allow: bool) -> Self {
        self.allow_autapses = allow;
        self
    }

    pub fn multapses(mut self, allow: bool) -> Self {
        self.allow_multapses = allow;
        self
    }

    pub fn symmetric(mut self, make_symmetric: bool) -> Self {
        self.make_symmetric = make_symmetric;
        self
    }
}

fn default_synapse_model() -> String {
    "static_synapse".to_string()
}

/// One synapse model and its per-connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynSpec {
    #[serde(default = "default_synapse_model")]
    pub synapse_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<ConnParameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<ConnParameter>,
    /// Further model parameters, e.g. `receptor_type`
    #[serde(default)]
    pub params: BTreeMap<String, ConnParameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_synaptic_element: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_synaptic_element: Option<String>,
}

impl Default for SynSpec {
    fn default() -> Self {
        Self::new("static_synapse")
    }
}

impl SynSpec {
    pub fn new(model: &str) -> Self {
        Self {
            synapse_model: model.to_string(),
            weight: None,
            delay: None,
            params: BTreeMap::new(),
            pre_synaptic_element: None,
            post_synaptic_element: None,
        }
    }

    pub fn weight(mut self, w: impl Into<ConnParameter>) -> Self {
        self.weight = Some(w.into());
        self
    }

    pub fn delay(mut self, d: impl Into<ConnParameter>) -> Self {
        self.delay = Some(d.into());
        self
    }

    pub fn param(mut self, name: &str, value: impl Into<ConnParameter>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn synaptic_elements(mut self, pre: &str, post: &str) -> Self {
        self.pre_synaptic_element = Some(pre.to_string());
        self.post_synaptic_element = Some(post.to_string());
        self
    }
}

/// How the pool of third-factor candidates is chosen per target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    #[default]
    Random,
    Block,
}

fn default_pool_size() -> usize {
    1
}

/// Conditional third-factor connectivity for each primary connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThirdFactorSpec {
    /// Probability of wiring a third-factor node to a primary connection
    pub p: f64,
    #[serde(default)]
    pub pool_type: PoolType,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_spec_defaults() {
        let spec: ConnSpec = serde_json::from_str(r#"{"rule": "all_to_all"}"#).unwrap();
        assert!(spec.allow_autapses);
        assert!(spec.allow_multapses);
        assert!(!spec.make_symmetric);
        assert_eq!(spec.rule.name(), "all_to_all");
    }

    #[test]
    fn test_rule_parameters_from_json() {
        let spec: ConnSpec = serde_json::from_str(
            r#"{"rule": "fixed_indegree", "indegree": 3, "allow_autapses": false}"#,
        )
        .unwrap();
        assert!(matches!(
            spec.rule,
            ConnectivityRule::FixedIndegree { indegree: ConnParameter::ScalarInteger(3) }
        ));
        assert!(!spec.allow_autapses);

        let spec: ConnSpec =
            serde_json::from_str(r#"{"rule": "pairwise_bernoulli", "p": 0.1}"#).unwrap();
        assert_eq!(spec.rule.name(), "pairwise_bernoulli");
    }

    #[test]
    fn test_syn_spec_json() {
        let syn: SynSpec = serde_json::from_str(
            r#"{"weight": {"distribution": "uniform", "min": 0.5, "max": 1.5}, "delay": 2.0,
                "params": {"receptor_type": 1}}"#,
        )
        .unwrap();
        assert_eq!(syn.synapse_model, "static_synapse");
        assert!(syn.weight.is_some());
        assert!(syn.params.contains_key("receptor_type"));
    }

    #[test]
    fn test_third_factor_defaults() {
        let spec: ThirdFactorSpec = serde_json::from_str(r#"{"p": 0.5}"#).unwrap();
        assert_eq!(spec.pool_type, PoolType::Random);
        assert_eq!(spec.pool_size, 1);
    }
}

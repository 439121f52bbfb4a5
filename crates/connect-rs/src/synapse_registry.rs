//! Synapse models known to the builder.

use serde::{Deserialize, Serialize};
use spikenet_core::{NestError, ParamDict, ParamValue, Result, SynapseModelId};
use spikenet_exchange::MAX_SYN_ID;
use std::collections::HashMap;

/// A registered synapse model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynapseModel {
    pub name: String,
    /// Parameter values used when a connection does not set them
    pub defaults: ParamDict,
    /// Parameters that cannot be set per connection
    #[serde(default)]
    pub forbidden: Vec<String>,
    /// Model can only be used for symmetric connectivity
    #[serde(default)]
    pub requires_symmetric: bool,
}

impl SynapseModel {
    pub fn new(name: &str, defaults: &[(&str, f64)]) -> Self {
        Self {
            name: name.to_string(),
            defaults: defaults
                .iter()
                .map(|(k, v)| (k.to_string(), ParamValue::Double(*v)))
                .collect(),
            forbidden: Vec::new(),
            requires_symmetric: false,
        }
    }

    pub fn forbid(mut self, names: &[&str]) -> Self {
        self.forbidden = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn symmetric(mut self) -> Self {
        self.requires_symmetric = true;
        self
    }

    pub fn default_weight(&self) -> f64 {
        self.defaults.get("weight").map_or(1.0, ParamValue::as_f64)
    }

    pub fn default_delay(&self) -> f64 {
        self.defaults.get("delay").map_or(1.0, ParamValue::as_f64)
    }
}

/// Name → id lookup of synapse models
#[derive(Debug, Clone)]
pub struct SynapseRegistry {
    models: Vec<SynapseModel>,
    by_name: HashMap<String, SynapseModelId>,
}

impl Default for SynapseRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl SynapseRegistry {
    pub fn empty() -> Self {
        Self {
            models: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Registry holding the standard models
    pub fn with_builtins() -> Self {
        let mut reg = Self::empty();
        let builtins = [
            SynapseModel::new("static_synapse", &[("weight", 1.0), ("delay", 1.0)]),
            SynapseModel::new("static_synapse_hom_w", &[("weight", 1.0), ("delay", 1.0)])
                .forbid(&["weight"]),
            SynapseModel::new(
                "stdp_synapse",
                &[
                    ("weight", 1.0),
                    ("delay", 1.0),
                    ("tau_plus", 20.0),
                    ("lambda", 0.01),
                    ("alpha", 1.0),
                    ("mu_plus", 1.0),
                    ("mu_minus", 1.0),
                    ("Wmax", 100.0),
                ],
            ),
            SynapseModel::new(
                "tsodyks_synapse",
                &[
                    ("weight", 1.0),
                    ("delay", 1.0),
                    ("U", 0.5),
                    ("tau_rec", 800.0),
                    ("tau_fac", 0.0),
                ],
            ),
            SynapseModel::new(
                "bernoulli_synapse",
                &[("weight", 1.0), ("delay", 1.0), ("p_transmit", 1.0)],
            ),
            SynapseModel::new(
                "vogels_sprekeler_synapse",
                &[
                    ("weight", 0.5),
                    ("delay", 1.0),
                    ("tau", 20.0),
                    ("eta", 0.001),
                    ("alpha", 0.12),
                    ("Wmax", 1.0),
                ],
            ),
            SynapseModel::new("gap_junction", &[("weight", 1.0), ("delay", 1.0)])
                .forbid(&["delay"])
                .symmetric(),
        ];
        for model in builtins {
            // names are distinct and fewer than the id limit
            let _ = reg.register(model);
        }
        reg
    }

    /// Add a model and return its id
    pub fn register(&mut self, model: SynapseModel) -> Result<SynapseModelId> {
        if self.by_name.contains_key(&model.name) {
            return Err(NestError::BadProperty(format!(
                "synapse model {} already exists",
                model.name
            )));
        }
        if self.models.len() > MAX_SYN_ID as usize {
            return Err(NestError::BadProperty(format!(
                "at most {} synapse models can be registered",
                MAX_SYN_ID + 1
            )));
        }
        let id = self.models.len();
        self.by_name.insert(model.name.clone(), id);
        self.models.push(model);
        Ok(id)
    }

    pub fn id_of(&self, name: &str) -> Result<SynapseModelId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| NestError::UnknownSynapseType(name.to_string()))
    }

    pub fn get(&self, id: SynapseModelId) -> Result<&SynapseModel> {
        self.models
            .get(id)
            .ok_or_else(|| NestError::UnknownSynapseType(format!("id {}", id)))
    }

    /// Reject per-connection parameters the model does not allow
    pub fn check_synapse_params<'a>(
        &self,
        id: SynapseModelId,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        let model = self.get(id)?;
        for name in names {
            if model.forbidden.iter().any(|f| f == name) {
                return Err(NestError::BadProperty(format!(
                    "{} cannot be set per connection for {}",
                    name, model.name
                )));
            }
        }
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|m| m.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins() {
        let reg = SynapseRegistry::with_builtins();
        let id = reg.id_of("stdp_synapse").unwrap();
        assert_eq!(reg.get(id).unwrap().defaults["tau_plus"], ParamValue::Double(20.0));
        assert!(reg.get(reg.id_of("gap_junction").unwrap()).unwrap().requires_symmetric);
        assert!(matches!(
            reg.id_of("no_such_synapse"),
            Err(NestError::UnknownSynapseType(_))
        ));
    }

    #[test]
    fn test_hom_w_rejects_weight() {
        let reg = SynapseRegistry::with_builtins();
        let id = reg.id_of("static_synapse_hom_w").unwrap();
        assert!(reg.check_synapse_params(id, ["delay"]).is_ok());
        assert!(matches!(
            reg.check_synapse_params(id, ["weight"]),
            Err(NestError::BadProperty(_))
        ));
    }

    #[test]
    fn test_register_limits() {
        let mut reg = SynapseRegistry::empty();
        for i in 0..=MAX_SYN_ID {
            reg.register(SynapseModel::new(&format!("syn_{}", i), &[])).unwrap();
        }
        assert!(reg.register(SynapseModel::new("one_too_many", &[])).is_err());
        assert!(reg.register(SynapseModel::new("syn_0", &[])).is_err());
    }
}

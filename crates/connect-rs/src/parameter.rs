//! Per-connection value sources for weights, delays and other synapse
//! parameters.
//!
//! Array-valued parameters are read through an external cursor owned by the
//! thread that evaluates them. Every candidate pair a thread considers
//! either reads a value or skips one, so the cursor position only depends on
//! the rule's iteration order and never on which rank owns which target.

use rand::Rng;
use rand_distr::{Distribution, Exp, LogNormal, Normal};
use serde::{Deserialize, Serialize};
use spikenet_core::{NestError, NodeId, Result};
use std::fmt;
use std::sync::Arc;

/// Random distribution parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "distribution", rename_all = "snake_case")]
pub enum RandomParameter {
    /// Uniform on `[min, max)`
    Uniform { min: f64, max: f64 },
    /// Uniform integer on `[0, max)`
    UniformInt { max: u64 },
    Normal { mean: f64, std: f64 },
    Lognormal { mu: f64, sigma: f64 },
    /// Exponential with scale `beta`
    Exponential { beta: f64 },
    /// Normal redrawn until it falls into `[min, max)`
    ClippedNormal { mean: f64, std: f64, min: f64, max: f64 },
}

impl RandomParameter {
    pub fn validate(&self) -> Result<()> {
        match *self {
            RandomParameter::Uniform { min, max } if !(min < max) => Err(NestError::BadProperty(
                format!("uniform parameter needs min < max, got [{}, {})", min, max),
            )),
            RandomParameter::UniformInt { max: 0 } => Err(NestError::BadProperty(
                "uniform_int parameter needs max > 0".into(),
            )),
            RandomParameter::Normal { std, .. } | RandomParameter::ClippedNormal { std, .. }
                if !(std >= 0.0) =>
            {
                Err(NestError::BadProperty(format!("std must be non-negative, got {}", std)))
            }
            RandomParameter::ClippedNormal { min, max, .. } if !(min < max) => Err(
                NestError::BadProperty(format!("clipped normal needs min < max, got [{}, {})", min, max)),
            ),
            RandomParameter::Lognormal { sigma, .. } if !(sigma >= 0.0) => Err(
                NestError::BadProperty(format!("sigma must be non-negative, got {}", sigma)),
            ),
            RandomParameter::Exponential { beta } if !(beta > 0.0) => Err(NestError::BadProperty(
                format!("beta must be positive, got {}", beta),
            )),
            _ => Ok(()),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<f64> {
        let bad = |e: &dyn fmt::Display| NestError::BadParameter(e.to_string());
        Ok(match *self {
            RandomParameter::Uniform { min, max } => rng.gen_range(min..max),
            RandomParameter::UniformInt { max } => rng.gen_range(0..max) as f64,
            RandomParameter::Normal { mean, std } => {
                Normal::new(mean, std).map_err(|e| bad(&e))?.sample(rng)
            }
            RandomParameter::Lognormal { mu, sigma } => {
                LogNormal::new(mu, sigma).map_err(|e| bad(&e))?.sample(rng)
            }
            RandomParameter::Exponential { beta } => {
                Exp::new(1.0 / beta).map_err(|e| bad(&e))?.sample(rng)
            }
            RandomParameter::ClippedNormal { mean, std, min, max } => {
                let dist = Normal::new(mean, std).map_err(|e| bad(&e))?;
                loop {
                    let v = dist.sample(rng);
                    if min <= v && v < max {
                        break v;
                    }
                }
            }
        })
    }

    fn is_integral(&self) -> bool {
        matches!(self, RandomParameter::UniformInt { .. })
    }
}

/// Value depending on the (source, target) pair, e.g. a distance rule
#[derive(Clone)]
pub struct PairFn(Arc<dyn Fn(NodeId, NodeId) -> f64 + Send + Sync>);

impl PairFn {
    pub fn new(f: impl Fn(NodeId, NodeId) -> f64 + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for PairFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PairFn(..)")
    }
}

/// Source of one parameter's value for every connection a rule creates.
///
/// In JSON: a number, an array of numbers, or an object with a
/// `distribution` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnParameter {
    ScalarInteger(i64),
    ScalarDouble(f64),
    ArrayInteger(Vec<i64>),
    ArrayDouble(Vec<f64>),
    Random(RandomParameter),
    #[serde(skip)]
    Pair(PairFn),
}

impl ConnParameter {
    pub fn pair(f: impl Fn(NodeId, NodeId) -> f64 + Send + Sync + 'static) -> Self {
        ConnParameter::Pair(PairFn::new(f))
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ConnParameter::Random(r) => r.validate(),
            _ => Ok(()),
        }
    }

    /// Next value as a double, advancing the cursor for arrays
    pub fn value_double<R: Rng + ?Sized>(
        &self,
        cursor: &mut usize,
        rng: &mut R,
        source: NodeId,
        target: NodeId,
    ) -> Result<f64> {
        match self {
            ConnParameter::ScalarInteger(v) => Ok(*v as f64),
            ConnParameter::ScalarDouble(v) => Ok(*v),
            ConnParameter::ArrayInteger(vs) => Ok(next_element(vs, cursor)? as f64),
            ConnParameter::ArrayDouble(vs) => next_element(vs, cursor),
            ConnParameter::Random(r) => r.sample(rng),
            ConnParameter::Pair(f) => Ok((f.0)(source, target)),
        }
    }

    /// Next value as an integer. Doubles must be integral.
    pub fn value_int<R: Rng + ?Sized>(
        &self,
        cursor: &mut usize,
        rng: &mut R,
        source: NodeId,
        target: NodeId,
    ) -> Result<i64> {
        match self {
            ConnParameter::ScalarInteger(v) => Ok(*v),
            ConnParameter::ArrayInteger(vs) => next_element(vs, cursor),
            _ => {
                let v = self.value_double(cursor, rng, source, target)?;
                if v.fract() != 0.0 {
                    return Err(NestError::BadParameter(format!(
                        "expected an integer value, got {}",
                        v
                    )));
                }
                Ok(v as i64)
            }
        }
    }

    /// Advance an array cursor by `n` without reading. No-op for other kinds.
    pub fn skip(&self, cursor: &mut usize, n: usize) {
        if self.is_array() {
            *cursor += n;
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, ConnParameter::ArrayInteger(_) | ConnParameter::ArrayDouble(_))
    }

    /// Constant value shared by every connection
    pub fn is_scalar(&self) -> bool {
        matches!(self, ConnParameter::ScalarInteger(_) | ConnParameter::ScalarDouble(_))
    }

    /// True if every value this parameter yields is an integer
    pub fn provides_long(&self) -> bool {
        match self {
            ConnParameter::ScalarInteger(_) | ConnParameter::ArrayInteger(_) => true,
            ConnParameter::Random(r) => r.is_integral(),
            _ => false,
        }
    }

    /// Number of values for arrays
    pub fn number_of_values(&self) -> Option<usize> {
        match self {
            ConnParameter::ArrayInteger(vs) => Some(vs.len()),
            ConnParameter::ArrayDouble(vs) => Some(vs.len()),
            _ => None,
        }
    }

    /// The constant value, if scalar
    pub fn scalar(&self) -> Option<f64> {
        match self {
            ConnParameter::ScalarInteger(v) => Some(*v as f64),
            ConnParameter::ScalarDouble(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<f64> for ConnParameter {
    fn from(v: f64) -> Self {
        ConnParameter::ScalarDouble(v)
    }
}

impl From<i64> for ConnParameter {
    fn from(v: i64) -> Self {
        ConnParameter::ScalarInteger(v)
    }
}

impl From<Vec<f64>> for ConnParameter {
    fn from(v: Vec<f64>) -> Self {
        ConnParameter::ArrayDouble(v)
    }
}

impl From<RandomParameter> for ConnParameter {
    fn from(r: RandomParameter) -> Self {
        ConnParameter::Random(r)
    }
}

fn next_element<T: Copy>(values: &[T], cursor: &mut usize) -> Result<T> {
    let v = values.get(*cursor).copied().ok_or_else(|| {
        NestError::BadParameter(format!(
            "array parameter exhausted after {} values",
            values.len()
        ))
    })?;
    *cursor += 1;
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(1)
    }

    #[test]
    fn test_scalar_ignores_cursor() {
        let p = ConnParameter::from(2.5);
        let mut c = 0;
        assert_eq!(p.value_double(&mut c, &mut rng(), 1, 2).unwrap(), 2.5);
        p.skip(&mut c, 10);
        assert_eq!(c, 0);
        assert!(p.value_int(&mut c, &mut rng(), 1, 2).is_err());
        assert_eq!(ConnParameter::from(3.0).value_int(&mut c, &mut rng(), 1, 2).unwrap(), 3);
    }

    #[test]
    fn test_array_cursor_and_exhaustion() {
        let p = ConnParameter::ArrayInteger(vec![4, 5, 6]);
        let mut c = 0;
        assert_eq!(p.value_int(&mut c, &mut rng(), 1, 1).unwrap(), 4);
        p.skip(&mut c, 1);
        assert_eq!(p.value_double(&mut c, &mut rng(), 1, 1).unwrap(), 6.0);
        assert!(p.value_int(&mut c, &mut rng(), 1, 1).is_err());
        assert!(p.provides_long());
        assert_eq!(p.number_of_values(), Some(3));
    }

    #[test]
    fn test_pair_parameter() {
        let p = ConnParameter::pair(|s, t| (t as f64 - s as f64).abs());
        let mut c = 0;
        assert_eq!(p.value_double(&mut c, &mut rng(), 3, 10).unwrap(), 7.0);
        assert!(!p.is_array() && !p.is_scalar());
    }

    #[test]
    fn test_random_validation_and_range() {
        assert!(RandomParameter::Uniform { min: 1.0, max: 1.0 }.validate().is_err());
        assert!(RandomParameter::Normal { mean: 0.0, std: -1.0 }.validate().is_err());
        assert!(RandomParameter::Exponential { beta: 0.0 }.validate().is_err());
        let p = ConnParameter::Random(RandomParameter::ClippedNormal {
            mean: 0.0,
            std: 1.0,
            min: -0.5,
            max: 0.5,
        });
        let mut r = rng();
        let mut c = 0;
        for _ in 0..100 {
            let v = p.value_double(&mut c, &mut r, 1, 2).unwrap();
            assert!((-0.5..0.5).contains(&v));
        }
    }

    #[test]
    fn test_json_forms() {
        let p: ConnParameter = serde_json::from_str("2").unwrap();
        assert!(matches!(p, ConnParameter::ScalarInteger(2)));
        let p: ConnParameter = serde_json::from_str("2.5").unwrap();
        assert!(matches!(p, ConnParameter::ScalarDouble(_)));
        let p: ConnParameter = serde_json::from_str("[1.5, 2]").unwrap();
        assert!(p.is_array());
        let p: ConnParameter =
            serde_json::from_str(r#"{"distribution": "normal", "mean": 1.0, "std": 0.1}"#).unwrap();
        assert!(matches!(p, ConnParameter::Random(RandomParameter::Normal { .. })));
    }

    proptest! {
        /// Reading or skipping gives the same stream position either way
        #[test]
        fn prop_skip_keeps_alignment(
            values in prop::collection::vec(-100.0f64..100.0, 1..40),
            skips in prop::collection::vec(any::<bool>(), 1..40),
        ) {
            let p = ConnParameter::ArrayDouble(values.clone());
            let mut c = 0;
            let mut r = rng();
            for (i, skip) in skips.iter().take(values.len()).enumerate() {
                if *skip {
                    p.skip(&mut c, 1);
                } else {
                    prop_assert_eq!(p.value_double(&mut c, &mut r, 1, 1).unwrap(), values[i]);
                }
                prop_assert_eq!(c, i + 1);
            }
        }
    }
}

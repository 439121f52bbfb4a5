//! Kernel configuration, loaded from JSON.

use crate::{NestError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Largest thread index that can appear in a packed spike record.
/// Values 1022 and 1023 of the 10-bit field are reserved as markers.
pub const MAX_THREADS: usize = 1022;

/// Largest number of lags a packed spike record can address (6 bits)
pub const MAX_LAGS: usize = 64;

/// Simulation kernel parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Threads per rank
    pub local_num_threads: usize,
    /// Master seed for every random stream
    pub rng_seed: u64,
    /// Steps per communication interval (number of lags)
    pub min_delay_steps: usize,
    pub communication: CommunicationConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            local_num_threads: 1,
            rng_seed: 12345,
            min_delay_steps: 10,
            communication: CommunicationConfig::default(),
        }
    }
}

/// Buffer sizes used by the collective layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunicationConfig {
    /// Initial per-rank slot of the fixed-size all-gather, in elements
    pub send_buffer_size: usize,
    /// Spike records per all-to-all round (whole send buffer)
    pub buffer_size_spike_data: usize,
    /// Target records per all-to-all round (whole send buffer)
    pub buffer_size_target_data: usize,
    pub adaptive_spike_buffers: bool,
    pub adaptive_target_buffers: bool,
    pub growth_factor_buffer_spike_data: f64,
    pub growth_factor_buffer_target_data: f64,
    pub shrink_factor_buffer_spike_data: f64,
    pub max_buffer_size_spike_data: usize,
    pub max_buffer_size_target_data: usize,
}

impl Default for CommunicationConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: 128,
            buffer_size_spike_data: 2,
            buffer_size_target_data: 2,
            adaptive_spike_buffers: true,
            adaptive_target_buffers: true,
            growth_factor_buffer_spike_data: 1.5,
            growth_factor_buffer_target_data: 1.5,
            shrink_factor_buffer_spike_data: 0.8,
            max_buffer_size_spike_data: 8_388_608,
            max_buffer_size_target_data: 16_777_216,
        }
    }
}

impl KernelConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: KernelConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_num_threads == 0 || self.local_num_threads >= MAX_THREADS {
            return Err(NestError::Config(format!(
                "local_num_threads must lie in 1..{}, got {}",
                MAX_THREADS, self.local_num_threads
            )));
        }
        if self.min_delay_steps == 0 || self.min_delay_steps > MAX_LAGS {
            return Err(NestError::Config(format!(
                "min_delay_steps must lie in 1..={}, got {}",
                MAX_LAGS, self.min_delay_steps
            )));
        }
        self.communication.validate()
    }
}

impl CommunicationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.send_buffer_size < 2 {
            return Err(NestError::Config("send_buffer_size must be at least 2".into()));
        }
        if self.buffer_size_spike_data == 0 || self.buffer_size_target_data == 0 {
            return Err(NestError::Config("exchange buffer sizes must be positive".into()));
        }
        if self.growth_factor_buffer_spike_data <= 1.0
            || self.growth_factor_buffer_target_data <= 1.0
        {
            return Err(NestError::Config("buffer growth factors must exceed 1".into()));
        }
        if !(self.shrink_factor_buffer_spike_data > 0.0
            && self.shrink_factor_buffer_spike_data <= 1.0)
        {
            return Err(NestError::Config(
                "shrink_factor_buffer_spike_data must lie in (0, 1]".into(),
            ));
        }
        if self.max_buffer_size_spike_data < self.buffer_size_spike_data
            || self.max_buffer_size_target_data < self.buffer_size_target_data
        {
            return Err(NestError::Config(
                "maximum buffer sizes must not be below the initial sizes".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(KernelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = KernelConfig::from_json_str(
            r#"{ "local_num_threads": 4, "communication": { "buffer_size_spike_data": 64 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.local_num_threads, 4);
        assert_eq!(cfg.rng_seed, 12345);
        assert_eq!(cfg.communication.buffer_size_spike_data, 64);
        assert_eq!(cfg.communication.send_buffer_size, 128);
    }

    #[test]
    fn test_thread_limit_enforced() {
        let cfg = KernelConfig {
            local_num_threads: MAX_THREADS,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(NestError::Config(_))));
    }

    #[test]
    fn test_bad_growth_factor() {
        let mut cfg = KernelConfig::default();
        cfg.communication.growth_factor_buffer_spike_data = 1.0;
        assert!(cfg.validate().is_err());
    }
}

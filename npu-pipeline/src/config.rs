// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Pipeline tunables.
//!
//! Values come from, in increasing priority: the defaults below, an
//! optional TOML file and environment variables prefixed with `NPU_`.
//! Nested values use a double underscore, for example
//! `NPU_ACCELERATOR__INFERENCE_TICKS=12`.

use std::error::Error;
use std::fmt;
use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::framing::command::FirmwareVersion;

/// Smallest and largest number of parallel result slots.
pub const RESULT_SLOTS_RANGE: std::ops::RangeInclusive<usize> = 2..=10;

/// Size of the area reserved for debug checkpoint dumps.
pub const CHECKPOINT_AREA_SIZE: usize = 8 * 1024 * 1024;

/// Identity reported by the system info commands.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareIdentity {
    pub kn_number: u32,
    pub major: u8,
    pub minor: u8,
    pub update: u8,
    pub build: u32,
    pub product_id: u32,
    pub target_chip: u32,
}

impl Default for FirmwareIdentity {
    fn default() -> Self {
        Self {
            kn_number: 0x1A2B_3C4D,
            major: 2,
            minor: 2,
            update: 0,
            build: 1000,
            product_id: 0x100,
            target_chip: 1,
        }
    }
}

impl FirmwareIdentity {
    #[must_use]
    pub fn version(&self) -> FirmwareVersion {
        FirmwareVersion {
            reserved: 0,
            major: self.major,
            minor: self.minor,
            update: self.update,
            build: self.build,
        }
    }
}

/// Timing of the simulated accelerator, in ticks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorConfig {
    /// From trigger until the input image has been consumed.
    pub inference_ticks: u64,

    /// From the end of inference until the result is complete.
    pub postprocess_ticks: u64,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            inference_ticks: 10,
            postprocess_ticks: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Size of the buffer used to receive messages before the queues are
    /// configured.
    pub scratch_buffer_size: usize,

    /// Number of parallel inferences in flight at once.
    pub result_slots: usize,

    /// How long the result handler waits on a slot before counting a
    /// missed completion.
    pub result_timeout_ticks: u64,

    /// Consecutive missed completions, with work outstanding, that fail a
    /// slot.
    pub timeout_strikes: u32,

    /// How long a command waits for the data that follows it.
    pub command_data_timeout_ticks: u64,

    /// How long a model load waits for the model data.
    pub model_data_timeout_ticks: u64,

    /// Dispatch through the result slots rather than waiting for each run.
    pub parallel: bool,

    pub firmware: FirmwareIdentity,

    pub accelerator: AcceleratorConfig,

    /// Largest bulk transfer the host sends; longer messages are split.
    pub host_chunk_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scratch_buffer_size: 64 * 1024,
            result_slots: 5,
            result_timeout_ticks: 2000,
            timeout_strikes: 2,
            command_data_timeout_ticks: 2000,
            model_data_timeout_ticks: 20_000,
            parallel: true,
            firmware: FirmwareIdentity::default(),
            accelerator: AcceleratorConfig::default(),
            host_chunk_size: 64 * 1024,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    /// A source could not be read or did not match the expected shape.
    Source(Box<figment::Error>),

    /// A value is outside its allowed range.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Source(e) => write!(f, "configuration error: {e}"),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Source(Box::new(e))
    }
}

impl PipelineConfig {
    /// The layered configuration sources, ready for further merging.
    #[must_use]
    pub fn figment(conf_file: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(PipelineConfig::default()));
        if let Some(path) = conf_file {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("NPU_").split("__"))
    }

    pub fn load(conf_file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::from_figment(&Self::figment(conf_file))
    }

    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        let config: PipelineConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !RESULT_SLOTS_RANGE.contains(&self.result_slots) {
            return Err(ConfigError::Invalid(format!(
                "result_slots must be in {RESULT_SLOTS_RANGE:?}, got {}",
                self.result_slots
            )));
        }
        if self.timeout_strikes == 0 {
            return Err(ConfigError::Invalid(
                "timeout_strikes must be at least 1".to_string(),
            ));
        }
        if self.scratch_buffer_size < crate::framing::inference::RESULT_HEADER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "scratch_buffer_size of {} bytes is too small",
                self.scratch_buffer_size
            )));
        }
        if self.host_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "host_chunk_size must not be zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.result_slots, 5);
        assert_eq!(config.result_timeout_ticks, 2000);
        assert_eq!(config.timeout_strikes, 2);
    }

    #[test]
    fn ring_size_is_bounded() {
        let config = PipelineConfig {
            result_slots: 11,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}

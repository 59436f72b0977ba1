use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tally_aggregate::AggregateProcessorConfig;

use crate::error::CliError;

/// Top-level configuration for the Tally CLI, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct TallyConfig {
    /// The aggregate processor to run.
    pub processor: AggregateProcessorConfig,
    /// Background conclusion settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Number of input events handed to the processor at once.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Configuration for the background conclusion scheduler.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// How often due groups are concluded.
    #[serde(default = "default_conclude_interval_ms")]
    pub conclude_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            conclude_interval_ms: default_conclude_interval_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn conclude_interval(&self) -> Duration {
        Duration::from_millis(self.conclude_interval_ms)
    }
}

fn default_batch_size() -> usize {
    100
}

fn default_conclude_interval_ms() -> u64 {
    1000
}

impl TallyConfig {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CliError> {
        if self.batch_size == 0 {
            return Err(CliError::Config("batch_size must be greater than 0".into()));
        }
        if self.scheduler.conclude_interval_ms == 0 {
            return Err(CliError::Config(
                "scheduler.conclude_interval_ms must be greater than 0".into(),
            ));
        }
        self.processor.validate().map_err(CliError::Config)
    }
}

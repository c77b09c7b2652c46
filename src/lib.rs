use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};

pub mod cli;
pub mod configs;
pub mod datasets;
pub mod distribute;
pub mod driver;
pub mod metrics;
pub mod models;
pub mod nn;
pub mod optim;
pub mod schedule;
pub mod trainer;

pub use configs::{ConfigError, TrainConfig, TrainMode};
pub use metrics::EpochMetrics;
pub use trainer::Trainer;

/// Anything that can be written to and read back from a RON string
pub trait Config: Send + Sync {
    fn config(&self) -> Result<String>;
    fn load_config(&mut self, config: &str) -> Result<()>;
}

impl<T: Serialize + DeserializeOwned + Send + Sync> Config for T {
    fn config(&self) -> Result<String> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default()).context("Failed to serialize config")
    }
    fn load_config(&mut self, config: &str) -> Result<()> {
        *self = ron::from_str(config).context(format!("Failed to load config {}", config))?;
        Ok(())
    }
}

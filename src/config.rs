//! Process configuration: serial link, polling cadence and the
//! controller's start mode, loaded from a YAML file.

use crate::controller::HeatPumpConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Invalid(#[from] crate::error::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub serial: SerialConfig,
    #[serde(default)]
    pub poll: PollConfig,
    pub controller: ControllerSection,
    /// Directory for the degree-minutes evaluation log.
    #[serde(default = "default_dm_log_dir")]
    pub dm_log_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerialConfig {
    /// Serial port device, e.g. `/dev/ttyUSB0`.
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PollConfig {
    /// Scheduler tick period.
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    /// Controller tick period.
    #[serde(with = "humantime_serde")]
    pub controller_period: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            controller_period: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerSection {
    /// Poll and cache values but never drive the plant.
    #[serde(default)]
    pub disabled: bool,
    /// Mode the controller starts in.
    pub start: HeatPumpConfig,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_dm_log_dir() -> PathBuf {
    PathBuf::from("/var/log/nibehpc")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.controller.start.validate()?;
        Ok(config)
    }
}

//! Engine configuration: timeouts, cache tiers, interception points.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mitmlearn_alphabet::{AlphabetError, InputSymbol};
use mitmlearn_explore::{DriverConfig, EncoderConfig};
use mitmlearn_fuzz::registry;
use mitmlearn_transport::HubConfig;
use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::limits::ResourceLimits;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config read error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No interception points configured")]
    NoInterceptionPoints,

    #[error("Interception point '{point}': unknown parser '{name}'")]
    UnknownParser { point: String, name: String },

    #[error("Interception point '{point}': unknown fuzzer '{name}'")]
    UnknownFuzzer { point: String, name: String },

    #[error("Timeout '{0}' must be positive")]
    InvalidTimeout(&'static str),

    #[error("Invalid preseed symbol: {0}")]
    Preseed(#[from] AlphabetError),
}

/// Parser and fuzzer names for one interception point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterceptionPointConfig {
    pub parser: String,
    pub fuzzer: String,
}

impl Default for InterceptionPointConfig {
    fn default() -> Self {
        Self {
            parser: "json".into(),
            fuzzer: "simple".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-listen timeout of a live session (seconds).
    pub mitm_timeout_secs: f64,
    /// Per-listen timeout once a session stopped producing traffic (seconds).
    pub noflow_timeout_secs: f64,
    /// Stop sessions at the first absorbing output and answer from the
    /// fast-path cache.
    pub early_termination: bool,
    /// Reuse answers of queries with an equal fuzz digest.
    pub plaid: bool,
    /// Input symbols run before every query.
    pub preseed: Vec<String>,
    pub enable_preseed: bool,
    /// Map abstraction keys to numeric output symbols.
    pub symbol_ids: bool,
    pub learner_port: u16,
    /// Port the proxy addon connects to with intercepted messages.
    pub hook_port: u16,
    pub log_dir: PathBuf,
    pub interception_points: BTreeMap<String, InterceptionPointConfig>,
    pub resource_limits: ResourceLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mitm_timeout_secs: 2.0,
            noflow_timeout_secs: 4.0,
            early_termination: false,
            plaid: false,
            preseed: Vec::new(),
            enable_preseed: false,
            symbol_ids: true,
            learner_port: 8888,
            hook_port: 8889,
            log_dir: PathBuf::from("logs"),
            interception_points: BTreeMap::new(),
            resource_limits: ResourceLimits::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interception_points.is_empty() {
            return Err(ConfigError::NoInterceptionPoints);
        }
        for (point, names) in &self.interception_points {
            registry::parser(&names.parser).map_err(|_| ConfigError::UnknownParser {
                point: point.clone(),
                name: names.parser.clone(),
            })?;
            registry::fuzzer(&names.fuzzer).map_err(|_| ConfigError::UnknownFuzzer {
                point: point.clone(),
                name: names.fuzzer.clone(),
            })?;
        }
        if !(self.mitm_timeout_secs > 0.0) {
            return Err(ConfigError::InvalidTimeout("mitm_timeout_secs"));
        }
        if !(self.noflow_timeout_secs > 0.0) {
            return Err(ConfigError::InvalidTimeout("noflow_timeout_secs"));
        }
        self.preseed_symbols()?;
        Ok(())
    }

    /// Preseed symbols in effect, empty when preseeding is disabled.
    pub fn preseed_symbols(&self) -> Result<Vec<InputSymbol>, ConfigError> {
        if !self.enable_preseed {
            return Ok(Vec::new());
        }
        let symbols = self
            .preseed
            .iter()
            .map(|s| s.parse::<InputSymbol>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(symbols)
    }

    pub fn mitm_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.mitm_timeout_secs)
    }

    pub fn noflow_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.noflow_timeout_secs)
    }

    pub fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig {
            mitm_timeout: self.mitm_timeout(),
            noflow_timeout: self.noflow_timeout(),
            early_termination: self.early_termination,
        }
    }

    pub fn driver_config(&self) -> Result<DriverConfig, ConfigError> {
        Ok(DriverConfig {
            early_termination: self.early_termination,
            preseed: self.preseed_symbols()?,
        })
    }

    /// The correlator gate is held no longer than a dead session takes to
    /// time out.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            gate_timeout_secs: self.noflow_timeout_secs,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            fast_path: self.early_termination,
            plaid: self.plaid,
        }
    }
}

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::orchestration::controller::{
    ControllerConfig, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_MAX_ITERATIONS,
};
use crate::orchestration::ledger::DEFAULT_COMMITMENT_THRESHOLDS;
use crate::orchestration::panel::DecisionPanel;
use crate::orchestration::spiral::SpiralDetector;
use crate::{Error, Result};

/// Name of the per-project config file inside a tasks directory.
pub const CONFIG_FILE_NAME: &str = "keel.toml";

fn default_total_budget() -> f64 {
    100.0
}

fn default_base_unit() -> f64 {
    10.0
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_confidence_threshold() -> f64 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

fn default_iteration_timeout_secs() -> u64 {
    600
}

fn default_parallelism() -> usize {
    1
}

fn default_commitment_thresholds() -> Vec<f64> {
    DEFAULT_COMMITMENT_THRESHOLDS.to_vec()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_total_budget")]
    pub total_budget: f64,
    #[serde(default = "default_base_unit")]
    pub base_unit: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_iteration_timeout_secs")]
    pub iteration_timeout_secs: u64,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_commitment_thresholds")]
    pub commitment_thresholds: Vec<f64>,
    /// Where checkpoints are written. Defaults to `~/.keel/sessions`.
    pub state_dir: Option<String>,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub spiral: SpiralDetector,
    #[serde(default)]
    pub panel: DecisionPanel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Command line run once per iteration.
    #[serde(default)]
    pub command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            total_budget: default_total_budget(),
            base_unit: default_base_unit(),
            max_iterations: default_max_iterations(),
            confidence_threshold: default_confidence_threshold(),
            iteration_timeout_secs: default_iteration_timeout_secs(),
            parallelism: default_parallelism(),
            commitment_thresholds: default_commitment_thresholds(),
            state_dir: None,
            executor: ExecutorConfig::default(),
            spiral: SpiralDetector::default(),
            panel: DecisionPanel::default(),
        }
    }
}

impl Config {
    pub fn keel_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".keel"))
    }

    pub fn global_config_path() -> Result<PathBuf> {
        Ok(Self::keel_dir()?.join(CONFIG_FILE_NAME))
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::keel_dir()?.join("sessions")),
        }
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            max_iterations: self.max_iterations,
            confidence_threshold: self.confidence_threshold,
            iteration_timeout: self.iteration_timeout(),
        }
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        let config: Self = toml::from_str(&fs::read_to_string(path)?)
            .map_err(|e| Error::InvalidInput(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config for a tasks directory.
    ///
    /// An explicit path wins, then `<tasks_dir>/keel.toml`, then
    /// `~/.keel/keel.toml`, then defaults.
    pub fn load_for(tasks_dir: &Path, explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let local = tasks_dir.join(CONFIG_FILE_NAME);
        if local.exists() {
            return Self::load(&local);
        }
        match Self::global_config_path() {
            Ok(global) if global.exists() => Self::load(&global),
            _ => {
                debug!("no config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.total_budget.is_finite() && self.total_budget > 0.0) {
            return Err(Error::InvalidInput(format!(
                "total_budget must be positive, got {}",
                self.total_budget
            )));
        }
        if !(self.base_unit.is_finite() && self.base_unit > 0.0) {
            return Err(Error::InvalidInput(format!(
                "base_unit must be positive, got {}",
                self.base_unit
            )));
        }
        if self.max_iterations == 0 {
            return Err(Error::InvalidInput(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if !(self.confidence_threshold > 0.0 && self.confidence_threshold <= 1.0) {
            return Err(Error::InvalidInput(format!(
                "confidence_threshold must be in (0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.parallelism == 0 {
            return Err(Error::InvalidInput(
                "parallelism must be at least 1".to_string(),
            ));
        }
        if self.iteration_timeout_secs == 0 {
            return Err(Error::InvalidInput(
                "iteration_timeout_secs must be at least 1".to_string(),
            ));
        }
        if let Some(bad) = self
            .commitment_thresholds
            .iter()
            .find(|t| !(**t > 0.0 && **t <= 1.0))
        {
            return Err(Error::InvalidInput(format!(
                "commitment threshold {} is outside (0, 1]",
                bad
            )));
        }
        self.validate_tuning()
    }

    fn validate_tuning(&self) -> Result<()> {
        let spiral = &self.spiral;
        if !(spiral.thrash_factor.is_finite() && spiral.thrash_factor > 0.0) {
            return Err(Error::InvalidInput(format!(
                "spiral.thrash_factor must be positive, got {}",
                spiral.thrash_factor
            )));
        }
        if spiral.oscillation_overlap == 0 {
            return Err(Error::InvalidInput(
                "spiral.oscillation_overlap must be at least 1".to_string(),
            ));
        }
        if !(spiral.min_progress.is_finite() && spiral.min_progress >= 0.0) {
            return Err(Error::InvalidInput(format!(
                "spiral.min_progress must be non-negative, got {}",
                spiral.min_progress
            )));
        }
        if let Some(bad) = self.panel.weights.iter().find(|w| !(w.is_finite() && **w >= 0.0)) {
            return Err(Error::InvalidInput(format!(
                "panel weight {} must be non-negative",
                bad
            )));
        }
        if !(self.panel.quorum.is_finite() && self.panel.quorum > 0.0) {
            return Err(Error::InvalidInput(format!(
                "panel.quorum must be positive, got {}",
                self.panel.quorum
            )));
        }
        Ok(())
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

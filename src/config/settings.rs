use super::ConfigError;
use crate::orchestration::context_loader::BudgetOverrides;
use crate::orchestration::gateway::WorkerCapability;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

fn default_max_cycles() -> u32 {
    256
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub step_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_remediation_loops: Option<u32>,
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            step_timeout_seconds: None,
            max_remediation_loops: None,
            max_cycles: default_max_cycles(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub state_root: PathBuf,
    #[serde(default)]
    pub protocols_dir: Option<PathBuf>,
    #[serde(default)]
    pub budgets: BudgetOverrides,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub workers: BTreeMap<WorkerCapability, WorkerCommandConfig>,
}

impl EngineSettings {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
            protocols_dir: None,
            budgets: BudgetOverrides::default(),
            limits: LimitsConfig::default(),
            workers: BTreeMap::new(),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let settings: Self = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_root.as_os_str().is_empty() {
            return Err(ConfigError::Settings(
                "`state_root` must be non-empty".to_string(),
            ));
        }
        self.budgets.validate().map_err(ConfigError::Settings)?;
        if self.limits.max_cycles == 0 {
            return Err(ConfigError::Settings(
                "`limits.max_cycles` must be >= 1".to_string(),
            ));
        }
        if self.limits.step_timeout_seconds == Some(0) {
            return Err(ConfigError::Settings(
                "`limits.step_timeout_seconds` must be >= 1".to_string(),
            ));
        }
        if self.limits.max_remediation_loops == Some(0) {
            return Err(ConfigError::Settings(
                "`limits.max_remediation_loops` must be >= 1".to_string(),
            ));
        }
        for (capability, worker) in &self.workers {
            if worker.command.trim().is_empty() {
                return Err(ConfigError::Settings(format!(
                    "worker `{capability}` requires non-empty `command`"
                )));
            }
        }
        Ok(())
    }
}

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestration::TieBreak;
use crate::{clog_debug, Error, Result};

pub const DEFAULT_MAX_ITERATIONS: u32 = 50;
pub const DEFAULT_EXECUTOR_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_SWARM_THRESHOLD: u32 = 3;

const CONFIG_FILE: &str = "cadence.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Approve approval requests without asking.
    pub trust: bool,
    pub worker_count: usize,
    pub max_iterations: u32,
    pub executor_command: Option<String>,
    pub executor_timeout_secs: u64,
    /// Per-gate timeout overrides in seconds, keyed by gate name.
    pub gate_timeouts: BTreeMap<String, u64>,
    /// Blocking gates demoted to report-only for this project.
    pub advisory_overrides: BTreeSet<String>,
    pub profile: Option<String>,
    pub swarm_threshold: u32,
    pub tie_break: TieBreak,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trust: false,
            worker_count: 1,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            executor_command: None,
            executor_timeout_secs: DEFAULT_EXECUTOR_TIMEOUT_SECS,
            gate_timeouts: BTreeMap::new(),
            advisory_overrides: BTreeSet::new(),
            profile: None,
            swarm_threshold: DEFAULT_SWARM_THRESHOLD,
            tie_break: TieBreak::default(),
        }
    }
}

impl Config {
    pub fn home_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".cadence"))
    }

    /// Project-local state directory.
    pub fn project_dir(root: &Path) -> PathBuf {
        root.join(".cadence")
    }

    pub fn project_config_path(root: &Path) -> PathBuf {
        Self::project_dir(root).join(CONFIG_FILE)
    }

    pub fn effective_command(&self) -> &str {
        self.executor_command.as_deref().unwrap_or("claude -p")
    }

    pub fn executor_timeout(&self) -> Duration {
        Duration::from_secs(self.executor_timeout_secs)
    }

    /// Load the project config, then the user config, then defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let project = Self::project_config_path(root);
        if project.exists() {
            return Self::load_from(&project);
        }
        if let Ok(home) = Self::home_dir() {
            let user = home.join(CONFIG_FILE);
            if user.exists() {
                return Self::load_from(&user);
            }
        }
        clog_debug!("Config file not found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        clog_debug!(
            "Config loaded: trust={}, workers={}, max_iterations={}, command={:?}",
            config.trust,
            config.worker_count,
            config.max_iterations,
            config.executor_command
        );
        Ok(config)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let dir = Self::project_dir(root);
        if !dir.exists() {
            clog_debug!("Creating project directory: {}", dir.display());
            fs::create_dir_all(&dir)?;
        }
        let path = Self::project_config_path(root);
        fs::write(&path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::Validation(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.executor_timeout_secs == 0 {
            return Err(Error::Validation(
                "executor_timeout_secs must be at least 1".to_string(),
            ));
        }
        if let Some((name, _)) = self.gate_timeouts.iter().find(|(_, secs)| **secs == 0) {
            return Err(Error::Validation(format!(
                "gate timeout for '{}' must be at least 1 second",
                name
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

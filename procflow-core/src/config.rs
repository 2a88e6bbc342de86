use crate::auth::TaskAccessRule;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_MAX_STEPS: &str = "PROCFLOW_MAX_STEPS";
pub const ENV_COMPACTION_INTERVAL_MS: &str = "PROCFLOW_COMPACTION_INTERVAL_MS";
pub const ENV_SYSTEM_ACTOR: &str = "PROCFLOW_SYSTEM_ACTOR";
pub const ENV_DEFINITIONS_DIR: &str = "PROCFLOW_DEFINITIONS_DIR";

/// Engine configuration. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on nodes visited by one advancement step.
    pub max_steps_per_advance: usize,
    pub compaction_interval_ms: u64,
    /// Actor recorded for trigger-driven steps.
    pub system_actor: String,
    pub definitions_dir: Option<PathBuf>,
    pub task_access: Vec<TaskAccessRule>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_advance: 10_000,
            compaction_interval_ms: 60_000,
            system_actor: "system".to_string(),
            definitions_dir: None,
            task_access: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).context("Failed to parse engine config")
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config: {}", path.display()))?;
        let config = Self::from_yaml_str(&content)?;
        tracing::info!(
            path = %path.display(),
            rules = config.task_access.len(),
            "Loaded engine config"
        );
        Ok(config)
    }

    /// Optional file, then `PROCFLOW_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup(ENV_MAX_STEPS) {
            self.max_steps_per_advance = v
                .parse()
                .with_context(|| format!("{ENV_MAX_STEPS} must be a positive integer, got '{v}'"))?;
        }
        if let Some(v) = lookup(ENV_COMPACTION_INTERVAL_MS) {
            self.compaction_interval_ms = v.parse().with_context(|| {
                format!("{ENV_COMPACTION_INTERVAL_MS} must be milliseconds, got '{v}'")
            })?;
        }
        if let Some(v) = lookup(ENV_SYSTEM_ACTOR) {
            self.system_actor = v;
        }
        if let Some(v) = lookup(ENV_DEFINITIONS_DIR) {
            self.definitions_dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn compaction_interval(&self) -> Duration {
        Duration::from_millis(self.compaction_interval_ms)
    }
}

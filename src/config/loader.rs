//! Configuration loading with multi-layer merge

use super::FlowVersion;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Global defaults
    #[serde(default)]
    pub defaults: Defaults,

    /// Retry policy for steps with `retryOnFailure`
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Global default settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    /// Worker pool size for splits and parallel loops
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Per-step action timeout in seconds
    pub step_timeout: Option<u64>,
}

fn default_pool_size() -> usize {
    10
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            step_timeout: None,
        }
    }
}

/// Retry settings, delays in milliseconds
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_delay")]
    pub initial_delay: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_delay")]
    pub max_delay: u64,

    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    4
}

fn default_initial_delay() -> u64 {
    2000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> u64 {
    60_000
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Take every field `other` sets away from its default
    fn merge(&mut self, other: Self) {
        let defaults = Self::default();
        if other.max_retries != defaults.max_retries {
            self.max_retries = other.max_retries;
        }
        if other.initial_delay != defaults.initial_delay {
            self.initial_delay = other.initial_delay;
        }
        if other.backoff_multiplier != defaults.backoff_multiplier {
            self.backoff_multiplier = other.backoff_multiplier;
        }
        if other.max_delay != defaults.max_delay {
            self.max_delay = other.max_delay;
        }
        if other.jitter != defaults.jitter {
            self.jitter = other.jitter;
        }
    }
}

impl EngineConfig {
    /// Load configuration from the standard hierarchy
    ///
    /// Load order (later overrides earlier):
    /// 1. Built-in defaults
    /// 2. ~/.config/blockflow/config.toml
    /// 3. .blockflow/config.toml (project)
    pub fn load(project_dir: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(user_config_path) = Self::user_config_path() {
            if user_config_path.exists() {
                let user_config = Self::load_file(&user_config_path)
                    .with_context(|| format!("loading {}", user_config_path.display()))?;
                config.merge(user_config);
            }
        }

        let project_config_path = project_dir
            .map(|p| p.join(".blockflow/config.toml"))
            .unwrap_or_else(|| PathBuf::from(".blockflow/config.toml"));

        if project_config_path.exists() {
            let project_config = Self::load_file(&project_config_path)
                .with_context(|| format!("loading {}", project_config_path.display()))?;
            config.merge(project_config);
        }

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Get the user config path (~/.config/blockflow/config.toml)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("blockflow/config.toml"))
    }

    /// Merge another config into this one (other takes precedence)
    pub fn merge(&mut self, other: Self) {
        if other.defaults.pool_size != default_pool_size() {
            self.defaults.pool_size = other.defaults.pool_size;
        }
        if other.defaults.step_timeout.is_some() {
            self.defaults.step_timeout = other.defaults.step_timeout;
        }

        self.retry.merge(other.retry);
    }

    /// Pool size for a fan-out, honouring a per-step override
    pub fn pool_size(&self, step_override: Option<usize>) -> usize {
        step_override.unwrap_or(self.defaults.pool_size).max(1)
    }
}

/// Load a flow version from a `.json` or `.toml` file and validate it
pub fn load_flow(path: &Path) -> Result<FlowVersion> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;

    let flow: FlowVersion = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?,
        _ => serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?,
    };

    flow.validate().map_err(|errors| {
        anyhow::anyhow!("flow validation failed:\n  {}", errors.join("\n  "))
    })?;

    Ok(flow)
}

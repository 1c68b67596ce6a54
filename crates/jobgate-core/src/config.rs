use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::JobSpec;
use crate::types::NodeId;

pub const DEFAULT_LOOP_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_SPLAY_SIZE: u32 = 8192; // must stay a power of two
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;
pub const DEFAULT_LOCK_ROOT: &str = "/jobgate/locks";
pub const DEFAULT_DISPATCH_CAPACITY: usize = 256;

/// Top-level config (jobgate.toml + JOBGATE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobgateConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub splay: SplayConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
    /// Job name → job definition.
    #[serde(default)]
    pub schedule: BTreeMap<String, JobSpec>,
    /// Label → timestamp lookup for `when` jobs. Must be a table when set.
    #[serde(default)]
    pub whens: Option<Value>,
    /// Blackout window inherited by jobs that do not define their own.
    #[serde(default)]
    pub skip_during_range: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity used for splay hashing and governor slots.
    #[serde(default)]
    pub id: NodeId,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { id: NodeId::local() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// When false, ticks evaluate nothing until the schedule is re-enabled.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_loop_interval")]
    pub loop_interval_secs: u64,
    /// SQLite file for run-state; `None` keeps run-state in memory only.
    #[serde(default)]
    pub state_db: Option<String>,
    #[serde(default = "default_dispatch_capacity")]
    pub dispatch_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            loop_interval_secs: DEFAULT_LOOP_INTERVAL_SECS,
            state_db: None,
            dispatch_capacity: DEFAULT_DISPATCH_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplayConfig {
    #[serde(default = "default_splay_size")]
    pub size: u32,
}

impl Default for SplayConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_SPLAY_SIZE,
        }
    }
}

/// How the governor claims a slot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AcquireStrategy {
    /// Ordered ephemeral nodes; a holder counts only the nodes ahead of it.
    #[default]
    Sequential,
    /// Count children, create a named node, re-check and back off on overshoot.
    CountThenCreate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub strategy: AcquireStrategy,
    #[serde(default = "default_lock_root")]
    pub lock_root: String,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            strategy: AcquireStrategy::default(),
            lock_root: DEFAULT_LOCK_ROOT.to_string(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_loop_interval() -> u64 {
    DEFAULT_LOOP_INTERVAL_SECS
}
fn default_dispatch_capacity() -> usize {
    DEFAULT_DISPATCH_CAPACITY
}
fn default_splay_size() -> u32 {
    DEFAULT_SPLAY_SIZE
}
fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_lock_root() -> String {
    DEFAULT_LOCK_ROOT.to_string()
}

impl JobgateConfig {
    /// Load config from a TOML file with JOBGATE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.jobgate/jobgate.toml
    ///
    /// Nested keys use a double underscore, e.g. `JOBGATE_GOVERNOR__POLL_INTERVAL_MS`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: JobgateConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("JOBGATE_").split("__"))
            .extract()
            .map_err(|e| crate::error::JobgateError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse config from an in-memory TOML document (no env overrides).
    pub fn from_toml_str(toml: &str) -> crate::error::Result<Self> {
        let config: JobgateConfig = Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .map_err(|e| crate::error::JobgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Process-wide settings only. Per-job problems are reported by the
    /// scheduler at evaluation time, never here.
    pub fn validate(&self) -> crate::error::Result<()> {
        if !self.splay.size.is_power_of_two() {
            return Err(crate::error::JobgateError::Config(format!(
                "splay.size must be a power of two, got {}",
                self.splay.size
            )));
        }
        if self.scheduler.loop_interval_secs == 0 {
            return Err(crate::error::JobgateError::Config(
                "scheduler.loop_interval_secs must be at least 1".to_string(),
            ));
        }
        for name in self.schedule.keys() {
            if name.is_empty() || name.contains('/') {
                return Err(crate::error::JobgateError::InvalidJob {
                    job: name.clone(),
                    reason: "job names must be non-empty and free of '/'".to_string(),
                });
            }
        }
        if self.scheduler.dispatch_capacity == 0 {
            return Err(crate::error::JobgateError::Config(
                "scheduler.dispatch_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jobgate/jobgate.toml", home)
}

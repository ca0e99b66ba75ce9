//! Loop configuration stored under `.cascade/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::PhaseName;
use crate::io::atomic::write_atomic;

/// Loop configuration (TOML).
///
/// Meant to be edited by humans; every field is optional and falls back to
/// the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CascadeConfig {
    /// Iterations per run before stopping with "iteration limit reached".
    pub max_iterations: u32,

    /// Run a full tracker sync every this many iterations.
    pub sync_interval: u32,

    /// Consecutive failures after which a task is no longer selected.
    pub skip_after_failures: u32,

    /// Extra implement+review rounds allowed after NEEDS_CHANGES.
    pub max_review_retries: u32,

    /// Labels marking a capability-group as parked.
    pub deferred_labels: Vec<String>,

    /// Global idle timeout, used when a phase sets none.
    pub idle_timeout_secs: u64,

    /// Directory holding `<phase>.md` prompt overrides.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts_dir: Option<PathBuf>,

    pub breaker: BreakerConfig,
    pub phases: PhasesConfig,
    pub agent: AgentConfig,
    pub tracker: TrackerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Number of most recent iterations considered.
    pub window: usize,
    /// Failures inside the window that open the breaker.
    pub threshold: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: 10,
            threshold: 5,
        }
    }
}

/// Timeouts for one phase. `idle_timeout_secs = None` defers to the global
/// idle timeout.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PhaseConfig {
    pub hard_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
}

impl PhaseConfig {
    fn new(hard_timeout_secs: u64, idle_timeout_secs: u64) -> Self {
        Self {
            hard_timeout_secs,
            idle_timeout_secs: Some(idle_timeout_secs),
        }
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

/// Per-phase timeouts. Each `[phases.<name>]` table only overrides the keys
/// it names; the rest keep that phase's own defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "PhasesFile")]
pub struct PhasesConfig {
    pub implement: PhaseConfig,
    pub review: PhaseConfig,
    pub commit: PhaseConfig,
    pub validate: PhaseConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PhasesFile {
    implement: PhaseOverride,
    review: PhaseOverride,
    commit: PhaseOverride,
    validate: PhaseOverride,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PhaseOverride {
    hard_timeout_secs: Option<u64>,
    idle_timeout_secs: Option<u64>,
}

impl PhaseOverride {
    fn over(self, base: PhaseConfig) -> PhaseConfig {
        PhaseConfig {
            hard_timeout_secs: self.hard_timeout_secs.unwrap_or(base.hard_timeout_secs),
            idle_timeout_secs: self.idle_timeout_secs.or(base.idle_timeout_secs),
        }
    }
}

impl From<PhasesFile> for PhasesConfig {
    fn from(file: PhasesFile) -> Self {
        let defaults = Self::default();
        Self {
            implement: file.implement.over(defaults.implement),
            review: file.review.over(defaults.review),
            commit: file.commit.over(defaults.commit),
            validate: file.validate.over(defaults.validate),
        }
    }
}

impl Default for PhasesConfig {
    fn default() -> Self {
        Self {
            implement: PhaseConfig::new(60 * 60, 10 * 60),
            review: PhaseConfig::new(20 * 60, 5 * 60),
            commit: PhaseConfig::new(15 * 60, 5 * 60),
            validate: PhaseConfig::new(30 * 60, 10 * 60),
        }
    }
}

impl PhasesConfig {
    pub fn get(&self, phase: PhaseName) -> &PhaseConfig {
        match phase {
            PhaseName::Implement => &self.implement,
            PhaseName::Review => &self.review,
            PhaseName::Commit => &self.commit,
            PhaseName::Validate => &self.validate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Program and leading arguments for the coding assistant.
    pub command: Vec<String>,
    /// Extra arguments placed before the streaming flags.
    pub args: Vec<String>,
    /// Truncate captured agent output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string()],
            args: vec!["--dangerously-skip-permissions".to_string()],
            output_limit_bytes: 2_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerConfig {
    /// Program and leading arguments for the tracker CLI (e.g. `["bd"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            command: vec!["bd".to_string()],
            timeout_secs: 120,
        }
    }
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            sync_interval: 5,
            skip_after_failures: 3,
            max_review_retries: 2,
            deferred_labels: vec!["deferred".to_string(), "backlog".to_string()],
            idle_timeout_secs: 300,
            prompts_dir: None,
            breaker: BreakerConfig::default(),
            phases: PhasesConfig::default(),
            agent: AgentConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

impl CascadeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.sync_interval == 0 {
            return Err(anyhow!("sync_interval must be > 0"));
        }
        if self.skip_after_failures == 0 {
            return Err(anyhow!("skip_after_failures must be > 0"));
        }
        if self.idle_timeout_secs == 0 {
            return Err(anyhow!("idle_timeout_secs must be > 0"));
        }
        if self.breaker.window == 0 || self.breaker.threshold == 0 {
            return Err(anyhow!("breaker.window and breaker.threshold must be > 0"));
        }
        if self.breaker.threshold > self.breaker.window {
            return Err(anyhow!(
                "breaker.threshold ({}) must not exceed breaker.window ({})",
                self.breaker.threshold,
                self.breaker.window
            ));
        }
        for phase in PhaseName::ALL {
            let cfg = self.phases.get(phase);
            if cfg.hard_timeout_secs == 0 {
                return Err(anyhow!("phases.{phase}.hard_timeout_secs must be > 0"));
            }
            if cfg.idle_timeout_secs == Some(0) {
                return Err(anyhow!("phases.{phase}.idle_timeout_secs must be > 0"));
            }
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.tracker.command.is_empty() || self.tracker.command[0].trim().is_empty() {
            return Err(anyhow!("tracker.command must be a non-empty array"));
        }
        if self.tracker.timeout_secs == 0 {
            return Err(anyhow!("tracker.timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn global_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `CascadeConfig::default()`.
pub fn load_config(path: &Path) -> Result<CascadeConfig> {
    if !path.exists() {
        let cfg = CascadeConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CascadeConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &CascadeConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

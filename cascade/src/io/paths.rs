//! Canonical paths within `.cascade/` and scaffolding for a fresh project.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::core::types::PhaseName;
use crate::io::config::{CascadeConfig, write_config};

/// All canonical paths within `.cascade/` for a project root.
#[derive(Debug, Clone)]
pub struct CascadePaths {
    pub root: PathBuf,
    pub cascade_dir: PathBuf,
    pub state_dir: PathBuf,
    pub iterations_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub status_path: PathBuf,
    pub history_path: PathBuf,
    pub escalation_path: PathBuf,
}

impl CascadePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let cascade_dir = root.join(".cascade");
        let state_dir = cascade_dir.join("state");
        Self {
            root: root.clone(),
            cascade_dir: cascade_dir.clone(),
            state_dir: state_dir.clone(),
            iterations_dir: cascade_dir.join("iterations"),
            prompts_dir: cascade_dir.join("prompts"),
            gitignore_path: cascade_dir.join(".gitignore"),
            config_path: cascade_dir.join("config.toml"),
            status_path: state_dir.join("status.json"),
            history_path: state_dir.join("history.jsonl"),
            escalation_path: state_dir.join("escalation.md"),
        }
    }

    pub fn iteration(&self, run_id: &str, iteration: u32) -> IterationPaths {
        IterationPaths::new(&self.iterations_dir, run_id, iteration)
    }

    /// Directory holding prompt overrides: the configured one (relative to
    /// the project root) or `.cascade/prompts`.
    pub fn resolve_prompts_dir(&self, config: &CascadeConfig) -> PathBuf {
        match &config.prompts_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.root.join(dir),
            None => self.prompts_dir.clone(),
        }
    }
}

/// Per-iteration log directory: `.cascade/iterations/<run_id>/<iteration>/`.
#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
}

impl IterationPaths {
    pub fn new(iterations_dir: &Path, run_id: &str, iteration: u32) -> Self {
        Self {
            dir: iterations_dir.join(run_id).join(iteration.to_string()),
        }
    }

    /// `<phase>.log` for the first round, `<phase>-<round>.log` after that.
    pub fn phase_log(&self, phase: PhaseName, round: u32) -> PathBuf {
        if round <= 1 {
            self.dir.join(format!("{phase}.log"))
        } else {
            self.dir.join(format!("{phase}-{round}.log"))
        }
    }
}

/// Create `.cascade/` with a default `config.toml`.
///
/// Fails if the config already exists unless `force` is set.
pub fn init_layout(root: &Path, force: bool) -> Result<CascadePaths> {
    let paths = CascadePaths::new(root);
    if paths.cascade_dir.exists() && !paths.cascade_dir.is_dir() {
        return Err(anyhow!("cascade init: .cascade exists but is not a directory"));
    }
    if paths.config_path.exists() && !force {
        return Err(anyhow!(
            "cascade init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    for dir in [
        &paths.cascade_dir,
        &paths.state_dir,
        &paths.iterations_dir,
        &paths.prompts_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    fs::write(&paths.gitignore_path, CASCADE_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &CascadeConfig::default())?;
    Ok(paths)
}

const CASCADE_GITIGNORE: &str = "iterations/\nstate/\n";

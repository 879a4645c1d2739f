//! Runner configuration stored in `snip.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use snip_lang::Limits;

use crate::io::boundary::BoundaryTimeouts;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "snip.toml";

/// Runner configuration (TOML).
///
/// Edited by humans; missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Wall-clock bound on one invocation of the entry point.
    pub invoke_timeout_ms: u64,

    /// How long teardown waits for a polite exit before killing the worker.
    pub teardown_grace_ms: u64,

    /// Bound on load, send and receive round trips.
    pub load_timeout_ms: u64,

    /// Worker binary. Defaults to `snip-worker` next to the running executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_path: Option<PathBuf>,

    pub limits: LimitsConfig,
}

/// Allocation caps enforced inside the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_string_len: usize,
    pub max_row_fields: usize,
    pub max_log_lines: usize,
    pub max_stack_depth: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            max_string_len: limits.max_string_len,
            max_row_fields: limits.max_row_fields,
            max_log_lines: limits.max_log_lines,
            max_stack_depth: limits.max_stack_depth,
        }
    }
}

impl From<&LimitsConfig> for Limits {
    fn from(cfg: &LimitsConfig) -> Self {
        Limits {
            max_string_len: cfg.max_string_len,
            max_row_fields: cfg.max_row_fields,
            max_log_lines: cfg.max_log_lines,
            max_stack_depth: cfg.max_stack_depth,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            invoke_timeout_ms: 5_000,
            teardown_grace_ms: 500,
            load_timeout_ms: 5_000,
            worker_path: None,
            limits: LimitsConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.invoke_timeout_ms == 0 {
            return Err(anyhow!("invoke_timeout_ms must be > 0"));
        }
        if self.load_timeout_ms == 0 {
            return Err(anyhow!("load_timeout_ms must be > 0"));
        }
        if self.limits.max_string_len == 0 {
            return Err(anyhow!("limits.max_string_len must be > 0"));
        }
        if self.limits.max_row_fields == 0 {
            return Err(anyhow!("limits.max_row_fields must be > 0"));
        }
        if self.limits.max_stack_depth == 0 {
            return Err(anyhow!("limits.max_stack_depth must be > 0"));
        }
        if let Some(path) = &self.worker_path
            && path.as_os_str().is_empty()
        {
            return Err(anyhow!("worker_path must not be empty"));
        }
        Ok(())
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }

    pub fn boundary_timeouts(&self) -> BoundaryTimeouts {
        BoundaryTimeouts {
            step: Duration::from_millis(self.load_timeout_ms),
            teardown_grace: Duration::from_millis(self.teardown_grace_ms),
        }
    }

    pub fn worker_limits(&self) -> Limits {
        Limits::from(&self.limits)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

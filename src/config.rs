//! `converge.toml` configuration
//!
//! Looked up at `--config`, then `./converge.toml`, then
//! `~/.config/converge/config.toml`. A missing file means defaults.

use anyhow::{Context, Result, bail};
use reconcile::{EngineOptions, ErrorCategory, FailurePolicy, ResourceTypeSchema, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "converge.toml";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// State file; `~` is expanded, relative paths are relative to the config file
    pub state_path: String,
    pub provider: ProviderKind,
    /// Where the local provider keeps remote objects (defaults next to the state file)
    pub sandbox_dir: Option<String>,
    pub workers: usize,
    /// A lock whose heartbeat is older than this is considered abandoned
    pub lock_staleness_secs: u64,
    pub heartbeat_secs: u64,
    pub failure_policy: FailurePolicy,
    /// Check for drift before every plan
    pub refresh: bool,
    /// Per-type behavior; only listed types can be managed
    pub types: BTreeMap<String, TypeConfig>,

    /// Directory of the file this was loaded from
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_path: "~/.local/state/converge/state.json".to_string(),
            provider: ProviderKind::Local,
            sandbox_dir: None,
            workers: 4,
            lock_staleness_secs: 300,
            heartbeat_secs: 30,
            failure_policy: FailurePolicy::FailFast,
            refresh: false,
            types: BTreeMap::new(),
            base_dir: None,
        }
    }
}

/// Which adapter backs every configured type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// JSON files under `sandbox_dir`
    #[default]
    Local,
    /// Objects live only for the duration of one command
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TypeConfig {
    pub force_replace: Vec<String>,
    pub create_before_destroy: bool,
    pub timeout_secs: u64,
    pub retry: Option<RetryConfig>,
}

impl Default for TypeConfig {
    fn default() -> Self {
        Self {
            force_replace: Vec::new(),
            create_before_destroy: false,
            timeout_secs: reconcile::DEFAULT_TIMEOUT.as_secs(),
            retry: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub retry_on: Vec<ErrorCategory>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            retry_on: vec![ErrorCategory::Throttled, ErrorCategory::Transient],
        }
    }
}

impl RetryConfig {
    fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_factor: self.backoff_factor,
            ..RetryPolicy::retrying(self.max_attempts, self.retry_on.iter().copied()).with_delays(
                Duration::from_millis(self.base_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            )
        }
    }
}

impl TypeConfig {
    pub fn schema(&self) -> ResourceTypeSchema {
        let mut schema = ResourceTypeSchema::default()
            .force_replace(self.force_replace.iter().cloned())
            .create_before_destroy(self.create_before_destroy)
            .timeout(Duration::from_secs(self.timeout_secs.max(1)));
        if let Some(retry) = &self.retry {
            schema = schema.retry(retry.policy());
        }
        schema
    }
}

impl Config {
    /// Load from an explicit path, or the first default location that exists.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            if !path.is_file() {
                bail!("Config file {} does not exist", path.display());
            }
            return Self::load_file(path);
        }

        for candidate in default_locations() {
            if candidate.is_file() {
                return Self::load_file(&candidate);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let mut config = Self::parse(&content)
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        if config.workers == 0 {
            bail!("workers must be at least 1");
        }
        if config.heartbeat_secs >= config.lock_staleness_secs {
            bail!(
                "heartbeat_secs ({}) must be shorter than lock_staleness_secs ({})",
                config.heartbeat_secs,
                config.lock_staleness_secs
            );
        }
        Ok(config)
    }

    pub fn state_path(&self) -> PathBuf {
        self.resolve(&self.state_path)
    }

    /// Local provider root: `sandbox_dir`, or `objects/` next to the state file.
    pub fn sandbox_dir(&self) -> PathBuf {
        match &self.sandbox_dir {
            Some(dir) => self.resolve(dir),
            None => {
                let state = self.state_path();
                state
                    .parent()
                    .map_or_else(|| PathBuf::from("objects"), |p| p.join("objects"))
            }
        }
    }

    pub fn lock_staleness(&self) -> Duration {
        Duration::from_secs(self.lock_staleness_secs)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            workers: self.workers,
            failure_policy: self.failure_policy,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            refresh: self.refresh,
            ..EngineOptions::default()
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let expanded = PathBuf::from(shellexpand::tilde(path).as_ref());
        match &self.base_dir {
            Some(base) if expanded.is_relative() => base.join(expanded),
            _ => expanded,
        }
    }
}

fn default_locations() -> Vec<PathBuf> {
    let mut locations = vec![PathBuf::from(CONFIG_FILE)];
    if let Some(home) = dirs::home_dir() {
        locations.push(home.join(".config").join("converge").join("config.toml"));
    }
    locations
}

//! Configuration loading.
//!
//! Settings come from `{config_dir}/scriptserve/config.json` when present,
//! then environment variables, then command-line flags (applied by the
//! binary). Every field has a default, so an empty or missing file is fine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;

use crate::client::ConnectOptions;
use crate::constants::{CONNECT_RETRY_INTERVAL, CONTEXTS_PER_CPU, DEFAULT_DEPTH, PRODUCT_PREFIX};
use crate::socket::Endpoint;

/// Environment variable overriding the configuration directory.
pub const CONFIG_DIR_ENV: &str = "SCRIPTSERVE_CONFIG_DIR";

/// Configuration for the scriptserve client and worker.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Endpoint name; `scriptserve-<user>` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipe_name: Option<String>,
    /// Directory holding the worker binary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exe_dir: Option<PathBuf>,
    /// Working directory for spawned workers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    /// Serialization depth used when the caller passes none.
    pub default_depth: usize,
    /// Execution-context pool size; two per CPU when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_contexts: Option<usize>,
    /// First connect attempt bound, in milliseconds.
    pub probe_timeout_ms: u64,
    /// Post-spawn connect bound, in milliseconds.
    pub spawn_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipe_name: None,
            exe_dir: None,
            working_directory: None,
            default_depth: DEFAULT_DEPTH,
            max_contexts: None,
            probe_timeout_ms: 500,
            spawn_timeout_ms: 3000,
        }
    }
}

impl Config {
    /// Returns the configuration directory path.
    ///
    /// `SCRIPTSERVE_CONFIG_DIR` when set, otherwise the platform config
    /// directory (`~/.config/scriptserve` on Linux).
    pub fn config_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|d| !d.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join(PRODUCT_PREFIX))
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_dir(&Self::config_dir()?)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads `config.json` from `dir`, or defaults when there is none.
    ///
    /// A file that fails to parse is reported and replaced by defaults.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.json");
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        match serde_json::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                log::warn!("Ignoring invalid config {}: {}", config_path.display(), e);
                Ok(Self::default())
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply `SCRIPTSERVE_*` overrides read through `lookup`.
    ///
    /// Unparseable numbers are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("SCRIPTSERVE_PIPE_NAME").filter(|v| !v.is_empty()) {
            self.pipe_name = Some(name);
        }
        if let Some(dir) = lookup("SCRIPTSERVE_EXE_DIR").filter(|v| !v.is_empty()) {
            self.exe_dir = Some(PathBuf::from(dir));
        }
        if let Some(depth) = lookup("SCRIPTSERVE_DEPTH") {
            if let Ok(depth) = depth.parse::<usize>() {
                self.default_depth = depth;
            }
        }
        if let Some(max) = lookup("SCRIPTSERVE_MAX_CONTEXTS") {
            if let Ok(max) = max.parse::<usize>() {
                self.max_contexts = Some(max);
            }
        }
    }

    /// Endpoint named by `pipe_name`, or the per-user default.
    pub fn endpoint(&self) -> Result<Endpoint> {
        match &self.pipe_name {
            Some(name) => Endpoint::named(name),
            None => Endpoint::default_for_user(),
        }
    }

    /// Context pool size to use.
    pub fn effective_max_contexts(&self) -> usize {
        self.max_contexts
            .filter(|&n| n > 0)
            .unwrap_or_else(|| num_cpus::get() * CONTEXTS_PER_CPU)
    }

    /// Connect options derived from this configuration.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            depth: self.default_depth,
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            spawn_timeout: Duration::from_millis(self.spawn_timeout_ms),
            retry_interval: CONNECT_RETRY_INTERVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.default_depth, 5);
        assert_eq!(config.probe_timeout_ms, 500);
        assert_eq!(config.spawn_timeout_ms, 3000);
        assert!(config.pipe_name.is_none());
        assert!(config.effective_max_contexts() >= CONTEXTS_PER_CPU);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.json"), r#"{"pipe_name": "team", "default_depth": 2}"#).unwrap();

        let config = Config::load_from_dir(dir.path()).unwrap();
        assert_eq!(config.pipe_name.as_deref(), Some("team"));
        assert_eq!(config.default_depth, 2);
        assert_eq!(config.spawn_timeout_ms, 3000);
    }

    #[test]
    fn test_missing_or_invalid_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Config::load_from_dir(dir.path()).unwrap(), Config::default());

        fs::write(dir.path().join("config.json"), "{ not json").unwrap();
        assert_eq!(Config::load_from_dir(dir.path()).unwrap(), Config::default());
    }

    #[test]
    fn test_hand_written_file_loads_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            max_contexts: Some(3),
            exe_dir: Some(PathBuf::from("/opt/scriptserve")),
            working_directory: Some(PathBuf::from("/srv")),
            ..Config::default()
        };
        let written = serde_json::to_string_pretty(&config).unwrap();
        assert!(!written.contains("pipe_name"));
        fs::write(dir.path().join("config.json"), written).unwrap();

        assert_eq!(Config::load_from_dir(dir.path()).unwrap(), config);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SCRIPTSERVE_PIPE_NAME", "override"),
            ("SCRIPTSERVE_EXE_DIR", "/bin/dir"),
            ("SCRIPTSERVE_DEPTH", "9"),
            ("SCRIPTSERVE_MAX_CONTEXTS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides_from(|key| env.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.pipe_name.as_deref(), Some("override"));
        assert_eq!(config.exe_dir, Some(PathBuf::from("/bin/dir")));
        assert_eq!(config.default_depth, 9);
        assert_eq!(config.max_contexts, None);
    }

    #[test]
    fn test_endpoint_from_pipe_name() {
        let config = Config {
            pipe_name: Some("named".into()),
            ..Config::default()
        };
        assert_eq!(config.endpoint().unwrap().name(), "named");
    }

    #[test]
    fn test_connect_options_follow_config() {
        let config = Config {
            default_depth: 1,
            probe_timeout_ms: 50,
            spawn_timeout_ms: 70,
            ..Config::default()
        };
        let options = config.connect_options();
        assert_eq!(options.depth, 1);
        assert_eq!(options.probe_timeout, Duration::from_millis(50));
        assert_eq!(options.spawn_timeout, Duration::from_millis(70));
    }
}

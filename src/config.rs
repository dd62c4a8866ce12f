//! Engine endpoint configuration.
//!
//! Reads `engine-pipe.yaml` and resolves environment variables. The file
//! decides which address the dispatcher talks to on each host OS, the default
//! timeouts, and which host processes belong to which platform.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::Platform;

/// File name searched for by [`find_config_path`].
pub const CONFIG_FILE_NAME: &str = "engine-pipe.yaml";

/// Overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "ENGINE_PIPE_CONFIG";

/// Overrides the resolved engine address.
pub const ADDRESS_ENV: &str = "ENGINE_PIPE_ADDRESS";

/// Address used when the config names no endpoint at all.
pub const FALLBACK_ADDRESS: &str = "127.0.0.1:50062";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {reason}")]
    NotFound { reason: String },

    #[error("failed to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Engine address per host operating system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    #[serde(default)]
    pub linux: Option<String>,
    #[serde(default)]
    pub windows: Option<String>,
    #[serde(default)]
    pub macos: Option<String>,
    /// Used when the current OS has no entry.
    #[serde(default)]
    pub default: Option<String>,
}

impl Endpoints {
    /// Entry for an OS name as reported by `std::env::consts::OS`.
    pub fn for_os(&self, os: &str) -> Option<&str> {
        let entry = match os {
            "linux" => self.linux.as_deref(),
            "windows" => self.windows.as_deref(),
            "macos" => self.macos.as_deref(),
            _ => None,
        };
        entry.or(self.default.as_deref())
    }
}

/// Top-level configuration (mirrors `engine-pipe.yaml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_platform")]
    pub default_platform: Platform,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub endpoints: Endpoints,
    /// Host process names per platform, e.g. `unity: [Unity, Unity Hub]`.
    #[serde(default)]
    pub host_processes: HashMap<Platform, Vec<String>>,
}

fn default_platform() -> Platform {
    Platform::Unity
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_platform: default_platform(),
            call_timeout_ms: default_call_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            endpoints: Endpoints::default(),
            host_processes: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Engine address for this machine.
    ///
    /// Resolution order:
    /// 1. `ENGINE_PIPE_ADDRESS`
    /// 2. The entry for the current OS
    /// 3. `endpoints.default`
    /// 4. [`FALLBACK_ADDRESS`]
    pub fn resolve_address(&self) -> String {
        self.resolve_address_for(std::env::var(ADDRESS_ENV).ok(), std::env::consts::OS)
    }

    fn resolve_address_for(&self, env_override: Option<String>, os: &str) -> String {
        if let Some(address) = env_override.filter(|a| !a.trim().is_empty()) {
            return address;
        }
        self.endpoints
            .for_os(os)
            .unwrap_or(FALLBACK_ADDRESS)
            .to_string()
    }

    /// Process names registered for a platform.
    pub fn processes_for(&self, platform: Platform) -> &[String] {
        self.host_processes
            .get(&platform)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `ENGINE_PIPE_CONFIG` first, then searches upward from `start` for
/// `engine-pipe.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, ConfigError> {
    // 1. Check env var
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.is_file() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_PATH_ENV} points to a missing file");
    }

    // 2. Walk upward from `start`
    search_upward(start).ok_or_else(|| ConfigError::NotFound {
        reason: format!("no {CONFIG_FILE_NAME} in {} or its parents", start.display()),
    })
}

fn search_upward(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Load and parse the configuration file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing.
pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let config = parse_config(&raw).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    tracing::debug!(
        path = %path.display(),
        platform = %config.default_platform,
        "loaded engine config"
    );
    Ok(config)
}

fn parse_config(raw: &str) -> Result<EngineConfig, serde_yaml::Error> {
    let interpolated = interpolate_env_vars(raw);
    // An empty file means "all defaults".
    if interpolated.trim().is_empty() {
        return Ok(EngineConfig::default());
    }
    serde_yaml::from_str(&interpolated)
}

/// Find and load the config, or fall back to defaults when there is none.
///
/// A file that exists but cannot be read or parsed is still an error.
pub fn load_or_default(start: &Path) -> Result<EngineConfig, ConfigError> {
    match find_config_path(start) {
        Ok(path) => load_config(&path),
        Err(ConfigError::NotFound { reason }) => {
            tracing::debug!(%reason, "using default engine config");
            Ok(EngineConfig::default())
        }
        Err(e) => Err(e),
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`. Unset variables without a default become empty.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
default_platform: unity
call_timeout_ms: 12000
endpoints:
  windows: "127.0.0.1:50061"
  linux: "${__ENGINE_PIPE_TEST_HOST__:-10.0.0.5}:50062"
  default: "127.0.0.1:50062"
host_processes:
  unity: ["Unity", "Unity Hub"]
"#;

    #[test]
    fn test_parse_sample_with_defaults() {
        std::env::remove_var("__ENGINE_PIPE_TEST_HOST__");
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.default_platform, Platform::Unity);
        assert_eq!(config.call_timeout(), Duration::from_secs(12));
        assert_eq!(config.connect_timeout_ms, 5_000);
        assert_eq!(config.endpoints.linux.as_deref(), Some("10.0.0.5:50062"));
        assert_eq!(config.processes_for(Platform::Unity), ["Unity", "Unity Hub"]);
        assert!(config.processes_for(Platform::Godot).is_empty());
    }

    #[test]
    fn test_resolve_address_order() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(
            config.resolve_address_for(Some("192.168.1.2:7000".into()), "windows"),
            "192.168.1.2:7000"
        );
        assert_eq!(config.resolve_address_for(None, "windows"), "127.0.0.1:50061");
        assert_eq!(config.resolve_address_for(Some("  ".into()), "macos"), "127.0.0.1:50062");
        assert_eq!(
            EngineConfig::default().resolve_address_for(None, "linux"),
            FALLBACK_ADDRESS
        );
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(parse_config("\n").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_unknown_platform_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "default_platform: cryengine\n").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_search_upward_finds_parent_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "call_timeout_ms: 100\n").unwrap();
        let nested = dir.path().join("Assets").join("Scripts");
        std::fs::create_dir_all(&nested).unwrap();

        let found = search_upward(&nested).unwrap();
        assert_eq!(found, dir.path().join(CONFIG_FILE_NAME));
        assert_eq!(load_config(&found).unwrap().call_timeout_ms, 100);
    }

    #[test]
    fn test_load_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__ENGINE_PIPE_TEST_PORT__", "6000");
        assert_eq!(
            interpolate_env_vars("host:${__ENGINE_PIPE_TEST_PORT__:-50062}"),
            "host:6000"
        );
        std::env::remove_var("__ENGINE_PIPE_TEST_PORT__");
    }

    #[test]
    fn test_interpolate_unset_without_default_is_empty() {
        std::env::remove_var("__ENGINE_PIPE_TEST_UNSET__");
        assert_eq!(interpolate_env_vars("a${__ENGINE_PIPE_TEST_UNSET__}b"), "ab");
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/engine-pipe.yaml");
        assert!(!result.starts_with('~'), "tilde should be expanded");
        assert!(result.ends_with("/engine-pipe.yaml"));
    }
}

//! Application configuration loading and validation.
//!
//! Reads `opspilot.yaml` and resolves environment variables before parsing.
//! The file is the single source of truth for the model provider, the tool
//! server commands, and the loop and timeout knobs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::inference::providers::{ProviderKind, MAX_TOOL_RESULT_CHARS};
use crate::mcp_client::ServerConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "OPSPILOT_CONFIG";

/// File name searched for when no path is given.
pub const CONFIG_FILE_NAME: &str = "opspilot.yaml";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not find {CONFIG_FILE_NAME} (set {CONFIG_ENV_VAR} or pass a path)")]
    NotFound,

    #[error("failed to read {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level configuration (mirrors `opspilot.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    pub servers: ServersConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Model provider connection and generation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Defaults to the provider's public API.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ProviderConfig {
    pub fn base_url(&self) -> &str {
        match (&self.base_url, self.kind) {
            (Some(url), _) => url,
            (None, ProviderKind::Anthropic) => "https://api.anthropic.com/v1",
            (None, ProviderKind::OpenAi) => "https://api.openai.com/v1",
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// The two remote tool servers.
#[derive(Debug, Clone, Deserialize)]
pub struct ServersConfig {
    pub audit: ServerConfig,
    pub cluster: ServerConfig,
}

/// Per-backend call timeouts. The audit server scans large datasets and gets
/// the long window; the cluster server gets the short one.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_short_ms")]
    pub short_ms: u64,
    #[serde(default = "default_long_ms")]
    pub long_ms: u64,
}

impl TimeoutsConfig {
    pub fn short(&self) -> Duration {
        Duration::from_millis(self.short_ms)
    }

    pub fn long(&self) -> Duration {
        Duration::from_millis(self.long_ms)
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            short_ms: default_short_ms(),
            long_ms: default_long_ms(),
        }
    }
}

/// Agent loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_true")]
    pub annotate_time: bool,
    #[serde(default)]
    pub parallel_tool_calls: bool,
    #[serde(default = "default_max_tool_result_chars")]
    pub max_tool_result_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            annotate_time: true,
            parallel_tool_calls: false,
            max_tool_result_chars: default_max_tool_result_chars(),
        }
    }
}

fn default_max_tokens() -> u32 {
    4096
}
fn default_temperature() -> f32 {
    0.2
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_short_ms() -> u64 {
    30_000
}
fn default_long_ms() -> u64 {
    120_000
}
fn default_max_rounds() -> u32 {
    10
}
fn default_true() -> bool {
    true
}
fn default_max_tool_result_chars() -> usize {
    MAX_TOOL_RESULT_CHARS
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolve the config file path.
///
/// Order: explicit path, `OPSPILOT_CONFIG`, `./opspilot.yaml`, then
/// `<config dir>/opspilot/opspilot.yaml`.
pub fn find_config_path(explicit: Option<&str>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(PathBuf::from(expand_tilde(path)));
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Ok(PathBuf::from(expand_tilde(&path)));
        }
    }

    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return Ok(local);
    }

    if let Some(dir) = dirs::config_dir() {
        let candidate = dir.join("opspilot").join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(ConfigError::NotFound)
}

/// Load, interpolate, parse, and validate the configuration file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}`, then expands a leading `~` in server commands,
/// working directories, and environment values.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let config = parse_config(&raw)?;
    tracing::info!(
        path = %path.display(),
        provider = %config.provider.kind,
        model = %config.provider.model,
        "loaded configuration"
    );
    Ok(config)
}

/// Parse configuration text (after interpolation) and validate it.
pub fn parse_config(raw: &str) -> Result<AppConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);

    let mut config: AppConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })?;

    expand_server_paths(&mut config.servers.audit);
    expand_server_paths(&mut config.servers.cluster);
    config.validate()?;
    Ok(config)
}

impl AppConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| {
            Err(ConfigError::Invalid {
                reason: reason.to_string(),
            })
        };

        if self.provider.model.trim().is_empty() {
            return invalid("provider.model must not be empty");
        }
        if self.provider.api_key.trim().is_empty() {
            return invalid("provider.api_key is empty (is the environment variable set?)");
        }
        if self.servers.audit.command.trim().is_empty() {
            return invalid("servers.audit.command must not be empty");
        }
        if self.servers.cluster.command.trim().is_empty() {
            return invalid("servers.cluster.command must not be empty");
        }
        if self.timeouts.short_ms == 0 || self.timeouts.long_ms == 0 {
            return invalid("timeouts must be greater than zero");
        }
        if self.engine.max_rounds == 0 {
            return invalid("engine.max_rounds must be at least 1");
        }
        Ok(())
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
///
/// An unterminated `${` is kept verbatim so a stray brace surfaces as a
/// parse or validation error instead of swallowing the rest of the file.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                result.push_str(&resolve_var_expr(&after[..end]));
                rest = &after[end + 1..];
            }
            None => {
                tracing::warn!(at = %&rest[start..], "unterminated variable reference in config");
                break;
            }
        }
    }

    result.push_str(rest);
    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
///
/// An empty variable counts as unset, as in the shell.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => std::env::var(var_name)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default.to_string()),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{}", home.display(), &path[1..]);
        }
    }
    path.to_string()
}

fn expand_server_paths(server: &mut ServerConfig) {
    server.command = expand_tilde(&server.command);
    if let Some(cwd) = server.cwd.as_mut() {
        *cwd = expand_tilde(cwd);
    }
    for value in server.env.values_mut() {
        *value = expand_tilde(value);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Permission modes a session can run under.
pub const PERMISSION_MODES: &[&str] = &["approve", "auto", "plan"];

/// Model identifiers offered to clients.
pub const AVAILABLE_MODELS: &[&str] = &["sonnet", "opus", "haiku"];

/// Default Agent model.
pub const DEFAULT_MODEL: &str = "sonnet";

/// Default concurrent session capacity.
pub const DEFAULT_MAX_SESSIONS: usize = 5;

/// Start flags for the `chroxy` daemon.
///
/// Precedence: CLI flag > environment variable > config file > default.
/// clap resolves the first two; [`Config::resolve`] folds in the file layer.
#[derive(Debug, Clone, Parser)]
#[command(name = "chroxy")]
pub struct Config {
    /// Path to the config file.
    #[arg(long, env = "CHROXY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Bearer token for client authentication.
    #[arg(long, env = "API_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Disable authentication entirely.
    #[arg(long, env = "CHROXY_NO_AUTH")]
    pub no_auth: bool,

    /// Tunnel mode: quick (ephemeral URL), named (stable URL), none.
    #[arg(long, env = "CHROXY_TUNNEL")]
    pub tunnel: Option<String>,

    /// Run the worker directly, without the supervisor.
    #[arg(long)]
    pub no_supervisor: bool,

    /// Agent model for the default session.
    #[arg(long, env = "CHROXY_MODEL")]
    pub model: Option<String>,

    /// Working directory for the default session.
    #[arg(long, env = "CHROXY_CWD")]
    pub cwd: Option<PathBuf>,

    /// Comma-separated tool allowlist passed to the Agent.
    #[arg(long, env = "CHROXY_ALLOWED_TOOLS")]
    pub allowed_tools: Option<String>,

    /// Resume a previous Agent conversation by id.
    #[arg(long, env = "CHROXY_RESUME")]
    pub resume: Option<String>,

    /// Command used to launch the Agent child.
    #[arg(long, env = "SHELL_CMD")]
    pub shell_cmd: Option<String>,

    /// Seconds between background terminal-session discovery scans (0 = off).
    #[arg(long, env = "CHROXY_DISCOVERY_INTERVAL")]
    pub discovery_interval: Option<u64>,

    /// Set by the supervisor on the forked worker; never set by hand.
    #[arg(long, env = "CHROXY_SUPERVISED", hide = true)]
    pub supervised: bool,

    /// Verbose logging (equivalent to log level debug).
    #[arg(long, short)]
    pub verbose: bool,

    /// Log format (json or text).
    #[arg(long, env = "CHROXY_LOG_FORMAT", default_value = "text")]
    pub log_format: String,
}

/// On-disk layer (`~/.chroxy/config.json`, mode 0600).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileConfig {
    pub port: Option<u16>,
    pub token: Option<String>,
    pub tunnel: Option<String>,
    pub model: Option<String>,
    pub cwd: Option<PathBuf>,
    pub allowed_tools: Option<String>,
    pub shell_cmd: Option<String>,
    pub max_sessions: Option<usize>,
    pub tunnel_hostname: Option<String>,
    pub discovery_interval: Option<u64>,
}

/// Tunnel operating mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelMode {
    /// Ephemeral tunnel with a random public URL.
    Quick,
    /// Stable URL derived from configured credentials.
    Named { hostname: String },
    /// No tunnel; the worker is only reachable locally.
    None,
}

/// Fully resolved settings, immutable after startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub token: Option<String>,
    pub tunnel: TunnelMode,
    pub no_supervisor: bool,
    pub supervised: bool,
    pub model: String,
    pub cwd: PathBuf,
    pub allowed_tools: Vec<String>,
    pub resume: Option<String>,
    pub shell_cmd: String,
    pub max_sessions: usize,
    pub discovery_interval_secs: u64,
    pub verbose: bool,
    pub log_format: String,
}

impl Settings {
    pub fn auth_required(&self) -> bool {
        self.token.is_some()
    }
}

/// Directory holding chroxy's persisted state (`~/.chroxy`).
///
/// `CHROXY_HOME` overrides the location, which tests rely on.
pub fn chroxy_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CHROXY_HOME") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_owned());
    Path::new(&home).join(".chroxy")
}

pub fn config_path() -> PathBuf {
    chroxy_dir().join("config.json")
}

pub fn pid_file_path() -> PathBuf {
    chroxy_dir().join("supervisor.pid")
}

pub fn known_good_ref_path() -> PathBuf {
    chroxy_dir().join("known-good-ref")
}

pub fn deploy_marker_path() -> PathBuf {
    chroxy_dir().join("deploy-marker")
}

pub fn session_state_path() -> PathBuf {
    chroxy_dir().join("session-state.json")
}

/// Load the file layer, tolerating a missing file.
pub fn load_file_config(path: &Path) -> anyhow::Result<FileConfig> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
        Err(e) => Err(e.into()),
    }
}

/// Write the file layer with owner-only permissions.
pub fn write_file_config(path: &Path, config: &FileConfig) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(config)?;
    fs::write(path, text)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

impl Config {
    /// Fold the file layer under the CLI/env layers and validate.
    pub fn resolve(&self) -> anyhow::Result<Settings> {
        let file_path = self.config.clone().unwrap_or_else(config_path);
        let file = load_file_config(&file_path)?;

        let token = if self.no_auth {
            None
        } else {
            self.token.clone().or(file.token)
        };

        let tunnel_str = self
            .tunnel
            .clone()
            .or(file.tunnel.clone())
            .unwrap_or_else(|| "quick".to_owned());
        let tunnel = match tunnel_str.as_str() {
            "quick" => TunnelMode::Quick,
            "named" => {
                let hostname = file
                    .tunnel_hostname
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("named tunnel requires tunnelHostname in config (run `chroxy tunnel setup`)"))?;
                TunnelMode::Named { hostname }
            }
            "none" => TunnelMode::None,
            other => anyhow::bail!("unknown tunnel mode: {other} (expected quick, named, or none)"),
        };

        let cwd = match self.cwd.clone().or(file.cwd) {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        if !cwd.is_dir() {
            anyhow::bail!("working directory does not exist: {}", cwd.display());
        }

        if token.is_none() && !self.no_auth {
            anyhow::bail!(
                "no API token configured; run `chroxy init` or pass --no-auth to disable authentication"
            );
        }

        let allowed_tools = self
            .allowed_tools
            .clone()
            .or(file.allowed_tools)
            .map(|s| s.split(',').map(|t| t.trim().to_owned()).filter(|t| !t.is_empty()).collect())
            .unwrap_or_default();

        Ok(Settings {
            port: self.port.or(file.port).unwrap_or(8765),
            token,
            tunnel,
            no_supervisor: self.no_supervisor,
            supervised: self.supervised,
            model: self.model.clone().or(file.model).unwrap_or_else(|| DEFAULT_MODEL.to_owned()),
            cwd,
            allowed_tools,
            resume: self.resume.clone(),
            shell_cmd: self
                .shell_cmd
                .clone()
                .or(file.shell_cmd)
                .unwrap_or_else(|| "claude".to_owned()),
            max_sessions: file.max_sessions.unwrap_or(DEFAULT_MAX_SESSIONS),
            discovery_interval_secs: self.discovery_interval.or(file.discovery_interval).unwrap_or(0),
            verbose: self.verbose,
            log_format: self.log_format.clone(),
        })
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

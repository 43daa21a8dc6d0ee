// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `init`, `config`, and `tunnel setup` subcommands.

use std::io::Write;

use rand::RngCore;
use tracing::info;

use crate::config::{
    config_path, load_file_config, write_file_config, Config, FileConfig,
};

/// `chroxy init` — write a fresh config with a generated token.
pub fn run_init() -> anyhow::Result<()> {
    let path = config_path();
    let mut config = load_file_config(&path)?;

    if config.token.is_none() {
        config.token = Some(generate_token());
    }
    if config.port.is_none() {
        config.port = Some(8765);
    }
    write_file_config(&path, &config)?;

    println!("wrote {}", path.display());
    if let Some(token) = config.token {
        println!("API token: {token}");
        println!("keep this secret; clients authenticate with it");
    }
    Ok(())
}

/// `chroxy config` — print the fully resolved configuration.
pub fn run_config(config: &Config) -> anyhow::Result<()> {
    let settings = config.resolve()?;
    let redacted = settings.token.as_deref().map(|t| {
        if t.len() > 8 {
            let prefix: String = t.chars().take(8).collect();
            format!("{prefix}…")
        } else {
            "(set)".to_owned()
        }
    });
    let out = serde_json::json!({
        "port": settings.port,
        "token": redacted,
        "tunnel": match settings.tunnel {
            crate::config::TunnelMode::Quick => "quick".to_owned(),
            crate::config::TunnelMode::Named { ref hostname } =>
                format!("named ({hostname})"),
            crate::config::TunnelMode::None => "none".to_owned(),
        },
        "model": settings.model,
        "cwd": settings.cwd.display().to_string(),
        "shellCmd": settings.shell_cmd,
        "allowedTools": settings.allowed_tools,
        "maxSessions": settings.max_sessions,
        "discoveryInterval": settings.discovery_interval_secs,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

/// `chroxy tunnel setup` — guided capture of named-tunnel credentials.
pub fn run_tunnel_setup() -> anyhow::Result<()> {
    let path = config_path();
    let mut config: FileConfig = load_file_config(&path)?;

    println!("named tunnel setup");
    println!("the hostname must already be routed to this machine by your tunnel provider");
    print!("tunnel hostname (e.g. chroxy.example.com): ");
    std::io::stdout().flush()?;

    let mut hostname = String::new();
    std::io::stdin().read_line(&mut hostname)?;
    let hostname = hostname.trim();
    if hostname.is_empty() {
        anyhow::bail!("no hostname entered");
    }

    config.tunnel_hostname = Some(hostname.to_owned());
    config.tunnel = Some("named".to_owned());
    write_file_config(&path, &config)?;
    info!(hostname, "named tunnel configured");
    println!("named tunnel configured for https://{hostname}");
    println!("start chroxy with `chroxy start --tunnel named`");
    Ok(())
}

fn generate_token() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
#[path = "setup_tests.rs"]
mod tests;

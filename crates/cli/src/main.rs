// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use clap::Parser;
use tracing::error;

use chroxy::config::{Config, Settings, TunnelMode};
use chroxy::spawn::{ChildSpec, TokioSpawner};
use chroxy::supervisor::Supervisor;
use chroxy::tunnel::Tunnel;

#[derive(Parser)]
#[command(
    name = "chroxy",
    version,
    about = "Remote-control daemon for interactive coding agents."
)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    subcommand: Option<Commands>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Write an initial config file with a generated API token.
    Init,
    /// Print the resolved configuration.
    Config,
    /// Tunnel management.
    Tunnel {
        #[command(subcommand)]
        action: TunnelAction,
    },
    /// Create a named terminal session hosting the Agent.
    Wrap(chroxy::wrap::WrapArgs),
}

#[derive(clap::Subcommand)]
enum TunnelAction {
    /// Guided credential capture for a named tunnel.
    Setup,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.config);

    let result = match cli.subcommand {
        Some(Commands::Init) => chroxy::setup::run_init(),
        Some(Commands::Config) => chroxy::setup::run_config(&cli.config),
        Some(Commands::Tunnel { action: TunnelAction::Setup }) => {
            chroxy::setup::run_tunnel_setup()
        }
        Some(Commands::Wrap(args)) => {
            chroxy::wrap::run(&args, Arc::new(TokioSpawner)).await
        }
        None => start(&cli.config).await,
    };

    if let Err(e) = result {
        error!("fatal: {e:#}");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

/// `chroxy start` (the default command).
async fn start(config: &Config) -> anyhow::Result<()> {
    let settings = config.resolve()?;

    if settings.supervised || settings.no_supervisor {
        return chroxy::run::run_worker(settings).await;
    }

    let spawner = Arc::new(TokioSpawner);
    let tunnel = match settings.tunnel {
        TunnelMode::None => None,
        ref mode => Some(Tunnel::new(mode.clone(), settings.port, spawner.clone())),
    };
    let worker_spec = worker_spec(&settings)?;
    let supervisor = Supervisor::new(
        settings,
        worker_spec,
        tunnel,
        spawner.clone(),
        spawner,
    );
    supervisor.run().await
}

/// Fork spec for the worker: same binary, supervised, tunnel off.
fn worker_spec(settings: &Settings) -> anyhow::Result<ChildSpec> {
    let exe = std::env::current_exe()?;
    let mut spec = ChildSpec::new(exe.display().to_string())
        .env("CHROXY_SUPERVISED", "1")
        .env("CHROXY_TUNNEL", "none")
        .env("PORT", settings.port.to_string())
        .env("CHROXY_MODEL", settings.model.clone())
        .env("CHROXY_CWD", settings.cwd.display().to_string())
        .env("SHELL_CMD", settings.shell_cmd.clone());
    if let Some(ref token) = settings.token {
        spec = spec.env("API_TOKEN", token.clone());
    } else {
        spec = spec.env("CHROXY_NO_AUTH", "1");
    }
    if !settings.allowed_tools.is_empty() {
        spec = spec.env("CHROXY_ALLOWED_TOOLS", settings.allowed_tools.join(","));
    }
    if let Some(ref resume) = settings.resume {
        spec = spec.env("CHROXY_RESUME", resume.clone());
    }
    if settings.discovery_interval_secs > 0 {
        spec = spec.env(
            "CHROXY_DISCOVERY_INTERVAL",
            settings.discovery_interval_secs.to_string(),
        );
    }
    Ok(spec)
}

fn init_logging(config: &Config) {
    use tracing_subscriber::EnvFilter;

    let default_level = if config.verbose { "chroxy=debug" } else { "chroxy=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into());

    // stdout is reserved for control messages and connection artifacts.
    if config.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

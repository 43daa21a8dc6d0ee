// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `wrap` subcommand: create a named tmux session hosting the Agent, ready
//! for later attachment.

use std::sync::Arc;

use clap::Args;

use crate::discover::validate_session_name;
use crate::spawn::Exec;

#[derive(Debug, Args)]
pub struct WrapArgs {
    /// Name for the new terminal session.
    #[arg(long)]
    pub name: String,

    /// Command to run inside the session.
    #[arg(long, env = "SHELL_CMD", default_value = "claude")]
    pub shell_cmd: String,
}

pub async fn run(args: &WrapArgs, exec: Arc<dyn Exec>) -> anyhow::Result<()> {
    if !validate_session_name(&args.name) {
        anyhow::bail!(
            "invalid session name {:?}: use letters, digits, dot, underscore, hyphen",
            args.name
        );
    }

    let tmux_args = vec![
        "new-session".to_owned(),
        "-d".to_owned(),
        "-s".to_owned(),
        args.name.clone(),
        args.shell_cmd.clone(),
    ];
    let out = exec.output("tmux", &tmux_args).await?;
    if !out.status.success() {
        anyhow::bail!(
            "tmux new-session failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    println!("created terminal session {:?} running {:?}", args.name, args.shell_cmd);
    println!("attach a client with attach_session, or locally: tmux attach -t {}", args.name);
    Ok(())
}

#[cfg(test)]
#[path = "wrap_tests.rs"]
mod tests;

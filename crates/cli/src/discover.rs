// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Discovery of attachable tmux sessions on the host.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::spawn::Exec;

/// A candidate terminal session a client may attach to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredSession {
    pub name: String,
    pub windows: u32,
    pub attached: bool,
}

/// Conservative whitelist for tmux session names.
///
/// Names reach `tmux -t <name>` subcommands downstream, so anything outside
/// alphanumerics, dot, underscore, and hyphen is refused outright.
pub fn validate_session_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

/// List tmux sessions on the host. A missing tmux binary or no server yields
/// an empty list, not an error.
pub async fn list_terminal_sessions(exec: &Arc<dyn Exec>) -> Vec<DiscoveredSession> {
    let args = vec![
        "list-sessions".to_owned(),
        "-F".to_owned(),
        "#{session_name}\t#{session_windows}\t#{session_attached}".to_owned(),
    ];
    let out = match exec.output("tmux", &args).await {
        Ok(out) if out.status.success() => out,
        _ => return vec![],
    };
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .filter_map(parse_session_line)
        .filter(|s| validate_session_name(&s.name))
        .collect()
}

fn parse_session_line(line: &str) -> Option<DiscoveredSession> {
    let mut parts = line.split('\t');
    let name = parts.next()?.to_owned();
    let windows = parts.next()?.parse().ok()?;
    let attached = parts.next().map(|v| v != "0").unwrap_or(false);
    Some(DiscoveredSession { name, windows, attached })
}

#[cfg(test)]
#[path = "discover_tests.rs"]
mod tests;

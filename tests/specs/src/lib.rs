// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `chroxy` binary as a subprocess with a stub Agent script
//! and exercises it over HTTP.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// Resolve the path to the compiled `chroxy` binary.
pub fn chroxy_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("chroxy")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Write a stub Agent: emits the init handshake, then idles.
///
/// The script echoes a result for every stdin line so turn plumbing can be
/// exercised without a real Agent.
pub fn write_stub_agent(dir: &Path) -> anyhow::Result<PathBuf> {
    let path = dir.join("stub-agent.sh");
    let script = r#"#!/bin/sh
printf '%s\n' '{"type":"system","subtype":"init","session_id":"conv-stub","model":"sonnet","tools":["Bash"]}'
while IFS= read -r _line; do
  printf '%s\n' '{"type":"result","duration_ms":1,"session_id":"conv-stub"}'
done
"#;
    std::fs::write(&path, script)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

/// A running `chroxy` worker that is killed on drop.
pub struct ChroxyProcess {
    child: Child,
    pub port: u16,
    // Keeps the stub agent and CHROXY_HOME alive for the process lifetime.
    _home: tempfile::TempDir,
}

impl ChroxyProcess {
    /// Start a worker (`--no-supervisor --tunnel none`) with a stub Agent.
    ///
    /// `token` enables bearer auth when set.
    pub fn start(token: Option<&str>) -> anyhow::Result<Self> {
        let home = tempfile::tempdir()?;
        let stub = write_stub_agent(home.path())?;
        let port = free_port()?;

        let mut cmd = Command::new(chroxy_binary());
        cmd.arg("--no-supervisor")
            .arg("--tunnel")
            .arg("none")
            .arg("--port")
            .arg(port.to_string())
            .arg("--shell-cmd")
            .arg(stub.display().to_string())
            .env("CHROXY_HOME", home.path())
            .env_remove("API_TOKEN")
            .env_remove("CHROXY_NO_AUTH")
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match token {
            Some(token) => {
                cmd.env("API_TOKEN", token);
            }
            None => {
                cmd.arg("--no-auth");
            }
        }

        let child = cmd.spawn()?;
        Ok(Self { child, port, _home: home })
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Poll `/health` until the worker answers or the deadline passes.
    pub async fn wait_ready(&self) -> anyhow::Result<()> {
        let url = format!("{}/health", self.base_url());
        let client = reqwest::Client::new();
        for _ in 0..100 {
            if let Ok(response) = client.get(&url).send().await {
                if response.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        anyhow::bail!("worker never became healthy at {url}")
    }
}

impl Drop for ChroxyProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

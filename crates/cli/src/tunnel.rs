// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Public tunnel child: publishes the worker on a stable or ephemeral URL.
//!
//! The tunnel is an external child process whose log output is scanned for
//! the established URL. Ephemeral mode extracts a random URL by regex on the
//! standard tunnel domain; named mode derives the URL from the configured
//! hostname and infers readiness from registered-connection log lines.
//! Unexpected exits recover with bounded backoff; a changed URL after
//! recovery is announced so the supervisor can re-print artifacts.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::TunnelMode;
use crate::spawn::{send_signal, ChildSpec, ExitStatus, Spawner};

/// How long the first URL may take before startup fails.
pub const FIRST_URL_TIMEOUT: Duration = Duration::from_secs(30);

/// Recovery backoff per attempt; exhausting it gives up.
pub const RECOVERY_BACKOFF: [Duration; 3] =
    [Duration::from_secs(3), Duration::from_secs(6), Duration::from_secs(12)];

/// Ephemeral tunnel URLs match the standard quick-tunnel domain.
pub const EPHEMERAL_URL_PATTERN: &str = r"https://[a-z0-9-]+\.trycloudflare\.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    Lost,
    Recovering { attempt: u32 },
    Recovered { url: String },
    Failed,
    UrlChanged { old_url: String, new_url: String },
}

pub struct Tunnel {
    mode: TunnelMode,
    port: u16,
    tunnel_bin: String,
    spawner: Arc<dyn Spawner>,
    event_tx: broadcast::Sender<TunnelEvent>,
    current_url: RwLock<String>,
    child_pid: Mutex<Option<u32>>,
    /// Intentional shutdown suppresses recovery.
    stopping: CancellationToken,
}

impl Tunnel {
    pub fn new(mode: TunnelMode, port: u16, spawner: Arc<dyn Spawner>) -> Arc<Self> {
        Self::with_bin(mode, port, spawner, "cloudflared")
    }

    /// As [`Tunnel::new`] with an explicit tunnel binary.
    pub fn with_bin(
        mode: TunnelMode,
        port: u16,
        spawner: Arc<dyn Spawner>,
        bin: impl Into<String>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(32);
        Arc::new(Self {
            mode,
            port,
            tunnel_bin: bin.into(),
            spawner,
            event_tx,
            current_url: RwLock::new(String::new()),
            child_pid: Mutex::new(None),
            stopping: CancellationToken::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.event_tx.subscribe()
    }

    pub fn current_url(&self) -> String {
        self.current_url.read().clone()
    }

    /// Start the tunnel child and wait for it to become routable.
    ///
    /// Fails if the child exits before producing a URL or the first URL does
    /// not appear within [`FIRST_URL_TIMEOUT`]. Spawns the recovery monitor
    /// on success.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<String> {
        let (url, lines, exit_rx) = self.launch().await?;
        *self.current_url.write() = url.clone();
        info!(url = %url, "tunnel established");

        let tunnel = Arc::clone(self);
        tokio::spawn(tunnel.monitor(lines, exit_rx));
        Ok(url)
    }

    /// Stop intentionally; recovery stays quiet.
    pub fn stop(&self) {
        self.stopping.cancel();
        if let Some(pid) = self.child_pid.lock().take() {
            send_signal(pid, nix::sys::signal::Signal::SIGTERM);
        }
    }

    /// Spawn one tunnel child and wait for its URL.
    async fn launch(
        &self,
    ) -> anyhow::Result<(String, mpsc::Receiver<String>, oneshot::Receiver<ExitStatus>)> {
        let spec = match self.mode {
            TunnelMode::Quick => ChildSpec::new(&self.tunnel_bin)
                .arg("tunnel")
                .arg("--url")
                .arg(format!("http://localhost:{}", self.port)),
            TunnelMode::Named { .. } => {
                ChildSpec::new(&self.tunnel_bin).arg("tunnel").arg("run")
            }
            TunnelMode::None => anyhow::bail!("tunnel disabled"),
        };
        let mut handle = self.spawner.spawn(&spec)?;
        *self.child_pid.lock() = handle.pid;

        let url_re = Regex::new(EPHEMERAL_URL_PATTERN)?;
        let deadline = tokio::time::Instant::now() + FIRST_URL_TIMEOUT;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    anyhow::bail!("tunnel produced no URL within {}s", FIRST_URL_TIMEOUT.as_secs());
                }
                status = &mut handle.exit_rx => {
                    anyhow::bail!("tunnel child exited before publishing a URL: {status:?}");
                }
                line = handle.lines.recv() => {
                    let Some(line) = line else {
                        anyhow::bail!("tunnel output closed before publishing a URL");
                    };
                    if let Some(url) = self.extract_url(&url_re, &line) {
                        return Ok((url, handle.lines, handle.exit_rx));
                    }
                }
            }
        }
    }

    fn extract_url(&self, url_re: &Regex, line: &str) -> Option<String> {
        match self.mode {
            TunnelMode::Quick => url_re.find(line).map(|m| m.as_str().to_owned()),
            TunnelMode::Named { ref hostname } => {
                // Readiness only; the URL itself is static.
                line.contains("Registered tunnel connection")
                    .then(|| format!("https://{hostname}"))
            }
            TunnelMode::None => None,
        }
    }

    /// Watch the child; recover on unexpected exit.
    async fn monitor(
        self: Arc<Self>,
        mut lines: mpsc::Receiver<String>,
        mut exit_rx: oneshot::Receiver<ExitStatus>,
    ) {
        loop {
            // Drain logs until the child exits.
            loop {
                tokio::select! {
                    _ = self.stopping.cancelled() => return,
                    _ = &mut exit_rx => break,
                    line = lines.recv() => {
                        if line.is_none() {
                            // Logs closed; wait for the exit notification.
                            let _ = (&mut exit_rx).await;
                            break;
                        }
                    }
                }
            }

            if self.stopping.is_cancelled() {
                return;
            }
            warn!("tunnel child exited unexpectedly");
            let _ = self.event_tx.send(TunnelEvent::Lost);

            let old_url = self.current_url();
            let mut recovered = None;
            for (i, delay) in RECOVERY_BACKOFF.iter().enumerate() {
                let attempt = (i + 1) as u32;
                let _ = self.event_tx.send(TunnelEvent::Recovering { attempt });
                tokio::select! {
                    _ = self.stopping.cancelled() => return,
                    _ = tokio::time::sleep(*delay) => {}
                }
                match self.launch().await {
                    Ok((url, new_lines, new_exit)) => {
                        recovered = Some((url, new_lines, new_exit));
                        break;
                    }
                    Err(e) => {
                        warn!(attempt, err = %e, "tunnel recovery attempt failed");
                    }
                }
            }

            let Some((url, new_lines, new_exit)) = recovered else {
                // The local port keeps working but is no longer routable.
                warn!("tunnel recovery exhausted; continuing without public URL");
                let _ = self.event_tx.send(TunnelEvent::Failed);
                return;
            };

            *self.current_url.write() = url.clone();
            let _ = self.event_tx.send(TunnelEvent::Recovered { url: url.clone() });
            if matches!(self.mode, TunnelMode::Quick) && url != old_url && !old_url.is_empty() {
                let _ = self
                    .event_tx
                    .send(TunnelEvent::UrlChanged { old_url, new_url: url });
            }
            lines = new_lines;
            exit_rx = new_exit;
        }
    }
}

#[cfg(test)]
#[path = "tunnel_tests.rs"]
mod tests;

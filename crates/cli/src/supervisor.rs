// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Supervisor: owns the tunnel, runs the worker as a restartable child.
//!
//! The worker is forked from the same binary with `CHROXY_SUPERVISED=1` and
//! the tunnel disabled (the supervisor owns the public side). Control
//! messages cross the worker's stdio as one-line JSON: the worker announces
//! `ready` and answers `drain` with `drain_complete`. While the worker is
//! down, a minimal standby server holds the listen port so remote clients
//! can tell "restarting" from "dead".

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{deploy_marker_path, known_good_ref_path, pid_file_path, Settings};
use crate::spawn::{terminate_with_grace, ChildSpec, Exec, ExitStatus, Spawner};
use crate::tunnel::{Tunnel, TunnelEvent};

/// Restart delays after successive worker crashes; the last entry repeats.
pub const RESTART_BACKOFF_SECS: [u64; 10] = [2, 2, 3, 3, 5, 5, 8, 8, 10, 10];

/// Worker restarts tolerated before the supervisor gives up.
pub const DEFAULT_MAX_RESTARTS: u32 = 10;

/// How long a drain may take before the worker is terminated anyway.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace between SIGTERM and SIGKILL on the worker.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Worker exits within this window after a deploy marker count as
/// deploy-induced.
pub const DEPLOY_WINDOW: Duration = Duration::from_secs(60);

/// Deploy-window exits that trigger a rollback.
pub const DEPLOY_CRASH_LIMIT: u32 = 3;

/// Standby bind retry interval while the port is transiently held.
pub const STANDBY_RETRY: Duration = Duration::from_millis(500);

/// Supervisor's view of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    Spawned,
    Ready,
    Draining,
    Exited,
    Backoff,
    GivingUp,
    Shutdown,
}

/// Counters surfaced in standby health responses and `/health`.
pub struct SupervisorMetrics {
    pub started_at: Instant,
    pub worker_started_at: Mutex<Option<Instant>>,
    pub restart_count: AtomicU32,
    pub last_exit: Mutex<Option<ExitStatus>>,
}

impl SupervisorMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started_at: Instant::now(),
            worker_started_at: Mutex::new(None),
            restart_count: AtomicU32::new(0),
            last_exit: Mutex::new(None),
        })
    }

    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "supervisorUptime": self.started_at.elapsed().as_secs(),
            "workerUptime": self.worker_started_at.lock().map(|t| t.elapsed().as_secs()),
            "restartCount": self.restart_count.load(Ordering::Relaxed),
            "lastExit": self.last_exit.lock().map(|e| json!({
                "code": e.code,
                "signal": e.signal,
            })),
        })
    }
}

struct WorkerHandle {
    pid: Option<u32>,
    stdin_tx: mpsc::Sender<String>,
    lines: mpsc::Receiver<String>,
    exit_rx: oneshot::Receiver<ExitStatus>,
}

pub struct Supervisor {
    settings: Settings,
    /// How to launch the worker; tests inject a scripted child.
    worker_spec: ChildSpec,
    tunnel: Option<Arc<Tunnel>>,
    spawner: Arc<dyn Spawner>,
    exec: Arc<dyn Exec>,
    metrics: Arc<SupervisorMetrics>,
    max_restarts: u32,
    state: WorkerState,
    standby_cancel: Option<CancellationToken>,
    deploy_exit_count: u32,
}

impl Supervisor {
    pub fn new(
        settings: Settings,
        worker_spec: ChildSpec,
        tunnel: Option<Arc<Tunnel>>,
        spawner: Arc<dyn Spawner>,
        exec: Arc<dyn Exec>,
    ) -> Self {
        Self {
            settings,
            worker_spec,
            tunnel,
            spawner,
            exec,
            metrics: SupervisorMetrics::new(),
            max_restarts: DEFAULT_MAX_RESTARTS,
            state: WorkerState::Init,
            standby_cancel: None,
            deploy_exit_count: 0,
        }
    }

    pub fn metrics(&self) -> Arc<SupervisorMetrics> {
        Arc::clone(&self.metrics)
    }

    #[cfg(test)]
    pub fn with_max_restarts(mut self, n: u32) -> Self {
        self.max_restarts = n;
        self
    }

    /// Run until shutdown or the restart ceiling is exceeded.
    pub async fn run(mut self) -> anyhow::Result<()> {
        if let Some(ref tunnel) = self.tunnel {
            let url = tunnel.start().await?;
            print_artifacts(&url, self.settings.token.as_deref());
        }
        self.write_pid_file();

        let mut sigusr2 =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined2())?;
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        let mut tunnel_events = self.tunnel.as_ref().map(|t| t.subscribe());

        let mut restarts: u32 = 0;

        'supervise: loop {
            self.start_standby();
            let mut worker = match self.spawn_worker() {
                Ok(w) => w,
                Err(e) => {
                    error!(err = %e, "worker spawn failed");
                    self.state = WorkerState::Exited;
                    *self.metrics.last_exit.lock() =
                        Some(ExitStatus { code: None, signal: None });
                    if self.after_exit(&mut restarts).await {
                        continue 'supervise;
                    }
                    return Err(anyhow::anyhow!("worker restart ceiling exceeded"));
                }
            };

            let mut draining = false;
            let mut drain_deadline: Option<tokio::time::Instant> = None;

            // Worker-alive loop.
            let outcome = loop {
                let far = tokio::time::Instant::now() + Duration::from_secs(86_400);
                let drain_at = drain_deadline.unwrap_or(far);

                tokio::select! {
                    line = worker.lines.recv() => match line {
                        Some(line) => match parse_control(&line) {
                            Some(ControlMsg::Ready) => {
                                info!("worker reports ready");
                                self.state = WorkerState::Ready;
                                *self.metrics.worker_started_at.lock() = Some(Instant::now());
                                self.stop_standby();
                            }
                            Some(ControlMsg::DrainComplete) => {
                                if draining {
                                    info!("drain complete, terminating worker");
                                    if let Some(pid) = worker.pid {
                                        terminate_with_grace(pid, KILL_GRACE).await;
                                    }
                                }
                            }
                            None => {
                                // Worker log passthrough.
                                println!("{line}");
                            }
                        },
                        None => {}
                    },

                    status = &mut worker.exit_rx => {
                        break LoopOutcome::Exited(status.ok());
                    }

                    _ = tokio::time::sleep_until(drain_at), if drain_deadline.is_some() => {
                        warn!("drain timed out, force-terminating worker");
                        drain_deadline = None;
                        if let Some(pid) = worker.pid {
                            terminate_with_grace(pid, KILL_GRACE).await;
                        }
                    }

                    _ = sigusr2.recv() => {
                        if draining || self.state != WorkerState::Ready {
                            info!("restart request ignored (state {:?})", self.state);
                            continue;
                        }
                        info!("restart requested, draining worker");
                        draining = true;
                        self.state = WorkerState::Draining;
                        drain_deadline =
                            Some(tokio::time::Instant::now() + DRAIN_TIMEOUT);
                        let msg = json!({
                            "type": "drain",
                            "timeout_secs": DRAIN_TIMEOUT.as_secs(),
                        });
                        let _ = worker.stdin_tx.send(msg.to_string()).await;
                    }

                    _ = sigterm.recv() => break LoopOutcome::ShutdownRequested,
                    _ = sigint.recv() => break LoopOutcome::ShutdownRequested,

                    event = recv_tunnel(&mut tunnel_events) => {
                        self.handle_tunnel_event(event);
                    }
                }
            };

            let status = match outcome {
                LoopOutcome::ShutdownRequested => {
                    self.shutdown(worker).await;
                    break 'supervise;
                }
                LoopOutcome::Exited(status) => {
                    status.unwrap_or(ExitStatus { code: None, signal: None })
                }
            };
            info!(code = ?status.code, signal = ?status.signal, "worker exited");
            self.state = WorkerState::Exited;
            *self.metrics.last_exit.lock() = Some(status);
            *self.metrics.worker_started_at.lock() = None;

            if draining {
                // Requested restart: no crash backoff.
                self.metrics.restart_count.fetch_add(1, Ordering::Relaxed);
                continue 'supervise;
            }
            if !self.after_exit(&mut restarts).await {
                self.state = WorkerState::GivingUp;
                self.stop_tunnel();
                self.remove_pid_file();
                return Err(anyhow::anyhow!(
                    "worker crashed {restarts} times, giving up"
                ));
            }
        }

        self.state = WorkerState::Shutdown;
        self.stop_tunnel();
        self.remove_pid_file();
        Ok(())
    }

    /// Crash bookkeeping: deploy rollback, ceiling, backoff. Returns false
    /// when the ceiling is exceeded.
    async fn after_exit(&mut self, restarts: &mut u32) -> bool {
        self.maybe_rollback().await;

        *restarts += 1;
        self.metrics.restart_count.fetch_add(1, Ordering::Relaxed);
        if *restarts > self.max_restarts {
            return false;
        }
        self.state = WorkerState::Backoff;
        let idx = (*restarts as usize - 1).min(RESTART_BACKOFF_SECS.len() - 1);
        let delay = Duration::from_secs(RESTART_BACKOFF_SECS[idx]);
        info!(attempt = *restarts, delay_secs = delay.as_secs(), "restarting worker");
        tokio::time::sleep(delay).await;
        true
    }

    /// Count exits inside the deploy window; on the third, roll the source
    /// tree back to the known-good commit. Rollback failure is bypassed.
    async fn maybe_rollback(&mut self) {
        let marker_age = deploy_marker_path()
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| SystemTime::now().duration_since(t).ok());
        let in_window = marker_age.map(|age| age <= DEPLOY_WINDOW).unwrap_or(false);
        if !in_window {
            self.deploy_exit_count = 0;
            return;
        }

        self.deploy_exit_count += 1;
        if self.deploy_exit_count < DEPLOY_CRASH_LIMIT {
            return;
        }
        self.deploy_exit_count = 0;

        let known_good = match std::fs::read_to_string(known_good_ref_path()) {
            Ok(r) => r.trim().to_owned(),
            Err(e) => {
                warn!(err = %e, "no known-good ref, skipping rollback");
                return;
            }
        };
        warn!(known_good = %known_good, "deploy crash loop detected, rolling back");
        let args = vec!["checkout".to_owned(), known_good];
        match self.exec.output("git", &args).await {
            Ok(out) if out.status.success() => {
                info!("rollback complete");
            }
            Ok(out) => {
                error!(
                    stderr = %String::from_utf8_lossy(&out.stderr),
                    "rollback failed, continuing normal restart policy"
                );
            }
            Err(e) => {
                error!(err = %e, "rollback failed, continuing normal restart policy");
            }
        }
    }

    fn spawn_worker(&mut self) -> anyhow::Result<WorkerHandle> {
        let handle = self.spawner.spawn(&self.worker_spec)?;
        self.state = WorkerState::Spawned;
        info!(pid = ?handle.pid, "worker spawned");
        Ok(WorkerHandle {
            pid: handle.pid,
            stdin_tx: handle.stdin_tx,
            lines: handle.lines,
            exit_rx: handle.exit_rx,
        })
    }

    /// Graceful shutdown: drain, wait, terminate.
    async fn shutdown(&mut self, mut worker: WorkerHandle) {
        info!("shutting down");
        let msg = json!({"type": "drain", "timeout_secs": DRAIN_TIMEOUT.as_secs()});
        let _ = worker.stdin_tx.send(msg.to_string()).await;

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                status = &mut worker.exit_rx => {
                    *self.metrics.last_exit.lock() = status.ok();
                    return;
                }
                line = worker.lines.recv() => {
                    if let Some(line) = line {
                        if matches!(parse_control(&line), Some(ControlMsg::DrainComplete)) {
                            break;
                        }
                    }
                }
            }
        }
        if let Some(pid) = worker.pid {
            terminate_with_grace(pid, KILL_GRACE).await;
        }
    }

    /// Bind the listen port with the restarting responder. Retries every
    /// 500 ms while the port is still held by the exiting worker.
    fn start_standby(&mut self) {
        if self.standby_cancel.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        self.standby_cancel = Some(cancel.clone());
        let port = self.settings.port;
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(run_standby(port, metrics, cancel));
    }

    fn stop_standby(&mut self) {
        if let Some(cancel) = self.standby_cancel.take() {
            cancel.cancel();
        }
    }

    fn stop_tunnel(&self) {
        if let Some(ref tunnel) = self.tunnel {
            tunnel.stop();
        }
    }

    fn handle_tunnel_event(&self, event: Option<TunnelEvent>) {
        match event {
            Some(TunnelEvent::UrlChanged { old_url, new_url }) => {
                info!(old = %old_url, new = %new_url, "tunnel URL changed");
                print_artifacts(&new_url, self.settings.token.as_deref());
            }
            Some(TunnelEvent::Recovered { url }) => {
                info!(url = %url, "tunnel recovered");
            }
            Some(TunnelEvent::Lost) => warn!("tunnel lost, recovering"),
            Some(TunnelEvent::Recovering { attempt }) => {
                info!(attempt, "tunnel recovery attempt");
            }
            Some(TunnelEvent::Failed) => {
                error!("tunnel recovery failed; worker stays local-only");
            }
            None => {}
        }
    }

    fn write_pid_file(&self) {
        let path = pid_file_path();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&path, std::process::id().to_string()) {
            // Out-of-band control is degraded but the supervisor still runs.
            warn!(err = %e, path = %path.display(), "failed to write pid file");
        }
    }

    fn remove_pid_file(&self) {
        let _ = std::fs::remove_file(pid_file_path());
    }
}

enum LoopOutcome {
    Exited(Option<ExitStatus>),
    ShutdownRequested,
}

enum ControlMsg {
    Ready,
    DrainComplete,
}

/// Worker stdout lines that are not control JSON pass through as logs.
fn parse_control(line: &str) -> Option<ControlMsg> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    match value.get("type").and_then(|v| v.as_str()) {
        Some("ready") => Some(ControlMsg::Ready),
        Some("drain_complete") => Some(ControlMsg::DrainComplete),
        _ => None,
    }
}

async fn recv_tunnel(
    rx: &mut Option<tokio::sync::broadcast::Receiver<TunnelEvent>>,
) -> Option<TunnelEvent> {
    match rx {
        Some(rx) => rx.recv().await.ok(),
        None => std::future::pending().await,
    }
}

/// Minimal standby responder on the worker port.
async fn run_standby(port: u16, metrics: Arc<SupervisorMetrics>, cancel: CancellationToken) {
    use axum::routing::get;

    let app = axum::Router::new()
        .route("/", get(standby_health))
        .route("/health", get(standby_health))
        .with_state(metrics);

    loop {
        if cancel.is_cancelled() {
            return;
        }
        match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                let shutdown = cancel.clone();
                let _ = axum::serve(listener, app.clone())
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await;
                return;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                // The exiting worker may still hold the port.
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(STANDBY_RETRY) => {}
                }
            }
            Err(e) => {
                warn!(err = %e, "standby bind failed");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(STANDBY_RETRY) => {}
                }
            }
        }
    }
}

async fn standby_health(
    axum::extract::State(metrics): axum::extract::State<Arc<SupervisorMetrics>>,
) -> axum::Json<serde_json::Value> {
    axum::Json(json!({
        "status": "restarting",
        "metrics": metrics.snapshot(),
    }))
}

/// Print the connection artifacts a client needs.
fn print_artifacts(url: &str, token: Option<&str>) {
    println!("chroxy is reachable at: {url}");
    match token {
        Some(token) if token.len() > 8 => {
            let prefix: String = token.chars().take(8).collect();
            println!("token: {prefix}…");
        }
        Some(_) => println!("token: (configured)"),
        None => println!("auth: disabled"),
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;

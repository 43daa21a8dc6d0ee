// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: builders, scripted children, fake engines.
//!
//! The Agent child and the tunnel child are the only non-determinism sources
//! in the core; tests replace both through [`FakeSpawner`] and drive them by
//! hand.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Output;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::{Settings, TunnelMode};
use crate::event::SessionEventEnvelope;
use crate::run::build_store;
use crate::session::sdk::{QueryCallbacks, QueryEngine, QueryRequest, SdkDecision};
use crate::spawn::{ChildSpec, Exec, ExitStatus, ProcessHandle, Spawner};
use crate::transport::state::Store;

/// Extension trait to convert any `Display` error into `anyhow::Error`.
pub trait AnyhowExt<T> {
    fn anyhow(self) -> anyhow::Result<T>;
}

impl<T, E: std::fmt::Display> AnyhowExt<T> for Result<T, E> {
    fn anyhow(self) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{e}"))
    }
}

/// One spawned fake child, driven by the test.
pub struct FakeChild {
    pub spec: ChildSpec,
    line_tx: mpsc::Sender<String>,
    exit_tx: Mutex<Option<oneshot::Sender<ExitStatus>>>,
    stdin: Arc<Mutex<Vec<String>>>,
}

impl FakeChild {
    /// Push one stdout line into the child's owner.
    pub async fn emit_line(&self, line: impl Into<String>) {
        let _ = self.line_tx.send(line.into()).await;
    }

    /// Push one stdout JSON entry.
    pub async fn emit(&self, value: &Value) {
        self.emit_line(value.to_string()).await;
    }

    /// Simulate process exit.
    pub fn exit(&self, status: ExitStatus) {
        if let Some(tx) = self.exit_tx.lock().take() {
            let _ = tx.send(status);
        }
    }

    /// Lines the owner wrote to the child's stdin so far.
    pub fn stdin_lines(&self) -> Vec<String> {
        self.stdin.lock().clone()
    }
}

/// Spawner whose children are inert until the test drives them.
#[derive(Default)]
pub struct FakeSpawner {
    children: Mutex<Vec<Arc<FakeChild>>>,
    /// Lines delivered immediately on each spawn, per spawn order.
    scripts: Mutex<VecDeque<Vec<String>>>,
    fail_next: AtomicU32,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue stdout lines for the next spawned child.
    pub fn script_lines(&self, lines: Vec<String>) {
        self.scripts.lock().push_back(lines);
    }

    /// Make the next `n` spawns fail.
    pub fn fail_spawns(&self, n: u32) {
        self.fail_next.store(n, Ordering::Release);
    }

    pub fn children(&self) -> Vec<Arc<FakeChild>> {
        self.children.lock().clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.children.lock().len()
    }

    /// The most recently spawned child.
    pub fn last_child(&self) -> Option<Arc<FakeChild>> {
        self.children.lock().last().cloned()
    }

    /// Wait until at least `n` children have been spawned.
    pub async fn wait_for_spawns(&self, n: usize) -> anyhow::Result<()> {
        for _ in 0..600 {
            if self.spawn_count() >= n {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        anyhow::bail!("timed out waiting for {n} spawns (got {})", self.spawn_count())
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self, spec: &ChildSpec) -> anyhow::Result<ProcessHandle> {
        let fail = self.fail_next.load(Ordering::Acquire);
        if fail > 0 {
            self.fail_next.store(fail - 1, Ordering::Release);
            anyhow::bail!("scripted spawn failure");
        }

        let (line_tx, lines) = mpsc::channel(256);
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(32);
        let (exit_tx, exit_rx) = oneshot::channel();
        let stdin = Arc::new(Mutex::new(Vec::new()));

        {
            let stdin = Arc::clone(&stdin);
            tokio::spawn(async move {
                while let Some(line) = stdin_rx.recv().await {
                    stdin.lock().push(line);
                }
            });
        }

        if let Some(script) = self.scripts.lock().pop_front() {
            let line_tx = line_tx.clone();
            tokio::spawn(async move {
                for line in script {
                    if line_tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }

        let child = Arc::new(FakeChild {
            spec: spec.clone(),
            line_tx,
            exit_tx: Mutex::new(Some(exit_tx)),
            stdin,
        });
        self.children.lock().push(child);

        Ok(ProcessHandle { pid: None, stdin_tx, lines, exit_rx })
    }
}

/// Exec fake returning scripted outputs and recording every call.
#[derive(Default)]
pub struct FakeExec {
    outputs: Mutex<VecDeque<(i32, String, String)>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeExec {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue an `(exit_code, stdout, stderr)` reply for the next call.
    pub fn script_output(&self, code: i32, stdout: &str, stderr: &str) {
        self.outputs
            .lock()
            .push_back((code, stdout.to_owned(), stderr.to_owned()));
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().clone()
    }
}

impl Exec for FakeExec {
    fn output(
        &self,
        program: &str,
        args: &[String],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Output>> + Send>> {
        use std::os::unix::process::ExitStatusExt;

        self.calls.lock().push((program.to_owned(), args.to_vec()));
        let (code, stdout, stderr) = self
            .outputs
            .lock()
            .pop_front()
            .unwrap_or((0, String::new(), String::new()));
        Box::pin(async move {
            Ok(Output {
                status: std::process::ExitStatus::from_raw(code << 8),
                stdout: stdout.into_bytes(),
                stderr: stderr.into_bytes(),
            })
        })
    }
}

/// Query engine that streams scripted entries and records requests.
///
/// Entries of the form `{"__permission__": {"tool": ..., "input": ...}}`
/// invoke the permission callback in place; the decision is recorded.
#[derive(Default)]
pub struct ScriptedEngine {
    turns: Mutex<VecDeque<Vec<Value>>>,
    pub requests: Mutex<Vec<QueryRequest>>,
    pub decisions: Arc<Mutex<Vec<SdkDecision>>>,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_turn(&self, entries: Vec<Value>) {
        self.turns.lock().push_back(entries);
    }
}

impl QueryEngine for ScriptedEngine {
    fn query(
        &self,
        request: QueryRequest,
        callbacks: QueryCallbacks,
    ) -> Pin<Box<dyn futures_util::Stream<Item = Value> + Send>> {
        self.requests.lock().push(request);
        let entries = self.turns.lock().pop_front().unwrap_or_default();
        let decisions = Arc::clone(&self.decisions);

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for entry in entries {
                // Hold marker: keep the turn open until the query is dropped.
                if entry.get("__hold__").is_some() {
                    tx.closed().await;
                    return;
                }
                if let Some(perm) = entry.get("__permission__") {
                    let tool = perm
                        .get("tool")
                        .and_then(|v| v.as_str())
                        .unwrap_or("Bash")
                        .to_owned();
                    let input = perm.get("input").cloned().unwrap_or(Value::Null);
                    let decision = (callbacks.on_permission)(tool, input).await;
                    decisions.lock().push(decision);
                    continue;
                }
                if tx.send(entry).await.is_err() {
                    return;
                }
            }
        });
        Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))
    }
}

/// Settings with test-friendly defaults (no tunnel, temp cwd).
pub fn test_settings(token: Option<&str>) -> Settings {
    Settings {
        port: 0,
        token: token.map(str::to_owned),
        tunnel: TunnelMode::None,
        no_supervisor: true,
        supervised: false,
        model: "sonnet".to_owned(),
        cwd: std::env::temp_dir(),
        allowed_tools: vec![],
        resume: None,
        shell_cmd: "claude".to_owned(),
        max_sessions: 5,
        discovery_interval_secs: 0,
        verbose: false,
        log_format: "text".to_owned(),
    }
}

/// Built test store plus the fakes wired into it.
pub struct TestCtx {
    pub store: Arc<Store>,
    pub spawner: Arc<FakeSpawner>,
    pub exec: Arc<FakeExec>,
}

/// Build a store around fakes. No sessions are created.
pub fn test_store(token: Option<&str>) -> TestCtx {
    let spawner = FakeSpawner::new();
    let exec = FakeExec::new();
    let store = build_store(
        test_settings(token),
        Arc::clone(&spawner) as Arc<dyn Spawner>,
        Arc::clone(&exec) as Arc<dyn Exec>,
        None,
    );
    TestCtx { store, spawner, exec }
}

/// Collects envelopes from a session-event bus with a deadline.
pub struct EventCollector {
    rx: broadcast::Receiver<SessionEventEnvelope>,
}

impl EventCollector {
    pub fn new(rx: broadcast::Receiver<SessionEventEnvelope>) -> Self {
        Self { rx }
    }

    /// Next envelope, or an error after one second.
    pub async fn next(&mut self) -> anyhow::Result<SessionEventEnvelope> {
        tokio::time::timeout(std::time::Duration::from_secs(1), self.rx.recv())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for event"))?
            .anyhow()
    }

    /// Skip events until `pred` matches, or fail after `max` events.
    pub async fn next_matching(
        &mut self,
        max: usize,
        pred: impl Fn(&SessionEventEnvelope) -> bool,
    ) -> anyhow::Result<SessionEventEnvelope> {
        for _ in 0..max {
            let envelope = self.next().await?;
            if pred(&envelope) {
                return Ok(envelope);
            }
        }
        anyhow::bail!("no matching event within {max} events")
    }

    pub fn try_drain(&mut self) -> Vec<SessionEventEnvelope> {
        let mut out = vec![];
        while let Ok(e) = self.rx.try_recv() {
            out.push(e);
        }
        out
    }
}

/// Temp dir pointed at by `CHROXY_HOME` for config/state tests.
///
/// Not parallel-safe; tests using it are marked `#[serial_test::serial]`.
pub fn chroxy_home_guard() -> anyhow::Result<(tempfile::TempDir, PathBuf)> {
    let dir = tempfile::tempdir()?;
    std::env::set_var("CHROXY_HOME", dir.path());
    let path = dir.path().to_path_buf();
    Ok((dir, path))
}

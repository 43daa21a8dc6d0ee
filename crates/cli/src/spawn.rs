// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child process seams.
//!
//! The Agent child, the tunnel child, and the supervised worker are the only
//! non-determinism sources in the core, so all of them are spawned through
//! the [`Spawner`] trait. Unit tests inject scripted fakes; production uses
//! [`TokioSpawner`], which pipes stdio line-by-line.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Output;
use std::time::Duration;

use anyhow::Context;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

/// Exit status of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// What to spawn: program, args, working directory, extra environment.
#[derive(Debug, Clone, Default)]
pub struct ChildSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ChildSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), ..Self::default() }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn args<I: IntoIterator<Item = S>, S: Into<String>>(mut self, args: I) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.env.push((key.into(), val.into()));
        self
    }
}

/// A running line-oriented child.
///
/// `lines` carries stdout lines (and, for the tunnel child, stderr lines);
/// `stdin_tx` accepts lines to write (a newline is appended); `exit_rx`
/// resolves once when the child exits. Dropping the handle does not kill the
/// child — callers signal the pid explicitly.
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub stdin_tx: mpsc::Sender<String>,
    pub lines: mpsc::Receiver<String>,
    pub exit_rx: oneshot::Receiver<ExitStatus>,
}

/// Spawns line-oriented children.
pub trait Spawner: Send + Sync {
    fn spawn(&self, spec: &ChildSpec) -> anyhow::Result<ProcessHandle>;
}

/// Runs one-shot commands to completion (tmux queries, rollback).
pub trait Exec: Send + Sync {
    fn output(
        &self,
        program: &str,
        args: &[String],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Output>> + Send>>;
}

/// Default timeout for one-shot helper commands.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(10);

/// Production spawner backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

impl Spawner for TokioSpawner {
    fn spawn(&self, spec: &ChildSpec) -> anyhow::Result<ProcessHandle> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);
        if let Some(ref dir) = spec.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().with_context(|| format!("spawn {}", spec.program))?;
        let pid = child.id();

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(32);
        let (line_tx, lines) = mpsc::channel::<String>(256);
        let (exit_tx, exit_rx) = oneshot::channel();

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                while let Some(line) = stdin_rx.recv().await {
                    if stdin.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdin.write_all(b"\n").await.is_err() {
                        break;
                    }
                    if stdin.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        if let Some(stdout) = child.stdout.take() {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if line_tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }

        tokio::spawn(async move {
            let status = child.wait().await;
            let exit = match status {
                Ok(s) => ExitStatus {
                    code: s.code(),
                    signal: {
                        use std::os::unix::process::ExitStatusExt;
                        s.signal()
                    },
                },
                Err(_) => ExitStatus { code: None, signal: None },
            };
            let _ = exit_tx.send(exit);
        });

        Ok(ProcessHandle { pid, stdin_tx, lines, exit_rx })
    }
}

impl Exec for TokioSpawner {
    fn output(
        &self,
        program: &str,
        args: &[String],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Output>> + Send>> {
        let program = program.to_owned();
        let args = args.to_vec();
        Box::pin(async move {
            let fut = tokio::process::Command::new(&program).args(&args).output();
            match tokio::time::timeout(EXEC_TIMEOUT, fut).await {
                Ok(Ok(out)) => Ok(out),
                Ok(Err(e)) => Err(e).with_context(|| format!("run {program}")),
                Err(_) => anyhow::bail!("{program} timed out after {}s", EXEC_TIMEOUT.as_secs()),
            }
        })
    }
}

/// Whether a process with the given pid is alive.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    signal::kill(Pid::from_raw(pid_i32), None).is_ok()
}

/// Deliver a signal to a pid, ignoring delivery errors (already-exited).
pub fn send_signal(pid: u32, sig: Signal) {
    if let Ok(pid_i32) = i32::try_from(pid) {
        let _ = signal::kill(Pid::from_raw(pid_i32), sig);
    }
}

/// Terminate a child: SIGTERM, wait up to `grace`, then SIGKILL.
///
/// Liveness is probed rather than waited on so the caller keeps ownership of
/// the exit channel.
pub async fn terminate_with_grace(pid: u32, grace: Duration) {
    send_signal(pid, Signal::SIGTERM);
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !is_process_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if is_process_alive(pid) {
        send_signal(pid, Signal::SIGKILL);
    }
}

#[cfg(test)]
#[path = "spawn_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Headless session: a persistent Agent child in NDJSON request/response
//! mode.
//!
//! The child is long-lived: one NDJSON user message per turn on stdin,
//! structured events on stdout. A turn ends when the Agent emits `result`,
//! not when the process exits. Permission prompts from this variant arrive
//! out-of-process through the HTTP hook (see `transport::http`); the child
//! gets `CHROXY_PORT`/`CHROXY_TOKEN` in its environment for that.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::PermissionBroker;
use crate::error::ErrorCode;
use crate::event::SessionEvent;
use crate::session::stream::TurnNormalizer;
use crate::session::{PermissionMode, SessionCore, DESTROY_GRACE, RESTART_GRACE};
use crate::spawn::{terminate_with_grace, ChildSpec, ExitStatus, ProcessHandle, Spawner};

/// Hard per-turn ceiling; on expiry the child is kept for the next turn.
pub const TURN_TIMEOUT: Duration = Duration::from_secs(300);

/// Safety window after an interrupt before busy state is force-cleared.
pub const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

/// Respawn delays after an unintentional child exit.
pub const RESPAWN_BACKOFF: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(15),
];

/// Static launch parameters for the Agent child.
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    /// Command line used to launch the Agent (program plus leading args).
    pub shell_cmd: String,
    pub allowed_tools: Vec<String>,
    /// Upstream conversation to resume on first spawn.
    pub resume: Option<String>,
    /// Worker port, handed to the Agent's permission hook.
    pub hook_port: u16,
    /// Worker token, handed to the Agent's permission hook.
    pub hook_token: Option<String>,
}

enum Command {
    Send { text: String, reply: oneshot::Sender<Result<(), ErrorCode>> },
    Interrupt { reply: oneshot::Sender<Result<(), ErrorCode>> },
    SetModel { model: String, reply: oneshot::Sender<Result<bool, ErrorCode>> },
    SetPermissionMode { mode: PermissionMode, reply: oneshot::Sender<Result<bool, ErrorCode>> },
}

/// Handle owned by the session directory. The owner task holds all mutable
/// turn state; commands cross over an mpsc channel.
pub struct HeadlessSession {
    core: Arc<SessionCore>,
    broker: Arc<PermissionBroker>,
    cmd_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

impl HeadlessSession {
    pub fn spawn(
        core: Arc<SessionCore>,
        config: HeadlessConfig,
        spawner: Arc<dyn Spawner>,
        broker: Arc<PermissionBroker>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let worker = SessionLoop {
            core: Arc::clone(&core),
            config,
            spawner,
            broker: Arc::clone(&broker),
            normalizer: TurnNormalizer::new(),
            cmd_rx,
            cancel: cancel.clone(),
            child_pid: None,
            child_stdin: None,
            child_lines: None,
            child_exit: None,
            pending_prompt: None,
            respawn_attempts: 0,
            respawn_at: None,
            turn_deadline: None,
            interrupt_deadline: None,
            question_rx: None,
            question_tool_use_id: None,
            tearing_down: false,
            dead: false,
        };
        tokio::spawn(worker.run());
        Self { core, broker, cmd_tx, cancel }
    }

    pub fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, ErrorCode>>) -> Command,
    ) -> Result<T, ErrorCode> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx.send(build(reply_tx)).await.map_err(|_| ErrorCode::Internal)?;
        reply_rx.await.map_err(|_| ErrorCode::Internal)?
    }

    pub async fn send(&self, text: &str) -> Result<(), ErrorCode> {
        let text = text.to_owned();
        self.request(|reply| Command::Send { text, reply }).await
    }

    pub async fn interrupt(&self) -> Result<(), ErrorCode> {
        self.request(|reply| Command::Interrupt { reply }).await
    }

    pub async fn set_model(&self, model: &str) -> Result<bool, ErrorCode> {
        let model = model.to_owned();
        self.request(|reply| Command::SetModel { model, reply }).await
    }

    pub async fn set_permission_mode(&self, mode: PermissionMode) -> Result<bool, ErrorCode> {
        self.request(|reply| Command::SetPermissionMode { mode, reply }).await
    }

    /// The waiting question lives in the broker; resolving it wakes the owner
    /// task, which writes the follow-up user message mid-turn.
    pub async fn respond_to_question(&self, answer: &str) -> Result<(), ErrorCode> {
        if self.broker.respond_question_for_session(&self.core.id, answer) {
            Ok(())
        } else {
            Err(ErrorCode::BadRequest)
        }
    }

    pub async fn destroy(&self) {
        self.cancel.cancel();
    }
}

/// The owner task: single writer of all turn state.
struct SessionLoop {
    core: Arc<SessionCore>,
    config: HeadlessConfig,
    spawner: Arc<dyn Spawner>,
    broker: Arc<PermissionBroker>,
    normalizer: TurnNormalizer,
    cmd_rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,

    child_pid: Option<u32>,
    child_stdin: Option<mpsc::Sender<String>>,
    child_lines: Option<mpsc::Receiver<String>>,
    child_exit: Option<oneshot::Receiver<ExitStatus>>,

    /// At most one prompt may wait for the child to become ready.
    pending_prompt: Option<String>,
    respawn_attempts: u32,
    respawn_at: Option<tokio::time::Instant>,
    turn_deadline: Option<tokio::time::Instant>,
    interrupt_deadline: Option<tokio::time::Instant>,
    question_rx: Option<oneshot::Receiver<String>>,
    question_tool_use_id: Option<String>,
    /// Suppresses the auto-respawn path while a model/mode change replaces
    /// the child on purpose.
    tearing_down: bool,
    /// Respawn cap exceeded; the session stays addressable but inert.
    dead: bool,
}

impl SessionLoop {
    async fn run(mut self) {
        if let Err(e) = self.spawn_child() {
            warn!(session_id = %self.core.id, err = %e, "initial agent spawn failed");
            self.handle_child_gone();
        }

        loop {
            let far = tokio::time::Instant::now() + Duration::from_secs(86_400);
            let turn_at = self.turn_deadline.unwrap_or(far);
            let respawn_at = self.respawn_at.unwrap_or(far);
            let interrupt_at = self.interrupt_deadline.unwrap_or(far);

            tokio::select! {
                _ = self.cancel.cancelled() => break,

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },

                line = recv_or_pending(&mut self.child_lines) => match line {
                    Some(line) => self.handle_line(&line).await,
                    None => {
                        // stdout closed; the exit branch owns the aftermath.
                        self.child_lines = None;
                    }
                },

                status = exit_or_pending(&mut self.child_exit) => {
                    self.child_exit = None;
                    debug!(session_id = %self.core.id, ?status, "agent child exited");
                    self.handle_child_gone();
                }

                _ = tokio::time::sleep_until(turn_at), if self.turn_deadline.is_some() => {
                    self.handle_turn_timeout();
                }

                _ = tokio::time::sleep_until(respawn_at), if self.respawn_at.is_some() => {
                    self.respawn_at = None;
                    if let Err(e) = self.spawn_child() {
                        warn!(session_id = %self.core.id, err = %e, "agent respawn failed");
                        self.handle_child_gone();
                    }
                }

                _ = tokio::time::sleep_until(interrupt_at), if self.interrupt_deadline.is_some() => {
                    self.interrupt_deadline = None;
                    if self.core.is_busy() {
                        self.finish_turn_abnormally(None);
                    }
                }

                answer = question_or_pending(&mut self.question_rx) => {
                    self.question_rx = None;
                    if let (Some(answer), Some(tool_use_id)) = (answer, self.question_tool_use_id.take()) {
                        self.send_question_answer(&tool_use_id, &answer).await;
                    }
                }
            }
        }

        // Teardown: deny outstanding prompts, stop the child.
        self.broker.cancel_session(&self.core.id);
        if let Some(pid) = self.child_pid.take() {
            terminate_with_grace(pid, DESTROY_GRACE).await;
        }
    }

    fn spawn_child(&mut self) -> anyhow::Result<()> {
        let mut parts = self.config.shell_cmd.split_whitespace();
        let program = parts.next().unwrap_or("claude").to_owned();
        let mut spec = ChildSpec::new(program)
            .args(parts.map(str::to_owned))
            .args([
                "--input-format",
                "stream-json",
                "--output-format",
                "stream-json",
                "--include-partial-messages",
                "--verbose",
            ])
            .arg("--model")
            .arg(self.core.model.read().clone())
            .arg("--permission-mode")
            .arg(self.core.permission_mode.read().as_str())
            .cwd(&self.core.cwd)
            .env("CHROXY_PORT", self.config.hook_port.to_string());
        if let Some(ref token) = self.config.hook_token {
            spec = spec.env("CHROXY_TOKEN", token.clone());
        }
        if !self.config.allowed_tools.is_empty() {
            spec = spec.arg("--allowed-tools").arg(self.config.allowed_tools.join(","));
        }
        let resume = self
            .normalizer
            .upstream_id()
            .map(str::to_owned)
            .or_else(|| self.config.resume.clone());
        if let Some(resume) = resume {
            spec = spec.arg("--resume").arg(resume);
        }

        let ProcessHandle { pid, stdin_tx, lines, exit_rx } = self.spawner.spawn(&spec)?;
        info!(session_id = %self.core.id, pid, "agent child spawned");
        self.child_pid = pid;
        self.child_stdin = Some(stdin_tx);
        self.child_lines = Some(lines);
        self.child_exit = Some(exit_rx);
        self.tearing_down = false;
        Ok(())
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send { text, reply } => {
                let _ = reply.send(self.start_turn(text).await);
            }
            Command::Interrupt { reply } => {
                if self.core.is_busy() {
                    if let Some(pid) = self.child_pid {
                        crate::spawn::send_signal(pid, Signal::SIGINT);
                    }
                    self.interrupt_deadline =
                        Some(tokio::time::Instant::now() + INTERRUPT_GRACE);
                    let _ = reply.send(Ok(()));
                } else {
                    let _ = reply.send(Ok(()));
                }
            }
            Command::SetModel { model, reply } => {
                let _ = reply.send(self.change_settings(Some(model), None).await);
            }
            Command::SetPermissionMode { mode, reply } => {
                let _ = reply.send(self.change_settings(None, Some(mode)).await);
            }
        }
    }

    async fn start_turn(&mut self, text: String) -> Result<(), ErrorCode> {
        if self.dead {
            return Err(ErrorCode::NotReady);
        }
        if self.core.is_busy() {
            return Err(ErrorCode::AgentBusy);
        }
        if !self.core.ready.load(Ordering::Acquire) {
            // One prompt may wait out a respawn; a second is rejected.
            if self.pending_prompt.is_some() {
                return Err(ErrorCode::NotReady);
            }
            self.pending_prompt = Some(text);
            return Ok(());
        }
        self.dispatch_prompt(&text).await
    }

    async fn dispatch_prompt(&mut self, text: &str) -> Result<(), ErrorCode> {
        let Some(ref stdin) = self.child_stdin else {
            return Err(ErrorCode::NotReady);
        };
        let msg = serde_json::json!({
            "type": "user",
            "message": { "role": "user", "content": text },
        });
        stdin.send(msg.to_string()).await.map_err(|_| ErrorCode::NotReady)?;
        self.core.busy.store(true, Ordering::Release);
        self.turn_deadline = Some(tokio::time::Instant::now() + TURN_TIMEOUT);
        Ok(())
    }

    async fn send_question_answer(&mut self, tool_use_id: &str, answer: &str) {
        let Some(ref stdin) = self.child_stdin else {
            return;
        };
        let msg = serde_json::json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": answer,
                }],
            },
        });
        let _ = stdin.send(msg.to_string()).await;
    }

    async fn handle_line(&mut self, line: &str) {
        let Ok(json) = serde_json::from_str::<serde_json::Value>(line) else {
            // Non-JSON noise on stdout is dropped.
            return;
        };
        let ingest = self.normalizer.ingest(&json);

        for event in ingest.events {
            self.core.emit(event);
        }
        if ingest.ready {
            self.core.ready.store(true, Ordering::Release);
            self.respawn_attempts = 0;
            *self.core.upstream_id.write() =
                self.normalizer.upstream_id().map(str::to_owned);
            if let Some(prompt) = self.pending_prompt.take() {
                if let Err(code) = self.dispatch_prompt(&prompt).await {
                    self.core.emit(SessionEvent::Error {
                        message: format!("buffered prompt failed: {code}"),
                        recoverable: true,
                    });
                }
            }
        }
        if let Some(q) = ingest.question {
            let (_, answer_rx) =
                self.broker.create_question(&self.core.id, &q.tool_use_id, q.questions);
            self.question_tool_use_id = Some(q.tool_use_id);
            self.question_rx = Some(answer_rx);
        }
        if ingest.turn_ended {
            self.core.busy.store(false, Ordering::Release);
            self.turn_deadline = None;
            self.interrupt_deadline = None;
            *self.core.upstream_id.write() =
                self.normalizer.upstream_id().map(str::to_owned);
            // Any prompt still waiting for a decision dies with the turn.
            self.broker.cancel_session(&self.core.id);
        }
    }

    /// Turn timeout: close the stream, clear busy, keep the child.
    fn handle_turn_timeout(&mut self) {
        warn!(session_id = %self.core.id, "turn exceeded {}s, clearing", TURN_TIMEOUT.as_secs());
        self.finish_turn_abnormally(Some(format!(
            "turn timed out after {}s",
            TURN_TIMEOUT.as_secs()
        )));
    }

    fn finish_turn_abnormally(&mut self, error: Option<String>) {
        if let Some(end) = self.normalizer.close_open_stream() {
            self.core.emit(end);
        }
        for event in self.normalizer.drain_markers() {
            self.core.emit(event);
        }
        if let Some(message) = error {
            self.core.emit(SessionEvent::Error { message, recoverable: true });
        }
        self.core.busy.store(false, Ordering::Release);
        self.turn_deadline = None;
        self.interrupt_deadline = None;
        self.broker.cancel_session(&self.core.id);
    }

    /// Child exit or spawn failure. Schedules a respawn unless the exit was
    /// intentional or the attempt cap is spent.
    fn handle_child_gone(&mut self) {
        self.child_pid = None;
        self.child_stdin = None;
        self.child_lines = None;
        self.child_exit = None;
        self.core.ready.store(false, Ordering::Release);

        if self.tearing_down || self.cancel.is_cancelled() {
            return;
        }
        if self.core.is_busy() {
            self.finish_turn_abnormally(Some("agent process exited mid-turn".to_owned()));
        }

        let attempt = self.respawn_attempts as usize;
        if attempt >= RESPAWN_BACKOFF.len() {
            self.dead = true;
            self.core.emit(SessionEvent::Error {
                message: "agent process keeps crashing; giving up".to_owned(),
                recoverable: false,
            });
            return;
        }
        let delay = RESPAWN_BACKOFF[attempt];
        self.respawn_attempts += 1;
        self.core.emit(SessionEvent::Error {
            message: format!("agent process exited; respawning in {}s", delay.as_secs()),
            recoverable: true,
        });
        self.respawn_at = Some(tokio::time::Instant::now() + delay);
    }

    /// Model or permission-mode change: replace the child with new arguments
    /// and start a fresh upstream conversation.
    async fn change_settings(
        &mut self,
        model: Option<String>,
        mode: Option<PermissionMode>,
    ) -> Result<bool, ErrorCode> {
        if self.core.is_busy() {
            return Err(ErrorCode::AgentBusy);
        }
        let changed = match (&model, &mode) {
            (Some(m), _) => *self.core.model.read() != *m,
            (_, Some(p)) => *self.core.permission_mode.read() != *p,
            _ => false,
        };
        if !changed {
            return Ok(false);
        }
        if let Some(m) = model {
            *self.core.model.write() = m;
        }
        if let Some(p) = mode {
            *self.core.permission_mode.write() = p;
        }

        self.tearing_down = true;
        self.core.ready.store(false, Ordering::Release);
        if let Some(pid) = self.child_pid.take() {
            terminate_with_grace(pid, RESTART_GRACE).await;
        }
        self.child_stdin = None;
        self.child_lines = None;
        self.child_exit = None;
        self.normalizer.clear_upstream_id();
        *self.core.upstream_id.write() = None;
        self.respawn_attempts = 0;

        match self.spawn_child() {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(session_id = %self.core.id, err = %e, "respawn after settings change failed");
                self.handle_child_gone();
                Err(ErrorCode::Internal)
            }
        }
    }
}

async fn recv_or_pending(rx: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn exit_or_pending(rx: &mut Option<oneshot::Receiver<ExitStatus>>) -> Option<ExitStatus> {
    match rx {
        Some(rx) => rx.await.ok(),
        None => std::future::pending().await,
    }
}

async fn question_or_pending(rx: &mut Option<oneshot::Receiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.await.ok(),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "headless_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Attached-terminal session: an existing tmux session hosting the Agent.
//!
//! Raw pane output is captured through `tmux pipe-pane` into a named pipe
//! and forwarded as `raw` frames; a [`TerminalParser`] (a black box to this
//! module) turns the same bytes into normalised events. Input goes back via
//! `tmux send-keys`. Model and permission-mode changes are rejected upstream.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use base64::Engine;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::stat::Mode;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::PermissionBroker;
use crate::error::ErrorCode;
use crate::event::SessionEvent;
use crate::session::SessionCore;
use crate::spawn::Exec;

/// Turns raw terminal bytes into normalised session events.
///
/// The parser implementation is consumed as a black box; chroxy only relies
/// on the uniform schema coming out.
pub trait TerminalParser: Send {
    fn feed(&mut self, bytes: &[u8]) -> Vec<SessionEvent>;
}

/// Parser that surfaces nothing; raw forwarding still works.
pub struct NoopParser;

impl TerminalParser for NoopParser {
    fn feed(&mut self, _bytes: &[u8]) -> Vec<SessionEvent> {
        vec![]
    }
}

enum Command {
    Send { text: String, reply: oneshot::Sender<Result<(), ErrorCode>> },
    Interrupt { reply: oneshot::Sender<Result<(), ErrorCode>> },
}

pub struct AttachedSession {
    core: Arc<SessionCore>,
    /// tmux session name this session is attached to.
    target: String,
    broker: Arc<PermissionBroker>,
    cmd_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

impl AttachedSession {
    /// Attach to `target` (already whitelist-validated by the manager).
    pub fn spawn(
        core: Arc<SessionCore>,
        target: String,
        exec: Arc<dyn Exec>,
        parser: Box<dyn TerminalParser>,
        broker: Arc<PermissionBroker>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let worker = AttachedLoop {
            core: Arc::clone(&core),
            target: target.clone(),
            exec,
            parser,
            broker: Arc::clone(&broker),
            cmd_rx,
            cancel: cancel.clone(),
            question_rx: None,
        };
        tokio::spawn(worker.run());
        Self { core, target, broker, cmd_tx, cancel }
    }

    pub fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn send(&self, text: &str) -> Result<(), ErrorCode> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send { text: text.to_owned(), reply: reply_tx })
            .await
            .map_err(|_| ErrorCode::Internal)?;
        reply_rx.await.map_err(|_| ErrorCode::Internal)?
    }

    pub async fn interrupt(&self) -> Result<(), ErrorCode> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Interrupt { reply: reply_tx })
            .await
            .map_err(|_| ErrorCode::Internal)?;
        reply_rx.await.map_err(|_| ErrorCode::Internal)?
    }

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

struct AttachedLoop {
    core: Arc<SessionCore>,
    target: String,
    exec: Arc<dyn Exec>,
    parser: Box<dyn TerminalParser>,
    broker: Arc<PermissionBroker>,
    cmd_rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,
    question_rx: Option<oneshot::Receiver<String>>,
}

impl AttachedLoop {
    async fn run(mut self) {
        let pipe_path =
            std::env::temp_dir().join(format!("chroxy-pipe-{}", self.core.id));
        let pipe = match start_pipe(&self.exec, &self.target, &pipe_path).await {
            Ok(pipe) => Some(pipe),
            Err(e) => {
                warn!(target = %self.target, err = %e, "pipe-pane capture failed");
                self.core.emit(SessionEvent::Error {
                    message: format!("failed to capture terminal output: {e}"),
                    recoverable: false,
                });
                None
            }
        };
        self.core.ready.store(true, Ordering::Release);

        let mut buf = vec![0u8; 8192];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },

                n = read_or_pending(pipe.as_ref(), &mut buf) => match n {
                    Ok(0) | Err(_) => {
                        // Writer side went away; tmux session likely ended.
                        self.core.emit(SessionEvent::Error {
                            message: "terminal session output ended".to_owned(),
                            recoverable: false,
                        });
                        break;
                    }
                    Ok(n) => self.handle_bytes(&buf[..n]),
                },

                answer = question_or_pending(&mut self.question_rx) => {
                    self.question_rx = None;
                    if let Some(answer) = answer {
                        debug!(target = %self.target, "send-keys to attached session");
                        let _ = send_keys(&self.exec, &self.target, &answer, true).await;
                    }
                }
            }
        }

        // Stop piping and clean up the fifo.
        let _ = self
            .exec
            .output("tmux", &["pipe-pane".to_owned(), "-t".to_owned(), self.target.clone()])
            .await;
        let _ = std::fs::remove_file(&pipe_path);
        self.broker.cancel_session(&self.core.id);
    }

    fn handle_bytes(&mut self, bytes: &[u8]) {
        let data = base64::engine::general_purpose::STANDARD.encode(bytes);
        self.core.emit(SessionEvent::Raw { data });

        for event in self.parser.feed(bytes) {
            match &event {
                SessionEvent::UserQuestion { tool_use_id, questions } => {
                    let (_, rx) = self.broker.create_question(
                        &self.core.id,
                        tool_use_id,
                        questions.clone(),
                    );
                    self.question_rx = Some(rx);
                    // The broker emits the user_question itself.
                    continue;
                }
                SessionEvent::Result { .. } => {
                    self.core.busy.store(false, Ordering::Release);
                    self.broker.cancel_session(&self.core.id);
                }
                _ => {}
            }
            self.core.emit(event);
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send { text, reply } => {
                debug!(target = %self.target, "send-keys to attached session");
                let result = send_keys(&self.exec, &self.target, &text, true).await;
                if result.is_ok() {
                    self.core.busy.store(true, Ordering::Release);
                }
                let _ = reply.send(result);
            }
            Command::Interrupt { reply } => {
                let result = self
                    .exec
                    .output(
                        "tmux",
                        &[
                            "send-keys".to_owned(),
                            "-t".to_owned(),
                            self.target.clone(),
                            "C-c".to_owned(),
                        ],
                    )
                    .await
                    .map(|_| ())
                    .map_err(|_| ErrorCode::Internal);
                self.core.busy.store(false, Ordering::Release);
                let _ = reply.send(result);
            }
        }
    }

}

async fn send_keys(
    exec: &Arc<dyn Exec>,
    target: &str,
    text: &str,
    enter: bool,
) -> Result<(), ErrorCode> {
    let out = exec
        .output(
            "tmux",
            &[
                "send-keys".to_owned(),
                "-t".to_owned(),
                target.to_owned(),
                "-l".to_owned(),
                text.to_owned(),
            ],
        )
        .await
        .map_err(|_| ErrorCode::Internal)?;
    if !out.status.success() {
        return Err(ErrorCode::Internal);
    }
    if enter {
        exec.output(
            "tmux",
            &["send-keys".to_owned(), "-t".to_owned(), target.to_owned(), "Enter".to_owned()],
        )
        .await
        .map_err(|_| ErrorCode::Internal)?;
    }
    Ok(())
}

/// Create the fifo and point `tmux pipe-pane` at it.
async fn start_pipe(
    exec: &Arc<dyn Exec>,
    target: &str,
    path: &Path,
) -> anyhow::Result<AsyncFd<PipeFd>> {
    let _ = std::fs::remove_file(path);
    nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o600))?;

    // O_RDWR prevents spurious EOF when the writer closes between
    // pipe-pane restarts; O_NONBLOCK makes reads cancellable.
    let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    set_nonblocking(&file)?;
    let owned: OwnedFd = file.into();
    let afd = AsyncFd::new(PipeFd(owned))?;

    let out = exec
        .output(
            "tmux",
            &[
                "pipe-pane".to_owned(),
                "-t".to_owned(),
                target.to_owned(),
                "-o".to_owned(),
                format!("cat >> {}", path.display()),
            ],
        )
        .await?;
    if !out.status.success() {
        anyhow::bail!("tmux pipe-pane failed: {}", String::from_utf8_lossy(&out.stderr));
    }
    Ok(afd)
}

/// Newtype for the fifo fd, for use with [`AsyncFd`].
struct PipeFd(OwnedFd);

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

fn set_nonblocking(fd: &impl AsFd) -> std::io::Result<()> {
    let flags = fcntl(fd.as_fd(), FcntlArg::F_GETFL)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    Ok(())
}

async fn read_or_pending(
    afd: Option<&AsyncFd<PipeFd>>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let Some(afd) = afd else {
        return std::future::pending().await;
    };
    loop {
        let mut guard = afd.readable().await?;
        match guard.try_io(|inner| {
            nix::unistd::read(inner.get_ref(), buf)
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
        }) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

async fn question_or_pending(rx: &mut Option<oneshot::Receiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.await.ok(),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "terminal_tests.rs"]
mod tests;

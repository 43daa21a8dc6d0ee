// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent-SDK session: the Agent as an in-process library.
//!
//! No child process and no respawn state. Each turn starts a fresh query
//! resuming the last-known upstream conversation. Tool-use permissions and
//! questions come back through in-process callbacks that block on the
//! [`PermissionBroker`] until a client answers or the timeout denies.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::Stream;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::broker::{Decision, PermissionBroker};
use crate::error::ErrorCode;
use crate::event::{Question, SessionEvent};
use crate::session::stream::TurnNormalizer;
use crate::session::{PermissionMode, SessionCore};

/// Decision returned to the SDK's permission callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkDecision {
    Allow,
    AllowAlways,
    Deny,
}

/// One turn's parameters.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub prompt: String,
    pub model: String,
    pub permission_mode: PermissionMode,
    pub resume: Option<String>,
    pub cwd: PathBuf,
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Callbacks the engine invokes mid-query.
#[derive(Clone)]
pub struct QueryCallbacks {
    /// Tool-use permission gate: `(tool, input)` → decision.
    pub on_permission: Arc<dyn Fn(String, Value) -> BoxFuture<SdkDecision> + Send + Sync>,
    /// `AskUserQuestion` gate: `(tool_use_id, questions)` → structured answers.
    pub on_question: Arc<dyn Fn(String, Vec<Question>) -> BoxFuture<Value> + Send + Sync>,
}

/// Seam to the in-process Agent library. Produces the same stream-json
/// entries the headless child writes to stdout.
pub trait QueryEngine: Send + Sync {
    fn query(
        &self,
        request: QueryRequest,
        callbacks: QueryCallbacks,
    ) -> Pin<Box<dyn Stream<Item = Value> + Send>>;
}

enum Command {
    Send { text: String, reply: oneshot::Sender<Result<(), ErrorCode>> },
    Interrupt { reply: oneshot::Sender<Result<(), ErrorCode>> },
    SetModel { model: String, reply: oneshot::Sender<Result<bool, ErrorCode>> },
    SetPermissionMode { mode: PermissionMode, reply: oneshot::Sender<Result<bool, ErrorCode>> },
}

pub struct SdkSession {
    core: Arc<SessionCore>,
    broker: Arc<PermissionBroker>,
    cmd_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

impl SdkSession {
    pub fn spawn(
        core: Arc<SessionCore>,
        engine: Arc<dyn QueryEngine>,
        broker: Arc<PermissionBroker>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let worker = SdkLoop {
            core: Arc::clone(&core),
            engine,
            broker: Arc::clone(&broker),
            normalizer: TurnNormalizer::new(),
            cmd_rx,
            cancel: cancel.clone(),
            active: None,
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

struct SdkLoop {
    core: Arc<SessionCore>,
    engine: Arc<dyn QueryEngine>,
    broker: Arc<PermissionBroker>,
    normalizer: TurnNormalizer,
    cmd_rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,
    active: Option<Pin<Box<dyn Stream<Item = Value> + Send>>>,
}

impl SdkLoop {
    async fn run(mut self) {
        // The library is available immediately; announce readiness once.
        self.core.ready.store(true, Ordering::Release);
        self.core.emit(SessionEvent::Ready {
            model: self.core.model.read().clone(),
            tools: vec![],
        });

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },

                item = next_or_pending(&mut self.active) => match item {
                    Some(value) => self.handle_entry(&value),
                    None => {
                        // Query stream ended without a result entry.
                        self.active = None;
                        if self.core.is_busy() {
                            self.finish_turn_abnormally(Some("query ended unexpectedly".to_owned()));
                        }
                    }
                },
            }
        }

        self.broker.cancel_session(&self.core.id);
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send { text, reply } => {
                let _ = reply.send(self.start_turn(text));
            }
            Command::Interrupt { reply } => {
                if self.core.is_busy() {
                    // Dropping the stream cancels the in-flight query.
                    self.active = None;
                    self.finish_turn_abnormally(None);
                }
                let _ = reply.send(Ok(()));
            }
            Command::SetModel { model, reply } => {
                let _ = reply.send(self.change_value(Some(model), None));
            }
            Command::SetPermissionMode { mode, reply } => {
                let _ = reply.send(self.change_value(None, Some(mode)));
            }
        }
    }

    fn start_turn(&mut self, text: String) -> Result<(), ErrorCode> {
        if self.core.is_busy() {
            return Err(ErrorCode::AgentBusy);
        }
        let request = QueryRequest {
            prompt: text,
            model: self.core.model.read().clone(),
            permission_mode: *self.core.permission_mode.read(),
            resume: self.core.upstream_id.read().clone(),
            cwd: self.core.cwd.clone(),
        };
        let callbacks = self.callbacks();
        self.active = Some(self.engine.query(request, callbacks));
        self.core.busy.store(true, Ordering::Release);
        Ok(())
    }

    /// Broker-blocking callbacks handed to the engine for this turn.
    fn callbacks(&self) -> QueryCallbacks {
        let broker = Arc::clone(&self.broker);
        let session_id = self.core.id.clone();
        let on_permission = {
            let broker = Arc::clone(&broker);
            let session_id = session_id.clone();
            Arc::new(move |tool: String, input: Value| -> BoxFuture<SdkDecision> {
                let broker = Arc::clone(&broker);
                let session_id = session_id.clone();
                Box::pin(async move {
                    let (request_id, rx) =
                        broker.create_permission(&session_id, &tool, input);
                    debug!(request_id, tool, "sdk permission pending");
                    // Each decision maps explicitly; anything unexpected,
                    // including a dropped channel, denies.
                    match rx.await {
                        Ok(Decision::Allow) => SdkDecision::Allow,
                        Ok(Decision::AllowAlways) => SdkDecision::AllowAlways,
                        Ok(Decision::Deny) => SdkDecision::Deny,
                        Err(_) => SdkDecision::Deny,
                    }
                })
            })
        };
        let on_question = {
            let broker = Arc::clone(&broker);
            Arc::new(move |tool_use_id: String, questions: Vec<Question>| -> BoxFuture<Value> {
                let broker = Arc::clone(&broker);
                let session_id = session_id.clone();
                Box::pin(async move {
                    let (_, rx) =
                        broker.create_question(&session_id, &tool_use_id, questions.clone());
                    let answer = rx.await.unwrap_or_else(|_| "cancel".to_owned());
                    // A single text reply answers every question of a
                    // multi-question prompt.
                    let map: serde_json::Map<String, Value> = questions
                        .iter()
                        .map(|q| (q.question.clone(), Value::String(answer.clone())))
                        .collect();
                    Value::Object(map)
                })
            })
        };
        QueryCallbacks { on_permission, on_question }
    }

    fn handle_entry(&mut self, value: &Value) {
        let ingest = self.normalizer.ingest(value);
        for event in ingest.events {
            self.core.emit(event);
        }
        if let Some(q) = ingest.question {
            // The engine's on_question callback already registered the
            // rendezvous; nothing extra to do for SDK sessions.
            debug!(tool_use_id = %q.tool_use_id, "question surfaced in sdk stream");
        }
        if ingest.turn_ended {
            self.active = None;
            self.core.busy.store(false, Ordering::Release);
            *self.core.upstream_id.write() =
                self.normalizer.upstream_id().map(str::to_owned);
            self.broker.cancel_session(&self.core.id);
        }
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
        self.broker.cancel_session(&self.core.id);
    }

    /// SDK settings apply on the next query; no restart is ever needed.
    fn change_value(
        &mut self,
        model: Option<String>,
        mode: Option<PermissionMode>,
    ) -> Result<bool, ErrorCode> {
        if self.core.is_busy() {
            return Err(ErrorCode::AgentBusy);
        }
        match (model, mode) {
            (Some(m), _) => {
                if *self.core.model.read() == m {
                    return Ok(false);
                }
                *self.core.model.write() = m;
                Ok(true)
            }
            (_, Some(p)) => {
                if *self.core.permission_mode.read() == p {
                    return Ok(false);
                }
                *self.core.permission_mode.write() = p;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

async fn next_or_pending(
    stream: &mut Option<Pin<Box<dyn Stream<Item = Value> + Send>>>,
) -> Option<Value> {
    match stream {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "sdk_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session variants and their shared core.
//!
//! A session encapsulates one Agent conversation. Variants differ only in
//! backend: a persistent NDJSON child (headless), an in-process library
//! (agent-sdk), or an existing tmux session (attached-terminal). All expose
//! the capability set `{send, interrupt, set_model, set_permission_mode,
//! respond_to_question, destroy}` and the uniform event schema.

pub mod headless;
pub mod sdk;
pub mod stream;
pub mod terminal;

pub use headless::HeadlessSession;
pub use sdk::SdkSession;
pub use terminal::AttachedSession;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ErrorCode;
use crate::event::{now_ms, SessionEvent, SessionEventEnvelope};
use crate::history::HistoryBuffer;

/// Grace given to a child when its session is destroyed.
pub const DESTROY_GRACE: Duration = Duration::from_secs(3);

/// Grace given to a child when replaced on a model/mode change.
pub const RESTART_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionVariant {
    Headless,
    AgentSdk,
    AttachedTerminal,
}

impl SessionVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Headless => "headless",
            Self::AgentSdk => "agent-sdk",
            Self::AttachedTerminal => "attached-terminal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    Approve,
    Auto,
    Plan,
}

impl PermissionMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approve" => Some(Self::Approve),
            "auto" => Some(Self::Auto),
            "plan" => Some(Self::Plan),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Auto => "auto",
            Self::Plan => "plan",
        }
    }
}

/// Summary row for `session_list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub cwd: String,
    pub variant: SessionVariant,
    pub model: String,
    pub permission_mode: PermissionMode,
    pub busy: bool,
    pub ready: bool,
    pub created_at: u64,
}

/// Bookkeeping shared between a session's owner task and the directory.
///
/// The owner task is the single writer of `busy`/`ready`/`upstream_id`;
/// everything else reads.
pub struct SessionCore {
    pub id: String,
    pub name: RwLock<String>,
    pub cwd: PathBuf,
    pub variant: SessionVariant,
    pub model: RwLock<String>,
    pub permission_mode: RwLock<PermissionMode>,
    pub busy: AtomicBool,
    pub ready: AtomicBool,
    pub upstream_id: RwLock<Option<String>>,
    pub history: Mutex<HistoryBuffer>,
    pub created_at: u64,
    event_tx: broadcast::Sender<SessionEventEnvelope>,
}

impl SessionCore {
    pub fn new(
        id: String,
        name: String,
        cwd: PathBuf,
        variant: SessionVariant,
        model: String,
        permission_mode: PermissionMode,
        event_tx: broadcast::Sender<SessionEventEnvelope>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: RwLock::new(name),
            cwd,
            variant,
            model: RwLock::new(model),
            permission_mode: RwLock::new(permission_mode),
            busy: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            upstream_id: RwLock::new(None),
            history: Mutex::new(HistoryBuffer::default()),
            created_at: now_ms(),
            event_tx,
        })
    }

    /// Record the event in history and publish it on the session bus.
    pub fn emit(&self, event: SessionEvent) {
        self.history.lock().push(event.clone());
        let _ = self
            .event_tx
            .send(SessionEventEnvelope { session_id: self.id.clone(), event });
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            name: self.name.read().clone(),
            cwd: self.cwd.display().to_string(),
            variant: self.variant,
            model: self.model.read().clone(),
            permission_mode: *self.permission_mode.read(),
            busy: self.busy.load(Ordering::Acquire),
            ready: self.ready.load(Ordering::Acquire),
            created_at: self.created_at,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// One Agent conversation, whichever backend drives it.
pub enum Session {
    Headless(HeadlessSession),
    Sdk(SdkSession),
    Terminal(AttachedSession),
}

impl Session {
    pub fn core(&self) -> &Arc<SessionCore> {
        match self {
            Self::Headless(s) => s.core(),
            Self::Sdk(s) => s.core(),
            Self::Terminal(s) => s.core(),
        }
    }

    pub fn id(&self) -> &str {
        &self.core().id
    }

    /// Start a user turn. Rejected while one is already in flight.
    pub async fn send(&self, text: &str) -> Result<(), ErrorCode> {
        match self {
            Self::Headless(s) => s.send(text).await,
            Self::Sdk(s) => s.send(text).await,
            Self::Terminal(s) => s.send(text).await,
        }
    }

    pub async fn interrupt(&self) -> Result<(), ErrorCode> {
        match self {
            Self::Headless(s) => s.interrupt().await,
            Self::Sdk(s) => s.interrupt().await,
            Self::Terminal(s) => s.interrupt().await,
        }
    }

    /// Change the model. `Ok(true)` when the value actually changed.
    pub async fn set_model(&self, model: &str) -> Result<bool, ErrorCode> {
        match self {
            Self::Headless(s) => s.set_model(model).await,
            Self::Sdk(s) => s.set_model(model).await,
            Self::Terminal(_) => Err(ErrorCode::Unsupported),
        }
    }

    /// Change the permission mode. `Ok(true)` when the value changed.
    pub async fn set_permission_mode(&self, mode: PermissionMode) -> Result<bool, ErrorCode> {
        match self {
            Self::Headless(s) => s.set_permission_mode(mode).await,
            Self::Sdk(s) => s.set_permission_mode(mode).await,
            Self::Terminal(_) => Err(ErrorCode::Unsupported),
        }
    }

    pub async fn respond_to_question(&self, answer: &str) -> Result<(), ErrorCode> {
        match self {
            Self::Headless(s) => s.respond_to_question(answer).await,
            Self::Sdk(s) => s.respond_to_question(answer).await,
            Self::Terminal(s) => s.respond_to_question(answer).await,
        }
    }

    /// Tear down the backend and stop the owner task.
    pub async fn destroy(&self) {
        match self {
            Self::Headless(s) => s.destroy().await,
            Self::Sdk(s) => s.destroy().await,
            Self::Terminal(s) => s.destroy().await,
        }
    }
}

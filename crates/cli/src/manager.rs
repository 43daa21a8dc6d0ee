// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session directory: creation, attachment, destruction, discovery.
//!
//! The manager exclusively owns sessions and is the single place where the
//! capacity and last-session invariants are enforced. All session events
//! funnel through one broadcast bus, tagged with the originating session id,
//! which the fanout layer subscribes to once.

use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

use crate::broker::PermissionBroker;
use crate::discover::{list_terminal_sessions, validate_session_name, DiscoveredSession};
use crate::error::ErrorCode;
use crate::event::SessionEventEnvelope;
use crate::session::headless::{HeadlessConfig, HeadlessSession};
use crate::session::sdk::{QueryEngine, SdkSession};
use crate::session::terminal::{AttachedSession, NoopParser, TerminalParser};
use crate::session::{PermissionMode, Session, SessionCore, SessionInfo, SessionVariant};
use crate::spawn::{Exec, Spawner};

/// Factory for terminal parsers, one per attached session.
pub type ParserFactory = Arc<dyn Fn() -> Box<dyn TerminalParser> + Send + Sync>;

/// Defaults applied to newly created sessions.
#[derive(Clone)]
pub struct ManagerConfig {
    pub capacity: usize,
    pub default_variant: SessionVariant,
    pub default_model: String,
    pub default_cwd: PathBuf,
    pub default_permission_mode: PermissionMode,
    pub shell_cmd: String,
    pub allowed_tools: Vec<String>,
    /// Conversation to resume; consumed by the first session only.
    pub resume: Option<String>,
    pub hook_port: u16,
    pub hook_token: Option<String>,
}

pub struct SessionManager {
    config: ManagerConfig,
    sessions: RwLock<IndexMap<String, Session>>,
    event_tx: broadcast::Sender<SessionEventEnvelope>,
    spawner: Arc<dyn Spawner>,
    exec: Arc<dyn Exec>,
    broker: Arc<PermissionBroker>,
    engine: Option<Arc<dyn QueryEngine>>,
    parser_factory: ParserFactory,
    /// Tracks whether `config.resume` was already handed to a session.
    resume_spent: std::sync::atomic::AtomicBool,
}

impl SessionManager {
    pub fn new(
        config: ManagerConfig,
        event_tx: broadcast::Sender<SessionEventEnvelope>,
        spawner: Arc<dyn Spawner>,
        exec: Arc<dyn Exec>,
        broker: Arc<PermissionBroker>,
        engine: Option<Arc<dyn QueryEngine>>,
    ) -> Self {
        Self {
            config,
            sessions: RwLock::new(IndexMap::new()),
            event_tx,
            spawner,
            exec,
            broker,
            engine,
            parser_factory: Arc::new(|| Box::new(NoopParser) as Box<dyn TerminalParser>),
            resume_spent: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn with_parser_factory(mut self, factory: ParserFactory) -> Self {
        self.parser_factory = factory;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEventEnvelope> {
        self.event_tx.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<SessionEventEnvelope> {
        self.event_tx.clone()
    }

    pub fn default_variant(&self) -> SessionVariant {
        self.config.default_variant
    }

    /// Create a session of the default variant.
    pub async fn create(
        &self,
        name: Option<String>,
        cwd: Option<PathBuf>,
    ) -> Result<SessionInfo, ErrorCode> {
        let cwd = cwd.unwrap_or_else(|| self.config.default_cwd.clone());
        if !cwd.is_dir() {
            return Err(ErrorCode::BadRequest);
        }

        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.config.capacity {
            return Err(ErrorCode::CapacityReached);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let name = name.unwrap_or_else(|| format!("session-{}", sessions.len() + 1));
        let core = SessionCore::new(
            id.clone(),
            name,
            cwd,
            self.config.default_variant,
            self.config.default_model.clone(),
            self.config.default_permission_mode,
            self.event_tx.clone(),
        );

        let session = match self.config.default_variant {
            SessionVariant::AgentSdk => match self.engine {
                Some(ref engine) => Session::Sdk(SdkSession::spawn(
                    Arc::clone(&core),
                    Arc::clone(engine),
                    Arc::clone(&self.broker),
                )),
                None => return Err(ErrorCode::Internal),
            },
            _ => {
                let resume = if self.resume_spent.swap(true, std::sync::atomic::Ordering::AcqRel) {
                    None
                } else {
                    self.config.resume.clone()
                };
                Session::Headless(HeadlessSession::spawn(
                    Arc::clone(&core),
                    HeadlessConfig {
                        shell_cmd: self.config.shell_cmd.clone(),
                        allowed_tools: self.config.allowed_tools.clone(),
                        resume,
                        hook_port: self.config.hook_port,
                        hook_token: self.config.hook_token.clone(),
                    },
                    Arc::clone(&self.spawner),
                    Arc::clone(&self.broker),
                ))
            }
        };

        let info = core.info();
        sessions.insert(id.clone(), session);
        info!(session_id = %id, name = %info.name, "session created");
        Ok(info)
    }

    /// Attach to an existing terminal session.
    pub async fn attach(
        &self,
        target: &str,
        name: Option<String>,
    ) -> Result<SessionInfo, ErrorCode> {
        if !validate_session_name(target) {
            return Err(ErrorCode::InvalidName);
        }

        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.config.capacity {
            return Err(ErrorCode::CapacityReached);
        }
        let already = sessions.values().any(|s| match s {
            Session::Terminal(t) => t.target() == target,
            _ => false,
        });
        if already {
            return Err(ErrorCode::BadRequest);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let name = name.unwrap_or_else(|| target.to_owned());
        let core = SessionCore::new(
            id.clone(),
            name,
            self.config.default_cwd.clone(),
            SessionVariant::AttachedTerminal,
            self.config.default_model.clone(),
            self.config.default_permission_mode,
            self.event_tx.clone(),
        );
        let session = Session::Terminal(AttachedSession::spawn(
            Arc::clone(&core),
            target.to_owned(),
            Arc::clone(&self.exec),
            (self.parser_factory)(),
            Arc::clone(&self.broker),
        ));

        let info = core.info();
        sessions.insert(id.clone(), session);
        info!(session_id = %id, target, "attached to terminal session");
        Ok(info)
    }

    /// Destroy a session. The last remaining session is protected.
    pub async fn destroy(&self, id: &str) -> Result<SessionInfo, ErrorCode> {
        let session = {
            let mut sessions = self.sessions.write().await;
            if !sessions.contains_key(id) {
                return Err(ErrorCode::UnknownSession);
            }
            if sessions.len() == 1 {
                return Err(ErrorCode::LastSession);
            }
            match sessions.shift_remove(id) {
                Some(s) => s,
                None => return Err(ErrorCode::UnknownSession),
            }
        };
        let info = session.core().info();
        session.destroy().await;
        self.broker.cancel_session(id);
        info!(session_id = %id, "session destroyed");
        Ok(info)
    }

    pub async fn rename(&self, id: &str, name: &str) -> Result<SessionInfo, ErrorCode> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(id).ok_or(ErrorCode::UnknownSession)?;
        *session.core().name.write() = name.to_owned();
        Ok(session.core().info())
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        self.sessions.read().await.values().map(|s| s.core().info()).collect()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn info(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.read().await.get(id).map(|s| s.core().info())
    }

    /// Events of a session's most recent turn, for bracketed replay.
    pub async fn replay_tail(&self, id: &str) -> Vec<crate::event::SessionEvent> {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .map(|s| s.core().history.lock().replay_tail())
            .unwrap_or_default()
    }

    pub async fn first_id(&self) -> Option<String> {
        self.sessions.read().await.keys().next().cloned()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Start a user turn on one session.
    pub async fn send(&self, id: &str, text: &str) -> Result<(), ErrorCode> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(id).ok_or(ErrorCode::UnknownSession)?;
        session.send(text).await
    }

    pub async fn interrupt(&self, id: &str) -> Result<(), ErrorCode> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(id).ok_or(ErrorCode::UnknownSession)?;
        session.interrupt().await
    }

    pub async fn set_model(&self, id: &str, model: &str) -> Result<bool, ErrorCode> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(id).ok_or(ErrorCode::UnknownSession)?;
        session.set_model(model).await
    }

    pub async fn set_permission_mode(
        &self,
        id: &str,
        mode: PermissionMode,
    ) -> Result<bool, ErrorCode> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(id).ok_or(ErrorCode::UnknownSession)?;
        session.set_permission_mode(mode).await
    }

    pub async fn respond_to_question(&self, id: &str, answer: &str) -> Result<(), ErrorCode> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(id).ok_or(ErrorCode::UnknownSession)?;
        session.respond_to_question(answer).await
    }

    /// Map an Agent-side conversation id to the owning session.
    ///
    /// Falls back to the sole headless session when nothing matches, which
    /// covers hooks that predate the id being threaded through.
    pub async fn session_for_upstream(&self, upstream_id: Option<&str>) -> Option<String> {
        let sessions = self.sessions.read().await;
        if let Some(upstream) = upstream_id {
            for (id, session) in sessions.iter() {
                let matches = session
                    .core()
                    .upstream_id
                    .read()
                    .as_deref()
                    .map(|u| u == upstream)
                    .unwrap_or(false);
                if matches {
                    return Some(id.clone());
                }
            }
        }
        let mut headless =
            sessions.iter().filter(|(_, s)| matches!(s, Session::Headless(_)));
        match (headless.next(), headless.next()) {
            (Some((id, _)), None) => Some(id.clone()),
            _ => None,
        }
    }

    /// Attachable terminal sessions, minus those already attached.
    pub async fn discover(&self) -> Vec<DiscoveredSession> {
        let candidates = list_terminal_sessions(&self.exec).await;
        let sessions = self.sessions.read().await;
        let attached: Vec<&str> = sessions
            .values()
            .filter_map(|s| match s {
                Session::Terminal(t) => Some(t.target()),
                _ => None,
            })
            .collect();
        candidates
            .into_iter()
            .filter(|c| !attached.contains(&c.name.as_str()))
            .collect()
    }

    /// Whether any session currently has a turn in flight.
    pub async fn any_busy(&self) -> bool {
        self.sessions.read().await.values().any(|s| s.core().is_busy())
    }

    /// Snapshot for drain serialisation.
    pub async fn snapshot_state(&self) -> Vec<serde_json::Value> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .map(|s| {
                let core = s.core();
                serde_json::json!({
                    "id": core.id,
                    "name": *core.name.read(),
                    "cwd": core.cwd.display().to_string(),
                    "variant": core.variant.as_str(),
                    "model": *core.model.read(),
                    "permissionMode": core.permission_mode.read().as_str(),
                    "upstreamId": *core.upstream_id.read(),
                })
            })
            .collect()
    }

    /// Destroy everything (shutdown path; the last-session rule is waived).
    pub async fn destroy_all(&self) {
        let sessions: Vec<Session> = {
            let mut map = self.sessions.write().await;
            map.drain(..).map(|(_, s)| s).collect()
        };
        for session in &sessions {
            session.destroy().await;
        }
        self.broker.shutdown();
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;

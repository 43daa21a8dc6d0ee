// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Permission and question rendezvous.
//!
//! Agent-originated tool-use prompts enter here (from the in-process SDK
//! callback or the headless HTTP hook), get an unpredictable request id, and
//! wait on a oneshot for exactly one resolution out of: client decision,
//! 5-minute timeout, hook connection close, turn end, shutdown. After any
//! resolution the id is gone from the broker; late responses are refused.
//!
//! Responses are correlated by `requestId` only — never by the responding
//! client's active session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::RngCore;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::event::{Question, SessionEvent, SessionEventEnvelope};

/// How long a pending prompt waits for a client before auto-denying.
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(300);

/// Concurrent pending prompts tolerated before new ones are auto-denied.
pub const MAX_PENDING: usize = 100;

/// Answer substituted when a question times out unanswered.
pub const QUESTION_TIMEOUT_ANSWER: &str = "cancel";

/// Tool-use decision, as accepted from clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    AllowAlways,
    Deny,
}

impl Decision {
    /// Unknown decision strings collapse to `Deny`.
    pub fn parse(s: &str) -> Self {
        match s {
            "allow" => Self::Allow,
            "allowAlways" => Self::AllowAlways,
            _ => Self::Deny,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::AllowAlways => "allowAlways",
            Self::Deny => "deny",
        }
    }
}

enum PendingKind {
    Permission { decision_tx: oneshot::Sender<Decision> },
    Question { answer_tx: oneshot::Sender<String> },
}

struct Pending {
    session_id: String,
    kind: PendingKind,
    /// Cancels the timeout task when the entry resolves early.
    timeout_cancel: CancellationToken,
}

/// Rendezvous for permission prompts and user questions.
pub struct PermissionBroker {
    pending: Mutex<HashMap<String, Pending>>,
    counter: AtomicU64,
    event_tx: broadcast::Sender<SessionEventEnvelope>,
    max_pending: usize,
}

impl PermissionBroker {
    pub fn new(event_tx: broadcast::Sender<SessionEventEnvelope>) -> Self {
        Self { pending: Mutex::new(HashMap::new()), counter: AtomicU64::new(0), event_tx, max_pending: MAX_PENDING }
    }

    #[cfg(test)]
    pub fn with_max_pending(mut self, n: usize) -> Self {
        self.max_pending = n;
        self
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let mut rng = rand::rng();
        // Random suffix keeps ids unpredictable across restarts.
        format!("{prefix}-{n}-{:08x}{:08x}", rng.next_u32(), rng.next_u32())
    }

    fn emit(&self, session_id: &str, event: SessionEvent) {
        let _ = self
            .event_tx
            .send(SessionEventEnvelope { session_id: session_id.to_owned(), event });
    }

    /// Register a permission prompt and return its id plus the decision
    /// future. Emits a session-scoped `permission_request` to subscribers.
    ///
    /// Over-capacity prompts resolve immediately with `Deny`.
    pub fn create_permission(
        self: &Arc<Self>,
        session_id: &str,
        tool: &str,
        input: Value,
    ) -> (String, oneshot::Receiver<Decision>) {
        let request_id = self.next_id("perm");
        let (decision_tx, decision_rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock();
            if pending.len() >= self.max_pending {
                warn!(session_id, tool, "pending permission cap reached, auto-denying");
                let _ = decision_tx.send(Decision::Deny);
                return (request_id, decision_rx);
            }
            let timeout_cancel = CancellationToken::new();
            pending.insert(
                request_id.clone(),
                Pending {
                    session_id: session_id.to_owned(),
                    kind: PendingKind::Permission { decision_tx },
                    timeout_cancel: timeout_cancel.clone(),
                },
            );
            self.spawn_timeout(request_id.clone(), timeout_cancel);
        }

        let description = derive_description(&input);
        self.emit(
            session_id,
            SessionEvent::PermissionRequest {
                request_id: request_id.clone(),
                tool: tool.to_owned(),
                description,
                input,
            },
        );
        (request_id, decision_rx)
    }

    /// Register a question prompt. Emits `user_question` to subscribers.
    pub fn create_question(
        self: &Arc<Self>,
        session_id: &str,
        tool_use_id: &str,
        questions: Vec<Question>,
    ) -> (String, oneshot::Receiver<String>) {
        let request_id = self.next_id("q");
        let (answer_tx, answer_rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock();
            if pending.len() >= self.max_pending {
                warn!(session_id, "pending question cap reached, auto-cancelling");
                let _ = answer_tx.send(QUESTION_TIMEOUT_ANSWER.to_owned());
                return (request_id, answer_rx);
            }
            let timeout_cancel = CancellationToken::new();
            pending.insert(
                request_id.clone(),
                Pending {
                    session_id: session_id.to_owned(),
                    kind: PendingKind::Question { answer_tx },
                    timeout_cancel: timeout_cancel.clone(),
                },
            );
            self.spawn_timeout(request_id.clone(), timeout_cancel);
        }

        self.emit(
            session_id,
            SessionEvent::UserQuestion { tool_use_id: tool_use_id.to_owned(), questions },
        );
        (request_id, answer_rx)
    }

    fn spawn_timeout(self: &Arc<Self>, request_id: String, cancel: CancellationToken) {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(PENDING_TIMEOUT) => {
                    debug!(request_id, "pending prompt timed out, auto-denying");
                    broker.resolve(&request_id, Decision::Deny, QUESTION_TIMEOUT_ANSWER);
                }
            }
        });
    }

    /// Resolve one entry with the given permission decision or question
    /// answer, whichever its kind requires. Returns false for unknown ids.
    fn resolve(&self, request_id: &str, decision: Decision, answer: &str) -> bool {
        let entry = self.pending.lock().remove(request_id);
        let Some(entry) = entry else {
            return false;
        };
        entry.timeout_cancel.cancel();
        match entry.kind {
            PendingKind::Permission { decision_tx } => {
                let _ = decision_tx.send(decision);
            }
            PendingKind::Question { answer_tx } => {
                let _ = answer_tx.send(answer.to_owned());
            }
        }
        true
    }

    /// Apply a client's `permission_response`. Routed strictly by request id;
    /// an id absent from the broker (already resolved, or never issued) is
    /// refused.
    pub fn respond_permission(&self, request_id: &str, decision: &str) -> bool {
        {
            let pending = self.pending.lock();
            match pending.get(request_id) {
                Some(p) if matches!(p.kind, PendingKind::Permission { .. }) => {}
                _ => return false,
            }
        }
        self.resolve(request_id, Decision::parse(decision), QUESTION_TIMEOUT_ANSWER)
    }

    /// Apply a client's `user_question_response` by request id.
    pub fn respond_question(&self, request_id: &str, answer: &str) -> bool {
        {
            let pending = self.pending.lock();
            match pending.get(request_id) {
                Some(p) if matches!(p.kind, PendingKind::Question { .. }) => {}
                _ => return false,
            }
        }
        self.resolve(request_id, Decision::Deny, answer)
    }

    /// Resolve a session's waiting question without a request id (the mobile
    /// client's `user_question_response` carries only the answer).
    pub fn respond_question_for_session(&self, session_id: &str, answer: &str) -> bool {
        let id = {
            let pending = self.pending.lock();
            pending
                .iter()
                .find(|(_, p)| {
                    p.session_id == session_id && matches!(p.kind, PendingKind::Question { .. })
                })
                .map(|(id, _)| id.clone())
        };
        match id {
            Some(id) => self.resolve(&id, Decision::Deny, answer),
            None => false,
        }
    }

    /// Originating session recorded for a pending entry, for authorisation
    /// cross-checks.
    pub fn session_of(&self, request_id: &str) -> Option<String> {
        self.pending.lock().get(request_id).map(|p| p.session_id.clone())
    }

    /// Auto-deny every pending entry of one session (turn end, destroy).
    pub fn cancel_session(&self, session_id: &str) {
        let ids: Vec<String> = {
            let pending = self.pending.lock();
            pending
                .iter()
                .filter(|(_, p)| p.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            self.resolve(&id, Decision::Deny, QUESTION_TIMEOUT_ANSWER);
        }
    }

    /// Auto-deny everything (worker shutdown).
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.pending.lock().keys().cloned().collect();
        for id in ids {
            self.resolve(&id, Decision::Deny, QUESTION_TIMEOUT_ANSWER);
        }
    }

    /// Remove an entry without resolving it (the waiter went away, e.g. the
    /// hook connection closed; the dropped receiver already reads as deny).
    pub fn abandon(&self, request_id: &str) {
        if let Some(entry) = self.pending.lock().remove(request_id) {
            entry.timeout_cancel.cancel();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Short human description of a tool invocation, for prompt UI.
///
/// Field priority follows what agents most often put the interesting part
/// in; the fallback is a truncated JSON dump.
pub fn derive_description(input: &Value) -> String {
    for key in ["description", "command", "file_path", "pattern", "query"] {
        if let Some(s) = input.get(key).and_then(|v| v.as_str()) {
            return s.to_owned();
        }
    }
    let mut dump = input.to_string();
    if dump.len() > 200 {
        dump.truncate(200);
    }
    dump
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Uniform session event schema.
//!
//! Every session variant normalises its backend's output to these events.
//! The fanout layer subscribes to one `session_event` stream per manager and
//! tags each event with the originating `sessionId` on egress, so clients can
//! route events even when the session is not currently viewed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One question inside an `AskUserQuestion` prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Badge-tracking record for an in-flight subordinate agent task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMarker {
    pub tool_use_id: String,
    pub description: String,
    pub started_at: u64,
}

/// Message kinds carried by [`SessionEvent::Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Response,
    ToolUse,
    System,
    Error,
    Prompt,
}

/// Events emitted by a session, in emission order.
///
/// Stream events obey a strict bracketing: every `stream_start` is followed
/// by exactly one `stream_end` for the same message id, and deltas only occur
/// inside the bracket. Fanout may coalesce adjacent deltas but never reorders
/// across message ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Emitted on session init and again after every recovery.
    Ready {
        model: String,
        #[serde(default)]
        tools: Vec<String>,
    },
    StreamStart {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    StreamDelta {
        #[serde(rename = "messageId")]
        message_id: String,
        delta: String,
    },
    StreamEnd {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    Message {
        #[serde(rename = "type")]
        kind: MessageKind,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        options: Option<Vec<String>>,
        timestamp: u64,
    },
    ToolStart {
        #[serde(rename = "messageId")]
        message_id: String,
        tool: String,
        input: Option<Value>,
    },
    UserQuestion {
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        questions: Vec<Question>,
    },
    AgentSpawned {
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        description: String,
        #[serde(rename = "startedAt")]
        started_at: u64,
    },
    AgentCompleted {
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
    },
    PlanStarted,
    PlanReady {
        #[serde(rename = "allowedPrompts", skip_serializing_if = "Option::is_none")]
        allowed_prompts: Option<Vec<String>>,
    },
    /// Terminates a turn.
    Result {
        #[serde(skip_serializing_if = "Option::is_none")]
        cost: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Value>,
    },
    PermissionRequest {
        #[serde(rename = "requestId")]
        request_id: String,
        tool: String,
        description: String,
        input: Value,
    },
    Error {
        message: String,
        recoverable: bool,
    },
    /// Raw terminal bytes, base64-encoded. Attached-terminal sessions only.
    Raw {
        data: String,
    },
    StatusUpdate {
        status: String,
    },
}

impl SessionEvent {
    /// Whether this event marks the end of a turn (the history replay marker).
    pub fn is_turn_end(&self) -> bool {
        matches!(self, Self::Result { .. })
    }

    /// Raw frames are delivered through the mode-gated raw path, never the
    /// general fanout, and are excluded from history.
    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw { .. })
    }
}

/// A session event tagged with its originating session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEventEnvelope {
    pub session_id: String,
    #[serde(flatten)]
    pub event: SessionEvent,
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket message types and conversions.
//!
//! One JSON object per frame, internally tagged (`{"type": "input", ...}`).
//! Unknown client message types are logged and ignored by the handler, so
//! the client enum is deserialised leniently from a raw value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;
use crate::event::{MessageKind, Question, SessionEvent};
use crate::session::SessionInfo;

/// Client-supplied device metadata, recorded at authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, rename = "deviceId", skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// Client view mode: raw terminal frames or structured chat events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    Terminal,
    #[default]
    Chat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        token: String,
        #[serde(default, rename = "deviceInfo")]
        device_info: Option<DeviceInfo>,
    },
    Input {
        data: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Mode {
        mode: ViewMode,
    },
    Interrupt {},
    SetModel {
        model: String,
    },
    SetPermissionMode {
        mode: String,
        #[serde(default)]
        confirmed: bool,
    },
    PermissionResponse {
        #[serde(rename = "requestId")]
        request_id: String,
        decision: String,
    },
    ListSessions {},
    SwitchSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    CreateSession {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    DestroySession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    RenameSession {
        #[serde(rename = "sessionId")]
        session_id: String,
        name: String,
    },
    DiscoverSessions {},
    TriggerDiscovery {},
    AttachSession {
        #[serde(rename = "tmuxSession")]
        tmux_session: String,
        #[serde(default)]
        name: Option<String>,
    },
    RegisterPushToken {
        token: String,
    },
    UserQuestionResponse {
        answer: String,
        #[serde(default, rename = "requestId")]
        request_id: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthOk {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "serverMode")]
        server_mode: String,
        #[serde(rename = "serverVersion")]
        server_version: String,
        #[serde(rename = "serverCommit")]
        server_commit: String,
        cwd: String,
        #[serde(rename = "connectedClients")]
        connected_clients: usize,
    },
    AuthFail {
        reason: String,
    },
    ServerMode {
        mode: String,
    },
    Status {
        connected: bool,
    },
    ClaudeReady {
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        model: String,
        tools: Vec<String>,
    },
    ModelChanged {
        #[serde(rename = "sessionId")]
        session_id: String,
        model: String,
    },
    AvailableModels {
        models: Vec<String>,
    },
    AvailablePermissionModes {
        modes: Vec<String>,
    },
    ConfirmPermissionMode {
        mode: String,
        warning: String,
    },
    PermissionModeChanged {
        #[serde(rename = "sessionId")]
        session_id: String,
        mode: String,
    },
    PermissionRequest {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "requestId")]
        request_id: String,
        tool: String,
        description: String,
        input: Value,
    },
    SessionList {
        sessions: Vec<SessionInfo>,
    },
    SessionSwitched {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    SessionCreated {
        session: SessionInfo,
    },
    SessionDestroyed {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    SessionError {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        category: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        recoverable: Option<bool>,
    },
    DiscoveredSessions {
        sessions: Vec<crate::discover::DiscoveredSession>,
    },
    DiscoveryTriggered {},
    HistoryReplayStart {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    HistoryReplayEnd {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    StreamStart {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "messageId")]
        message_id: String,
    },
    StreamDelta {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "messageId")]
        message_id: String,
        delta: String,
    },
    StreamEnd {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "messageId")]
        message_id: String,
    },
    Message {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "messageType")]
        kind: MessageKind,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        options: Option<Vec<String>>,
        timestamp: u64,
    },
    ToolStart {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "messageId")]
        message_id: String,
        tool: String,
        input: Option<Value>,
    },
    Raw {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
    },
    RawBackground {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
    },
    StatusUpdate {
        #[serde(rename = "sessionId")]
        session_id: String,
        status: String,
    },
    UserQuestion {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        questions: Vec<Question>,
    },
    AgentSpawned {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        description: String,
        #[serde(rename = "startedAt")]
        started_at: u64,
    },
    AgentCompleted {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
    },
    PlanStarted {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    PlanReady {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "allowedPrompts", skip_serializing_if = "Option::is_none")]
        allowed_prompts: Option<Vec<String>>,
    },
    Result {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Value>,
    },
    ServerStatus {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ServerError {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        category: Option<String>,
    },
    ClientJoined {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "deviceInfo", skip_serializing_if = "Option::is_none")]
        device_info: Option<DeviceInfo>,
    },
    ClientLeft {
        #[serde(rename = "clientId")]
        client_id: String,
    },
    PrimaryChanged {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "clientId")]
        client_id: String,
    },
}

/// Build a `session_error` from an error code.
pub fn session_error(code: ErrorCode) -> ServerMessage {
    ServerMessage::SessionError {
        message: code.message().to_owned(),
        category: Some(code.as_str().to_owned()),
        recoverable: None,
    }
}

/// Map a session event into its tagged wire message.
///
/// `Raw` frames never pass through here; the fanout routes them through the
/// mode-gated raw path (`raw` / `raw_background`).
pub fn session_event_to_msg(session_id: &str, event: SessionEvent) -> ServerMessage {
    let session_id = session_id.to_owned();
    match event {
        SessionEvent::Ready { model, tools } => ServerMessage::ClaudeReady {
            session_id: Some(session_id),
            model,
            tools,
        },
        SessionEvent::StreamStart { message_id } => {
            ServerMessage::StreamStart { session_id, message_id }
        }
        SessionEvent::StreamDelta { message_id, delta } => {
            ServerMessage::StreamDelta { session_id, message_id, delta }
        }
        SessionEvent::StreamEnd { message_id } => {
            ServerMessage::StreamEnd { session_id, message_id }
        }
        SessionEvent::Message { kind, content, tool, options, timestamp } => {
            ServerMessage::Message { session_id, kind, content, tool, options, timestamp }
        }
        SessionEvent::ToolStart { message_id, tool, input } => {
            ServerMessage::ToolStart { session_id, message_id, tool, input }
        }
        SessionEvent::UserQuestion { tool_use_id, questions } => {
            ServerMessage::UserQuestion { session_id, tool_use_id, questions }
        }
        SessionEvent::AgentSpawned { tool_use_id, description, started_at } => {
            ServerMessage::AgentSpawned { session_id, tool_use_id, description, started_at }
        }
        SessionEvent::AgentCompleted { tool_use_id } => {
            ServerMessage::AgentCompleted { session_id, tool_use_id }
        }
        SessionEvent::PlanStarted => ServerMessage::PlanStarted { session_id },
        SessionEvent::PlanReady { allowed_prompts } => {
            ServerMessage::PlanReady { session_id, allowed_prompts }
        }
        SessionEvent::Result { cost, duration, usage } => {
            ServerMessage::Result { session_id, cost, duration, usage }
        }
        SessionEvent::PermissionRequest { request_id, tool, description, input } => {
            ServerMessage::PermissionRequest { session_id, request_id, tool, description, input }
        }
        SessionEvent::Error { message, recoverable } => ServerMessage::SessionError {
            message,
            category: None,
            recoverable: Some(recoverable),
        },
        SessionEvent::Raw { data } => ServerMessage::Raw { session_id, data },
        SessionEvent::StatusUpdate { status } => {
            ServerMessage::StatusUpdate { session_id, status }
        }
    }
}

#[cfg(test)]
#[path = "ws_msg_tests.rs"]
mod tests;

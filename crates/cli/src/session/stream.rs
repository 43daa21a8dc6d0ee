// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Normaliser for the Agent's structured NDJSON stream.
//!
//! Consumes one parsed JSON entry at a time and produces uniform
//! [`SessionEvent`]s. Shared by the headless child variant and the SDK
//! variant (both speak the same stream-json schema).
//!
//! Stream bracketing is enforced here: `stream_start` is idempotent within a
//! live stream, `stream_end` is emitted exactly once per start, and assistant
//! messages whose text was already streamed are not re-emitted.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde_json::Value;

use crate::event::{now_ms, AgentMarker, MessageKind, Question, SessionEvent};

/// Accumulated partial tool input is capped; overflowing chunks are dropped
/// but the tool invocation itself still surfaces.
pub const TOOL_INPUT_CAP: usize = 256 * 1024;

/// A question prompt surfaced mid-turn, to be registered with the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct QuestionPrompt {
    pub tool_use_id: String,
    pub questions: Vec<Question>,
}

/// Everything one ingested entry produced.
#[derive(Debug, Default)]
pub struct Ingest {
    pub events: Vec<SessionEvent>,
    /// The entry was the turn-terminating `result`.
    pub turn_ended: bool,
    /// The entry was the init handshake.
    pub ready: bool,
    /// An `AskUserQuestion` completed its input; the session must rendezvous.
    pub question: Option<QuestionPrompt>,
}

struct ToolAcc {
    tool_use_id: String,
    name: String,
    buf: String,
    overflowed: bool,
}

/// Per-session normaliser state. Survives across turns; per-turn state is
/// reset when `result` lands.
pub struct TurnNormalizer {
    msg_counter: u64,
    current_message: Option<String>,
    open_stream: Option<String>,
    streamed: HashSet<String>,
    dispatched: HashSet<String>,
    tools: HashMap<u64, ToolAcc>,
    markers: IndexMap<String, AgentMarker>,
    plan_active: bool,
    plan_prompts: Option<Vec<String>>,
    upstream_id: Option<String>,
    model: Option<String>,
}

impl TurnNormalizer {
    pub fn new() -> Self {
        Self {
            msg_counter: 0,
            current_message: None,
            open_stream: None,
            streamed: HashSet::new(),
            dispatched: HashSet::new(),
            tools: HashMap::new(),
            markers: IndexMap::new(),
            plan_active: false,
            plan_prompts: None,
            upstream_id: None,
            model: None,
        }
    }

    /// Upstream conversation id captured from the handshake, for resume.
    pub fn upstream_id(&self) -> Option<&str> {
        self.upstream_id.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Forget the upstream conversation (model change starts fresh).
    pub fn clear_upstream_id(&mut self) {
        self.upstream_id = None;
    }

    /// Close any open text stream, returning the defensive `stream_end`.
    pub fn close_open_stream(&mut self) -> Option<SessionEvent> {
        self.open_stream
            .take()
            .map(|message_id| SessionEvent::StreamEnd { message_id })
    }

    /// Drain live subordinate-agent markers into `agent_completed` events.
    pub fn drain_markers(&mut self) -> Vec<SessionEvent> {
        self.markers
            .drain(..)
            .map(|(tool_use_id, _)| SessionEvent::AgentCompleted { tool_use_id })
            .collect()
    }

    fn next_message_id(&mut self) -> String {
        self.msg_counter += 1;
        format!("msg-{}", self.msg_counter)
    }

    /// Ingest one NDJSON entry.
    pub fn ingest(&mut self, json: &Value) -> Ingest {
        let mut out = Ingest::default();

        if let Some(error) = json.get("error") {
            let message = error
                .as_str()
                .map(str::to_owned)
                .unwrap_or_else(|| error.to_string());
            out.events.push(SessionEvent::Error { message, recoverable: true });
            return out;
        }

        match json.get("type").and_then(|v| v.as_str()) {
            Some("system") => self.ingest_system(json, &mut out),
            Some("stream_event") => {
                if let Some(event) = json.get("event") {
                    self.ingest_stream_event(event, &mut out);
                }
            }
            Some("assistant") => self.ingest_assistant(json, &mut out),
            Some("result") => self.ingest_result(json, &mut out),
            // User echoes and unrecognised entries are ignored.
            _ => {}
        }
        out
    }

    fn ingest_system(&mut self, json: &Value, out: &mut Ingest) {
        match json.get("subtype").and_then(|v| v.as_str()) {
            Some("init") => {
                if let Some(id) = json.get("session_id").and_then(|v| v.as_str()) {
                    self.upstream_id = Some(id.to_owned());
                }
                let model = json
                    .get("model")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_owned();
                self.model = Some(model.clone());
                let tools = json
                    .get("tools")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter_map(|t| t.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                out.ready = true;
                out.events.push(SessionEvent::Ready { model, tools });
            }
            Some("status") => {
                let status = json
                    .get("status")
                    .or_else(|| json.get("message"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_owned();
                out.events.push(SessionEvent::StatusUpdate { status });
            }
            _ => {}
        }
    }

    fn ingest_stream_event(&mut self, event: &Value, out: &mut Ingest) {
        match event.get("type").and_then(|v| v.as_str()) {
            Some("message_start") => {
                let id = event
                    .get("message")
                    .and_then(|m| m.get("id"))
                    .and_then(|v| v.as_str())
                    .map(str::to_owned)
                    .unwrap_or_else(|| self.next_message_id());
                self.current_message = Some(id);
            }
            Some("content_block_start") => {
                let index = event.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let block = event.get("content_block");
                match block.and_then(|b| b.get("type")).and_then(|v| v.as_str()) {
                    Some("text") => self.open_text_stream(out),
                    Some("tool_use") => {
                        let message_id = self.current_message_id();
                        let name = block
                            .and_then(|b| b.get("name"))
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown")
                            .to_owned();
                        let tool_use_id = block
                            .and_then(|b| b.get("id"))
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_owned();
                        out.events.push(SessionEvent::ToolStart {
                            message_id,
                            tool: name.clone(),
                            input: None,
                        });
                        self.tools.insert(
                            index,
                            ToolAcc { tool_use_id, name, buf: String::new(), overflowed: false },
                        );
                    }
                    _ => {}
                }
            }
            Some("content_block_delta") => {
                let index = event.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let delta = event.get("delta");
                match delta.and_then(|d| d.get("type")).and_then(|v| v.as_str()) {
                    Some("text_delta") => {
                        let text = delta
                            .and_then(|d| d.get("text"))
                            .and_then(|v| v.as_str())
                            .unwrap_or_default();
                        // A delta outside a bracket opens one; the upstream
                        // occasionally skips content_block_start on resume.
                        self.open_text_stream(out);
                        if let Some(ref message_id) = self.open_stream {
                            out.events.push(SessionEvent::StreamDelta {
                                message_id: message_id.clone(),
                                delta: text.to_owned(),
                            });
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(acc) = self.tools.get_mut(&index) {
                            let chunk = delta
                                .and_then(|d| d.get("partial_json"))
                                .and_then(|v| v.as_str())
                                .unwrap_or_default();
                            if acc.buf.len() + chunk.len() <= TOOL_INPUT_CAP {
                                acc.buf.push_str(chunk);
                            } else {
                                acc.overflowed = true;
                            }
                        }
                    }
                    _ => {}
                }
            }
            Some("content_block_stop") => {
                let index = event.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                if let Some(acc) = self.tools.remove(&index) {
                    self.finish_tool(acc, out);
                } else if self.open_stream.is_some() {
                    if let Some(end) = self.close_open_stream() {
                        if let Some(ref id) = self.current_message {
                            self.streamed.insert(id.clone());
                        }
                        out.events.push(end);
                    }
                }
            }
            Some("message_stop") => {
                if let Some(end) = self.close_open_stream() {
                    if let Some(ref id) = self.current_message {
                        self.streamed.insert(id.clone());
                    }
                    out.events.push(end);
                }
            }
            _ => {}
        }
    }

    fn current_message_id(&mut self) -> String {
        match self.current_message {
            Some(ref id) => id.clone(),
            None => {
                let id = self.next_message_id();
                self.current_message = Some(id.clone());
                id
            }
        }
    }

    /// Open the text stream for the current message. Idempotent: a duplicate
    /// start within a live stream is suppressed.
    fn open_text_stream(&mut self, out: &mut Ingest) {
        if self.open_stream.is_some() {
            return;
        }
        let message_id = self.current_message_id();
        self.open_stream = Some(message_id.clone());
        out.events.push(SessionEvent::StreamStart { message_id });
    }

    fn finish_tool(&mut self, acc: ToolAcc, out: &mut Ingest) {
        let input: Option<Value> = if acc.overflowed {
            None
        } else {
            serde_json::from_str(&acc.buf).ok()
        };
        if !acc.tool_use_id.is_empty() {
            self.dispatched.insert(acc.tool_use_id.clone());
        }
        self.dispatch_tool(&acc.tool_use_id, &acc.name, input.as_ref(), out);
    }

    /// Special-tool handling shared by the streamed and complete paths.
    fn dispatch_tool(
        &mut self,
        tool_use_id: &str,
        name: &str,
        input: Option<&Value>,
        out: &mut Ingest,
    ) {
        match name {
            "AskUserQuestion" => {
                let questions = input.map(parse_questions).unwrap_or_default();
                out.question = Some(QuestionPrompt {
                    tool_use_id: tool_use_id.to_owned(),
                    questions,
                });
            }
            "Task" => {
                let description = input
                    .and_then(|i| i.get("description"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("agent task")
                    .to_owned();
                let marker = AgentMarker {
                    tool_use_id: tool_use_id.to_owned(),
                    description: description.clone(),
                    started_at: now_ms(),
                };
                self.markers.insert(tool_use_id.to_owned(), marker.clone());
                out.events.push(SessionEvent::AgentSpawned {
                    tool_use_id: marker.tool_use_id,
                    description: marker.description,
                    started_at: marker.started_at,
                });
            }
            "EnterPlanMode" => {
                if !self.plan_active {
                    self.plan_active = true;
                    out.events.push(SessionEvent::PlanStarted);
                }
            }
            "ExitPlanMode" => {
                // Prompts ride along until the upcoming result closes the cycle.
                self.plan_prompts = input
                    .and_then(|i| i.get("allowedPrompts"))
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter_map(|p| p.as_str().map(String::from)).collect());
            }
            _ => {}
        }
    }

    fn ingest_assistant(&mut self, json: &Value, out: &mut Ingest) {
        let message = json.get("message");
        let message_id = message
            .and_then(|m| m.get("id"))
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        let already_streamed = message_id
            .as_deref()
            .map(|id| self.streamed.contains(id))
            .unwrap_or(false);

        let Some(content) = message.and_then(|m| m.get("content")).and_then(|c| c.as_array())
        else {
            return;
        };

        for block in content {
            match block.get("type").and_then(|v| v.as_str()) {
                Some("text") if !already_streamed => {
                    let text = block.get("text").and_then(|v| v.as_str()).unwrap_or_default();
                    if !text.is_empty() {
                        out.events.push(SessionEvent::Message {
                            kind: MessageKind::Response,
                            content: text.to_owned(),
                            tool: None,
                            options: None,
                            timestamp: now_ms(),
                        });
                    }
                }
                Some("tool_use") => {
                    let tool_use_id =
                        block.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_owned();
                    // Blocks that already came through the streaming path were
                    // dispatched at content_block_stop.
                    if !tool_use_id.is_empty() && self.dispatched.contains(&tool_use_id) {
                        continue;
                    }
                    let name =
                        block.get("name").and_then(|v| v.as_str()).unwrap_or("unknown").to_owned();
                    let input = block.get("input").cloned();
                    out.events.push(SessionEvent::ToolStart {
                        message_id: message_id.clone().unwrap_or_else(|| "msg-0".to_owned()),
                        tool: name.clone(),
                        input: input.clone(),
                    });
                    if !tool_use_id.is_empty() {
                        self.dispatched.insert(tool_use_id.clone());
                    }
                    self.dispatch_tool(&tool_use_id, &name, input.as_ref(), out);
                }
                _ => {}
            }
        }
    }

    fn ingest_result(&mut self, json: &Value, out: &mut Ingest) {
        if let Some(end) = self.close_open_stream() {
            out.events.push(end);
        }
        if self.plan_active {
            self.plan_active = false;
            out.events.push(SessionEvent::PlanReady { allowed_prompts: self.plan_prompts.take() });
        }
        out.events.push(SessionEvent::Result {
            cost: json
                .get("total_cost_usd")
                .or_else(|| json.get("cost_usd"))
                .and_then(|v| v.as_f64()),
            duration: json.get("duration_ms").and_then(|v| v.as_u64()),
            usage: json.get("usage").cloned(),
        });
        out.events.extend(self.drain_markers());
        if let Some(id) = json.get("session_id").and_then(|v| v.as_str()) {
            self.upstream_id = Some(id.to_owned());
        }
        self.tools.clear();
        self.streamed.clear();
        self.dispatched.clear();
        self.current_message = None;
        out.turn_ended = true;
    }
}

impl Default for TurnNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the `AskUserQuestion` input payload into question/options pairs.
///
/// Options may be plain strings or `{label: ...}` objects.
pub fn parse_questions(input: &Value) -> Vec<Question> {
    let Some(items) = input.get("questions").and_then(|v| v.as_array()) else {
        return vec![];
    };
    items
        .iter()
        .filter_map(|q| {
            let question = q.get("question").and_then(|v| v.as_str())?.to_owned();
            let options = q
                .get("options")
                .and_then(|v| v.as_array())
                .map(|opts| {
                    opts.iter()
                        .filter_map(|o| {
                            o.as_str()
                                .map(String::from)
                                .or_else(|| {
                                    o.get("label").and_then(|l| l.as_str()).map(String::from)
                                })
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(Question { question, options })
        })
        .collect()
}

#[cfg(test)]
#[path = "stream_tests.rs"]
mod tests;

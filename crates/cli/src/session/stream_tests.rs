// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::{json, Value};

use crate::event::SessionEvent;
use crate::session::stream::{parse_questions, TurnNormalizer, TOOL_INPUT_CAP};

fn init_entry() -> Value {
    json!({
        "type": "system",
        "subtype": "init",
        "session_id": "conv-abc",
        "model": "sonnet",
        "tools": ["Bash", "Read"],
    })
}

fn block_start_text(index: u64) -> Value {
    json!({
        "type": "stream_event",
        "event": {
            "type": "content_block_start",
            "index": index,
            "content_block": { "type": "text" },
        },
    })
}

fn text_delta(index: u64, text: &str) -> Value {
    json!({
        "type": "stream_event",
        "event": {
            "type": "content_block_delta",
            "index": index,
            "delta": { "type": "text_delta", "text": text },
        },
    })
}

fn block_stop(index: u64) -> Value {
    json!({
        "type": "stream_event",
        "event": { "type": "content_block_stop", "index": index },
    })
}

fn tool_start(index: u64, id: &str, name: &str) -> Value {
    json!({
        "type": "stream_event",
        "event": {
            "type": "content_block_start",
            "index": index,
            "content_block": { "type": "tool_use", "id": id, "name": name },
        },
    })
}

fn input_delta(index: u64, partial: &str) -> Value {
    json!({
        "type": "stream_event",
        "event": {
            "type": "content_block_delta",
            "index": index,
            "delta": { "type": "input_json_delta", "partial_json": partial },
        },
    })
}

fn result_entry() -> Value {
    json!({
        "type": "result",
        "total_cost_usd": 0.25,
        "duration_ms": 1234,
        "usage": { "input_tokens": 10 },
        "session_id": "conv-abc",
    })
}

#[test]
fn init_produces_ready_and_captures_upstream_id() {
    let mut n = TurnNormalizer::new();
    let out = n.ingest(&init_entry());
    assert!(out.ready);
    assert_eq!(
        out.events,
        vec![SessionEvent::Ready {
            model: "sonnet".to_owned(),
            tools: vec!["Bash".to_owned(), "Read".to_owned()],
        }]
    );
    assert_eq!(n.upstream_id(), Some("conv-abc"));
    assert_eq!(n.model(), Some("sonnet"));
}

#[test]
fn text_stream_brackets_strictly() {
    let mut n = TurnNormalizer::new();
    n.ingest(&block_start_text(0));
    let d1 = n.ingest(&text_delta(0, "hel"));
    let d2 = n.ingest(&text_delta(0, "lo"));
    let end = n.ingest(&block_stop(0));

    assert!(matches!(d1.events[0], SessionEvent::StreamDelta { ref delta, .. } if delta == "hel"));
    assert!(matches!(d2.events[0], SessionEvent::StreamDelta { ref delta, .. } if delta == "lo"));
    assert!(matches!(end.events[0], SessionEvent::StreamEnd { .. }));
}

#[test]
fn duplicate_stream_start_is_suppressed() {
    let mut n = TurnNormalizer::new();
    let first = n.ingest(&block_start_text(0));
    assert_eq!(first.events.len(), 1);
    let second = n.ingest(&block_start_text(0));
    assert!(second.events.is_empty(), "duplicate start must be idempotent");
}

#[test]
fn delta_without_start_opens_the_bracket() {
    let mut n = TurnNormalizer::new();
    let out = n.ingest(&text_delta(0, "x"));
    assert!(matches!(out.events[0], SessionEvent::StreamStart { .. }));
    assert!(matches!(out.events[1], SessionEvent::StreamDelta { .. }));
}

#[test]
fn streamed_text_is_not_reemitted_from_assistant_entry() {
    let mut n = TurnNormalizer::new();
    n.ingest(&json!({
        "type": "stream_event",
        "event": { "type": "message_start", "message": { "id": "msg_a" } },
    }));
    n.ingest(&block_start_text(0));
    n.ingest(&text_delta(0, "hello"));
    n.ingest(&block_stop(0));

    let out = n.ingest(&json!({
        "type": "assistant",
        "message": {
            "id": "msg_a",
            "content": [{ "type": "text", "text": "hello" }],
        },
    }));
    assert!(out.events.is_empty(), "already-streamed text must not repeat: {:?}", out.events);
}

#[test]
fn unstreamed_assistant_text_becomes_a_message() {
    let mut n = TurnNormalizer::new();
    let out = n.ingest(&json!({
        "type": "assistant",
        "message": { "id": "msg_b", "content": [{ "type": "text", "text": "direct" }] },
    }));
    assert!(
        matches!(out.events[0], SessionEvent::Message { ref content, .. } if content == "direct")
    );
}

#[test]
fn tool_use_starts_with_null_input_then_accumulates() {
    let mut n = TurnNormalizer::new();
    let start = n.ingest(&tool_start(0, "toolu_1", "Bash"));
    assert!(matches!(
        start.events[0],
        SessionEvent::ToolStart { ref tool, ref input, .. } if tool == "Bash" && input.is_none()
    ));

    n.ingest(&input_delta(0, r#"{"com"#));
    n.ingest(&input_delta(0, r#"mand":"ls"}"#));
    let out = n.ingest(&block_stop(0));
    // Plain tools produce no extra event at block end.
    assert!(out.events.is_empty());
}

#[test]
fn oversized_tool_input_is_dropped_but_tool_still_ran() {
    let mut n = TurnNormalizer::new();
    n.ingest(&tool_start(0, "toolu_1", "AskUserQuestion"));
    let big = "x".repeat(TOOL_INPUT_CAP + 1);
    n.ingest(&input_delta(0, &big));
    let out = n.ingest(&block_stop(0));
    // Overflow parses as no input; the question prompt still surfaces.
    let q = out.question.as_ref();
    assert!(q.is_some());
    assert!(q.map(|q| q.questions.is_empty()).unwrap_or(false));
}

#[test]
fn ask_user_question_surfaces_prompt() {
    let mut n = TurnNormalizer::new();
    n.ingest(&tool_start(0, "toolu_q", "AskUserQuestion"));
    let input = json!({
        "questions": [{
            "question": "Deploy now?",
            "options": [{ "label": "yes" }, { "label": "no" }],
        }],
    });
    n.ingest(&input_delta(0, &input.to_string()));
    let out = n.ingest(&block_stop(0));

    let q = out.question.as_ref();
    assert_eq!(q.map(|q| q.tool_use_id.as_str()), Some("toolu_q"));
    let questions = q.map(|q| q.questions.clone()).unwrap_or_default();
    assert_eq!(questions.len(), 1);
    assert_eq!(questions[0].question, "Deploy now?");
    assert_eq!(questions[0].options, vec!["yes", "no"]);
}

#[test]
fn task_tool_spawns_marker_and_result_completes_it() {
    let mut n = TurnNormalizer::new();
    n.ingest(&tool_start(0, "toolu_t", "Task"));
    n.ingest(&input_delta(0, r#"{"description":"explore the repo"}"#));
    let spawned = n.ingest(&block_stop(0));
    assert!(matches!(
        spawned.events[0],
        SessionEvent::AgentSpawned { ref description, .. } if description == "explore the repo"
    ));

    let done = n.ingest(&result_entry());
    assert!(done.turn_ended);
    let completed: Vec<_> = done
        .events
        .iter()
        .filter(|e| matches!(e, SessionEvent::AgentCompleted { .. }))
        .collect();
    assert_eq!(completed.len(), 1);
}

#[test]
fn plan_cycle_emits_started_then_ready_after_result() {
    let mut n = TurnNormalizer::new();
    n.ingest(&tool_start(0, "toolu_p1", "EnterPlanMode"));
    let started = n.ingest(&block_stop(0));
    assert!(started.events.contains(&SessionEvent::PlanStarted));

    n.ingest(&tool_start(1, "toolu_p2", "ExitPlanMode"));
    n.ingest(&input_delta(1, r#"{"allowedPrompts":["run tests"]}"#));
    let exited = n.ingest(&block_stop(1));
    assert!(exited.events.is_empty(), "plan_ready waits for the result");

    let done = n.ingest(&result_entry());
    assert!(done.events.iter().any(|e| matches!(
        e,
        SessionEvent::PlanReady { allowed_prompts: Some(p) } if p == &vec!["run tests".to_owned()]
    )));
}

#[test]
fn result_closes_open_stream_defensively() {
    let mut n = TurnNormalizer::new();
    n.ingest(&block_start_text(0));
    n.ingest(&text_delta(0, "unfinished"));
    let done = n.ingest(&result_entry());

    assert!(matches!(done.events[0], SessionEvent::StreamEnd { .. }));
    assert!(matches!(
        done.events[1],
        SessionEvent::Result { cost: Some(c), duration: Some(1234), .. } if (c - 0.25).abs() < 1e-9
    ));
    assert!(done.turn_ended);
}

#[test]
fn error_entries_become_error_events() {
    let mut n = TurnNormalizer::new();
    let out = n.ingest(&json!({"error": "boom"}));
    assert!(matches!(
        out.events[0],
        SessionEvent::Error { ref message, recoverable: true } if message == "boom"
    ));
}

#[test]
fn status_lines_are_forwarded() {
    let mut n = TurnNormalizer::new();
    let out = n.ingest(&json!({"type": "system", "subtype": "status", "status": "compacting"}));
    assert!(matches!(
        out.events[0],
        SessionEvent::StatusUpdate { ref status } if status == "compacting"
    ));
}

#[yare::parameterized(
    object_options = { json!({"questions": [{"question": "q", "options": [{"label": "a"}]}]}), vec!["a".to_owned()] },
    string_options = { json!({"questions": [{"question": "q", "options": ["a", "b"]}]}), vec!["a".to_owned(), "b".to_owned()] },
    no_options     = { json!({"questions": [{"question": "q"}]}), vec![] },
)]
fn question_parsing(input: Value, options: Vec<String>) {
    let questions = parse_questions(&input);
    assert_eq!(questions.len(), 1);
    assert_eq!(questions[0].options, options);
}

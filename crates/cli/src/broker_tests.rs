// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;

use crate::broker::{derive_description, Decision, PermissionBroker};
use crate::event::{Question, SessionEvent, SessionEventEnvelope};
use crate::test_support::EventCollector;

fn broker() -> (Arc<PermissionBroker>, broadcast::Receiver<SessionEventEnvelope>) {
    let (tx, rx) = broadcast::channel(64);
    (Arc::new(PermissionBroker::new(tx)), rx)
}

#[yare::parameterized(
    allow        = { "allow", Decision::Allow },
    allow_always = { "allowAlways", Decision::AllowAlways },
    deny         = { "deny", Decision::Deny },
    unknown      = { "whatever", Decision::Deny },
    empty        = { "", Decision::Deny },
)]
fn decision_parsing(s: &str, expected: Decision) {
    assert_eq!(Decision::parse(s), expected);
}

#[yare::parameterized(
    description = { json!({"description": "open a file", "command": "x"}), "open a file" },
    command     = { json!({"command": "ls -la"}), "ls -la" },
    file_path   = { json!({"file_path": "/etc/hosts"}), "/etc/hosts" },
    pattern     = { json!({"pattern": "fn main"}), "fn main" },
    query       = { json!({"query": "weather"}), "weather" },
)]
fn description_priority(input: serde_json::Value, expected: &str) {
    assert_eq!(derive_description(&input), expected);
}

#[test]
fn description_falls_back_to_truncated_dump() {
    let input = json!({"blob": "x".repeat(500)});
    let description = derive_description(&input);
    assert_eq!(description.len(), 200);
}

#[tokio::test]
async fn client_decision_resolves_once() -> anyhow::Result<()> {
    let (broker, rx) = broker();
    let mut events = EventCollector::new(rx);

    let (request_id, decision_rx) =
        broker.create_permission("s1", "Bash", json!({"command": "ls"}));
    assert!(request_id.starts_with("perm-1-"));

    // The session-scoped permission_request is emitted on ingress.
    let envelope = events.next().await?;
    assert_eq!(envelope.session_id, "s1");
    assert!(matches!(envelope.event, SessionEvent::PermissionRequest { .. }));

    assert!(broker.respond_permission(&request_id, "allow"));
    assert_eq!(decision_rx.await?, Decision::Allow);

    // Resolved ids are gone; a second response is refused.
    assert!(!broker.respond_permission(&request_id, "deny"));
    assert_eq!(broker.pending_count(), 0);
    Ok(())
}

#[tokio::test]
async fn responses_route_by_request_id_not_session() -> anyhow::Result<()> {
    // A client viewing s2 answers a prompt that originated in s1: the broker
    // accepts by request id alone.
    let (broker, _rx) = broker();
    let (id_s1, rx_s1) = broker.create_permission("s1", "Bash", json!({}));
    let (_id_s2, _rx_s2) = broker.create_permission("s2", "Bash", json!({}));

    assert_eq!(broker.session_of(&id_s1).as_deref(), Some("s1"));
    assert!(broker.respond_permission(&id_s1, "allow"));
    assert_eq!(rx_s1.await?, Decision::Allow);

    // s2's prompt is untouched.
    assert_eq!(broker.pending_count(), 1);
    Ok(())
}

#[tokio::test]
async fn unknown_request_id_is_refused() {
    let (broker, _rx) = broker();
    assert!(!broker.respond_permission("perm-999-deadbeef", "allow"));
}

#[tokio::test]
async fn turn_end_denies_all_pending_for_session() -> anyhow::Result<()> {
    let (broker, _rx) = broker();
    let (_, rx1) = broker.create_permission("s1", "Bash", json!({}));
    let (_, rx2) = broker.create_permission("s1", "Write", json!({}));
    let (_, rx_other) = broker.create_permission("s2", "Bash", json!({}));

    broker.cancel_session("s1");
    assert_eq!(rx1.await?, Decision::Deny);
    assert_eq!(rx2.await?, Decision::Deny);
    assert_eq!(broker.pending_count(), 1);

    broker.shutdown();
    assert_eq!(rx_other.await?, Decision::Deny);
    assert_eq!(broker.pending_count(), 0);
    Ok(())
}

#[tokio::test]
async fn questions_resolve_with_answer() -> anyhow::Result<()> {
    let (broker, rx) = broker();
    let mut events = EventCollector::new(rx);

    let questions = vec![Question { question: "Which?".to_owned(), options: vec![] }];
    let (request_id, answer_rx) = broker.create_question("s1", "toolu_1", questions);

    let envelope = events.next().await?;
    assert!(matches!(envelope.event, SessionEvent::UserQuestion { .. }));

    assert!(broker.respond_question(&request_id, "the first one"));
    assert_eq!(answer_rx.await?, "the first one");
    Ok(())
}

#[tokio::test]
async fn question_routing_by_session_fallback() -> anyhow::Result<()> {
    let (broker, _rx) = broker();
    let (_, answer_rx) = broker.create_question("s1", "toolu_1", vec![]);

    // Permission responses never resolve questions.
    let (perm_id, _perm_rx) = broker.create_permission("s1", "Bash", json!({}));
    assert!(!broker.respond_question(&perm_id, "nope"));

    assert!(broker.respond_question_for_session("s1", "answer"));
    assert_eq!(answer_rx.await?, "answer");
    assert!(!broker.respond_question_for_session("s1", "again"));
    Ok(())
}

#[tokio::test]
async fn pending_cap_auto_denies_excess() -> anyhow::Result<()> {
    let (tx, _rx) = broadcast::channel(64);
    let broker = Arc::new(PermissionBroker::new(tx).with_max_pending(2));

    let (_, _rx1) = broker.create_permission("s1", "Bash", json!({}));
    let (_, _rx2) = broker.create_permission("s1", "Bash", json!({}));
    let (_, rx3) = broker.create_permission("s1", "Bash", json!({}));
    assert_eq!(rx3.await?, Decision::Deny);
    assert_eq!(broker.pending_count(), 2);
    Ok(())
}

#[tokio::test]
async fn abandon_removes_without_resolving() {
    let (broker, _rx) = broker();
    let (request_id, _decision_rx) = broker.create_permission("s1", "Bash", json!({}));
    broker.abandon(&request_id);
    assert_eq!(broker.pending_count(), 0);
    assert!(!broker.respond_permission(&request_id, "allow"));
}

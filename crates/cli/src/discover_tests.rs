// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use crate::discover::{list_terminal_sessions, validate_session_name};
use crate::spawn::Exec;
use crate::test_support::FakeExec;

#[yare::parameterized(
    simple       = { "work", true },
    dotted       = { "my.project", true },
    underscored  = { "my_project", true },
    hyphenated   = { "agent-1", true },
    digits       = { "session42", true },
    empty        = { "", false },
    space        = { "my session", false },
    semicolon    = { "x;rm -rf /", false },
    quote        = { "x'y", false },
    dollar       = { "$(whoami)", false },
    unicode      = { "séance", false },
)]
fn name_whitelist(name: &str, valid: bool) {
    assert_eq!(validate_session_name(name), valid, "{name:?}");
}

#[tokio::test]
async fn lists_and_parses_tmux_sessions() -> anyhow::Result<()> {
    let exec = FakeExec::new();
    exec.script_output(0, "work\t2\t1\nscratch\t1\t0\n", "");

    let sessions = list_terminal_sessions(&(Arc::clone(&exec) as Arc<dyn Exec>)).await;
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].name, "work");
    assert_eq!(sessions[0].windows, 2);
    assert!(sessions[0].attached);
    assert_eq!(sessions[1].name, "scratch");
    assert!(!sessions[1].attached);
    Ok(())
}

#[tokio::test]
async fn tmux_failure_yields_empty_list() {
    let exec = FakeExec::new();
    exec.script_output(1, "", "no server running");
    let sessions = list_terminal_sessions(&(Arc::clone(&exec) as Arc<dyn Exec>)).await;
    assert!(sessions.is_empty());
}

#[tokio::test]
async fn hostile_names_are_filtered_out() {
    let exec = FakeExec::new();
    exec.script_output(0, "good\t1\t0\nbad name\t1\t0\n", "");
    let sessions = list_terminal_sessions(&(Arc::clone(&exec) as Arc<dyn Exec>)).await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].name, "good");
}

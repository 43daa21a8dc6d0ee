// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use serde_json::json;

use super::{parse_control, ControlMsg, Supervisor, RESTART_BACKOFF_SECS};
use crate::spawn::{ChildSpec, ExitStatus, Spawner};
use crate::test_support::{chroxy_home_guard, test_settings, FakeExec, FakeSpawner};

fn supervisor(
    spawner: &Arc<FakeSpawner>,
    exec: &Arc<FakeExec>,
) -> Supervisor {
    Supervisor::new(
        test_settings(Some("secret123")),
        ChildSpec::new("worker"),
        None,
        Arc::clone(spawner) as _,
        Arc::clone(exec) as _,
    )
}

#[yare::parameterized(
    ready          = { r#"{"type":"ready"}"#, true },
    drain_complete = { r#"{"type":"drain_complete"}"#, true },
    other_json     = { r#"{"type":"listening"}"#, false },
    log_noise      = { "worker listening on 0.0.0.0:8765", false },
)]
fn control_parsing(line: &str, is_control: bool) {
    assert_eq!(parse_control(line).is_some(), is_control);
}

#[test]
fn control_kinds() {
    assert!(matches!(parse_control(r#"{"type":"ready"}"#), Some(ControlMsg::Ready)));
    assert!(matches!(
        parse_control(r#"{"type":"drain_complete"}"#),
        Some(ControlMsg::DrainComplete)
    ));
}

#[test]
fn backoff_sequence_matches_policy() {
    assert_eq!(RESTART_BACKOFF_SECS, [2, 2, 3, 3, 5, 5, 8, 8, 10, 10]);
}

#[test]
fn metrics_snapshot_shape() {
    let spawner = FakeSpawner::new();
    let exec = FakeExec::new();
    let sup = supervisor(&spawner, &exec);
    let snapshot = sup.metrics().snapshot();
    assert!(snapshot["supervisorUptime"].is_number());
    assert_eq!(snapshot["restartCount"], 0);
    assert!(snapshot["workerUptime"].is_null());
    assert!(snapshot["lastExit"].is_null());
}

#[tokio::test(start_paused = true)]
#[serial_test::serial]
async fn crashed_worker_restarts_with_backoff() -> anyhow::Result<()> {
    let (_guard, _home) = chroxy_home_guard()?;
    let spawner = FakeSpawner::new();
    let exec = FakeExec::new();
    let sup = supervisor(&spawner, &exec);
    let metrics = sup.metrics();

    let run = tokio::spawn(sup.run());

    spawner.wait_for_spawns(1).await?;
    let worker = spawner.last_child().ok_or_else(|| anyhow::anyhow!("no worker"))?;
    worker.emit(&json!({"type": "ready"})).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    worker.exit(ExitStatus { code: Some(1), signal: None });
    spawner.wait_for_spawns(2).await?;

    assert!(metrics.restart_count.load(std::sync::atomic::Ordering::Relaxed) >= 1);
    let last_exit = metrics.last_exit.lock().clone();
    assert_eq!(last_exit.map(|e| e.code), Some(Some(1)));

    run.abort();
    Ok(())
}

#[tokio::test(start_paused = true)]
#[serial_test::serial]
async fn restart_ceiling_gives_up() -> anyhow::Result<()> {
    let (_guard, _home) = chroxy_home_guard()?;
    let spawner = FakeSpawner::new();
    let exec = FakeExec::new();
    let sup = supervisor(&spawner, &exec).with_max_restarts(2);

    let run = tokio::spawn(sup.run());
    spawner.wait_for_spawns(1).await?;

    for _ in 0..3 {
        let worker = spawner.last_child().ok_or_else(|| anyhow::anyhow!("no worker"))?;
        worker.exit(ExitStatus { code: Some(1), signal: None });
        tokio::time::sleep(std::time::Duration::from_secs(15)).await;
    }

    let result = tokio::time::timeout(std::time::Duration::from_secs(60), run).await??;
    assert!(result.is_err(), "supervisor must give up past the ceiling");
    Ok(())
}

#[tokio::test]
#[serial_test::serial]
async fn deploy_crash_loop_rolls_back_to_known_good() -> anyhow::Result<()> {
    let (_guard, home) = chroxy_home_guard()?;
    std::fs::create_dir_all(&home)?;
    std::fs::write(home.join("deploy-marker"), "deployed")?;
    std::fs::write(home.join("known-good-ref"), "abc123def\n")?;

    let spawner = FakeSpawner::new();
    let exec = FakeExec::new();
    let mut sup = supervisor(&spawner, &exec);

    // Two exits inside the window: counted, no rollback yet.
    sup.maybe_rollback().await;
    sup.maybe_rollback().await;
    assert!(exec.calls().is_empty());

    // Third exit triggers the checkout of the recorded ref.
    sup.maybe_rollback().await;
    let calls = exec.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "git");
    assert_eq!(calls[0].1, vec!["checkout".to_owned(), "abc123def".to_owned()]);

    // Counter reset: the next exit starts a fresh window count.
    sup.maybe_rollback().await;
    assert_eq!(exec.calls().len(), 1);
    Ok(())
}

#[tokio::test]
#[serial_test::serial]
async fn no_rollback_without_deploy_marker() -> anyhow::Result<()> {
    let (_guard, _home) = chroxy_home_guard()?;
    let spawner = FakeSpawner::new();
    let exec = FakeExec::new();
    let mut sup = supervisor(&spawner, &exec);

    for _ in 0..5 {
        sup.maybe_rollback().await;
    }
    assert!(exec.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn shutdown_drains_the_worker_first() -> anyhow::Result<()> {
    let spawner = FakeSpawner::new();
    let exec = FakeExec::new();
    let mut sup = supervisor(&spawner, &exec);

    let handle = spawner.spawn(&ChildSpec::new("worker"))?;
    let child = spawner.last_child().ok_or_else(|| anyhow::anyhow!("no worker"))?;
    let worker = super::WorkerHandle {
        pid: handle.pid,
        stdin_tx: handle.stdin_tx,
        lines: handle.lines,
        exit_rx: handle.exit_rx,
    };

    let shutdown = tokio::spawn(async move {
        sup.shutdown(worker).await;
    });

    for _ in 0..100 {
        if !child.stdin_lines().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    let lines = child.stdin_lines();
    let msg: serde_json::Value = serde_json::from_str(&lines[0])?;
    assert_eq!(msg["type"], "drain");
    assert_eq!(msg["timeout_secs"], 30);

    child.emit(&json!({"type": "drain_complete"})).await;
    tokio::time::timeout(std::time::Duration::from_secs(2), shutdown).await??;
    Ok(())
}

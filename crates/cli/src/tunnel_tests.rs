// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use crate::config::TunnelMode;
use crate::spawn::ExitStatus;
use crate::test_support::FakeSpawner;
use crate::tunnel::{Tunnel, TunnelEvent};

fn quick(spawner: &Arc<FakeSpawner>) -> Arc<Tunnel> {
    Tunnel::new(TunnelMode::Quick, 8765, Arc::clone(spawner) as _)
}

#[tokio::test]
async fn ephemeral_url_is_scraped_from_logs() -> anyhow::Result<()> {
    let spawner = FakeSpawner::new();
    spawner.script_lines(vec![
        "preparing tunnel".to_owned(),
        "visit https://witty-otter.trycloudflare.com to connect".to_owned(),
    ]);

    let tunnel = quick(&spawner);
    let url = tunnel.start().await?;
    assert_eq!(url, "https://witty-otter.trycloudflare.com");
    assert_eq!(tunnel.current_url(), url);

    let child = spawner.last_child().ok_or_else(|| anyhow::anyhow!("no child"))?;
    assert_eq!(child.spec.program, "cloudflared");
    assert!(child.spec.args.contains(&"--url".to_owned()));
    Ok(())
}

#[tokio::test]
async fn named_mode_derives_url_from_hostname() -> anyhow::Result<()> {
    let spawner = FakeSpawner::new();
    spawner.script_lines(vec![
        "INF Registered tunnel connection connIndex=0".to_owned(),
    ]);

    let tunnel = Tunnel::new(
        TunnelMode::Named { hostname: "chroxy.example.com".to_owned() },
        8765,
        Arc::clone(&spawner) as _,
    );
    let url = tunnel.start().await?;
    assert_eq!(url, "https://chroxy.example.com");
    Ok(())
}

#[tokio::test]
async fn exit_before_url_fails_start() -> anyhow::Result<()> {
    let spawner = FakeSpawner::new();
    let tunnel = quick(&spawner);

    let start = tokio::spawn({
        let tunnel = Arc::clone(&tunnel);
        async move { tunnel.start().await }
    });
    spawner.wait_for_spawns(1).await?;
    spawner
        .last_child()
        .ok_or_else(|| anyhow::anyhow!("no child"))?
        .exit(ExitStatus { code: Some(1), signal: None });

    let result = start.await?;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn no_url_within_deadline_fails_start() -> anyhow::Result<()> {
    let spawner = FakeSpawner::new();
    let tunnel = quick(&spawner);
    let result = tunnel.start().await;
    assert!(result.is_err(), "expected first-URL timeout");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn recovery_announces_lost_recovered_and_url_change() -> anyhow::Result<()> {
    let spawner = FakeSpawner::new();
    spawner.script_lines(vec!["https://first.trycloudflare.com".to_owned()]);

    let tunnel = quick(&spawner);
    let mut events = tunnel.subscribe();
    tunnel.start().await?;

    // Second child comes up on a different URL after the crash.
    spawner.script_lines(vec!["https://second.trycloudflare.com".to_owned()]);
    spawner
        .last_child()
        .ok_or_else(|| anyhow::anyhow!("no child"))?
        .exit(ExitStatus { code: Some(1), signal: None });

    assert_eq!(events.recv().await?, TunnelEvent::Lost);
    assert_eq!(events.recv().await?, TunnelEvent::Recovering { attempt: 1 });
    assert_eq!(
        events.recv().await?,
        TunnelEvent::Recovered { url: "https://second.trycloudflare.com".to_owned() }
    );
    assert_eq!(
        events.recv().await?,
        TunnelEvent::UrlChanged {
            old_url: "https://first.trycloudflare.com".to_owned(),
            new_url: "https://second.trycloudflare.com".to_owned(),
        }
    );
    assert_eq!(tunnel.current_url(), "https://second.trycloudflare.com");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn exhausted_recovery_emits_failed() -> anyhow::Result<()> {
    let spawner = FakeSpawner::new();
    spawner.script_lines(vec!["https://only.trycloudflare.com".to_owned()]);

    let tunnel = quick(&spawner);
    let mut events = tunnel.subscribe();
    tunnel.start().await?;

    // Every relaunch dies before producing a URL.
    spawner.fail_spawns(3);
    spawner
        .last_child()
        .ok_or_else(|| anyhow::anyhow!("no child"))?
        .exit(ExitStatus { code: Some(1), signal: None });

    assert_eq!(events.recv().await?, TunnelEvent::Lost);
    let mut saw_failed = false;
    for _ in 0..8 {
        match events.recv().await? {
            TunnelEvent::Failed => {
                saw_failed = true;
                break;
            }
            TunnelEvent::Recovering { .. } => {}
            other => anyhow::bail!("unexpected event {other:?}"),
        }
    }
    assert!(saw_failed);
    Ok(())
}

#[tokio::test]
async fn intentional_stop_suppresses_recovery() -> anyhow::Result<()> {
    let spawner = FakeSpawner::new();
    spawner.script_lines(vec!["https://gone.trycloudflare.com".to_owned()]);

    let tunnel = quick(&spawner);
    let mut events = tunnel.subscribe();
    tunnel.start().await?;

    tunnel.stop();
    spawner
        .last_child()
        .ok_or_else(|| anyhow::anyhow!("no child"))?
        .exit(ExitStatus { code: Some(0), signal: None });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err(), "no events after intentional stop");
    assert_eq!(spawner.spawn_count(), 1);
    Ok(())
}

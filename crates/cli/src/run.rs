// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker runner — shared by `main` and integration tests.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::PermissionBroker;
use crate::config::{session_state_path, Settings};
use crate::manager::{ManagerConfig, SessionManager};
use crate::session::sdk::QueryEngine;
use crate::session::{PermissionMode, SessionVariant};
use crate::spawn::{Exec, Spawner, TokioSpawner};
use crate::transport::auth::RateLimiter;
use crate::transport::state::{LifecycleState, Store, VersionInfo};
use crate::transport::build_router;
use crate::transport::ws_msg::ServerMessage;

/// Slack subtracted from the drain timeout for serialisation work.
const DRAIN_SLACK: Duration = Duration::from_secs(2);

/// Assemble worker state. Tests inject their own spawner/exec/engine.
pub fn build_store(
    settings: Settings,
    spawner: Arc<dyn Spawner>,
    exec: Arc<dyn Exec>,
    engine: Option<Arc<dyn QueryEngine>>,
) -> Arc<Store> {
    let (event_tx, _) = broadcast::channel(1024);
    let broker = Arc::new(PermissionBroker::new(event_tx.clone()));
    let manager = Arc::new(SessionManager::new(
        ManagerConfig {
            capacity: settings.max_sessions,
            default_variant: if engine.is_some() {
                SessionVariant::AgentSdk
            } else {
                SessionVariant::Headless
            },
            default_model: settings.model.clone(),
            default_cwd: settings.cwd.clone(),
            default_permission_mode: PermissionMode::Approve,
            shell_cmd: settings.shell_cmd.clone(),
            allowed_tools: settings.allowed_tools.clone(),
            resume: settings.resume.clone(),
            hook_port: settings.port,
            hook_token: settings.token.clone(),
        },
        event_tx,
        spawner,
        exec,
        Arc::clone(&broker),
        engine,
    ));

    Arc::new(Store {
        manager,
        broker,
        hub: Arc::new(crate::transport::fanout::ClientHub::new()),
        settings,
        limiter: RateLimiter::new(),
        lifecycle: LifecycleState {
            shutdown: CancellationToken::new(),
            draining: std::sync::atomic::AtomicBool::new(false),
            started_at: Instant::now(),
        },
        version: VersionInfo::default(),
    })
}

/// Spawn the hub fanout, keepalive, limiter pruning, and discovery loops.
pub fn spawn_background_tasks(store: &Arc<Store>) {
    let shutdown = store.lifecycle.shutdown.clone();
    tokio::spawn(
        Arc::clone(&store.hub).run(store.manager.subscribe(), shutdown.clone()),
    );
    tokio::spawn(Arc::clone(&store.hub).run_keepalive(shutdown.clone()));

    // Stale auth-failure entries are pruned every minute.
    {
        let store = Arc::clone(store);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => store.limiter.prune(),
                }
            }
        });
    }

    if store.settings.discovery_interval_secs > 0 {
        let store = Arc::clone(store);
        let interval = Duration::from_secs(store.settings.discovery_interval_secs);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = store.lifecycle.shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let sessions = store.manager.discover().await;
                        store
                            .hub
                            .broadcast(ServerMessage::DiscoveredSessions { sessions })
                            .await;
                    }
                }
            }
        });
    }
}

/// Run the worker server to completion.
pub async fn run_worker(settings: Settings) -> anyhow::Result<()> {
    let spawner: Arc<dyn Spawner> = Arc::new(TokioSpawner);
    let exec: Arc<dyn Exec> = Arc::new(TokioSpawner);
    let store = build_store(settings, Arc::clone(&spawner), exec, None);
    spawn_background_tasks(&store);

    // Without a supervisor the worker owns its own tunnel; supervised
    // workers are forked with the tunnel disabled.
    let tunnel = match store.settings.tunnel {
        crate::config::TunnelMode::None => None,
        ref mode => {
            let tunnel =
                crate::tunnel::Tunnel::new(mode.clone(), store.settings.port, spawner);
            let url = tunnel.start().await?;
            println!("chroxy is reachable at: {url}");
            spawn_tunnel_watch(&store, &tunnel);
            Some(tunnel)
        }
    };

    // Startup default session.
    if let Err(code) = store.manager.create(Some("main".to_owned()), None).await {
        error!(code = %code, "failed to create default session");
    }

    let listener =
        tokio::net::TcpListener::bind(("0.0.0.0", store.settings.port)).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "worker listening");

    if store.settings.supervised {
        // stdout carries control messages for the supervisor.
        println!("{}", serde_json::json!({"type": "ready"}));
        spawn_control_reader(Arc::clone(&store));
    }

    let shutdown = store.lifecycle.shutdown.clone();
    let app = build_router(Arc::clone(&store));
    let serve = std::future::IntoFuture::into_future(
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        }),
    );

    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    tokio::select! {
        result = serve => result?,
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = sigint.recv() => info!("SIGINT received"),
    }

    // Orderly teardown: pendings deny, sessions die, clients drop.
    shutdown.cancel();
    if let Some(tunnel) = tunnel {
        tunnel.stop();
    }
    store.broker.shutdown();
    store.manager.destroy_all().await;
    Ok(())
}

/// Surface tunnel faults to connected clients.
fn spawn_tunnel_watch(store: &Arc<Store>, tunnel: &Arc<crate::tunnel::Tunnel>) {
    let store = Arc::clone(store);
    let mut events = tunnel.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = store.lifecycle.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(crate::tunnel::TunnelEvent::Lost) => {
                        store
                            .hub
                            .broadcast(ServerMessage::ServerError {
                                message: "tunnel lost; reconnecting".to_owned(),
                                category: Some("tunnel".to_owned()),
                            })
                            .await;
                    }
                    Ok(crate::tunnel::TunnelEvent::Failed) => {
                        store
                            .hub
                            .broadcast(ServerMessage::ServerError {
                                message: "tunnel recovery failed; server is local-only".to_owned(),
                                category: Some("tunnel".to_owned()),
                            })
                            .await;
                    }
                    Ok(crate::tunnel::TunnelEvent::Recovered { url }) => {
                        info!(url = %url, "tunnel recovered");
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

/// Supervisor → worker control channel (one JSON object per stdin line).
fn spawn_control_reader(store: Arc<Store>) {
    tokio::spawn(async move {
        let stdin = tokio::io::stdin();
        let mut lines = tokio::io::BufReader::new(stdin).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
                continue;
            };
            if value.get("type").and_then(|v| v.as_str()) == Some("drain") {
                let timeout = value
                    .get("timeout_secs")
                    .and_then(|v| v.as_u64())
                    .map(Duration::from_secs)
                    .unwrap_or(Duration::from_secs(30));
                drain(&store, timeout).await;
            }
        }
    });
}

/// Drain: flag, notify clients, wait for idle, serialise, acknowledge.
pub async fn drain(store: &Arc<Store>, timeout: Duration) {
    info!("drain requested");
    store.lifecycle.draining.store(true, Ordering::Release);
    store
        .hub
        .broadcast(ServerMessage::ServerStatus {
            status: "restarting".to_owned(),
            message: Some("server is restarting".to_owned()),
        })
        .await;

    let deadline = tokio::time::Instant::now() + timeout.saturating_sub(DRAIN_SLACK);
    while store.manager.any_busy().await && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    let state = serde_json::json!({ "sessions": store.manager.snapshot_state().await });
    match serde_json::to_string_pretty(&state) {
        Ok(text) => {
            if let Err(e) = std::fs::write(session_state_path(), text) {
                warn!(err = %e, "failed to serialise session state");
            }
        }
        Err(e) => warn!(err = %e, "failed to encode session state"),
    }

    println!("{}", serde_json::json!({"type": "drain_complete"}));
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests against the compiled binary.
//!
//! `cargo test -p chroxy-specs` expects `target/debug/chroxy` to exist
//! (cargo builds it as a workspace dependency of the test profile).

use std::process::Command;

use chroxy_specs::{chroxy_binary, ChroxyProcess};

fn binary_exists() -> bool {
    chroxy_binary().exists()
}

#[test]
fn config_subcommand_prints_resolved_settings() -> anyhow::Result<()> {
    if !binary_exists() {
        eprintln!("skipping: chroxy binary not built");
        return Ok(());
    }
    let home = tempfile::tempdir()?;
    let output = Command::new(chroxy_binary())
        .arg("--no-auth")
        .arg("config")
        .env("CHROXY_HOME", home.path())
        .env_remove("API_TOKEN")
        .output()?;
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(parsed["port"], 8765);
    assert_eq!(parsed["tunnel"], "quick");
    Ok(())
}

#[test]
fn init_then_config_round_trips_the_token() -> anyhow::Result<()> {
    if !binary_exists() {
        eprintln!("skipping: chroxy binary not built");
        return Ok(());
    }
    let home = tempfile::tempdir()?;
    let status = Command::new(chroxy_binary())
        .arg("init")
        .env("CHROXY_HOME", home.path())
        .status()?;
    assert!(status.success());

    let config = std::fs::read_to_string(home.path().join("config.json"))?;
    let parsed: serde_json::Value = serde_json::from_str(&config)?;
    assert!(parsed["token"].is_string());
    Ok(())
}

#[tokio::test]
async fn worker_serves_health_without_auth() -> anyhow::Result<()> {
    if !binary_exists() {
        eprintln!("skipping: chroxy binary not built");
        return Ok(());
    }
    let worker = ChroxyProcess::start(None)?;
    worker.wait_ready().await?;

    let body: serde_json::Value = reqwest::Client::new()
        .get(format!("{}/health", worker.base_url()))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["mode"], "headless");

    // Auth disabled: /version answers without a bearer.
    let response = reqwest::Client::new()
        .get(format!("{}/version", worker.base_url()))
        .send()
        .await?;
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await?;
    assert!(body["version"].is_string());
    Ok(())
}

#[tokio::test]
async fn version_and_permission_enforce_bearer() -> anyhow::Result<()> {
    if !binary_exists() {
        eprintln!("skipping: chroxy binary not built");
        return Ok(());
    }
    let worker = ChroxyProcess::start(Some("smoke-token"))?;
    worker.wait_ready().await?;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/version", worker.base_url()))
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 403);

    let response = client
        .get(format!("{}/version", worker.base_url()))
        .bearer_auth("smoke-token")
        .send()
        .await?;
    assert!(response.status().is_success());

    let response = client
        .post(format!("{}/permission", worker.base_url()))
        .json(&serde_json::json!({"tool_name": "Bash", "tool_input": {}}))
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 403);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["decision"], "deny");
    Ok(())
}

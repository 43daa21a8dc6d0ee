// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::os::unix::fs::PermissionsExt;

use crate::config::{config_path, load_file_config};
use crate::setup::run_init;
use crate::test_support::chroxy_home_guard;

#[test]
#[serial_test::serial]
fn init_writes_config_with_generated_token() -> anyhow::Result<()> {
    let (_guard, _home) = chroxy_home_guard()?;
    run_init()?;

    let path = config_path();
    let config = load_file_config(&path)?;
    let token = config.token.unwrap_or_default();
    assert_eq!(token.len(), 48, "24 random bytes hex-encoded");
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(config.port, Some(8765));

    let mode = std::fs::metadata(&path)?.permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    Ok(())
}

#[test]
#[serial_test::serial]
fn init_preserves_an_existing_token() -> anyhow::Result<()> {
    let (_guard, _home) = chroxy_home_guard()?;
    run_init()?;
    let first = load_file_config(&config_path())?.token;
    run_init()?;
    let second = load_file_config(&config_path())?.token;
    assert_eq!(first, second);
    Ok(())
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::broker::PermissionBroker;
use crate::config::Settings;
use crate::manager::SessionManager;
use crate::transport::auth::RateLimiter;
use crate::transport::fanout::ClientHub;

/// Build-time version identity reported by `/version` and `auth_ok`.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub version: String,
    pub git_commit: String,
    pub git_branch: String,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            git_commit: option_env!("CHROXY_GIT_COMMIT").unwrap_or("unknown").to_owned(),
            git_branch: option_env!("CHROXY_GIT_BRANCH").unwrap_or("unknown").to_owned(),
        }
    }
}

/// Runtime lifecycle primitives.
pub struct LifecycleState {
    pub shutdown: CancellationToken,
    /// Set while the supervisor drains us; gates client messages.
    pub draining: AtomicBool,
    pub started_at: Instant,
}

/// Shared worker state passed to all handlers via the axum `State` extractor.
///
/// Ownership is strict: the manager owns sessions, the hub owns client
/// bookkeeping, the broker owns pending prompts. Nothing else mutates them.
pub struct Store {
    pub manager: Arc<SessionManager>,
    pub broker: Arc<PermissionBroker>,
    pub hub: Arc<ClientHub>,
    pub settings: Settings,
    pub limiter: RateLimiter,
    pub lifecycle: LifecycleState,
    pub version: VersionInfo,
}

impl Store {
    pub fn is_draining(&self) -> bool {
        self.lifecycle.draining.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.lifecycle.started_at.elapsed().as_secs()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("auth", &self.settings.auth_required())
            .field("port", &self.settings.port)
            .finish()
    }
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use parking_lot::Mutex;

use crate::error::ErrorCode;

/// Consecutive failures tolerated before an address is blocked.
pub const MAX_AUTH_FAILURES: u32 = 5;

/// Failure entries idle longer than this are forgotten.
pub const FAILURE_WINDOW: Duration = Duration::from_secs(300);

/// Ceiling for the exponential block duration.
pub const MAX_BLOCK: Duration = Duration::from_secs(60);

/// Constant-time token comparison with length padding.
///
/// Both buffers are walked to the longer length so timing is independent of
/// any matching prefix; the length check is folded in at the end rather than
/// short-circuiting up front.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let len = a.len().max(b.len());
    let mut acc = 0u8;
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        acc |= x ^ y;
    }
    acc == 0 && a.len() == b.len()
}

/// Validate a Bearer token from HTTP headers.
///
/// Returns `Ok(())` when `expected` is `None` (auth disabled) or the header
/// matches.
pub fn validate_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), ErrorCode> {
    let expected = match expected {
        Some(tok) => tok,
        None => return Ok(()),
    };

    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(ErrorCode::Unauthorized)?;

    let token = header.strip_prefix("Bearer ").ok_or(ErrorCode::Unauthorized)?;
    if constant_time_eq(token.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(ErrorCode::Unauthorized)
    }
}

/// Validate a token from the WebSocket `auth` message.
pub fn validate_ws_auth(token: &str, expected: Option<&str>) -> Result<(), ErrorCode> {
    match expected {
        None => Ok(()),
        Some(tok) if constant_time_eq(tok.as_bytes(), token.as_bytes()) => Ok(()),
        Some(_) => Err(ErrorCode::Unauthorized),
    }
}

struct FailureEntry {
    count: u32,
    last_failure: Instant,
}

impl FailureEntry {
    /// Block duration after this entry's Nth failure: min(60s, 1s × 2^(N−1)).
    fn block_duration(&self) -> Duration {
        let exp = self.count.saturating_sub(1).min(16);
        Duration::from_secs(1u64 << exp).min(MAX_BLOCK)
    }
}

/// Per-address auth failure tracking.
///
/// Blocked addresses are rejected before any token comparison happens.
pub struct RateLimiter {
    entries: Mutex<HashMap<IpAddr, FailureEntry>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Whether the address is currently blocked.
    pub fn is_blocked(&self, addr: IpAddr) -> bool {
        self.is_blocked_at(addr, Instant::now())
    }

    fn is_blocked_at(&self, addr: IpAddr, now: Instant) -> bool {
        let entries = self.entries.lock();
        let Some(entry) = entries.get(&addr) else {
            return false;
        };
        if now.duration_since(entry.last_failure) > FAILURE_WINDOW {
            return false;
        }
        entry.count >= MAX_AUTH_FAILURES
            && now.duration_since(entry.last_failure) < entry.block_duration()
    }

    /// Record one failed attempt and return the updated consecutive count.
    pub fn record_failure(&self, addr: IpAddr) -> u32 {
        self.record_failure_at(addr, Instant::now())
    }

    fn record_failure_at(&self, addr: IpAddr, now: Instant) -> u32 {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(addr)
            .or_insert(FailureEntry { count: 0, last_failure: now });
        if now.duration_since(entry.last_failure) > FAILURE_WINDOW {
            entry.count = 0;
        }
        entry.count += 1;
        entry.last_failure = now;
        entry.count
    }

    /// Successful auth clears the address entirely.
    pub fn record_success(&self, addr: IpAddr) {
        self.entries.lock().remove(&addr);
    }

    /// Drop entries idle past the failure window. Run every minute.
    pub fn prune(&self) {
        let now = Instant::now();
        self.entries
            .lock()
            .retain(|_, e| now.duration_since(e.last_failure) <= FAILURE_WINDOW);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;

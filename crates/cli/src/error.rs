// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error codes shared across the HTTP and WebSocket transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Unauthorized,
    RateLimited,
    BadRequest,
    PayloadTooLarge,
    AgentBusy,
    NotReady,
    CapacityReached,
    UnknownSession,
    LastSession,
    InvalidName,
    Unsupported,
    Draining,
    Internal,
}

/// Broad failure classes used to pick a recovery policy.
///
/// Transient faults are retried or ridden out; policy faults are reported to
/// the offending client; integrity faults are dropped or answered with a
/// conservative default; fatal faults exit with a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Policy,
    Integrity,
    Fatal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::RateLimited => 429,
            Self::BadRequest => 400,
            Self::PayloadTooLarge => 413,
            Self::AgentBusy => 409,
            Self::NotReady => 503,
            Self::CapacityReached => 409,
            Self::UnknownSession => 404,
            Self::LastSession => 409,
            Self::InvalidName => 400,
            Self::Unsupported => 405,
            Self::Draining => 503,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::RateLimited => "RATE_LIMITED",
            Self::BadRequest => "BAD_REQUEST",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::AgentBusy => "AGENT_BUSY",
            Self::NotReady => "NOT_READY",
            Self::CapacityReached => "CAPACITY_REACHED",
            Self::UnknownSession => "UNKNOWN_SESSION",
            Self::LastSession => "LAST_SESSION",
            Self::InvalidName => "INVALID_NAME",
            Self::Unsupported => "UNSUPPORTED",
            Self::Draining => "DRAINING",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotReady | Self::Draining => ErrorClass::Transient,
            Self::Unauthorized
            | Self::RateLimited
            | Self::AgentBusy
            | Self::CapacityReached
            | Self::UnknownSession
            | Self::LastSession
            | Self::InvalidName
            | Self::Unsupported => ErrorClass::Policy,
            Self::BadRequest | Self::PayloadTooLarge => ErrorClass::Integrity,
            Self::Internal => ErrorClass::Fatal,
        }
    }

    /// Default human-readable message for this code.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Unauthorized => "not authenticated",
            Self::RateLimited => "too many failed attempts",
            Self::BadRequest => "invalid request",
            Self::PayloadTooLarge => "request body too large",
            Self::AgentBusy => "agent is busy with another turn",
            Self::NotReady => "agent is not ready",
            Self::CapacityReached => "session capacity reached",
            Self::UnknownSession => "no such session",
            Self::LastSession => "cannot destroy the last session",
            Self::InvalidName => "invalid session name",
            Self::Unsupported => "operation not supported for this session",
            Self::Draining => "server is restarting",
            Self::Internal => "internal error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

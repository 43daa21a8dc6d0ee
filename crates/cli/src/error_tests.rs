// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use crate::error::{ErrorClass, ErrorCode};

#[yare::parameterized(
    unauthorized = { ErrorCode::Unauthorized, 401 },
    rate_limited = { ErrorCode::RateLimited, 429 },
    payload      = { ErrorCode::PayloadTooLarge, 413 },
    busy         = { ErrorCode::AgentBusy, 409 },
    not_ready    = { ErrorCode::NotReady, 503 },
    last_session = { ErrorCode::LastSession, 409 },
    unknown      = { ErrorCode::UnknownSession, 404 },
    internal     = { ErrorCode::Internal, 500 },
)]
fn http_status_mapping(code: ErrorCode, status: u16) {
    assert_eq!(code.http_status(), status);
}

#[yare::parameterized(
    transient = { ErrorCode::NotReady, ErrorClass::Transient },
    draining  = { ErrorCode::Draining, ErrorClass::Transient },
    policy    = { ErrorCode::RateLimited, ErrorClass::Policy },
    name      = { ErrorCode::InvalidName, ErrorClass::Policy },
    integrity = { ErrorCode::PayloadTooLarge, ErrorClass::Integrity },
    fatal     = { ErrorCode::Internal, ErrorClass::Fatal },
)]
fn error_classes(code: ErrorCode, class: ErrorClass) {
    assert_eq!(code.class(), class);
}

#[test]
fn display_matches_as_str() {
    assert_eq!(ErrorCode::AgentBusy.to_string(), "AGENT_BUSY");
    assert_eq!(ErrorCode::LastSession.as_str(), "LAST_SESSION");
}

//! Standard failure handlers and the chains the runner attaches with them.

use authrpc_core::ResponseEnvelope;
use serde_json::Value;
use tracing::{error, info, warn};

use super::failure::{FailureKind, RpcFailure};
use super::procedure::RemoteProcedure;

/// 400 for malformed or mistyped arguments.
#[must_use]
pub fn invalid_data(failure: &RpcFailure, _args: &Value) -> ResponseEnvelope {
    warn!(error = %failure, "rejected call with invalid data");
    ResponseEnvelope::message(400, "invalid data")
}

/// 401 for failed logins. Never echoes the submitted arguments.
#[must_use]
pub fn login_failed(failure: &RpcFailure, _args: &Value) -> ResponseEnvelope {
    info!(error = %failure, "login rejected");
    ResponseEnvelope::message(401, "could not login")
}

/// 500 catch-all; must be the last entry of every chain.
#[must_use]
pub fn internal_error(failure: &RpcFailure, _args: &Value) -> ResponseEnvelope {
    error!(error = %failure, "unhandled failure in remote procedure");
    ResponseEnvelope::message(500, format!("internal error: {failure}"))
}

/// 400 -> 500.
#[must_use]
pub fn with_default_chain(procedure: RemoteProcedure) -> RemoteProcedure {
    procedure
        .on_failure(&[FailureKind::InvalidData], invalid_data)
        .on_failure(&[FailureKind::Failure], internal_error)
}

/// 401 -> 400 -> 500, for login-class operations.
#[must_use]
pub fn with_login_chain(procedure: RemoteProcedure) -> RemoteProcedure {
    with_default_chain(procedure.on_failure(&[FailureKind::Unauthorized], login_failed))
}

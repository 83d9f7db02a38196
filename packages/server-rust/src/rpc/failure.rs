//! Failure taxonomy raised by wrapped business calls.

use std::fmt;
use std::time::Duration;

/// Runtime "type" of a failure, with a declared parent relation.
///
/// ```text
/// Failure
/// ├── InvalidData
/// ├── Unauthorized
/// │   ├── BadCredentials
/// │   └── PermissionDenied
/// ├── NotFound
/// ├── Conflict
/// ├── Timeout
/// └── Internal
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Root of the hierarchy; matches every failure.
    Failure,
    /// Malformed or missing call arguments.
    InvalidData,
    Unauthorized,
    BadCredentials,
    PermissionDenied,
    NotFound,
    Conflict,
    Timeout,
    Internal,
}

impl FailureKind {
    #[must_use]
    pub fn parent(self) -> Option<Self> {
        match self {
            Self::Failure => None,
            Self::BadCredentials | Self::PermissionDenied => Some(Self::Unauthorized),
            Self::InvalidData
            | Self::Unauthorized
            | Self::NotFound
            | Self::Conflict
            | Self::Timeout
            | Self::Internal => Some(Self::Failure),
        }
    }

    /// True if `self` is `kind` or descends from it.
    #[must_use]
    pub fn is_a(self, kind: Self) -> bool {
        let mut current = Some(self);
        while let Some(k) = current {
            if k == kind {
                return true;
            }
            current = k.parent();
        }
        false
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Failure => "failure",
            Self::InvalidData => "invalid_data",
            Self::Unauthorized => "unauthorized",
            Self::BadCredentials => "bad_credentials",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure raised inside a remote procedure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RpcFailure {
    kind: FailureKind,
    message: String,
}

impl RpcFailure {
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_data(message: impl fmt::Display) -> Self {
        Self::new(FailureKind::InvalidData, message.to_string())
    }

    #[must_use]
    pub fn internal(message: impl fmt::Display) -> Self {
        Self::new(FailureKind::Internal, message.to_string())
    }

    #[must_use]
    pub fn timeout(after: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("call exceeded {}ms", after.as_millis()),
        )
    }

    #[must_use]
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for RpcFailure {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_data(err)
    }
}

//! Auth workflow seam.
//!
//! The business logic behind each queue sits behind three traits. The
//! runner only sees a [`WorkflowFactory`], which prepares persistence and
//! builds a [`WorkflowSet`] from the assembled configuration.
//!
//! [`memory::MemoryWorkflowFactory`] is the in-process backend used by tests
//! and local runs.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use authrpc_core::{AppConfig, DbConfig, JwtEncoder, JwtValidator, LdapConfig, ResponseEnvelope};
use serde::Deserialize;

use crate::rpc::{FailureKind, RpcFailure};

pub use memory::MemoryWorkflowFactory;

pub type WorkflowResult = Result<ResponseEnvelope, WorkflowError>;

// ---------------------------------------------------------------------------
// WorkflowError
// ---------------------------------------------------------------------------

/// Failures a workflow raises instead of answering with an envelope.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("invalid username or password")]
    BadCredentials,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("account is not allowed to log in: {0}")]
    PermissionDenied(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<WorkflowError> for RpcFailure {
    fn from(err: WorkflowError) -> Self {
        let kind = match &err {
            WorkflowError::BadCredentials => FailureKind::BadCredentials,
            WorkflowError::InvalidToken(_) => FailureKind::Unauthorized,
            WorkflowError::PermissionDenied(_) => FailureKind::PermissionDenied,
            WorkflowError::InvalidRequest(_) => FailureKind::InvalidData,
            WorkflowError::Internal(_) => FailureKind::Internal,
        };
        RpcFailure::new(kind, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Carries the refresh token handed out by `login`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterUserRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminCreateUserRequest {
    pub token: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Names a user; `token` is the caller's access token.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserRequest {
    pub token: String,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChangeUserRequest {
    pub token: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupMembershipRequest {
    pub token: String,
    pub username: String,
    pub group: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupRequest {
    pub token: String,
    pub group: String,
}

// ---------------------------------------------------------------------------
// Workflow traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SessionWorkflow: Send + Sync {
    /// Checks credentials and opens a session.
    ///
    /// # Errors
    ///
    /// `BadCredentials` or `PermissionDenied` when the login is refused.
    async fn login(&self, request: LoginRequest) -> WorkflowResult;

    /// # Errors
    ///
    /// Only on backend failure.
    async fn logout(&self, request: SessionRequest) -> WorkflowResult;

    /// Exchanges a refresh token for a fresh access token.
    ///
    /// # Errors
    ///
    /// `InvalidToken` for unknown or expired refresh tokens.
    async fn get_access_token(&self, request: SessionRequest) -> WorkflowResult;
}

/// User management. Errors are backend failures only; refusals are envelopes.
#[async_trait]
pub trait UserWorkflow: Send + Sync {
    async fn register_user(&self, request: RegisterUserRequest) -> WorkflowResult;

    async fn admin_create_user(&self, request: AdminCreateUserRequest) -> WorkflowResult;

    async fn delete_user(&self, request: UserRequest) -> WorkflowResult;

    async fn change_user(&self, request: ChangeUserRequest) -> WorkflowResult;

    async fn get_all(&self, request: TokenRequest) -> WorkflowResult;

    async fn get_user(&self, request: UserRequest) -> WorkflowResult;
}

/// Group management. Every operation requires an admin token.
#[async_trait]
pub trait GroupWorkflow: Send + Sync {
    async fn add_user_to_group(&self, request: GroupMembershipRequest) -> WorkflowResult;

    async fn remove_user_from_group(&self, request: GroupMembershipRequest) -> WorkflowResult;

    async fn create_group(&self, request: GroupRequest) -> WorkflowResult;

    async fn delete_group(&self, request: GroupRequest) -> WorkflowResult;
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Everything a backend may draw on when building its workflows.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub validator: Option<JwtValidator>,
    pub encoder: Option<JwtEncoder>,
    pub directory: Option<LdapConfig>,
    pub app: AppConfig,
}

#[derive(Clone)]
pub struct WorkflowSet {
    pub session: Arc<dyn SessionWorkflow>,
    pub users: Arc<dyn UserWorkflow>,
    pub groups: Arc<dyn GroupWorkflow>,
}

impl std::fmt::Debug for WorkflowSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowSet").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait WorkflowFactory: Send + Sync {
    /// Prepares the persistence layer before any workflow exists.
    ///
    /// # Errors
    ///
    /// Any error aborts startup.
    async fn init_persistence(&self, db: Option<&DbConfig>) -> anyhow::Result<()>;

    /// # Errors
    ///
    /// Any error aborts startup.
    fn build(&self, context: WorkflowContext) -> anyhow::Result<WorkflowSet>;
}

//! Composition root: configuration in, serving RPC service out.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use authrpc_core::{AmqpConfig, AssembledConfig, ConfigError, OperationId, QueueTable};
use serde::de::DeserializeOwned;
use tracing::instrument::WithSubscriber;
use tracing::{info, warn, Dispatch};

use crate::broker::Broker;
use crate::rpc::handlers::{with_default_chain, with_login_chain};
use crate::rpc::{RemoteProcedure, RpcFailure};
use crate::service::{RpcService, ServiceError, DEFAULT_DRAIN_TIMEOUT};
use crate::workflow::{
    AdminCreateUserRequest, ChangeUserRequest, GroupMembershipRequest, GroupRequest,
    LoginRequest, RegisterUserRequest, SessionRequest, TokenRequest, UserRequest,
    WorkflowContext, WorkflowFactory, WorkflowResult, WorkflowSet,
};

/// `EX_CONFIG` from sysexits.h.
pub const EXIT_CONFIG: i32 = 78;
pub const EXIT_FAILURE: i32 = 1;

// ---------------------------------------------------------------------------
// RunnerError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("configuration section `{0}` is required")]
    MissingSection(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("persistence initialisation failed: {0:#}")]
    Persistence(anyhow::Error),

    #[error("failed to build workflows: {0:#}")]
    Workflows(anyhow::Error),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl RunnerError {
    /// Process exit code for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MissingSection(_) | Self::Config(_) => EXIT_CONFIG,
            Self::Persistence(_) | Self::Workflows(_) | Self::Service(_) => EXIT_FAILURE,
        }
    }
}

// ---------------------------------------------------------------------------
// Procedure table
// ---------------------------------------------------------------------------

fn bind<W, A, F, Fut>(
    queues: &QueueTable,
    op: OperationId,
    workflow: &Arc<W>,
    call: F,
) -> RemoteProcedure
where
    W: ?Sized + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    F: Fn(Arc<W>, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkflowResult> + Send + 'static,
{
    let workflow = Arc::clone(workflow);
    RemoteProcedure::typed(queues.queue_for(op), move |args: A| {
        let pending = call(Arc::clone(&workflow), args);
        async move { pending.await.map_err(RpcFailure::from) }
    })
}

/// Wraps every workflow operation, bound to its queue and failure chain.
///
/// `login` and `get_access_token` translate authorization failures into
/// 401; every other operation only gets the 400 and 500 handlers.
#[must_use]
pub fn build_procedures(
    workflows: &WorkflowSet,
    queues: &QueueTable,
    call_timeout: Option<Duration>,
) -> Vec<RemoteProcedure> {
    let session = &workflows.session;
    let users = &workflows.users;
    let groups = &workflows.groups;

    let login_class = vec![
        bind(queues, OperationId::SessionLogin, session, |wf, req: LoginRequest| async move {
            wf.login(req).await
        }),
        bind(
            queues,
            OperationId::SessionGetAccessToken,
            session,
            |wf, req: SessionRequest| async move { wf.get_access_token(req).await },
        ),
    ];

    let others = vec![
        bind(queues, OperationId::SessionLogout, session, |wf, req: SessionRequest| async move {
            wf.logout(req).await
        }),
        bind(
            queues,
            OperationId::UserRegisterUser,
            users,
            |wf, req: RegisterUserRequest| async move { wf.register_user(req).await },
        ),
        bind(
            queues,
            OperationId::UserAdminCreateUser,
            users,
            |wf, req: AdminCreateUserRequest| async move { wf.admin_create_user(req).await },
        ),
        bind(queues, OperationId::UserDeleteUser, users, |wf, req: UserRequest| async move {
            wf.delete_user(req).await
        }),
        bind(
            queues,
            OperationId::UserChangeUser,
            users,
            |wf, req: ChangeUserRequest| async move { wf.change_user(req).await },
        ),
        bind(queues, OperationId::UserGetAll, users, |wf, req: TokenRequest| async move {
            wf.get_all(req).await
        }),
        bind(queues, OperationId::UserGetUser, users, |wf, req: UserRequest| async move {
            wf.get_user(req).await
        }),
        bind(
            queues,
            OperationId::GroupAddUserToGroup,
            groups,
            |wf, req: GroupMembershipRequest| async move { wf.add_user_to_group(req).await },
        ),
        bind(
            queues,
            OperationId::GroupRemoveUserFromGroup,
            groups,
            |wf, req: GroupMembershipRequest| async move { wf.remove_user_from_group(req).await },
        ),
        bind(
            queues,
            OperationId::GroupCreateGroup,
            groups,
            |wf, req: GroupRequest| async move { wf.create_group(req).await },
        ),
        bind(
            queues,
            OperationId::GroupDeleteGroup,
            groups,
            |wf, req: GroupRequest| async move { wf.delete_group(req).await },
        ),
    ];

    login_class
        .into_iter()
        .map(with_login_chain)
        .chain(others.into_iter().map(with_default_chain))
        .map(|procedure| procedure.with_timeout(call_timeout))
        .collect()
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Drives startup in order: persistence, workflows, procedures, connect,
/// register, serve. Any failure aborts the run.
pub struct Runner {
    config: AssembledConfig,
    broker: Arc<dyn Broker>,
    factory: Arc<dyn WorkflowFactory>,
    log: Dispatch,
    drain_timeout: Duration,
}

impl Runner {
    #[must_use]
    pub fn new(
        config: AssembledConfig,
        broker: Arc<dyn Broker>,
        factory: Arc<dyn WorkflowFactory>,
        log: Dispatch,
    ) -> Self {
        Self {
            config,
            broker,
            factory,
            log,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Runs until `shutdown` resolves, then drains and disconnects.
    ///
    /// # Errors
    ///
    /// Returns the first startup or serving failure; see
    /// [`RunnerError::exit_code`] for its classification.
    pub async fn run<F>(self, shutdown: F) -> Result<(), RunnerError>
    where
        F: Future<Output = ()> + Send,
    {
        let log = self.log.clone();
        self.run_inner(shutdown).with_subscriber(log).await
    }

    async fn run_inner<F>(self, shutdown: F) -> Result<(), RunnerError>
    where
        F: Future<Output = ()> + Send,
    {
        let Self {
            config,
            broker,
            factory,
            log,
            drain_timeout,
        } = self;

        factory
            .init_persistence(config.db.as_ref())
            .await
            .map_err(RunnerError::Persistence)?;

        let workflows = factory
            .build(WorkflowContext {
                validator: config.jwt_validator,
                encoder: config.jwt_encoder,
                directory: config.ldap,
                app: config.app.unwrap_or_default(),
            })
            .map_err(RunnerError::Workflows)?;

        let call_timeout = config.amqp.as_ref().and_then(AmqpConfig::call_timeout);
        let procedures = build_procedures(&workflows, &config.queues, call_timeout);
        let amqp = config
            .amqp
            .ok_or(RunnerError::MissingSection("amqp_settings"))?;

        let service = RpcService::new(broker, log).with_drain_timeout(drain_timeout);
        service.connect(&amqp).await?;

        let count = procedures.len();
        for procedure in procedures {
            if let Err(err) = service.register_function(procedure).await {
                if let Err(close_err) = service.close().await {
                    warn!(error = %close_err, "failed to close after registration error");
                }
                return Err(err.into());
            }
        }
        info!(procedures = count, queues = ?service.queues(), "all procedures registered");

        service.serve(shutdown).await?;
        info!("runner stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("queues", &self.config.queues)
            .field("drain_timeout", &self.drain_timeout)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! `authrpc` server: exposes session, user and group workflows as AMQP RPC
//! procedures with per-operation failure translation.

pub mod broker;
pub mod logging;
pub mod rpc;
pub mod runner;
pub mod service;
pub mod workflow;

pub use broker::{AmqpBroker, Broker, BrokerError, InMemoryBroker};
pub use rpc::{FailureKind, RemoteProcedure, RpcFailure};
pub use runner::{build_procedures, Runner, RunnerError};
pub use service::{ReconnectPolicy, RpcService, ServiceError, ServiceState};
pub use workflow::{MemoryWorkflowFactory, WorkflowFactory, WorkflowSet};

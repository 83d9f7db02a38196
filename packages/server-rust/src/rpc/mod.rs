//! RPC function wrapping and failure translation.
//!
//! 1. **Failures** (`failure`): `FailureKind` hierarchy and `RpcFailure`
//! 2. **Procedures** (`procedure`): callable + queue + ordered handler chain
//! 3. **Handlers** (`handlers`): the 400 / 401 / 500 translations
//! 4. **Middleware** (`middleware`): per-call tracing span

pub mod failure;
pub mod handlers;
pub mod middleware;
pub mod procedure;

pub use failure::{FailureKind, RpcFailure};
pub use middleware::CallTraceLayer;
pub use procedure::{CallResult, FailureHandler, RemoteProcedure, RpcCall};

//! Remote procedures: a queue name, an async callable and its failure chain.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use authrpc_core::ResponseEnvelope;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tower::Service;

use super::failure::{FailureKind, RpcFailure};

// ---------------------------------------------------------------------------
// Type aliases
// ---------------------------------------------------------------------------

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Outcome of one call before translation.
pub type CallResult = Result<ResponseEnvelope, RpcFailure>;

type Callable = Arc<dyn Fn(Value) -> BoxFuture<CallResult> + Send + Sync>;

type HandlerFn = Arc<dyn Fn(&RpcFailure, &Value) -> ResponseEnvelope + Send + Sync>;

// ---------------------------------------------------------------------------
// RpcCall
// ---------------------------------------------------------------------------

/// One inbound invocation.
#[derive(Debug, Clone)]
pub struct RpcCall {
    pub correlation_id: Option<String>,
    pub args: Value,
}

impl RpcCall {
    #[must_use]
    pub fn new(args: Value) -> Self {
        Self {
            correlation_id: None,
            args,
        }
    }
}

// ---------------------------------------------------------------------------
// FailureHandler
// ---------------------------------------------------------------------------

/// One `(predicates -> handler)` entry of a procedure's failure chain.
#[derive(Clone)]
pub struct FailureHandler {
    kinds: Vec<FailureKind>,
    handler: HandlerFn,
}

impl FailureHandler {
    /// True if the failure is, or descends from, any of this entry's kinds.
    #[must_use]
    pub fn matches(&self, failure: &RpcFailure) -> bool {
        self.kinds.iter().any(|kind| failure.kind().is_a(*kind))
    }
}

impl fmt::Debug for FailureHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureHandler")
            .field("kinds", &self.kinds)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// RemoteProcedure
// ---------------------------------------------------------------------------

/// A broker-addressable wrapper around one async business call.
///
/// Failures raised by the call are translated by the first handler, in
/// registration order, whose predicates match the failure kind. A failure no
/// handler matches is returned as `Err` for the transport to report.
pub struct RemoteProcedure {
    queue: String,
    callable: Callable,
    handlers: Vec<FailureHandler>,
    timeout: Option<Duration>,
}

impl RemoteProcedure {
    /// Wraps a callable taking the raw JSON arguments.
    pub fn new<F, Fut>(queue: impl Into<String>, callable: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        Self {
            queue: queue.into(),
            callable: Arc::new(move |args| Box::pin(callable(args))),
            handlers: Vec::new(),
            timeout: None,
        }
    }

    /// Wraps a callable taking typed arguments.
    ///
    /// Arguments that do not deserialize into `A` raise an `InvalidData`
    /// failure before the callable runs.
    pub fn typed<A, F, Fut>(queue: impl Into<String>, callable: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        let callable = Arc::new(callable);
        Self::new(queue, move |args: Value| {
            let callable = Arc::clone(&callable);
            async move {
                let args: A = serde_json::from_value(args)?;
                callable(args).await
            }
        })
    }

    /// Bounds each call; expiry raises a `Timeout` failure.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Appends a handler for failures matching any of `kinds`.
    pub fn register_handler<H>(&mut self, kinds: &[FailureKind], handler: H)
    where
        H: Fn(&RpcFailure, &Value) -> ResponseEnvelope + Send + Sync + 'static,
    {
        self.handlers.push(FailureHandler {
            kinds: kinds.to_vec(),
            handler: Arc::new(handler),
        });
    }

    /// Builder form of [`RemoteProcedure::register_handler`].
    #[must_use]
    pub fn on_failure<H>(mut self, kinds: &[FailureKind], handler: H) -> Self
    where
        H: Fn(&RpcFailure, &Value) -> ResponseEnvelope + Send + Sync + 'static,
    {
        self.register_handler(kinds, handler);
        self
    }

    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Predicate sets of the chain, in registration order.
    #[must_use]
    pub fn handler_kinds(&self) -> Vec<Vec<FailureKind>> {
        self.handlers.iter().map(|h| h.kinds.clone()).collect()
    }

    /// Runs the callable and translates any failure through the chain.
    ///
    /// # Errors
    ///
    /// Returns the failure unchanged when no handler matches it.
    pub async fn dispatch(&self, args: Value) -> CallResult {
        let callable = &self.callable;
        // The callable runs inside the guarded future so a panic while
        // building its future is caught too.
        let call = AssertUnwindSafe(async { callable(args.clone()).await }).catch_unwind();
        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_elapsed) => Ok(Err(RpcFailure::timeout(limit))),
            },
            None => call.await,
        };

        match outcome {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(failure)) => self.handle_failure(failure, &args),
            Err(_panic) => self.handle_failure(RpcFailure::internal("procedure panicked"), &args),
        }
    }

    /// Translates `failure` with the first matching handler.
    ///
    /// # Errors
    ///
    /// Returns `failure` unchanged when no handler matches it.
    pub fn handle_failure(&self, failure: RpcFailure, args: &Value) -> CallResult {
        match self.handlers.iter().find(|h| h.matches(&failure)) {
            Some(entry) => Ok((entry.handler)(&failure, args)),
            None => Err(failure),
        }
    }
}

impl fmt::Debug for RemoteProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteProcedure")
            .field("queue", &self.queue)
            .field("handlers", &self.handlers)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Service<RpcCall> for Arc<RemoteProcedure> {
    type Response = ResponseEnvelope;
    type Error = RpcFailure;
    type Future = BoxFuture<CallResult>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: RpcCall) -> Self::Future {
        let procedure = Arc::clone(self);
        Box::pin(async move { procedure.dispatch(call.args).await })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde::Deserialize;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;

    fn failing(kind: FailureKind) -> RemoteProcedure {
        RemoteProcedure::new("q", move |_args| async move {
            Err(RpcFailure::new(kind, "boom"))
        })
    }

    fn tagged(code: u16) -> impl Fn(&RpcFailure, &Value) -> ResponseEnvelope {
        move |failure, _args| ResponseEnvelope::message(code, failure.kind().as_str())
    }

    #[tokio::test]
    async fn success_is_returned_unchanged() {
        let procedure = RemoteProcedure::new("q", |args| async move {
            Ok(ResponseEnvelope::ok(json!({ "echo": args })))
        })
        .on_failure(&[FailureKind::Failure], tagged(500));

        let envelope = procedure.dispatch(json!({"a": 1})).await.unwrap();
        assert_eq!(envelope, ResponseEnvelope::ok(json!({"echo": {"a": 1}})));
    }

    #[tokio::test]
    async fn specific_handler_registered_first_wins() {
        let procedure = failing(FailureKind::BadCredentials)
            .on_failure(&[FailureKind::BadCredentials], tagged(401))
            .on_failure(&[FailureKind::Unauthorized], tagged(403));

        let envelope = procedure.dispatch(Value::Null).await.unwrap();
        assert_eq!(envelope.response_code, 401);
    }

    #[tokio::test]
    async fn ancestor_handler_matches_descendant() {
        let procedure = failing(FailureKind::PermissionDenied)
            .on_failure(&[FailureKind::BadCredentials], tagged(401))
            .on_failure(&[FailureKind::Unauthorized], tagged(403));

        let envelope = procedure.dispatch(Value::Null).await.unwrap();
        assert_eq!(envelope.response_code, 403);
    }

    #[tokio::test]
    async fn registration_order_beats_specificity() {
        let procedure = failing(FailureKind::BadCredentials)
            .on_failure(&[FailureKind::Failure], tagged(500))
            .on_failure(&[FailureKind::BadCredentials], tagged(401));

        let envelope = procedure.dispatch(Value::Null).await.unwrap();
        assert_eq!(envelope.response_code, 500);
    }

    #[tokio::test]
    async fn unrelated_failure_propagates() {
        let procedure = failing(FailureKind::NotFound)
            .on_failure(&[FailureKind::BadCredentials], tagged(401))
            .on_failure(&[FailureKind::Unauthorized], tagged(403));

        let failure = procedure.dispatch(Value::Null).await.unwrap_err();
        assert_eq!(failure.kind(), FailureKind::NotFound);
    }

    #[tokio::test]
    async fn any_predicate_in_a_set_matches() {
        let procedure = failing(FailureKind::Conflict)
            .on_failure(&[FailureKind::NotFound, FailureKind::Conflict], tagged(409));

        assert_eq!(procedure.dispatch(Value::Null).await.unwrap().response_code, 409);
    }

    #[tokio::test]
    async fn handler_receives_failure_and_call_args() {
        let procedure = failing(FailureKind::InvalidData).on_failure(
            &[FailureKind::InvalidData],
            |failure, args| {
                ResponseEnvelope::new(
                    400,
                    json!({ "kind": failure.kind().as_str(), "args": args.clone() }),
                )
            },
        );

        let envelope = procedure.dispatch(json!({"user": "bob"})).await.unwrap();
        assert_eq!(
            envelope.response_data,
            json!({"kind": "invalid_data", "args": {"user": "bob"}})
        );
    }

    #[test]
    fn registrations_append_in_order() {
        let mut procedure = failing(FailureKind::Internal);
        procedure.register_handler(&[FailureKind::Unauthorized], tagged(401));
        procedure.register_handler(&[FailureKind::InvalidData], tagged(400));
        procedure.register_handler(&[FailureKind::Failure], tagged(500));

        assert_eq!(
            procedure.handler_kinds(),
            vec![
                vec![FailureKind::Unauthorized],
                vec![FailureKind::InvalidData],
                vec![FailureKind::Failure],
            ]
        );
    }

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Login {
        username: String,
    }

    #[tokio::test]
    async fn typed_arguments_mismatch_is_invalid_data() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let procedure = RemoteProcedure::typed("login", move |args: Login| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(ResponseEnvelope::ok(json!(args.username))) }
        });

        let ok = procedure.dispatch(json!({"username": "alice"})).await.unwrap();
        assert_eq!(ok.response_data, json!("alice"));

        let failure = procedure.dispatch(json!({"username": 7})).await.unwrap_err();
        assert_eq!(failure.kind(), FailureKind::InvalidData);

        let failure = procedure
            .dispatch(json!({"username": "a", "extra": true}))
            .await
            .unwrap_err();
        assert_eq!(failure.kind(), FailureKind::InvalidData);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_into_the_chain() {
        let procedure = RemoteProcedure::new("q", |_args| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ResponseEnvelope::ok(Value::Null))
        })
        .with_timeout(Some(Duration::from_millis(50)))
        .on_failure(&[FailureKind::Timeout], tagged(504));

        assert_eq!(procedure.dispatch(Value::Null).await.unwrap().response_code, 504);
    }

    #[tokio::test]
    async fn panic_becomes_internal_failure() {
        let procedure = RemoteProcedure::new("q", |_args| async {
            if true {
                panic!("bug in business logic");
            }
            Ok(ResponseEnvelope::ok(Value::Null))
        });

        let failure = procedure.dispatch(Value::Null).await.unwrap_err();
        assert_eq!(failure.kind(), FailureKind::Internal);
    }

    #[tokio::test]
    async fn panic_before_the_future_exists_is_caught() {
        let procedure = RemoteProcedure::new("q", |args: Value| {
            if args["explode"] == true {
                panic!("bad arguments");
            }
            async { Ok(ResponseEnvelope::ok(Value::Null)) }
        })
        .on_failure(&[FailureKind::Failure], tagged(500));

        let envelope = procedure.dispatch(json!({"explode": true})).await.unwrap();
        assert_eq!(envelope.response_code, 500);
        let envelope = procedure.dispatch(json!({"explode": false})).await.unwrap();
        assert_eq!(envelope.response_code, 200);
    }

    #[tokio::test]
    async fn tower_service_dispatches() {
        let procedure = Arc::new(
            RemoteProcedure::new("q", |_args| async { Ok(ResponseEnvelope::ok(json!(1))) }),
        );
        let envelope = procedure.oneshot(RpcCall::new(Value::Null)).await.unwrap();
        assert_eq!(envelope.response_data, json!(1));
    }
}

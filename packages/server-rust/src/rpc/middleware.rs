//! Call tracing middleware.
//!
//! Records queue, correlation id, duration and outcome of every call in a
//! `tracing` span.

use std::task::{Context, Poll};
use std::time::Instant;

use authrpc_core::ResponseEnvelope;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::failure::RpcFailure;
use super::procedure::{BoxFuture, CallResult, RpcCall};

// ---------------------------------------------------------------------------
// CallTraceLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments calls on one queue.
#[derive(Debug, Clone)]
pub struct CallTraceLayer {
    queue: String,
}

impl CallTraceLayer {
    #[must_use]
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }
}

impl<S> Layer<S> for CallTraceLayer {
    type Service = CallTraceService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CallTraceService {
            inner,
            queue: self.queue.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// CallTraceService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CallTraceService<S> {
    inner: S,
    queue: String,
}

impl<S> Service<RpcCall> for CallTraceService<S>
where
    S: Service<RpcCall, Response = ResponseEnvelope, Error = RpcFailure> + Send,
    S::Future: Send + 'static,
{
    type Response = ResponseEnvelope;
    type Error = RpcFailure;
    type Future = BoxFuture<CallResult>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: RpcCall) -> Self::Future {
        let span = info_span!(
            "rpc_call",
            queue = %self.queue,
            correlation_id = call.correlation_id.as_deref().unwrap_or("-"),
            duration_ms = tracing::field::Empty,
            response_code = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(call);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = start.elapsed().as_millis() as u64;
                let current = tracing::Span::current();
                current.record("duration_ms", duration_ms);
                match &result {
                    Ok(envelope) => {
                        current.record("response_code", envelope.response_code);
                        current.record("outcome", "ok");
                    }
                    Err(failure) => {
                        current.record("outcome", failure.kind().as_str());
                    }
                }
                tracing::debug!("call finished");
                result
            }
            .instrument(span),
        )
    }
}

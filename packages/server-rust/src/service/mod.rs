//! Broker-facing RPC service.
//!
//! 1. **Connect** with a `ReconnectPolicy` (Disconnected -> Connected)
//! 2. **Register** one `RemoteProcedure` per queue
//! 3. **Serve**: one consumer per queue, one task per delivery (Connected -> Serving)
//! 4. **Close**: stop consumers, drain in-flight calls, close the broker once (-> Closed)

pub mod reconnect;
pub mod shutdown;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tower::{Layer, ServiceExt};
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn, Dispatch};

use authrpc_core::AmqpConfig;

use crate::broker::{Broker, BrokerError, Delivery, DeliveryStream, OutboundReply};
use crate::rpc::{CallTraceLayer, RemoteProcedure, RpcCall, RpcFailure};

pub use reconnect::ReconnectPolicy;
pub use shutdown::{InFlightGuard, ShutdownController};

/// Upper bound on waiting for in-flight calls after serving stops.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// ServiceState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Disconnected,
    Connected,
    Serving,
    Closed,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Serving => "serving",
            Self::Closed => "closed",
        })
    }
}

// ---------------------------------------------------------------------------
// ServiceError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("could not connect to broker after {attempts} attempt(s): {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error("a procedure is already registered on queue `{0}`")]
    DuplicateQueue(String),

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ServiceState,
    },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("consumer task failed: {0}")]
    Consumer(#[from] tokio::task::JoinError),
}

// ---------------------------------------------------------------------------
// RpcService
// ---------------------------------------------------------------------------

/// Serves registered procedures over a [`Broker`].
pub struct RpcService {
    broker: Arc<dyn Broker>,
    state: ArcSwap<ServiceState>,
    procedures: DashMap<String, Arc<RemoteProcedure>>,
    shutdown: Arc<ShutdownController>,
    drain_timeout: Duration,
    log: Dispatch,
}

impl RpcService {
    /// Creates a disconnected service. Spawned tasks log to `log`.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, log: Dispatch) -> Self {
        Self {
            broker,
            state: ArcSwap::from_pointee(ServiceState::Disconnected),
            procedures: DashMap::new(),
            shutdown: Arc::new(ShutdownController::new()),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            log,
        }
    }

    #[must_use]
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        **self.state.load()
    }

    /// Registered queue names, sorted.
    #[must_use]
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.procedures.iter().map(|e| e.key().clone()).collect();
        queues.sort();
        queues
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.shutdown.in_flight_count()
    }

    fn require(&self, expected: ServiceState, operation: &'static str) -> Result<(), ServiceError> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(ServiceError::InvalidState { operation, state })
        }
    }

    /// Moves `from` -> `to` atomically, or reports the state it found.
    fn transition(
        &self,
        from: ServiceState,
        to: ServiceState,
        operation: &'static str,
    ) -> Result<(), ServiceError> {
        let previous = self.state.rcu(|current| {
            if **current == from {
                Arc::new(to)
            } else {
                Arc::clone(current)
            }
        });
        if *previous == from {
            Ok(())
        } else {
            Err(ServiceError::InvalidState {
                operation,
                state: *previous,
            })
        }
    }

    /// Connects using the policy derived from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Connection`] once every attempt has failed, or
    /// [`ServiceError::InvalidState`] unless disconnected.
    pub async fn connect(&self, config: &AmqpConfig) -> Result<(), ServiceError> {
        self.connect_with(config, ReconnectPolicy::from_config(config))
            .await
    }

    /// Connects, retrying with `policy`.
    ///
    /// # Errors
    ///
    /// See [`RpcService::connect`].
    pub async fn connect_with(
        &self,
        config: &AmqpConfig,
        policy: ReconnectPolicy,
    ) -> Result<(), ServiceError> {
        self.require(ServiceState::Disconnected, "connect")?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.broker.connect(config).await {
                Ok(()) => {
                    self.state.store(Arc::new(ServiceState::Connected));
                    info!(attempt, host = %config.hostname, "connected to broker");
                    return Ok(());
                }
                Err(err) if attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "broker connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(source) => {
                    error!(attempts = attempt, error = %source, "giving up on broker connection");
                    return Err(ServiceError::Connection {
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }

    /// Declares the procedure's queue and adds it to the dispatch table.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidState`] unless connected,
    /// [`ServiceError::DuplicateQueue`] if the queue is taken, or a broker
    /// error if the declaration fails.
    pub async fn register_function(&self, procedure: RemoteProcedure) -> Result<(), ServiceError> {
        self.require(ServiceState::Connected, "register a function")?;

        let queue = procedure.queue().to_owned();
        if self.procedures.contains_key(&queue) {
            return Err(ServiceError::DuplicateQueue(queue));
        }
        self.broker.declare_queue(&queue).await?;

        match self.procedures.entry(queue.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ServiceError::DuplicateQueue(queue)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(procedure));
                debug!(queue = %queue, "procedure registered");
                Ok(())
            }
        }
    }

    /// Consumes every registered queue until `shutdown` resolves, `close()`
    /// is called, or a consumer fails. Always drains and closes before
    /// returning.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidState`] unless connected, or the error
    /// that ended a consumer.
    pub async fn serve<F>(&self, shutdown: F) -> Result<(), ServiceError>
    where
        F: Future<Output = ()> + Send,
    {
        self.transition(ServiceState::Connected, ServiceState::Serving, "serve")?;

        let procedures: Vec<Arc<RemoteProcedure>> = self
            .procedures
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut consumers = JoinSet::new();
        for procedure in procedures {
            let deliveries = match self.broker.consume(procedure.queue()).await {
                Ok(deliveries) => deliveries,
                Err(err) => {
                    self.shutdown.trigger();
                    while consumers.join_next().await.is_some() {}
                    self.shutdown.mark_consumers_stopped();
                    self.close_after_failure().await;
                    return Err(err.into());
                }
            };
            consumers.spawn(
                consume_queue(
                    procedure,
                    deliveries,
                    Arc::clone(&self.broker),
                    Arc::clone(&self.shutdown),
                    self.log.clone(),
                )
                .with_subscriber(self.log.clone()),
            );
        }
        info!(queues = consumers.len(), "serving");

        let outcome = tokio::select! {
            () = shutdown => {
                info!("shutdown requested");
                Ok(())
            }
            () = self.shutdown.stopped() => Ok(()),
            Some(joined) = consumers.join_next() => match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(ServiceError::Broker(err)),
                Err(join) => Err(ServiceError::Consumer(join)),
            },
        };

        self.shutdown.trigger();
        while consumers.join_next().await.is_some() {}
        self.shutdown.mark_consumers_stopped();

        match outcome {
            Ok(()) => self.close().await,
            Err(err) => {
                error!(error = %err, "serve loop failed");
                self.close_after_failure().await;
                Err(err)
            }
        }
    }

    /// Stops consumers, drains in-flight calls and closes the broker.
    ///
    /// Idempotent: the broker is closed at most once. A disconnected service
    /// stays disconnected and can still connect.
    ///
    /// # Errors
    ///
    /// Returns a broker error if the connection does not close cleanly.
    pub async fn close(&self) -> Result<(), ServiceError> {
        let previous = self.state.rcu(|current| match **current {
            ServiceState::Connected | ServiceState::Serving => Arc::new(ServiceState::Closed),
            ServiceState::Disconnected | ServiceState::Closed => Arc::clone(current),
        });
        match *previous {
            ServiceState::Closed | ServiceState::Disconnected => Ok(()),
            state @ (ServiceState::Connected | ServiceState::Serving) => {
                self.shutdown.trigger();
                if state == ServiceState::Serving
                    && tokio::time::timeout(self.drain_timeout, self.shutdown.consumers_stopped())
                        .await
                        .is_err()
                {
                    warn!("consumers did not stop before the drain timeout");
                }
                if !self.shutdown.wait_for_drain(self.drain_timeout).await {
                    warn!(
                        in_flight = self.shutdown.in_flight_count(),
                        "drain timeout expired with calls still running"
                    );
                }
                self.broker.close().await?;
                info!("service closed");
                Ok(())
            }
        }
    }

    async fn close_after_failure(&self) {
        if let Err(err) = self.close().await {
            warn!(error = %err, "failed to close broker after error");
        }
    }
}

impl fmt::Debug for RpcService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcService")
            .field("state", &self.state())
            .field("queues", &self.queues())
            .field("drain_timeout", &self.drain_timeout)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Consumer and per-delivery tasks
// ---------------------------------------------------------------------------

async fn consume_queue(
    procedure: Arc<RemoteProcedure>,
    mut deliveries: DeliveryStream,
    broker: Arc<dyn Broker>,
    shutdown: Arc<ShutdownController>,
    log: Dispatch,
) -> Result<(), BrokerError> {
    loop {
        tokio::select! {
            biased;
            () = shutdown.stopped() => return Ok(()),
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => {
                    let guard = shutdown.in_flight_guard();
                    tokio::spawn(
                        handle_delivery(
                            Arc::clone(&procedure),
                            Arc::clone(&broker),
                            delivery,
                            guard,
                        )
                        .with_subscriber(log.clone()),
                    );
                }
                Some(Err(err)) => return Err(err),
                None => return Err(BrokerError::ConsumerEnded(procedure.queue().to_owned())),
            },
        }
    }
}

async fn handle_delivery(
    procedure: Arc<RemoteProcedure>,
    broker: Arc<dyn Broker>,
    delivery: Delivery,
    _guard: InFlightGuard,
) {
    let Delivery {
        delivery_tag,
        payload,
        correlation_id,
        reply_to,
    } = delivery;

    let result = match serde_json::from_slice::<Value>(&payload) {
        Ok(args) => {
            let call = RpcCall {
                correlation_id: correlation_id.clone(),
                args,
            };
            CallTraceLayer::new(procedure.queue())
                .layer(Arc::clone(&procedure))
                .oneshot(call)
                .await
        }
        Err(err) => procedure.handle_failure(RpcFailure::from(err), &Value::Null),
    };

    let (body, is_error) = match result {
        Ok(envelope) => match serde_json::to_value(&envelope) {
            Ok(body) => (body, false),
            Err(err) => (json!({ "error": err.to_string() }), true),
        },
        Err(failure) => {
            error!(queue = procedure.queue(), error = %failure, "no handler matched failure");
            (json!({ "error": failure.to_string() }), true)
        }
    };

    let replied = match reply_to {
        Some(reply_to) => {
            let reply = OutboundReply {
                reply_to,
                correlation_id,
                body,
                is_error,
            };
            match broker.reply(reply).await {
                Ok(()) => true,
                Err(err) => {
                    error!(queue = procedure.queue(), error = %err, "failed to publish reply");
                    false
                }
            }
        }
        None => {
            warn!(queue = procedure.queue(), "call without reply_to, reply dropped");
            true
        }
    };

    // An unanswered call is dead-lettered rather than acked as handled.
    let settled = if replied {
        broker.ack(delivery_tag).await
    } else {
        broker.reject(delivery_tag).await
    };
    if let Err(err) = settled {
        error!(queue = procedure.queue(), delivery_tag, error = %err, "failed to settle delivery");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use authrpc_core::ResponseEnvelope;
    use tokio::sync::{oneshot, Notify};

    use super::*;
    use crate::broker::{BrokerEvent, InMemoryBroker};
    use crate::rpc::handlers::with_default_chain;
    use crate::rpc::FailureKind;

    fn config() -> AmqpConfig {
        let mut config = AmqpConfig::new("guest", "guest", "localhost");
        config.connect_backoff_ms = 10;
        config
    }

    fn service(broker: &Arc<InMemoryBroker>) -> Arc<RpcService> {
        let broker: Arc<dyn Broker> = Arc::clone(broker) as Arc<dyn Broker>;
        Arc::new(RpcService::new(broker, Dispatch::none()))
    }

    fn echo(queue: &str) -> RemoteProcedure {
        with_default_chain(RemoteProcedure::new(queue, |args| async move {
            Ok(ResponseEnvelope::ok(args))
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_until_success() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.fail_next_connects(2);
        let service = service(&broker);

        service.connect(&config()).await.unwrap();
        assert_eq!(service.state(), ServiceState::Connected);
        assert_eq!(broker.connect_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_gives_up_after_max_attempts() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.fail_next_connects(10);
        let service = service(&broker);

        let err = service.connect(&config()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Connection { attempts: 5, .. }));
        assert_eq!(service.state(), ServiceState::Disconnected);
    }

    #[tokio::test]
    async fn register_requires_connection() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service(&broker);

        let err = service.register_function(echo("q")).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::InvalidState {
                state: ServiceState::Disconnected,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn duplicate_queue_is_rejected() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service(&broker);
        service.connect(&config()).await.unwrap();

        service.register_function(echo("login")).await.unwrap();
        let err = service.register_function(echo("login")).await.unwrap_err();
        assert!(matches!(err, ServiceError::DuplicateQueue(q) if q == "login"));
        assert_eq!(service.queues(), vec!["login".to_owned()]);
        assert_eq!(broker.declared_queues(), vec!["login".to_owned()]);
    }

    #[tokio::test]
    async fn serve_requires_connection() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service(&broker);
        let err = service.serve(async {}).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn replies_with_envelope_and_acks() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service(&broker);
        service.connect(&config()).await.unwrap();
        service.register_function(echo("echo")).await.unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let serving = tokio::spawn({
            let service = Arc::clone(&service);
            async move {
                service
                    .serve(async {
                        let _ = stop_rx.await;
                    })
                    .await
            }
        });

        tokio::task::yield_now().await;
        let tag = broker
            .publish_call("echo", &json!({"hello": "world"}), "c-1")
            .unwrap();
        let reply = broker.wait_for_reply("c-1").await;
        assert!(!reply.is_error);
        assert_eq!(
            reply.body,
            json!({"response_code": 200, "response_data": {"hello": "world"}})
        );

        stop_tx.send(()).unwrap();
        serving.await.unwrap().unwrap();
        assert!(broker.events().contains(&BrokerEvent::Acked(tag)));
        assert_eq!(service.state(), ServiceState::Closed);
    }

    #[tokio::test]
    async fn invalid_json_goes_through_the_chain() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service(&broker);
        service.connect(&config()).await.unwrap();
        service.register_function(echo("echo")).await.unwrap();

        let serving = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.serve(std::future::pending()).await }
        });
        tokio::task::yield_now().await;

        broker
            .publish_raw("echo", b"{not json".to_vec(), Some("c-bad"))
            .unwrap();
        let reply = broker.wait_for_reply("c-bad").await;
        assert_eq!(
            reply.body,
            json!({"response_code": 400, "response_data": {"message": "invalid data"}})
        );

        service.close().await.unwrap();
        serving.await.unwrap().unwrap();
        assert_eq!(broker.close_count(), 1);
    }

    #[tokio::test]
    async fn unmatched_failure_is_an_error_reply() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service(&broker);
        service.connect(&config()).await.unwrap();
        service
            .register_function(RemoteProcedure::new("bare", |_args| async {
                Err(RpcFailure::new(FailureKind::NotFound, "no such user"))
            }))
            .await
            .unwrap();

        let serving = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.serve(std::future::pending()).await }
        });
        tokio::task::yield_now().await;

        broker.publish_call("bare", &Value::Null, "c-2").unwrap();
        let reply = broker.wait_for_reply("c-2").await;
        assert!(reply.is_error);
        assert_eq!(reply.body, json!({"error": "not_found: no such user"}));

        service.close().await.unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ended_consumer_fails_serve_and_closes() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service(&broker);
        service.connect(&config()).await.unwrap();
        service.register_function(echo("echo")).await.unwrap();

        let serving = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.serve(std::future::pending()).await }
        });
        tokio::task::yield_now().await;
        broker.end_consumer("echo");

        let err = serving.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Broker(BrokerError::ConsumerEnded(q)) if q == "echo"
        ));
        assert_eq!(broker.close_count(), 1);
    }

    #[tokio::test]
    async fn cancellation_closes_once_after_in_flight_call_completes() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service(&broker);
        service.connect(&config()).await.unwrap();

        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let slow = RemoteProcedure::new("slow", {
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            move |_args| {
                let started = Arc::clone(&started);
                let release = Arc::clone(&release);
                async move {
                    started.notify_one();
                    release.notified().await;
                    Ok(ResponseEnvelope::ok(json!("done")))
                }
            }
        });
        service.register_function(slow).await.unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let serving = tokio::spawn({
            let service = Arc::clone(&service);
            async move {
                service
                    .serve(async {
                        let _ = stop_rx.await;
                    })
                    .await
            }
        });
        tokio::task::yield_now().await;

        broker.publish_call("slow", &Value::Null, "c-slow").unwrap();
        started.notified().await;
        assert_eq!(service.in_flight_count(), 1);

        stop_tx.send(()).unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(broker.close_count(), 0);

        release.notify_one();
        serving.await.unwrap().unwrap();
        service.close().await.unwrap();

        assert_eq!(broker.close_count(), 1);
        let events = broker.events();
        let replied = events
            .iter()
            .position(|e| matches!(e, BrokerEvent::Replied(r) if r.correlation_id.as_deref() == Some("c-slow")))
            .unwrap();
        let closed = events
            .iter()
            .position(|e| *e == BrokerEvent::Closed)
            .unwrap();
        assert!(replied < closed);
    }

    #[tokio::test]
    async fn panicking_callable_is_answered_and_acked() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service(&broker);
        service.connect(&config()).await.unwrap();
        let boom = with_default_chain(RemoteProcedure::new("boom", |args: Value| {
            if args["explode"] == true {
                panic!("cannot build call");
            }
            async { Ok(ResponseEnvelope::ok(Value::Null)) }
        }));
        service.register_function(boom).await.unwrap();

        let serving = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.serve(std::future::pending()).await }
        });
        tokio::task::yield_now().await;

        let tag = broker
            .publish_call("boom", &json!({"explode": true}), "c-boom")
            .unwrap();
        let reply = broker.wait_for_reply("c-boom").await;
        assert_eq!(reply.body["response_code"], 500);

        service.close().await.unwrap();
        serving.await.unwrap().unwrap();
        assert!(broker.events().contains(&BrokerEvent::Acked(tag)));
    }

    #[tokio::test]
    async fn unanswerable_call_is_rejected() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service(&broker);
        service.connect(&config()).await.unwrap();
        service.register_function(echo("echo")).await.unwrap();

        let serving = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.serve(std::future::pending()).await }
        });
        tokio::task::yield_now().await;

        broker.fail_next_replies(1);
        let lost = broker.publish_call("echo", &json!(1), "c-lost").unwrap();
        let kept = broker.publish_call("echo", &json!(2), "c-kept").unwrap();
        broker.wait_for_reply("c-kept").await;
        while !broker.events().contains(&BrokerEvent::Rejected(lost)) {
            tokio::task::yield_now().await;
        }

        service.close().await.unwrap();
        serving.await.unwrap().unwrap();
        let events = broker.events();
        assert!(!events.contains(&BrokerEvent::Acked(lost)));
        assert!(events.contains(&BrokerEvent::Acked(kept)));
    }

    #[tokio::test]
    async fn external_close_waits_for_consumers_to_stop() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service(&broker);
        service.connect(&config()).await.unwrap();
        service.register_function(echo("a")).await.unwrap();
        service.register_function(echo("b")).await.unwrap();

        let serving = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.serve(std::future::pending()).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(service.state(), ServiceState::Serving);

        service.close().await.unwrap();
        let stopped = tokio::time::timeout(
            Duration::from_millis(1),
            service.shutdown.consumers_stopped(),
        )
        .await;
        assert!(stopped.is_ok());
        assert_eq!(broker.close_count(), 1);

        serving.await.unwrap().unwrap();
        assert_eq!(broker.close_count(), 1);
        assert_eq!(service.state(), ServiceState::Closed);
    }

    #[tokio::test]
    async fn close_before_connect_leaves_service_usable() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service(&broker);

        service.close().await.unwrap();
        assert_eq!(service.state(), ServiceState::Disconnected);

        service.connect(&config()).await.unwrap();
        assert_eq!(service.state(), ServiceState::Connected);
        assert_eq!(broker.close_count(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let broker = Arc::new(InMemoryBroker::new());
        let service = service(&broker);
        service.close().await.unwrap();
        assert_eq!(broker.close_count(), 0);

        service.connect(&config()).await.unwrap();
        service.close().await.unwrap();
        service.close().await.unwrap();
        assert_eq!(broker.close_count(), 1);
        assert_eq!(service.state(), ServiceState::Closed);
    }
}

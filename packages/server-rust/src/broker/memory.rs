//! Deterministic in-process broker.
//!
//! Queues are unbounded channels. Replies, acks and lifecycle calls are
//! recorded as [`BrokerEvent`]s so tests can assert on ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use authrpc_core::AmqpConfig;
use futures_util::stream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Broker, BrokerError, Delivery, DeliveryStream, OutboundReply};

/// Queue replies are addressed to when a test publishes a call.
pub const MEMORY_REPLY_QUEUE: &str = "memory.replies";

/// One observable interaction with the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Connected,
    Declared(String),
    Consuming(String),
    Replied(OutboundReply),
    Acked(u64),
    Rejected(u64),
    Closed,
}

#[derive(Debug)]
struct QueueSlot {
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Option<mpsc::UnboundedReceiver<Delivery>>,
}

/// In-memory [`Broker`].
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    connected: AtomicBool,
    closed: AtomicBool,
    failing_connects: AtomicU32,
    failing_replies: AtomicU32,
    connects: AtomicU32,
    closes: AtomicU32,
    next_tag: AtomicU64,
    queues: Mutex<HashMap<String, QueueSlot>>,
    events: Mutex<Vec<BrokerEvent>>,
    reply_notify: tokio::sync::Notify,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` reply publishes fail as if the reply queue
    /// had been deleted.
    pub fn fail_next_replies(&self, count: u32) {
        self.failing_replies.store(count, Ordering::SeqCst);
    }

    /// Enqueues a JSON call as a client would, returning its delivery tag.
    ///
    /// # Errors
    ///
    /// Returns an error if `queue` was never declared.
    pub fn publish_call(
        &self,
        queue: &str,
        args: &Value,
        correlation_id: &str,
    ) -> Result<u64, BrokerError> {
        let payload = serde_json::to_vec(args)?;
        self.publish_raw(queue, payload, Some(correlation_id))
    }

    /// Enqueues an arbitrary payload, which need not be valid JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if `queue` was never declared.
    pub fn publish_raw(
        &self,
        queue: &str,
        payload: Vec<u8>,
        correlation_id: Option<&str>,
    ) -> Result<u64, BrokerError> {
        let delivery_tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let delivery = Delivery {
            delivery_tag,
            payload,
            correlation_id: correlation_id.map(str::to_owned),
            reply_to: Some(MEMORY_REPLY_QUEUE.to_owned()),
        };
        let queues = self.queues.lock();
        let slot = queues
            .get(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_owned()))?;
        slot.sender
            .send(delivery)
            .map_err(|_| BrokerError::Closed)?;
        Ok(delivery_tag)
    }

    /// Ends the consumer stream of `queue`, as a cancelled consumer would.
    pub fn end_consumer(&self, queue: &str) {
        self.queues.lock().remove(queue);
    }

    /// Waits until a reply for `correlation_id` has been published.
    pub async fn wait_for_reply(&self, correlation_id: &str) -> OutboundReply {
        loop {
            let notified = self.reply_notify.notified();
            if let Some(reply) = self
                .replies()
                .into_iter()
                .find(|r| r.correlation_id.as_deref() == Some(correlation_id))
            {
                return reply;
            }
            notified.await;
        }
    }

    #[must_use]
    pub fn replies(&self) -> Vec<OutboundReply> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                BrokerEvent::Replied(reply) => Some(reply.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn events(&self) -> Vec<BrokerEvent> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn declared_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.queues.lock().keys().cloned().collect();
        queues.sort();
        queues
    }

    #[must_use]
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn close_count(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    fn record(&self, event: BrokerEvent) {
        self.events.lock().push(event);
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self, _config: &AmqpConfig) -> Result<(), BrokerError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BrokerError::Connect("injected connection failure".into()));
        }
        self.closed.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        self.record(BrokerEvent::Connected);
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.queues
            .lock()
            .entry(queue.to_owned())
            .or_insert_with(|| {
                let (sender, receiver) = mpsc::unbounded_channel();
                QueueSlot {
                    sender,
                    receiver: Some(receiver),
                }
            });
        self.record(BrokerEvent::Declared(queue.to_owned()));
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let receiver = self
            .queues
            .lock()
            .get_mut(queue)
            .and_then(|slot| slot.receiver.take())
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_owned()))?;
        self.record(BrokerEvent::Consuming(queue.to_owned()));

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver
                .recv()
                .await
                .map(|delivery| (Ok(delivery), receiver))
        })
        .boxed())
    }

    async fn reply(&self, reply: OutboundReply) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let injected = self
            .failing_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BrokerError::UnknownQueue(reply.reply_to));
        }
        self.record(BrokerEvent::Replied(reply));
        self.reply_notify.notify_waiters();
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.record(BrokerEvent::Acked(delivery_tag));
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.record(BrokerEvent::Rejected(delivery_tag));
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.queues.lock().clear();
        self.record(BrokerEvent::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn config() -> AmqpConfig {
        AmqpConfig::new("guest", "guest", "localhost")
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2);

        assert!(broker.connect(&config()).await.is_err());
        assert!(broker.connect(&config()).await.is_err());
        assert!(broker.connect(&config()).await.is_ok());
        assert_eq!(broker.connect_count(), 3);
    }

    #[tokio::test]
    async fn published_calls_reach_the_consumer() {
        let broker = InMemoryBroker::new();
        broker.connect(&config()).await.unwrap();
        broker.declare_queue("login").await.unwrap();
        let mut deliveries = broker.consume("login").await.unwrap();

        let tag = broker
            .publish_call("login", &json!({"username": "bob"}), "c-1")
            .unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();

        assert_eq!(delivery.delivery_tag, tag);
        assert_eq!(delivery.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(delivery.reply_to.as_deref(), Some(MEMORY_REPLY_QUEUE));
        assert_eq!(
            serde_json::from_slice::<Value>(&delivery.payload).unwrap(),
            json!({"username": "bob"})
        );
    }

    #[tokio::test]
    async fn queue_is_consumed_once() {
        let broker = InMemoryBroker::new();
        broker.connect(&config()).await.unwrap();
        broker.declare_queue("login").await.unwrap();
        let _first = broker.consume("login").await.unwrap();
        assert!(matches!(
            broker.consume("login").await,
            Err(BrokerError::UnknownQueue(_))
        ));
    }

    #[tokio::test]
    async fn publishing_to_undeclared_queue_fails() {
        let broker = InMemoryBroker::new();
        assert!(matches!(
            broker.publish_call("nowhere", &Value::Null, "c"),
            Err(BrokerError::UnknownQueue(_))
        ));
    }

    #[tokio::test]
    async fn close_ends_streams_and_rejects_further_use() {
        let broker = InMemoryBroker::new();
        broker.connect(&config()).await.unwrap();
        broker.declare_queue("q").await.unwrap();
        let mut deliveries = broker.consume("q").await.unwrap();

        broker.close().await.unwrap();
        assert!(deliveries.next().await.is_none());
        assert!(matches!(broker.ack(1).await, Err(BrokerError::Closed)));
        assert!(matches!(broker.close().await, Err(BrokerError::Closed)));
        assert_eq!(broker.close_count(), 1);
    }

    #[tokio::test]
    async fn replies_are_recorded() {
        let broker = InMemoryBroker::new();
        broker.connect(&config()).await.unwrap();
        let reply = OutboundReply {
            reply_to: MEMORY_REPLY_QUEUE.into(),
            correlation_id: Some("c-9".into()),
            body: json!({"response_code": 200}),
            is_error: false,
        };
        broker.reply(reply.clone()).await.unwrap();

        assert_eq!(broker.wait_for_reply("c-9").await, reply);
        assert_eq!(
            broker.events(),
            vec![BrokerEvent::Connected, BrokerEvent::Replied(reply)]
        );
    }

    #[tokio::test]
    async fn injected_reply_failure_is_not_recorded() {
        let broker = InMemoryBroker::new();
        broker.connect(&config()).await.unwrap();
        broker.fail_next_replies(1);
        let reply = OutboundReply {
            reply_to: "gone".into(),
            correlation_id: Some("c-10".into()),
            body: json!({}),
            is_error: false,
        };

        let err = broker.reply(reply.clone()).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownQueue(q) if q == "gone"));
        assert!(broker.replies().is_empty());
        broker.reply(reply).await.unwrap();
        assert_eq!(broker.replies().len(), 1);
    }
}

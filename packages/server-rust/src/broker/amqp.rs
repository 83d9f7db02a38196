//! AMQP 0-9-1 broker backed by `lapin`.

use async_trait::async_trait;
use authrpc_core::AmqpConfig;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Broker, BrokerError, Delivery, DeliveryStream, OutboundReply};

const REPLY_CONTENT_TYPE: &str = "application/json";
const ERROR_MESSAGE_TYPE: &str = "error";

/// Broker speaking AMQP to a RabbitMQ-compatible server.
///
/// One connection and one channel are opened by `connect`; every queue is
/// consumed and replied to on that channel.
#[derive(Default)]
pub struct AmqpBroker {
    connection: Mutex<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
}

impl AmqpBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self) -> Result<Channel, BrokerError> {
        self.channel.read().clone().ok_or(BrokerError::NotConnected)
    }
}

impl std::fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpBroker")
            .field("connected", &self.channel.read().is_some())
            .finish()
    }
}

fn from_lapin(delivery: lapin::message::Delivery) -> Delivery {
    let correlation_id = delivery
        .properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str().to_owned());
    let reply_to = delivery
        .properties
        .reply_to()
        .as_ref()
        .map(|queue| queue.as_str().to_owned());
    Delivery {
        delivery_tag: delivery.delivery_tag,
        payload: delivery.data,
        correlation_id,
        reply_to,
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, config: &AmqpConfig) -> Result<(), BrokerError> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &config.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        let connection = Connection::connect(&config.uri(), properties).await?;
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await?;

        info!(
            host = %config.hostname,
            port = config.port,
            vhost = %config.vhost,
            prefetch = config.prefetch_count,
            "amqp connection established"
        );
        *self.channel.write() = Some(channel);
        *self.connection.lock().await = Some(connection);
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            durable: true,
            auto_delete: true,
            ..QueueDeclareOptions::default()
        };
        self.channel()?
            .queue_declare(queue, options, FieldTable::default())
            .await?;
        debug!(queue, "queue declared");
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel()?
            .basic_consume(
                queue,
                &format!("authrpc.{queue}"),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|item| item.map(from_lapin).map_err(BrokerError::from))
            .boxed())
    }

    async fn reply(&self, reply: OutboundReply) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(&reply.body)?;
        let mut properties =
            BasicProperties::default().with_content_type(ShortString::from(REPLY_CONTENT_TYPE));
        if let Some(id) = reply.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(id));
        }
        if reply.is_error {
            properties = properties.with_kind(ShortString::from(ERROR_MESSAGE_TYPE));
        }

        self.channel()?
            .basic_publish(
                "",
                &reply.reply_to,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel()?
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let options = BasicNackOptions {
            requeue: false,
            ..BasicNackOptions::default()
        };
        self.channel()?.basic_nack(delivery_tag, options).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.channel.write().take();
        let Some(connection) = self.connection.lock().await.take() else {
            return Err(BrokerError::NotConnected);
        };
        connection.close(200, "shutting down").await?;
        info!("amqp connection closed");
        Ok(())
    }
}

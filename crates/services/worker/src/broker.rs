//! AMQP broker facade.
//!
//! Wraps the lapin client behind the small surface the worker needs:
//! connect (with retry), declare the durable topology, open the consumer
//! with a per-consumer prefetch window, publish notifications, and
//! acknowledge deliveries. The delivery tag is only meaningful on the
//! channel that produced it; if the connection is re-established, in-flight
//! tags are invalidated and the broker redelivers, which matches the
//! at-least-once contract.

use backon::{ExponentialBuilder, Retryable};
use conveyor_config::BrokerConfig;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use monitoring::logging;

use crate::notif::Notification;

/// AMQP persistent delivery mode.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Broker acknowledgment seam.
///
/// The pool finalizes every work item through this trait, which keeps the
/// ack/nack mapping testable without a broker.
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sync {
    /// Acknowledge a delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Negatively acknowledge a delivery, optionally requeueing it.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;
}

/// A connected broker client bound to one exchange/queue pair.
///
/// Cloning is cheap and shares the underlying channel.
#[derive(Clone)]
pub struct Broker {
    channel: Channel,
    exchange: String,
    queue: String,
    routing_key: String,
}

impl Broker {
    /// Connect and declare the durable topology.
    ///
    /// The initial connection is retried with an exponential backoff;
    /// everything after that is fatal to startup.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let connection = (|| async {
            Connection::connect(&config.url, ConnectionProperties::default()).await
        })
        .retry(ExponentialBuilder::default())
        .notify(|err, dur| {
            tracing::warn!(
                error = %err,
                "Broker connection failed. Retrying in {:.1}s",
                dur.as_secs_f32()
            );
        })
        .await
        .map_err(BrokerError::Connect)?;

        let channel = connection
            .create_channel()
            .await
            .map_err(BrokerError::Channel)?;

        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::Declare)?;

        channel
            .queue_declare(
                &config.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::Declare)?;

        channel
            .queue_bind(
                &config.queue_name,
                &config.exchange,
                &config.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::Declare)?;

        Ok(Self {
            channel,
            exchange: config.exchange.clone(),
            queue: config.queue_name.clone(),
            routing_key: config.routing_key.clone(),
        })
    }

    /// Open the consumer with the given tag and prefetch window.
    ///
    /// The prefetch limit is per-consumer, not per-channel; it caps
    /// in-flight work and is the dominant backpressure of the worker.
    pub async fn consume(
        &self,
        consumer_tag: &str,
        prefetch_count: u16,
    ) -> Result<Consumer, BrokerError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(BrokerError::Qos)?;

        self.channel
            .basic_consume(
                &self.queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::Consume)
    }

    /// Publish a job notification with persistent delivery mode.
    pub async fn publish_notification(&self, notif: &Notification) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(notif).map_err(BrokerError::Encode)?;

        let confirm = self
            .channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(DELIVERY_MODE_PERSISTENT),
            )
            .await
            .map_err(BrokerError::Publish)?;
        confirm.await.map_err(BrokerError::Publish)?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl Acknowledge for Broker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(BrokerError::Ack)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(BrokerError::Nack)
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("exchange", &self.exchange)
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .finish_non_exhaustive()
    }
}

/// Errors that can occur when working with the broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Failed to connect to the broker
    #[error("failed to connect to broker")]
    Connect(#[source] lapin::Error),

    /// Failed to open a channel
    #[error("failed to open broker channel")]
    Channel(#[source] lapin::Error),

    /// Failed to declare the exchange/queue topology
    #[error("failed to declare broker topology")]
    Declare(#[source] lapin::Error),

    /// Failed to set the per-consumer prefetch window
    #[error("failed to set consumer prefetch")]
    Qos(#[source] lapin::Error),

    /// Failed to start consuming
    #[error("failed to start consuming")]
    Consume(#[source] lapin::Error),

    /// Failed to publish a notification
    #[error("failed to publish notification")]
    Publish(#[source] lapin::Error),

    /// Failed to encode a notification
    #[error("failed to encode notification")]
    Encode(#[source] serde_json::Error),

    /// Failed to acknowledge a delivery
    #[error("failed to ack delivery")]
    Ack(#[source] lapin::Error),

    /// Failed to negatively acknowledge a delivery
    #[error("failed to nack delivery")]
    Nack(#[source] lapin::Error),
}

/// Log an acknowledgment failure.
///
/// Broker I/O errors on the ack path are never propagated: the delivery
/// will time out server-side and be redelivered, which is the correct
/// at-least-once recovery.
pub(crate) fn log_ack_failure(err: &BrokerError, delivery_tag: u64) {
    tracing::warn!(
        delivery_tag,
        error = %err,
        error_source = logging::error_source(err),
        "broker acknowledgment failed; delivery will be redelivered after the visibility timeout"
    );
}

//! The `amqp` module runs the engine against a real AMQP 0-9-1 broker
//! (RabbitMQ) through `lapin`.
//!
//! `AmqpConnection` wraps one `lapin::Connection`; every `open_channel`
//! creates a new `lapin::Channel`.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ConnectionProperties};
use tracing::debug;

use crate::broker::connector::{QuadraticBackoff, connect_with_retry};
use crate::broker::message::Delivery;
use crate::broker::topology::{ExchangeKind, ExchangeOptions, QueueOptions};
use crate::broker::{Channel, Connection, DeliveryStream};
use crate::utils::error::{BrokerError, Result};

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

pub struct AmqpConnection {
    inner: lapin::Connection,
}

impl AmqpConnection {
    /// Single connection attempt.
    pub async fn dial(url: &str) -> Result<Self> {
        let inner = lapin::Connection::connect(url, ConnectionProperties::default()).await?;
        Ok(Self { inner })
    }

    /// Dials `url` with quadratic backoff, making at most `max_attempts` attempts.
    pub async fn connect(url: &str, max_attempts: u32) -> Result<Self> {
        connect_with_retry(url, max_attempts, &QuadraticBackoff, |url| async move {
            Self::dial(&url).await
        })
        .await
    }
}

impl std::fmt::Debug for AmqpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpConnection")
            .field("status", &self.inner.status().state())
            .finish()
    }
}

#[async_trait]
impl Connection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn open_channel(&self) -> Result<AmqpChannel> {
        let inner = self.inner.create_channel().await?;
        Ok(AmqpChannel { inner })
    }

    async fn close(&self) -> Result<()> {
        self.inner.close(REPLY_SUCCESS, "closing").await?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct AmqpChannel {
    inner: lapin::Channel,
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Self {
            routing_key: delivery.routing_key.as_str().to_string(),
            timestamp: delivery
                .properties
                .timestamp()
                .and_then(|ts| i64::try_from(ts).ok()),
            payload: delivery.data,
        }
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, options: ExchangeOptions) -> Result<()> {
        self.inner
            .exchange_declare(
                name,
                exchange_kind(options.kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        let purged = self
            .inner
            .queue_delete(queue, QueueDeleteOptions::default())
            .await?;
        debug!(queue, purged, "queue deleted");
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type("text/plain".into())
            .with_timestamp(chrono::Utc::now().timestamp().unsigned_abs());

        // The confirm is dropped: confirms are not enabled on these channels.
        let _confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(BrokerError::from))
            .boxed())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close(REPLY_SUCCESS, "closing").await?;
        Ok(())
    }
}

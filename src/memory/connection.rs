//! `Connection` and `Channel` implementations for [`MemoryBroker`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;

use super::engine::{ChannelId, MemoryBroker};
use crate::broker::message::Delivery;
use crate::broker::topology::{ExchangeOptions, QueueOptions};
use crate::broker::{Channel, Connection, DeliveryStream};
use crate::utils::error::{BrokerError, Result};

#[derive(Debug)]
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    next_channel: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl MemoryConnection {
    pub(crate) fn new(broker: MemoryBroker, id: u64) -> Self {
        Self {
            broker,
            id,
            next_channel: AtomicU64::new(0),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<MemoryChannel> {
        let latency = self.broker.open_latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.is_closed() {
            return Err(BrokerError::ConnectionClosed);
        }

        let id = ChannelId {
            connection: self.id,
            channel: self.next_channel.fetch_add(1, Ordering::SeqCst) + 1,
        };
        self.broker.register_channel(id);

        Ok(MemoryChannel {
            broker: self.broker.clone(),
            id,
            closed: AtomicBool::new(false),
            connection_closed: self.closed.clone(),
        })
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed);
        }
        self.broker.release_connection(self.id);
        Ok(())
    }
}

/// A channel on a [`MemoryConnection`]. Dropping it without `close` releases
/// it as well.
#[derive(Debug)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    id: ChannelId,
    closed: AtomicBool,
    connection_closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.connection_closed.load(Ordering::SeqCst) {
            Err(BrokerError::ConnectionClosed)
        } else if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::ChannelClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, options: ExchangeOptions) -> Result<()> {
        self.ensure_open()?;
        self.broker.declare_exchange(name, options)
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        self.ensure_open()?;
        self.broker.declare_queue(name, options, self.id)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker.bind_queue(queue, exchange, pattern)
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker.delete_queue(queue);
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;

        let latency = self.broker.publish_latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
            self.ensure_open()?;
        }

        let delivery = Delivery::new(routing_key, payload)
            .with_timestamp(chrono::Utc::now().timestamp());
        self.broker.publish(exchange, delivery).map(|_| ())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let receiver = self.broker.take_consumer(queue)?;

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver
                .recv()
                .await
                .map(|delivery| (Ok::<_, BrokerError>(delivery), receiver))
        })
        .boxed())
    }

    async fn close(&self) -> Result<()> {
        if self.connection_closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed);
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::ChannelClosed);
        }
        self.broker.release_channel(self.id);
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.release_channel(self.id);
        }
    }
}

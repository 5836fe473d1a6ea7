//! Publishing side of the engine.
//!
//! An `Emitter` is bound to one exchange for its whole life. Every `push`
//! opens its own channel and closes it before returning, so concurrent pushes
//! on the same emitter never share a channel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant};
use tracing::debug;

use super::{Channel, Connection, close_channel, topology};
use crate::utils::error::{BrokerError, Result};

#[derive(Debug)]
pub struct Emitter<C: Connection> {
    connection: Arc<C>,
    exchange: String,
}

impl<C: Connection> Emitter<C> {
    /// Creates an emitter for `exchange`, declaring it on the broker.
    ///
    /// Fails when the declaration is rejected, e.g. because the exchange
    /// exists with different properties.
    pub async fn new(connection: Arc<C>, exchange: impl Into<String>) -> Result<Self> {
        let emitter = Self {
            connection,
            exchange: exchange.into(),
        };
        emitter.setup().await?;
        Ok(emitter)
    }

    async fn setup(&self) -> Result<()> {
        let channel = self.connection.open_channel().await?;
        let declared = topology::declare_exchange(&channel, &self.exchange).await;
        close_channel(&channel, "emitter setup").await;
        declared
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publishes `payload` under `routing_key`.
    ///
    /// Fire-and-forget: no broker confirmation is awaited and nothing is
    /// retried. Channel and publish failures are returned to the caller.
    pub async fn push(&self, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.publish(routing_key, payload, None).await
    }

    /// Like [`Emitter::push`], but gives up with
    /// [`BrokerError::DeadlineExceeded`] once `timeout` has elapsed.
    ///
    /// The deadline covers opening the channel and publishing. A channel open
    /// still pending at the deadline is finished in the background and the
    /// channel closed straight away.
    pub async fn push_within(
        &self,
        routing_key: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        self.publish(routing_key, payload, Some((deadline, timeout)))
            .await
    }

    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        deadline: Option<(Instant, Duration)>,
    ) -> Result<()> {
        let channel = match deadline {
            None => self.connection.open_channel().await?,
            Some(deadline) => self.open_within(deadline).await?,
        };

        debug!(
            exchange = %self.exchange,
            routing_key,
            bytes = payload.len(),
            "pushing to channel"
        );
        let published = bounded(
            deadline,
            channel.publish(&self.exchange, routing_key, payload),
        )
        .await;

        close_channel(&channel, "emitter push").await;
        published
    }

    /// Opens a channel on a spawned task so that missing the deadline never
    /// drops an open halfway through.
    async fn open_within(&self, (at, timeout): (Instant, Duration)) -> Result<C::Channel> {
        let connection = self.connection.clone();
        let mut opening = tokio::spawn(async move { connection.open_channel().await });

        match time::timeout_at(at, &mut opening).await {
            Ok(joined) => joined.map_err(|_| BrokerError::ChannelClosed)?,
            Err(_) => {
                tokio::spawn(async move {
                    if let Ok(Ok(channel)) = opening.await {
                        close_channel(&channel, "late channel open").await;
                    }
                });
                Err(BrokerError::DeadlineExceeded(timeout))
            }
        }
    }
}

async fn bounded<T>(
    deadline: Option<(Instant, Duration)>,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        None => operation.await,
        Some((at, timeout)) => time::timeout_at(at, operation)
            .await
            .map_err(|_| BrokerError::DeadlineExceeded(timeout))?,
    }
}

//! Consuming side of the engine.
//!
//! `listen` walks a fixed sequence of states:
//!
//! ```text
//! Idle -> ChannelOpen -> QueueDeclared -> Bound -> Consuming -> Failed
//!                                                            -> Cancelled
//! ```
//!
//! Any step failing moves straight to `Failed` and the error is returned.
//! Deliveries are auto-acknowledged by the broker on handoff, so a message
//! received right before a crash is lost (at-most-once).

use std::fmt;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatch::{DispatchConfig, Dispatcher, MessageHandler};
use super::{Channel, Connection, close_channel, topology};
use crate::utils::error::{BrokerError, Result};

/// Progress of a single `listen` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
    Idle,
    ChannelOpen,
    QueueDeclared,
    Bound,
    Consuming,
    Failed,
    Cancelled,
}

impl fmt::Display for ListenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListenState::Idle => "idle",
            ListenState::ChannelOpen => "channel_open",
            ListenState::QueueDeclared => "queue_declared",
            ListenState::Bound => "bound",
            ListenState::Consuming => "consuming",
            ListenState::Failed => "failed",
            ListenState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct Consumer<C: Connection> {
    connection: Arc<C>,
    exchange: String,
    dispatch: DispatchConfig,
}

impl<C: Connection> Consumer<C> {
    /// Creates a consumer for `exchange`, declaring it on the broker.
    pub async fn new(connection: Arc<C>, exchange: impl Into<String>) -> Result<Self> {
        let consumer = Self {
            connection,
            exchange: exchange.into(),
            dispatch: DispatchConfig::default(),
        };

        let channel = consumer.connection.open_channel().await?;
        let declared = topology::declare_exchange(&channel, &consumer.exchange).await;
        close_channel(&channel, "consumer setup").await;
        declared?;

        Ok(consumer)
    }

    /// Overrides the size of the handler worker pool.
    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Binds a private queue to every pattern and hands each delivery to
    /// `handler` until the delivery stream closes.
    ///
    /// This is meant to be the last thing a task does: it only returns on
    /// failure, and the stream closing is reported as
    /// [`BrokerError::StreamClosed`].
    pub async fn listen<S, H>(&self, patterns: &[S], handler: H) -> Result<()>
    where
        S: AsRef<str>,
        H: MessageHandler,
    {
        self.listen_until(patterns, handler, CancellationToken::new())
            .await
    }

    /// Same as [`Consumer::listen`], but returns `Ok(())` once `shutdown` is
    /// cancelled.
    ///
    /// Deliveries already received are handled before this returns, whatever
    /// the reason for stopping.
    pub async fn listen_until<S, H>(
        &self,
        patterns: &[S],
        handler: H,
        shutdown: CancellationToken,
    ) -> Result<()>
    where
        S: AsRef<str>,
        H: MessageHandler,
    {
        debug!(exchange = %self.exchange, state = %ListenState::Idle, "listen starting");

        let channel = match self.connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                error!(exchange = %self.exchange, state = %ListenState::Failed, error = %e, "could not open channel");
                return Err(e);
            }
        };
        debug!(exchange = %self.exchange, state = %ListenState::ChannelOpen, "listen progressed");

        let outcome = self
            .consume(&channel, patterns, Arc::new(handler), shutdown)
            .await;
        close_channel(&channel, "consumer listen").await;

        match &outcome {
            Ok(()) => info!(exchange = %self.exchange, state = %ListenState::Cancelled, "listen stopped"),
            Err(e) => error!(exchange = %self.exchange, state = %ListenState::Failed, error = %e, "listen terminated"),
        }
        outcome
    }

    /// Declares the private queue, runs it, and deletes it again however the
    /// run ends. The queue is exclusive, so the broker would otherwise keep it
    /// (bound and filling up) until the whole connection closes.
    async fn consume<S: AsRef<str>>(
        &self,
        channel: &C::Channel,
        patterns: &[S],
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let queue = topology::declare_anonymous_queue(channel).await?;
        debug!(queue = %queue, state = %ListenState::QueueDeclared, "listen progressed");

        let outcome = self
            .consume_queue(channel, &queue, patterns, handler, shutdown)
            .await;

        if let Err(e) = channel.delete_queue(&queue).await {
            debug!(queue = %queue, error = %e, "queue delete failed");
        }
        outcome
    }

    async fn consume_queue<S: AsRef<str>>(
        &self,
        channel: &C::Channel,
        queue: &str,
        patterns: &[S],
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        for pattern in patterns {
            channel
                .bind_queue(queue, &self.exchange, pattern.as_ref())
                .await?;
        }
        debug!(queue, bindings = patterns.len(), state = %ListenState::Bound, "listen progressed");

        let mut deliveries = channel.consume(queue).await?;
        info!(exchange = %self.exchange, queue, state = %ListenState::Consuming, "waiting for messages");

        let dispatcher = Dispatcher::spawn(handler, self.dispatch);
        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        debug!(routing_key = %delivery.routing_key, "dispatching message");
                        // a full pool must not hold up shutdown
                        tokio::select! {
                            _ = shutdown.cancelled() => break Ok(()),
                            sent = dispatcher.dispatch(delivery) => {
                                if let Err(e) = sent {
                                    break Err(e);
                                }
                            }
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => {
                        warn!(queue, "delivery stream ended");
                        break Err(BrokerError::StreamClosed);
                    }
                },
            }
        };

        dispatcher.drain().await;
        outcome
    }
}

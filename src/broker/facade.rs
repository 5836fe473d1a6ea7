//! `MessageBroker` bundles an [`Emitter`] and a [`Consumer`] behind two calls
//! for callers that would rather not wire them by hand.
//!
//! Payloads pushed through the façade are JSON-encoded. Every call builds a
//! fresh emitter or consumer, which repeats the (idempotent) exchange
//! declaration each time.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::consumer::Consumer;
use super::dispatch::{DispatchConfig, MessageHandler};
use super::emitter::Emitter;
use super::Connection;
use crate::utils::error::Result;

#[derive(Debug)]
pub struct MessageBroker<C: Connection> {
    connection: Arc<C>,
    exchange: String,
    queue: String,
    dispatch: DispatchConfig,
    publish_timeout: Option<Duration>,
}

impl<C: Connection> MessageBroker<C> {
    /// `queue` is kept for the caller's bookkeeping only; consumers always
    /// declare an anonymous queue.
    pub fn new(connection: Arc<C>, exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            connection,
            exchange: exchange.into(),
            queue: queue.into(),
            dispatch: DispatchConfig::default(),
            publish_timeout: None,
        }
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Bounds every `push_to_queue` call by `timeout`.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = Some(timeout);
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// JSON-encodes `data` and publishes it under `routing_key`.
    pub async fn push_to_queue<T>(&self, routing_key: &str, data: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(data)?;
        let emitter = Emitter::new(self.connection.clone(), self.exchange.as_str()).await?;

        match self.publish_timeout {
            Some(timeout) => emitter.push_within(routing_key, &payload, timeout).await,
            None => emitter.push(routing_key, &payload).await,
        }
    }

    /// Listens on `patterns` until the delivery stream closes.
    ///
    /// Failures are logged and also returned, so a dead listener is never
    /// silent.
    pub async fn listen_for_updates<S, H>(&self, patterns: &[S], handler: H) -> Result<()>
    where
        S: AsRef<str>,
        H: MessageHandler,
    {
        self.listen_for_updates_until(patterns, handler, CancellationToken::new())
            .await
    }

    /// Same as [`MessageBroker::listen_for_updates`], returning `Ok(())` once
    /// `shutdown` is cancelled.
    pub async fn listen_for_updates_until<S, H>(
        &self,
        patterns: &[S],
        handler: H,
        shutdown: CancellationToken,
    ) -> Result<()>
    where
        S: AsRef<str>,
        H: MessageHandler,
    {
        let consumer = Consumer::new(self.connection.clone(), self.exchange.as_str())
            .await
            .inspect_err(|e| {
                error!(exchange = %self.exchange, queue = %self.queue, error = %e, "could not create consumer")
            })?
            .with_dispatch(self.dispatch);

        consumer
            .listen_until(patterns, handler, shutdown)
            .await
            .inspect_err(|e| {
                error!(exchange = %self.exchange, queue = %self.queue, error = %e, "listener stopped")
            })
    }
}

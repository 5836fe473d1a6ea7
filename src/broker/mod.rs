//! The `broker` module is the connection-lifecycle and topic pub/sub engine.
//!
//! Everything here is written against two small traits, [`Connection`] and
//! [`Channel`], so the same emitter/consumer code runs over AMQP
//! (`crate::amqp`) or the in-process broker (`crate::memory`).
//!
//! - `connector`: dialing with bounded retry and quadratic backoff.
//! - `topology`: exchange and anonymous queue declarations.
//! - `emitter`: publishing on a fresh channel per call.
//! - `consumer`: queue declare/bind/consume loop feeding a dispatch pool.
//! - `dispatch`: the worker pool that runs message handlers.
//! - `facade`: `MessageBroker`, emitter and consumer behind one object.

pub mod connector;
pub mod consumer;
pub mod dispatch;
pub mod emitter;
pub mod facade;
pub mod message;
pub mod topology;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::debug;

use crate::utils::error::Result;

pub use connector::{Backoff, DEFAULT_MAX_ATTEMPTS, QuadraticBackoff, connect_with_retry};
pub use consumer::{Consumer, ListenState};
pub use dispatch::{DispatchConfig, MessageHandler};
pub use emitter::Emitter;
pub use facade::MessageBroker;
pub use message::Delivery;
pub use topology::{ExchangeKind, ExchangeOptions, QueueOptions};

/// Stream of deliveries produced by [`Channel::consume`].
///
/// The stream ends when the channel, the queue or the connection goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// A logical link to the broker, shared by every emitter and consumer built
/// on top of it.
///
/// Implementations must allow channels to be opened concurrently from many
/// tasks through a shared reference.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    type Channel: Channel;

    /// Opens a new, independent channel on this connection.
    async fn open_channel(&self) -> Result<Self::Channel>;

    /// Closes the connection; every channel opened on it stops working.
    async fn close(&self) -> Result<()>;
}

/// A single channel on a [`Connection`]. Channels are never shared between
/// concurrent operations.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    async fn declare_exchange(&self, name: &str, options: ExchangeOptions) -> Result<()>;

    /// Declares a queue and returns its name. An empty `name` asks the broker
    /// to generate one.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    /// Deletes `queue` together with its bindings and any unread messages.
    async fn delete_queue(&self, queue: &str) -> Result<()>;

    /// Publishes without waiting for a broker confirmation.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()>;

    /// Starts consuming `queue` in auto-acknowledge mode.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;
}

/// Closes `channel`, logging rather than returning a failure. Used on exit
/// paths where the operation's own outcome is what the caller needs to see.
pub(crate) async fn close_channel<C: Channel>(channel: &C, context: &'static str) {
    if let Err(e) = channel.close().await {
        debug!(context, error = %e, "channel close failed");
    }
}

#[cfg(test)]
mod tests;

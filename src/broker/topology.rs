//! Exchange and queue declarations shared by emitters and consumers.
//!
//! Both declarations are idempotent on the broker side: repeating one with
//! identical properties is a no-op, repeating it with different properties
//! fails and the broker's error is returned unchanged.

use tracing::debug;

use super::Channel;
use crate::utils::error::Result;

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Dot-delimited routing keys matched against `*`/`#` patterns.
    Topic,
    /// Routing key must equal the binding key.
    Direct,
    /// Every bound queue receives every message.
    Fanout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

/// Topic exchange that survives broker restarts and is never removed implicitly.
pub const TOPIC_EXCHANGE: ExchangeOptions = ExchangeOptions {
    kind: ExchangeKind::Topic,
    durable: true,
    auto_delete: false,
    internal: false,
};

/// Private queue living only as long as the channel that declared it.
pub const ANONYMOUS_QUEUE: QueueOptions = QueueOptions {
    durable: false,
    auto_delete: false,
    exclusive: true,
};

/// Declares `name` as a durable topic exchange.
pub async fn declare_exchange<C: Channel>(channel: &C, name: &str) -> Result<()> {
    channel.declare_exchange(name, TOPIC_EXCHANGE).await?;
    debug!(exchange = name, "exchange declared");
    Ok(())
}

/// Declares an exclusive queue named by the broker and returns that name.
pub async fn declare_anonymous_queue<C: Channel>(channel: &C) -> Result<String> {
    let queue = channel.declare_queue("", ANONYMOUS_QUEUE).await?;
    debug!(queue = %queue, "anonymous queue declared");
    Ok(queue)
}

//! In-memory broker engine
//!
//! This module contains an in-process broker with the routing model of an
//! AMQP server:
//! - named exchanges (topic, direct, fanout) declared idempotently
//! - queues, either named or broker-generated (`amq.gen-…`)
//! - bindings from queues to exchanges, and the default exchange which
//!   routes straight to the queue named by the routing key
//! - auto-delete queues removed when the declaring channel closes, exclusive
//!   queues when the declaring connection closes; deleting a queue ends its
//!   consumer's delivery stream
//!
//! Concurrency and usage notes:
//! - All state lives behind one `std::sync::Mutex`. The lock is never held
//!   across an `.await`; delivery goes through unbounded channels.
//! - `MemoryBroker` is a cheap handle; clones share the same state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};
use uuid::Uuid;

use super::connection::MemoryConnection;
use super::topic::Exchange;
use crate::broker::message::Delivery;
use crate::broker::topology::{ExchangeOptions, QueueOptions};
use crate::utils::error::{BrokerError, Result};

/// Identifies one channel of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub connection: u64,
    pub channel: u64,
}

#[derive(Debug)]
struct Queue {
    options: QueueOptions,
    owner: ChannelId,
    sender: UnboundedSender<Delivery>,
    receiver: Option<UnboundedReceiver<Delivery>>,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    open_channels: HashSet<ChannelId>,
    channels_opened: u64,
    next_connection: u64,
    refused_dials: u32,
    open_latency: Duration,
    publish_latency: Duration,
}

impl BrokerState {
    fn delete_queue(&mut self, name: &str) {
        if self.queues.remove(name).is_some() {
            for exchange in self.exchanges.values_mut() {
                exchange.unbind_queue(name);
            }
            debug!(queue = name, "queue deleted");
        }
    }

    fn delete_owned_queues(&mut self, doomed: impl Fn(&ChannelId, &QueueOptions) -> bool) {
        let doomed: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| doomed(&q.owner, &q.options))
            .map(|(name, _)| name.clone())
            .collect();

        for name in doomed {
            self.delete_queue(&name);
        }
    }
}

/// Handle to an in-process broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a connection. Fails with [`BrokerError::Connect`] while refused
    /// dials are pending (see [`MemoryBroker::refuse_connections`]).
    pub fn dial(&self) -> Result<MemoryConnection> {
        let id = {
            let mut state = self.state();
            if state.refused_dials > 0 {
                state.refused_dials -= 1;
                return Err(BrokerError::Connect("connection refused".to_string()));
            }
            state.next_connection += 1;
            state.next_connection
        };

        info!(connection = id, "connection opened");
        Ok(MemoryConnection::new(self.clone(), id))
    }

    /// Makes the next `count` dials fail, as if the broker was still starting.
    pub fn refuse_connections(&self, count: u32) {
        self.state().refused_dials = count;
    }

    /// Delays every channel open by `latency`.
    pub fn set_open_latency(&self, latency: Duration) {
        self.state().open_latency = latency;
    }

    pub(crate) fn open_latency(&self) -> Duration {
        self.state().open_latency
    }

    /// Delays every publish by `latency`, simulating the network round trip.
    pub fn set_publish_latency(&self, latency: Duration) {
        self.state().publish_latency = latency;
    }

    pub(crate) fn publish_latency(&self) -> Duration {
        self.state().publish_latency
    }

    /// Channels currently open across all connections.
    pub fn open_channels(&self) -> usize {
        self.state().open_channels.len()
    }

    /// Channels opened since the broker was created.
    pub fn channels_opened(&self) -> u64 {
        self.state().channels_opened
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state().exchanges.contains_key(name)
    }

    pub fn queue_count(&self) -> usize {
        self.state().queues.len()
    }

    /// Number of bindings on `exchange`, zero if it does not exist.
    pub fn binding_count(&self, exchange: &str) -> usize {
        self.state()
            .exchanges
            .get(exchange)
            .map_or(0, |e| e.bindings.len())
    }

    pub(crate) fn register_channel(&self, id: ChannelId) {
        let mut state = self.state();
        state.open_channels.insert(id);
        state.channels_opened += 1;
    }

    /// Forgets a closed channel and deletes the auto-delete queues it declared.
    ///
    /// Exclusive queues outlive the channel; they belong to the connection.
    pub(crate) fn release_channel(&self, id: ChannelId) {
        let mut state = self.state();
        if state.open_channels.remove(&id) {
            state.delete_owned_queues(|owner, options| *owner == id && options.auto_delete);
            debug!(connection = id.connection, channel = id.channel, "channel closed");
        }
    }

    /// Releases every channel of a closed connection along with its exclusive
    /// and auto-delete queues.
    pub(crate) fn release_connection(&self, connection: u64) {
        let mut state = self.state();
        state.open_channels.retain(|id| id.connection != connection);
        state.delete_owned_queues(|owner, options| {
            owner.connection == connection && (options.exclusive || options.auto_delete)
        });
        info!(connection, "connection closed");
    }

    /// Deletes `queue` and its bindings. Deleting a missing queue is a no-op.
    pub(crate) fn delete_queue(&self, queue: &str) {
        self.state().delete_queue(queue);
    }

    pub(crate) fn declare_exchange(&self, name: &str, options: ExchangeOptions) -> Result<()> {
        let mut state = self.state();
        match state.exchanges.get(name) {
            Some(existing) if existing.options != options => Err(BrokerError::PreconditionFailed(
                format!("inequivalent arguments for exchange '{name}'"),
            )),
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(name.to_string(), Exchange::new(name, options));
                Ok(())
            }
        }
    }

    pub(crate) fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        owner: ChannelId,
    ) -> Result<String> {
        let mut state = self.state();

        if let Some(existing) = state.queues.get(name) {
            if existing.options != options {
                return Err(BrokerError::PreconditionFailed(format!(
                    "inequivalent arguments for queue '{name}'"
                )));
            }
            return Ok(name.to_string());
        }

        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        state.queues.insert(
            name.clone(),
            Queue {
                options,
                owner,
                sender,
                receiver: Some(receiver),
            },
        );
        Ok(name)
    }

    pub(crate) fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        let mut state = self.state();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let exchange = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;

        exchange.bind(queue, pattern);
        Ok(())
    }

    /// Routes a message to every matching queue and returns how many received it.
    ///
    /// Messages that match nothing are dropped, as an unroutable,
    /// non-mandatory publish would be.
    pub(crate) fn publish(&self, exchange: &str, delivery: Delivery) -> Result<usize> {
        let state = self.state();

        let targets: Vec<&str> = if exchange.is_empty() {
            state
                .queues
                .get_key_value(delivery.routing_key.as_str())
                .map(|(name, _)| name.as_str())
                .into_iter()
                .collect()
        } else {
            state
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?
                .route(&delivery.routing_key)
                .into_iter()
                .collect()
        };

        let mut routed = 0;
        for name in targets {
            if let Some(queue) = state.queues.get(name) {
                if queue.sender.send(delivery.clone()).is_ok() {
                    routed += 1;
                }
            }
        }

        debug!(exchange, routing_key = %delivery.routing_key, routed, "message published");
        Ok(routed)
    }

    /// Hands out the receiving end of `queue`. A queue has at most one consumer.
    pub(crate) fn take_consumer(&self, queue: &str) -> Result<UnboundedReceiver<Delivery>> {
        let mut state = self.state();
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;

        queue_state
            .receiver
            .take()
            .ok_or_else(|| BrokerError::QueueInUse(queue.to_string()))
    }
}

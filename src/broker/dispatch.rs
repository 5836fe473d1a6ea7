//! Worker pool running message handlers.
//!
//! The consumer's receive loop pushes every delivery into a bounded queue;
//! `workers` tasks pull from it and invoke the handler. A full queue makes the
//! receive loop wait, which is the only backpressure applied to the broker.
//!
//! A handler that panics only loses the message it was handling: the panic is
//! caught, logged, and the worker moves on to the next delivery.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::message::Delivery;
use crate::utils::error::{BrokerError, Result};

/// Callback invoked once per received message with `(routing_key, payload)`.
///
/// Implemented for any `Fn(String, Vec<u8>) -> impl Future<Output = ()>`, so
/// closures returning an `async move` block can be passed directly. Handlers
/// must not block indefinitely; they run on the dispatch path.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, routing_key: String, payload: Vec<u8>) -> BoxFuture<'static, ()>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(String, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, routing_key: String, payload: Vec<u8>) -> BoxFuture<'static, ()> {
        self(routing_key, payload).boxed()
    }
}

/// Sizing of the dispatch pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Handler invocations allowed to run at the same time.
    pub workers: usize,
    /// Deliveries buffered between the receive loop and the workers.
    pub capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            capacity: 1024,
        }
    }
}

pub(crate) struct Dispatcher {
    sender: mpsc::Sender<Delivery>,
    workers: JoinSet<()>,
}

impl Dispatcher {
    /// Spawns the workers on the current runtime. Zero values are raised to one.
    pub(crate) fn spawn(handler: Arc<dyn MessageHandler>, config: DispatchConfig) -> Self {
        let (sender, receiver) = mpsc::channel::<Delivery>(config.capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = JoinSet::new();

        for worker in 0..config.workers.max(1) {
            let receiver = receiver.clone();
            let handler = handler.clone();
            workers.spawn(async move {
                loop {
                    let next = receiver.lock().await.recv().await;
                    let Some(delivery) = next else { break };
                    run_handler(worker, handler.as_ref(), delivery).await;
                }
                debug!(worker, "dispatch worker stopped");
            });
        }

        Self { sender, workers }
    }

    /// Queues `delivery` for a worker, waiting while the queue is full.
    pub(crate) async fn dispatch(&self, delivery: Delivery) -> Result<()> {
        self.sender
            .send(delivery)
            .await
            .map_err(|_| BrokerError::ChannelClosed)
    }

    /// Stops accepting deliveries and waits until every queued one is handled.
    pub(crate) async fn drain(self) {
        let Self {
            sender,
            mut workers,
        } = self;
        drop(sender);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "dispatch worker ended abnormally");
            }
        }
    }
}

async fn run_handler(worker: usize, handler: &dyn MessageHandler, delivery: Delivery) {
    let Delivery {
        routing_key,
        payload,
        ..
    } = delivery;
    let key = routing_key.clone();

    let outcome = AssertUnwindSafe(async move { handler.handle(routing_key, payload).await })
        .catch_unwind()
        .await;

    if outcome.is_err() {
        error!(worker, routing_key = %key, "message handler panicked, message dropped");
    }
}

//! # topicbus
//!
//! `topicbus` is a small publish/subscribe façade over a topic exchange on an
//! AMQP broker. It connects with bounded retry, declares a durable topic
//! exchange, binds private per-consumer queues to routing-key patterns and
//! moves byte payloads between producers and a handler callback.
//!
//! ## Core Modules
//!
//! - `broker`: connector, topology, `Emitter`, `Consumer`, the dispatch pool
//!   and the `MessageBroker` façade, all generic over `Connection`/`Channel`.
//! - `amqp`: the `lapin` implementation of those traits.
//! - `memory`: an in-process broker with the same exchange/queue model.
//! - `config`: loading settings from files and the environment.
//! - `utils`: the error type and logging setup.

pub mod amqp;
pub mod broker;
pub mod config;
pub mod memory;
pub mod utils;

pub use amqp::AmqpConnection;
pub use broker::{
    Backoff, Channel, Connection, Consumer, DEFAULT_MAX_ATTEMPTS, Delivery, DispatchConfig,
    Emitter, MessageBroker, MessageHandler, QuadraticBackoff, connect_with_retry,
};
pub use memory::MemoryBroker;
pub use utils::error::{BrokerError, Result};

//! The `memory` module is an in-process broker speaking the same
//! exchange/queue/binding model as an AMQP server.
//!
//! It backs the test-suite and local runs without RabbitMQ:
//!
//! - `engine`: `MemoryBroker`, the shared exchange/queue state.
//! - `topic`: exchanges, bindings and routing-key pattern matching.
//! - `connection`: the `Connection`/`Channel` implementations.

pub mod connection;
pub mod engine;
pub mod topic;

pub use connection::{MemoryChannel, MemoryConnection};
pub use engine::{ChannelId, MemoryBroker};
pub use topic::{Exchange, RoutingPattern};

//! The `error` module defines the error type shared by every layer of `topicbus`.
//!
//! Broker-side failures are never retried by the library itself; they are
//! surfaced to the caller as a `BrokerError`, which decides what to do next.

use std::time::Duration;

use thiserror::Error;

/// Errors produced while talking to the broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Error reported by the AMQP client or by the broker through it.
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    /// The broker could not be reached.
    #[error("could not reach broker: {0}")]
    Connect(String),

    /// An entity already exists with properties that differ from the declaration.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("exchange '{0}' not found")]
    ExchangeNotFound(String),

    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    /// The queue already has a consumer attached.
    #[error("queue '{0}' is already being consumed")]
    QueueInUse(String),

    #[error("channel is closed")]
    ChannelClosed,

    #[error("connection is closed")]
    ConnectionClosed,

    /// A caller supplied deadline elapsed before the operation completed.
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// The inbound delivery stream of a consumer ended.
    #[error("message stream closed")]
    StreamClosed,

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

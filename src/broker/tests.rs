use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::topology::{self, ExchangeOptions, TOPIC_EXCHANGE};
use super::{
    Backoff, Channel, Connection, Consumer, DispatchConfig, Emitter, MessageBroker,
    MessageHandler, QuadraticBackoff, connect_with_retry,
};
use crate::memory::{MemoryBroker, MemoryConnection};
use crate::utils::error::BrokerError;

type Received = mpsc::UnboundedReceiver<(String, Vec<u8>)>;

fn recording_handler() -> (impl MessageHandler, Received) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |routing_key: String, payload: Vec<u8>| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((routing_key, payload));
        }
    };
    (handler, rx)
}

async fn next_message(rx: &mut Received) -> (String, Vec<u8>) {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("handler channel closed")
}

async fn wait_for_bindings(broker: &MemoryBroker, exchange: &str, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while broker.binding_count(exchange) < count {
        assert!(Instant::now() < deadline, "consumer never bound its queue");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn connect(broker: &MemoryBroker) -> Arc<MemoryConnection> {
    Arc::new(broker.dial().unwrap())
}

fn single_worker() -> DispatchConfig {
    DispatchConfig {
        workers: 1,
        capacity: 16,
    }
}

// connector

#[test]
fn test_quadratic_backoff() {
    let pauses: Vec<u64> = (1..=5).map(|n| QuadraticBackoff.delay(n).as_secs()).collect();
    assert_eq!(pauses, vec![1, 4, 9, 16, 25]);
}

#[tokio::test(start_paused = true)]
async fn test_connect_after_refusals() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(3);
    let dials = AtomicU32::new(0);
    let started = Instant::now();

    let connection = connect_with_retry("memory://local", 6, &QuadraticBackoff, |_url| {
        dials.fetch_add(1, Ordering::SeqCst);
        let broker = broker.clone();
        async move { broker.dial() }
    })
    .await
    .unwrap();

    // waits of 1s, 4s and 9s before attempts 2, 3 and 4
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(14) && elapsed < Duration::from_secs(15));
    assert_eq!(dials.load(Ordering::SeqCst), 4);
    assert!(!connection.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_connect_gives_up_with_last_error() {
    let dials = AtomicU32::new(0);
    let started = Instant::now();

    let result = connect_with_retry("memory://down", 6, &QuadraticBackoff, |_url| {
        let attempt = dials.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Err::<MemoryConnection, _>(BrokerError::Connect(format!("refused #{attempt}"))) }
    })
    .await;

    assert_eq!(dials.load(Ordering::SeqCst), 6);
    // 1 + 4 + 9 + 16 + 25, no pause after the last failure
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(55) && elapsed < Duration::from_secs(56));
    match result {
        Err(BrokerError::Connect(message)) => assert_eq!(message, "refused #6"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_connect_uses_injected_backoff() {
    let seen = Mutex::new(Vec::new());
    let backoff = |failures: u32| {
        seen.lock().unwrap().push(failures);
        Duration::ZERO
    };

    let result = connect_with_retry("memory://down", 4, &backoff, |url| async move {
        Err::<MemoryConnection, _>(BrokerError::Connect(url))
    })
    .await;

    assert!(matches!(result, Err(BrokerError::Connect(url)) if url == "memory://down"));
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_connect_zero_attempts_still_dials_once() {
    let broker = MemoryBroker::new();
    let connection = connect_with_retry("memory://local", 0, &QuadraticBackoff, |_url| {
        let broker = broker.clone();
        async move { broker.dial() }
    })
    .await;
    assert!(connection.is_ok());
}

// topology

#[tokio::test]
async fn test_declare_exchange_twice() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let channel = connection.open_channel().await.unwrap();

    topology::declare_exchange(&channel, "events").await.unwrap();
    topology::declare_exchange(&channel, "events").await.unwrap();

    let transient = ExchangeOptions {
        durable: false,
        ..TOPIC_EXCHANGE
    };
    let err = channel.declare_exchange("events", transient).await.unwrap_err();
    assert!(matches!(err, BrokerError::PreconditionFailed(_)));
}

#[tokio::test]
async fn test_declare_anonymous_queue() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let channel = connection.open_channel().await.unwrap();

    let queue = topology::declare_anonymous_queue(&channel).await.unwrap();
    assert!(!queue.is_empty());
    assert_eq!(broker.queue_count(), 1);
}

// emitter

#[tokio::test]
async fn test_emitter_new_declares_exchange() {
    let broker = MemoryBroker::new();
    let emitter = Emitter::new(connect(&broker), "events").await.unwrap();

    assert_eq!(emitter.exchange(), "events");
    assert!(broker.has_exchange("events"));
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test]
async fn test_emitter_new_fails_on_conflicting_exchange() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let channel = connection.open_channel().await.unwrap();
    let transient = ExchangeOptions {
        durable: false,
        ..TOPIC_EXCHANGE
    };
    channel.declare_exchange("events", transient).await.unwrap();

    let err = Emitter::new(connection.clone(), "events").await.unwrap_err();
    assert!(matches!(err, BrokerError::PreconditionFailed(_)));
}

#[tokio::test]
async fn test_concurrent_pushes_use_own_channels() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let emitter = Arc::new(Emitter::new(connection.clone(), "events").await.unwrap());

    let mut pushes = JoinSet::new();
    for i in 0..32 {
        let emitter = emitter.clone();
        pushes.spawn(async move { emitter.push(&format!("orders.{i}"), b"x").await });
    }
    while let Some(joined) = pushes.join_next().await {
        joined.unwrap().unwrap();
    }

    // one channel for the exchange declaration plus one per push
    assert_eq!(broker.channels_opened(), 33);
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_push_within_deadline_exceeded() {
    let broker = MemoryBroker::new();
    let emitter = Emitter::new(connect(&broker), "events").await.unwrap();
    broker.set_publish_latency(Duration::from_secs(1));

    let err = emitter
        .push_within("orders.created", b"late", Duration::from_millis(10))
        .await
        .unwrap_err();

    assert!(matches!(err, BrokerError::DeadlineExceeded(t) if t == Duration::from_millis(10)));
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_push_within_deadline_during_channel_open() {
    let broker = MemoryBroker::new();
    let emitter = Emitter::new(connect(&broker), "events").await.unwrap();
    broker.set_open_latency(Duration::from_secs(1));

    let err = emitter
        .push_within("orders.created", b"late", Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::DeadlineExceeded(_)));

    // the open finishes after the deadline and its channel is closed again
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(broker.channels_opened(), 2);
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test]
async fn test_push_within_deadline_met() {
    let broker = MemoryBroker::new();
    let emitter = Emitter::new(connect(&broker), "events").await.unwrap();

    emitter
        .push_within("orders.created", b"on time", Duration::from_secs(1))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_push_on_closed_connection() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let emitter = Emitter::new(connection.clone(), "events").await.unwrap();
    connection.close().await.unwrap();

    let err = emitter.push("orders.created", b"x").await.unwrap_err();
    assert!(matches!(err, BrokerError::ConnectionClosed));
}

// consumer

#[tokio::test]
async fn test_push_reaches_listener() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let emitter = Emitter::new(connection.clone(), "events").await.unwrap();
    let consumer = Consumer::new(connection.clone(), "events").await.unwrap();
    let (handler, mut rx) = recording_handler();

    let listener = tokio::spawn(async move { consumer.listen(&["orders.created"], handler).await });
    wait_for_bindings(&broker, "events", 1).await;

    emitter.push("orders.created", b"hello").await.unwrap();

    let (key, payload) = next_message(&mut rx).await;
    assert_eq!(key, "orders.created");
    assert_eq!(payload, b"hello");
    assert!(rx.try_recv().is_err());
    assert!(!listener.is_finished());
    listener.abort();
}

#[tokio::test]
async fn test_single_word_wildcard_binding() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let emitter = Emitter::new(connection.clone(), "events").await.unwrap();
    let consumer = Consumer::new(connection.clone(), "events")
        .await
        .unwrap()
        .with_dispatch(single_worker());
    let (handler, mut rx) = recording_handler();

    let listener = tokio::spawn(async move { consumer.listen(&["a.*.c"], handler).await });
    wait_for_bindings(&broker, "events", 1).await;

    for key in ["a.b.c", "a.b.b.c", "x.b.c", "a.end.c"] {
        emitter.push(key, key.as_bytes()).await.unwrap();
    }

    assert_eq!(next_message(&mut rx).await.0, "a.b.c");
    assert_eq!(next_message(&mut rx).await.0, "a.end.c");
    listener.abort();
}

#[tokio::test]
async fn test_multi_word_wildcard_binding() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let emitter = Emitter::new(connection.clone(), "events").await.unwrap();
    let consumer = Consumer::new(connection.clone(), "events")
        .await
        .unwrap()
        .with_dispatch(single_worker());
    let (handler, mut rx) = recording_handler();

    let listener = tokio::spawn(async move { consumer.listen(&["a.#"], handler).await });
    wait_for_bindings(&broker, "events", 1).await;

    for key in ["a", "b.a", "a.b", "a.b.c"] {
        emitter.push(key, b"").await.unwrap();
    }

    assert_eq!(next_message(&mut rx).await.0, "a");
    assert_eq!(next_message(&mut rx).await.0, "a.b");
    assert_eq!(next_message(&mut rx).await.0, "a.b.c");
    listener.abort();
}

#[tokio::test]
async fn test_duplicate_patterns_deliver_once() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let emitter = Emitter::new(connection.clone(), "events").await.unwrap();
    let consumer = Consumer::new(connection.clone(), "events")
        .await
        .unwrap()
        .with_dispatch(single_worker());
    let (handler, mut rx) = recording_handler();

    let listener = tokio::spawn(async move {
        consumer
            .listen(&["orders.*", "orders.*", "orders.#"], handler)
            .await
    });
    wait_for_bindings(&broker, "events", 2).await;

    emitter.push("orders.created", b"once").await.unwrap();
    emitter.push("orders.done", b"marker").await.unwrap();

    assert_eq!(next_message(&mut rx).await.1, b"once");
    assert_eq!(next_message(&mut rx).await.1, b"marker");
    listener.abort();
}

#[tokio::test]
async fn test_panicking_handler_is_isolated() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let emitter = Emitter::new(connection.clone(), "events").await.unwrap();
    let consumer = Consumer::new(connection.clone(), "events")
        .await
        .unwrap()
        .with_dispatch(single_worker());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = move |routing_key: String, payload: Vec<u8>| {
        let tx = tx.clone();
        async move {
            if routing_key == "jobs.boom" {
                panic!("handler failure");
            }
            let _ = tx.send((routing_key, payload));
        }
    };

    let listener = tokio::spawn(async move { consumer.listen(&["jobs.*"], handler).await });
    wait_for_bindings(&broker, "events", 1).await;

    emitter.push("jobs.boom", b"").await.unwrap();
    emitter.push("jobs.ok", b"fine").await.unwrap();

    let (key, payload) = next_message(&mut rx).await;
    assert_eq!(key, "jobs.ok");
    assert_eq!(payload, b"fine");
    assert!(!listener.is_finished());
    listener.abort();
}

#[tokio::test]
async fn test_stream_close_finishes_in_flight_handlers() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let emitter = Emitter::new(connection.clone(), "events").await.unwrap();
    let consumer = Consumer::new(connection.clone(), "events")
        .await
        .unwrap()
        .with_dispatch(DispatchConfig {
            workers: 2,
            capacity: 8,
        });

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let handler = move |_routing_key: String, _payload: Vec<u8>| {
        let counter = counter.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        }
    };

    let listener = tokio::spawn(async move { consumer.listen(&["work.#"], handler).await });
    wait_for_bindings(&broker, "events", 1).await;

    for i in 0..3 {
        emitter.push(&format!("work.{i}"), b"job").await.unwrap();
    }
    connection.close().await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), listener)
        .await
        .expect("listen did not return")
        .unwrap();
    assert!(matches!(outcome, Err(BrokerError::StreamClosed)));
    assert_eq!(handled.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_listen_until_cancelled() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let consumer = Consumer::new(connection.clone(), "events").await.unwrap();
    let (handler, _rx) = recording_handler();
    let shutdown = CancellationToken::new();

    let token = shutdown.clone();
    let listener =
        tokio::spawn(async move { consumer.listen_until(&["orders.#"], handler, token).await });
    wait_for_bindings(&broker, "events", 1).await;

    shutdown.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(2), listener)
        .await
        .expect("listen did not stop")
        .unwrap();

    assert!(outcome.is_ok());
    assert!(!connection.is_closed());
    assert_eq!(broker.open_channels(), 0);
    assert_eq!(broker.queue_count(), 0);
    assert_eq!(broker.binding_count("events"), 0);
}

#[tokio::test]
async fn test_slow_handler_does_not_block_next_message() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let emitter = Emitter::new(connection.clone(), "events").await.unwrap();
    let consumer = Consumer::new(connection.clone(), "events").await.unwrap();

    let release = Arc::new(Notify::new());
    let gate = release.clone();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = move |routing_key: String, payload: Vec<u8>| {
        let gate = gate.clone();
        let tx = tx.clone();
        async move {
            if routing_key == "a.slow" {
                gate.notified().await;
            }
            let _ = tx.send((routing_key, payload));
        }
    };

    let listener = tokio::spawn(async move { consumer.listen(&["a.*"], handler).await });
    wait_for_bindings(&broker, "events", 1).await;

    emitter.push("a.slow", b"").await.unwrap();
    emitter.push("a.fast", b"").await.unwrap();

    assert_eq!(next_message(&mut rx).await.0, "a.fast");
    release.notify_one();
    assert_eq!(next_message(&mut rx).await.0, "a.slow");
    listener.abort();
}

#[tokio::test]
async fn test_cancel_while_dispatch_pool_is_full() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let emitter = Emitter::new(connection.clone(), "events").await.unwrap();
    let consumer = Consumer::new(connection.clone(), "events")
        .await
        .unwrap()
        .with_dispatch(DispatchConfig {
            workers: 1,
            capacity: 1,
        });

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let handler = move |_routing_key: String, _payload: Vec<u8>| {
        let counter = counter.clone();
        let started = started_tx.clone();
        async move {
            let _ = started.send(());
            tokio::time::sleep(Duration::from_millis(200)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        }
    };
    let shutdown = CancellationToken::new();

    let token = shutdown.clone();
    let listener =
        tokio::spawn(async move { consumer.listen_until(&["work.#"], handler, token).await });
    wait_for_bindings(&broker, "events", 1).await;

    for i in 0..5 {
        emitter.push(&format!("work.{i}"), b"job").await.unwrap();
    }
    started_rx.recv().await.unwrap();

    let cancelled_at = Instant::now();
    shutdown.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(2), listener)
        .await
        .expect("listen did not stop")
        .unwrap();

    assert!(outcome.is_ok());
    // the running handler and the one buffered delivery, nothing more
    assert!(handled.load(Ordering::SeqCst) <= 2);
    assert!(cancelled_at.elapsed() < Duration::from_millis(600));
}

#[tokio::test]
async fn test_repeated_listens_leave_no_queues() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let consumer = Arc::new(Consumer::new(connection.clone(), "events").await.unwrap());

    for round in 1..=3 {
        let (handler, _rx) = recording_handler();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let listening = consumer.clone();
        let listener = tokio::spawn(async move {
            listening
                .listen_until(&["orders.#", "users.*"], handler, token)
                .await
        });
        wait_for_bindings(&broker, "events", 2).await;
        assert_eq!(broker.queue_count(), 1, "round {round}");

        shutdown.cancel();
        listener.await.unwrap().unwrap();
        assert_eq!(broker.queue_count(), 0, "round {round}");
        assert_eq!(broker.binding_count("events"), 0, "round {round}");
    }

    assert!(!connection.is_closed());
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test]
async fn test_listen_on_closed_connection() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let consumer = Consumer::new(connection.clone(), "events").await.unwrap();
    connection.close().await.unwrap();
    let (handler, _rx) = recording_handler();

    let err = consumer.listen(&["orders.#"], handler).await.unwrap_err();
    assert!(matches!(err, BrokerError::ConnectionClosed));
}

// facade

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct OrderCreated {
    id: u32,
    sku: String,
}

#[tokio::test]
async fn test_facade_round_trip() {
    let broker = MemoryBroker::new();
    let facade = Arc::new(
        MessageBroker::new(connect(&broker), "events", "orders").with_dispatch(single_worker()),
    );
    assert_eq!(facade.queue_name(), "orders");
    let (handler, mut rx) = recording_handler();

    let listening = facade.clone();
    let listener = tokio::spawn(async move {
        listening
            .listen_for_updates(&["orders.created"], handler)
            .await
    });
    wait_for_bindings(&broker, "events", 1).await;

    let order = OrderCreated {
        id: 7,
        sku: "KB-101".to_string(),
    };
    facade.push_to_queue("orders.created", &order).await.unwrap();

    let (key, payload) = next_message(&mut rx).await;
    assert_eq!(key, "orders.created");
    let decoded: OrderCreated = serde_json::from_slice(&payload).unwrap();
    assert_eq!(decoded, order);
    listener.abort();
}

#[tokio::test(start_paused = true)]
async fn test_facade_push_honours_timeout() {
    let broker = MemoryBroker::new();
    let facade = MessageBroker::new(connect(&broker), "events", "orders")
        .with_publish_timeout(Duration::from_millis(50));
    broker.set_publish_latency(Duration::from_secs(5));

    let err = facade.push_to_queue("orders.created", "slow").await.unwrap_err();
    assert!(matches!(err, BrokerError::DeadlineExceeded(_)));
}

#[tokio::test]
async fn test_facade_propagates_listen_errors() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);
    let facade = MessageBroker::new(connection.clone(), "events", "orders");
    connection.close().await.unwrap();
    let (handler, _rx) = recording_handler();

    let err = facade
        .listen_for_updates(&["orders.#"], handler)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::ConnectionClosed));
}

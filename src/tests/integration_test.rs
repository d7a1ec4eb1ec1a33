//! End-to-end tests running the whole stack in-process: an embedded broker
//! on a random port, with real sessions connecting to it over WebSocket.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, mpsc};

use crate::broker::{Engine, start_broker_server};
use crate::config::BrokerSettings;
use crate::consume::{ConsumeOptions, Delivery, consume};
use crate::publish::Publisher;
use crate::transport::{Endpoint, ReconnectBackoff, Session, SessionOptions};
use crate::utils::error::{ConnectionError, HandlerError};
use crate::wire::QueueDescriptor;

async fn start_test_broker() -> (Arc<Mutex<Engine>>, Endpoint) {
    let port = portpicker::pick_unused_port().expect("no free port");
    let settings = BrokerSettings {
        host: "127.0.0.1".to_string(),
        port,
        ..BrokerSettings::default()
    };
    let engine = Arc::new(Mutex::new(Engine::new()));
    let addr = format!("{}:{}", settings.host, settings.port);
    let endpoint = Endpoint::from_settings(&settings);

    tokio::spawn(start_broker_server(addr, engine.clone(), settings));
    tokio::time::sleep(Duration::from_millis(100)).await;
    (engine, endpoint)
}

/// Reconnects quickly so recovery tests finish in milliseconds.
fn fast_options() -> SessionOptions {
    SessionOptions {
        backoff: ReconnectBackoff {
            first: Duration::from_millis(10),
            cap: Duration::from_millis(50),
            ..ReconnectBackoff::default()
        },
        ..SessionOptions::default()
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn integration_publish_confirm_and_consume() {
    let (engine, endpoint) = start_test_broker().await;
    let session = Session::connect(endpoint, fast_options())
        .await
        .expect("connect");
    let queue = QueueDescriptor::durable("jobs");

    let mut publisher = Publisher::bind(&session, queue.clone()).await.expect("bind");
    let receipt = publisher.publish_confirmed(b"hello").await.expect("publish");
    assert!(receipt.confirmed);
    assert_eq!(engine.lock().unwrap().queue_depth("jobs"), 1);

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let subscription = consume(
        &session,
        queue,
        move |delivery: Delivery| {
            let tx = tx.clone();
            async move {
                tx.send(delivery.payload).map_err(|_| "receiver gone")?;
                Ok(())
            }
        },
        ConsumeOptions::default(),
    )
    .await
    .expect("consume");

    let payload = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delivery within deadline")
        .expect("delivery");
    assert_eq!(payload, b"hello");

    {
        let engine = engine.clone();
        eventually("message to be settled", move || {
            let engine = engine.lock().unwrap();
            engine.queue_depth("jobs") == 0 && engine.unacked_count("jobs") == 0
        })
        .await;
    }

    subscription.cancel().await;
    session.close().await;
}

#[tokio::test]
async fn integration_prefetch_bounds_in_flight_handlers() {
    let (engine, endpoint) = start_test_broker().await;
    let session = Session::connect(endpoint, fast_options())
        .await
        .expect("connect");
    let queue = QueueDescriptor::durable("jobs");

    let mut publisher = Publisher::bind(&session, queue.clone()).await.expect("bind");
    for _ in 0..4 {
        publisher.publish_confirmed(b"work").await.expect("publish");
    }

    // Handlers park on the gate until the test releases them.
    let gate = Arc::new(Semaphore::new(0));
    let handler_gate = gate.clone();
    let subscription = consume(
        &session,
        queue,
        move |_delivery: Delivery| {
            let gate = handler_gate.clone();
            async move {
                gate.acquire().await.map_err(|_| "gate closed")?.forget();
                Ok(())
            }
        },
        ConsumeOptions {
            concurrency: 2,
            ..ConsumeOptions::default()
        },
    )
    .await
    .expect("consume");

    // Exactly two handlers start; the broker holds the other two back.
    eventually("two handlers in flight", || subscription.in_flight() == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(subscription.in_flight(), 2);
    {
        let engine = engine.lock().unwrap();
        assert_eq!(engine.unacked_count("jobs"), 2);
        assert_eq!(engine.queue_depth("jobs"), 2);
    }

    gate.add_permits(4);
    {
        let engine = engine.clone();
        eventually("all messages settled", move || {
            let engine = engine.lock().unwrap();
            engine.queue_depth("jobs") == 0 && engine.unacked_count("jobs") == 0
        })
        .await;
    }

    subscription.cancel().await;
    session.close().await;
}

#[tokio::test]
async fn integration_failed_handler_requeues_then_succeeds() {
    let (engine, endpoint) = start_test_broker().await;
    let session = Session::connect(endpoint, fast_options())
        .await
        .expect("connect");
    let queue = QueueDescriptor::durable("jobs");

    let mut publisher = Publisher::bind(&session, queue.clone()).await.expect("bind");
    publisher.publish_confirmed(b"flaky").await.expect("publish");

    let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
    let subscription = consume(
        &session,
        queue,
        move |delivery: Delivery| {
            let tx = tx.clone();
            async move {
                let first_try = delivery.attempt == 1;
                tx.send(delivery).map_err(|_| "receiver gone")?;
                if first_try {
                    return Err(HandlerError::from("transient failure"));
                }
                Ok(())
            }
        },
        ConsumeOptions::default(),
    )
    .await
    .expect("consume");

    let first = rx.recv().await.expect("first delivery");
    assert_eq!(first.attempt, 1);
    assert!(!first.redelivered);

    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("redelivery within deadline")
        .expect("redelivery");
    assert_eq!(second.attempt, 2);
    assert!(second.redelivered);

    {
        let engine = engine.clone();
        eventually("message settled after retry", move || {
            let engine = engine.lock().unwrap();
            engine.queue_depth("jobs") == 0 && engine.unacked_count("jobs") == 0
        })
        .await;
    }

    subscription.cancel().await;
    session.close().await;
}

#[tokio::test]
async fn integration_poison_message_is_dead_lettered() {
    let (engine, endpoint) = start_test_broker().await;
    let session = Session::connect(endpoint, fast_options())
        .await
        .expect("connect");
    let queue = QueueDescriptor::durable("jobs");

    let mut publisher = Publisher::bind(&session, queue.clone()).await.expect("bind");
    publisher.publish_confirmed(b"poison").await.expect("publish");

    let attempts = Arc::new(AtomicU32::new(0));
    let handler_attempts = attempts.clone();
    let subscription = consume(
        &session,
        queue,
        move |_delivery: Delivery| {
            let attempts = handler_attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::from("always fails"))
            }
        },
        ConsumeOptions {
            max_retries: 1,
            ..ConsumeOptions::default()
        },
    )
    .await
    .expect("consume");

    {
        let engine = engine.clone();
        eventually("message in the dead-letter queue", move || {
            engine.lock().unwrap().queue_depth("jobs.dlq") == 1
        })
        .await;
    }

    // One initial delivery plus max_retries redeliveries, then the poison
    // message left the work queue for good.
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    {
        let engine = engine.clone();
        eventually("poison message settled out of the work queue", move || {
            let engine = engine.lock().unwrap();
            engine.queue_depth("jobs") == 0 && engine.unacked_count("jobs") == 0
        })
        .await;
    }

    subscription.cancel().await;
    session.close().await;
}

#[tokio::test]
async fn integration_session_recovers_after_broker_disconnect() {
    let (engine, endpoint) = start_test_broker().await;
    let session = Session::connect(endpoint, fast_options())
        .await
        .expect("connect");
    assert_eq!(session.epoch(), 1);

    engine.lock().unwrap().disconnect_all_peers();

    let probe = session.clone();
    eventually("session to recover under a new epoch", move || {
        probe.epoch() == 2
    })
    .await;
    session.close().await;
}

#[tokio::test]
async fn integration_confirmed_publish_survives_reconnect() {
    let (engine, endpoint) = start_test_broker().await;
    let session = Session::connect(endpoint, fast_options())
        .await
        .expect("connect");
    let queue = QueueDescriptor::durable("jobs");
    let mut publisher = Publisher::bind(&session, queue).await.expect("bind");

    engine.lock().unwrap().disconnect_all_peers();
    {
        let engine = engine.clone();
        eventually("broker to drop the connection", move || {
            engine.lock().unwrap().peer_count() == 0
        })
        .await;
    }

    // The publisher rides out the reconnect on its own; the caller only
    // sees a confirmed receipt.
    let receipt = publisher
        .publish_confirmed(b"persistent")
        .await
        .expect("publish across reconnect");
    assert!(receipt.confirmed);

    // At-least-once: duplicates are possible if the link died between
    // enqueue and confirm, but never silent loss.
    assert!(engine.lock().unwrap().queue_depth("jobs") >= 1);
    session.close().await;
}

#[tokio::test]
async fn integration_cancel_waits_for_in_flight_handler() {
    let (engine, endpoint) = start_test_broker().await;
    let session = Session::connect(endpoint, fast_options())
        .await
        .expect("connect");
    let queue = QueueDescriptor::durable("jobs");

    let mut publisher = Publisher::bind(&session, queue.clone()).await.expect("bind");
    publisher.publish_confirmed(b"slow").await.expect("publish");

    let subscription = consume(
        &session,
        queue,
        |_delivery: Delivery| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        },
        ConsumeOptions::default(),
    )
    .await
    .expect("consume");

    eventually("handler to start", || subscription.in_flight() == 1).await;
    subscription.cancel().await;

    // The handler got its grace period: the message was acknowledged, not
    // released for redelivery.
    {
        let engine = engine.clone();
        eventually("message acknowledged, not released", move || {
            let engine = engine.lock().unwrap();
            engine.queue_depth("jobs") == 0 && engine.unacked_count("jobs") == 0
        })
        .await;
    }
    session.close().await;
}

#[tokio::test]
async fn integration_drain_timeout_releases_message_for_redelivery() {
    let (engine, endpoint) = start_test_broker().await;
    let session = Session::connect(endpoint, fast_options())
        .await
        .expect("connect");
    let queue = QueueDescriptor::durable("jobs");

    let mut publisher = Publisher::bind(&session, queue.clone()).await.expect("bind");
    publisher.publish_confirmed(b"stuck").await.expect("publish");

    // A handler that never finishes: cancellation must give up on it at
    // the drain timeout and close the channel with the message unacked.
    let subscription = consume(
        &session,
        queue.clone(),
        |_delivery: Delivery| async move {
            futures_util::future::pending::<()>().await;
            Ok(())
        },
        ConsumeOptions {
            drain_timeout: Duration::from_millis(100),
            ..ConsumeOptions::default()
        },
    )
    .await
    .expect("consume");

    eventually("handler to start", || subscription.in_flight() == 1).await;
    subscription.cancel().await;

    {
        let engine = engine.clone();
        eventually("message back in the queue", move || {
            engine.lock().unwrap().queue_depth("jobs") == 1
        })
        .await;
    }

    // The next consumer gets the message exactly once, flagged redelivered.
    let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
    let second = consume(
        &session,
        queue,
        move |delivery: Delivery| {
            let tx = tx.clone();
            async move {
                tx.send(delivery).map_err(|_| "receiver gone")?;
                Ok(())
            }
        },
        ConsumeOptions::default(),
    )
    .await
    .expect("second consume");

    let delivery = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("redelivery within deadline")
        .expect("redelivery");
    assert!(delivery.redelivered);

    {
        let engine = engine.clone();
        eventually("message settled", move || {
            let engine = engine.lock().unwrap();
            engine.queue_depth("jobs") == 0 && engine.unacked_count("jobs") == 0
        })
        .await;
    }
    assert!(rx.try_recv().is_err(), "message must be redelivered only once");

    second.cancel().await;
    session.close().await;
}

#[tokio::test]
async fn integration_bad_credentials_are_refused() {
    let (_engine, endpoint) = start_test_broker().await;
    let endpoint = Endpoint {
        password: "wrong".to_string(),
        ..endpoint
    };
    match Session::connect(endpoint, fast_options()).await {
        Err(ConnectionError::AuthRefused(reason)) => {
            assert!(reason.contains("credentials"));
        }
        Err(other) => panic!("expected auth refusal, got {other}"),
        Ok(_) => panic!("expected auth refusal, got a session"),
    }
}

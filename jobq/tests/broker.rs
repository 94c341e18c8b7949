//! Exercises `Broker::connect`/topology declaration/publish/consume against a real AMQP
//! broker reachable at the default `ConnectionParams`.

mod support;

use std::time::Duration;

use jobq::broker::OutboundMessage;
use jobq::registry::{BindingDef, ExchangeDef, QueueDef};
use jobq::{Broker, ConnectionParams};
use uuid::Uuid;

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

#[tokio::test]
async fn connect_is_idempotent_across_concurrent_callers() {
    support::init_logging();
    let broker = Broker::new(ConnectionParams::default());

    let (a, b) = tokio::join!(broker.connect(), broker.connect());
    a.unwrap();
    b.unwrap();
    assert!(broker.is_connected());
}

#[tokio::test]
async fn publish_and_consume_round_trip_through_default_exchange() {
    support::init_logging();
    let broker = Broker::new(ConnectionParams::default());
    broker.connect().await.unwrap();

    let queue = unique("jobq-test-queue");
    broker
        .declare_queues(&[QueueDef {
            name: queue.clone(),
            durable: false,
            auto_delete: true,
            exclusive: false,
        }])
        .await
        .unwrap();

    let mut handle = broker.consume(&queue, Some(1)).await.unwrap();

    broker
        .publish(OutboundMessage::new(queue.clone(), b"hello".to_vec()))
        .await
        .unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(5), handle.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("consumer stream ended")
        .expect("delivery error");
    assert_eq!(delivery.delivery.data, b"hello");

    delivery
        .delivery
        .ack(lapin::options::BasicAckOptions::default())
        .await
        .unwrap();

    broker.cancel(&handle).await.unwrap();
}

#[tokio::test]
async fn exchange_and_binding_route_a_published_message() {
    support::init_logging();
    let broker = Broker::new(ConnectionParams::default());
    broker.connect().await.unwrap();

    let exchange = unique("jobq-test-exchange");
    let queue = unique("jobq-test-bound-queue");

    broker
        .declare_exchanges(&[ExchangeDef {
            name: exchange.clone(),
            kind: "direct".to_string(),
            durable: false,
        }])
        .await
        .unwrap();
    broker
        .declare_queues(&[QueueDef {
            name: queue.clone(),
            durable: false,
            auto_delete: true,
            exclusive: false,
        }])
        .await
        .unwrap();
    broker
        .declare_bindings(&[BindingDef {
            exchange: exchange.clone(),
            queue: queue.clone(),
            routing_key: "route".to_string(),
        }])
        .await
        .unwrap();

    let mut handle = broker.consume(&queue, Some(1)).await.unwrap();

    broker
        .publish(
            OutboundMessage::new("route", b"via-exchange".to_vec()).exchange(exchange.clone()),
        )
        .await
        .unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(5), handle.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("consumer stream ended")
        .expect("delivery error");
    assert_eq!(delivery.delivery.data, b"via-exchange");

    broker.cancel(&handle).await.unwrap();
}

#[tokio::test]
async fn shutdown_before_connect_reports_not_connected() {
    support::init_logging();
    let broker = Broker::new(ConnectionParams::default());
    let err = broker.shutdown(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, jobq::Error::NotConnected));
}

#[tokio::test]
async fn shutdown_cancels_consumers_and_closes_the_connection() {
    support::init_logging();
    let broker = Broker::new(ConnectionParams::default());
    broker.connect().await.unwrap();

    let queue = unique("jobq-test-shutdown-queue");
    broker
        .declare_queues(&[QueueDef {
            name: queue.clone(),
            durable: false,
            auto_delete: true,
            exclusive: false,
        }])
        .await
        .unwrap();
    let _handle = broker.consume(&queue, Some(1)).await.unwrap();

    broker.shutdown(Duration::from_secs(5)).await.unwrap();
    assert!(!broker.is_connected());
}

#[tokio::test]
async fn failed_connect_dials_exactly_max_retries_plus_one_times() {
    support::init_logging();
    let params = ConnectionParams {
        host: "127.0.0.1".to_string(),
        port: 1, // nothing listens here; dial fails immediately instead of timing out
        max_retries: 2,
        retry_delay: Duration::from_millis(5),
        ..ConnectionParams::default()
    };
    let broker = Broker::new(params);

    let err = broker.connect().await.unwrap_err();
    match err {
        jobq::Error::ConnectFailed { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected ConnectFailed, got {other:?}"),
    }
    assert!(!broker.is_connected());
}

#[tokio::test]
async fn burst_of_publishes_trips_the_backpressure_watermark() {
    support::init_logging();
    let params = ConnectionParams {
        pool_size: 20,
        ..ConnectionParams::default()
    };
    let broker = Broker::new(params);
    broker.connect().await.unwrap();

    let queue = unique("jobq-test-backpressure-queue");
    broker
        .declare_queues(&[QueueDef {
            name: queue.clone(),
            durable: false,
            auto_delete: true,
            exclusive: false,
        }])
        .await
        .unwrap();

    // The watermark trips at 2000 in-flight publishes; firing more than that in a burst
    // should make at least one call observe back-pressure before earlier ones decay.
    let mut tasks = Vec::with_capacity(2500);
    for _ in 0..2500 {
        let broker = broker.clone();
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            broker
                .publish(OutboundMessage::new(queue, b"burst".to_vec()))
                .await
                .unwrap()
        }));
    }

    let mut rejected = 0usize;
    for task in tasks {
        if !task.await.unwrap() {
            rejected += 1;
        }
    }

    assert!(
        rejected > 0,
        "expected at least one publish in the burst to observe back-pressure"
    );

    broker.shutdown(Duration::from_secs(10)).await.unwrap();
}

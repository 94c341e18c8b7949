//! Exercises `ChannelPool`'s acquire/release/broken-replacement behavior against a real
//! AMQP connection. Requires a broker reachable at the default `ConnectionParams`.

mod support;

use jobq::pool::ChannelPool;
use jobq::ConnectionParams;
use lapin::{Connection, ConnectionProperties};

async fn connect() -> Connection {
    let params = ConnectionParams::default();
    Connection::connect(&params.uri(), ConnectionProperties::default())
        .await
        .expect("failed to connect to AMQP broker")
}

#[tokio::test]
async fn acquire_and_run_returns_channel_to_free_list() {
    support::init_logging();
    let connection = connect().await;
    let pool = ChannelPool::open(&connection, 2).await.unwrap();

    assert_eq!(pool.num_free_channels().await, 2);

    pool.acquire_and_run(|_channel| async { Ok(()) }, &connection)
        .await
        .unwrap();

    assert_eq!(pool.num_free_channels().await, 2);
}

#[tokio::test]
async fn concurrent_acquisitions_are_bounded_by_pool_size() {
    support::init_logging();
    let connection = connect().await;
    let pool = std::sync::Arc::new(ChannelPool::open(&connection, 1).await.unwrap());

    let (release_tx, release_rx) = tokio::sync::oneshot::channel();
    let (holding_tx, holding_rx) = tokio::sync::oneshot::channel();

    let held_pool = pool.clone();
    let held_connection_free = connection.clone();
    let holder = tokio::spawn(async move {
        held_pool
            .acquire_and_run(
                |_channel| async move {
                    holding_tx.send(()).unwrap();
                    release_rx.await.ok();
                    Ok(())
                },
                &held_connection_free,
            )
            .await
            .unwrap();
    });

    holding_rx.await.unwrap();
    assert_eq!(pool.num_free_channels().await, 0);

    release_tx.send(()).unwrap();
    holder.await.unwrap();
    assert_eq!(pool.num_free_channels().await, 1);
}

#[tokio::test]
async fn broken_channel_is_replaced_without_shrinking_the_pool() {
    support::init_logging();
    let connection = connect().await;
    let pool = ChannelPool::open(&connection, 1).await.unwrap();

    let result: Result<(), jobq::Error> = pool
        .acquire_and_run(
            |_channel| async { Err(jobq::Error::NotConnected) },
            &connection,
        )
        .await;
    assert!(result.is_err());

    assert_eq!(pool.num_free_channels().await, 1);
    pool.acquire_and_run(|_channel| async { Ok(()) }, &connection)
        .await
        .unwrap();
}

#[tokio::test]
async fn broken_channel_whose_replacement_also_fails_is_dropped_from_free_list() {
    support::init_logging();
    let connection = connect().await;
    let pool = ChannelPool::open(&connection, 1).await.unwrap();

    connection.close(0, "simulating a dead connection").await.unwrap();

    let result: Result<(), jobq::Error> = pool
        .acquire_and_run(
            |_channel| async { Err(jobq::Error::NotConnected) },
            &connection,
        )
        .await;
    assert!(result.is_err());

    assert_eq!(pool.num_free_channels().await, 0);
}

#[tokio::test]
async fn close_rejects_further_acquisitions() {
    support::init_logging();
    let connection = connect().await;
    let pool = ChannelPool::open(&connection, 1).await.unwrap();

    pool.close().await;
    assert!(!pool.is_open());

    let err = pool
        .acquire_and_run(|_channel| async { Ok(()) }, &connection)
        .await
        .unwrap_err();
    assert!(matches!(err, jobq::Error::PoolClosed));
}

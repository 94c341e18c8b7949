//! Exercises `App::open_transaction`/`App::stage` against a real broker: committing
//! flushes staged jobs, rolling back discards them.

mod support;

use std::time::Duration;

use jobq::registry::JobDefinitionInput;
use jobq::{App, Broker, ConnectionParams};
use uuid::Uuid;

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

#[tokio::test]
async fn committed_transaction_flushes_staged_jobs_to_the_queue() {
    support::init_logging();
    let app = App::new(Broker::new(ConnectionParams::default()));
    let queue = unique("jobq-test-txn-commit-queue");

    app.job(JobDefinitionInput::new(queue.clone()), || async move { Ok(()) })
        .await
        .unwrap();
    app.declare_amq_resources().await.unwrap();

    let transactor = app.open_transaction().await;
    app.stage(&transactor, &queue, serde_json::json!({})).await.unwrap();
    app.stage(&transactor, &queue, serde_json::json!({})).await.unwrap();

    transactor.commit(app.broker()).await.unwrap();
    transactor.wait_until(Duration::from_secs(5)).await.unwrap();

    let mut handle = app.broker().consume(&queue, Some(2)).await.unwrap();
    for _ in 0..2 {
        let delivery = tokio::time::timeout(Duration::from_secs(5), handle.recv())
            .await
            .expect("timed out waiting for a committed job to arrive")
            .expect("consumer stream ended")
            .expect("delivery error");
        delivery
            .delivery
            .ack(lapin::options::BasicAckOptions::default())
            .await
            .unwrap();
    }

    app.broker().cancel(&handle).await.unwrap();
}

#[tokio::test]
async fn rolled_back_transaction_never_publishes_staged_jobs() {
    support::init_logging();
    let app = App::new(Broker::new(ConnectionParams::default()));
    let queue = unique("jobq-test-txn-rollback-queue");

    app.job(JobDefinitionInput::new(queue.clone()), || async move { Ok(()) })
        .await
        .unwrap();
    app.declare_amq_resources().await.unwrap();

    let transactor = app.open_transaction().await;
    app.stage(&transactor, &queue, serde_json::json!({})).await.unwrap();
    transactor.rollback().await.unwrap();

    let mut handle = app.broker().consume(&queue, Some(1)).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_millis(500), handle.recv()).await;
    assert!(outcome.is_err(), "rolled-back job should never be delivered");

    app.broker().cancel(&handle).await.unwrap();
}

#[tokio::test]
async fn staging_on_a_concluded_transactor_errors() {
    support::init_logging();
    let app = App::new(Broker::new(ConnectionParams::default()));
    let queue = unique("jobq-test-txn-concluded-queue");

    app.job(JobDefinitionInput::new(queue.clone()), || async move { Ok(()) })
        .await
        .unwrap();
    app.declare_amq_resources().await.unwrap();

    let transactor = app.open_transaction().await;
    transactor.rollback().await.unwrap();

    let err = app
        .stage(&transactor, &queue, serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        jobq::Error::Transactor(jobq::error::TransactorError::AlreadyConcluded)
    ));
}

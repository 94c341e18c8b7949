//! Exercises a job round trip through `App`: register a job and handler, declare
//! topology, start a worker, call the job, and observe the resulting `WorkerResult`.

mod support;

use std::time::Duration;

use jobq::extract::Args;
use jobq::registry::JobDefinitionInput;
use jobq::worker::{JobStatus, WorkerConfig};
use jobq::{App, Broker, ConnectionParams};
use serde::Deserialize;
use uuid::Uuid;

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

#[derive(Debug, Deserialize)]
struct Greeting {
    to: String,
}

#[tokio::test]
async fn called_job_is_dispatched_and_reports_success() {
    support::init_logging();
    let app = App::new(Broker::new(ConnectionParams::default()));
    let queue = unique("jobq-test-app-worker-queue");

    app.job(JobDefinitionInput::new(queue.clone()), |Args(greeting): Args<Greeting>| async move {
        assert_eq!(greeting.to, "world");
        Ok(())
    })
    .await
    .unwrap();

    app.declare_amq_resources().await.unwrap();

    let mut results = app
        .worker(WorkerConfig {
            queues: vec![queue.clone()],
            concurrency: 4,
            prefetch: None,
        })
        .await
        .unwrap();

    app.call(&queue, serde_json::json!({"to": "world"})).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .expect("timed out waiting for a worker result")
        .expect("worker result stream ended");

    assert_eq!(result.queue, queue);
    assert_eq!(result.status, JobStatus::Success);
    assert_eq!(result.name.as_deref(), Some(queue.as_str()));

    app.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn unregistered_job_name_is_rejected_before_publish() {
    support::init_logging();
    let app = App::new(Broker::new(ConnectionParams::default()));
    let err = app.call("no-such-job", serde_json::json!({})).await.unwrap_err();
    assert!(matches!(err, jobq::Error::UnknownJob(name) if name == "no-such-job"));
}

#[tokio::test]
async fn pause_then_resume_queue_round_trips_delivery() {
    support::init_logging();
    let app = App::new(Broker::new(ConnectionParams::default()));
    let queue = unique("jobq-test-app-pause-queue");

    app.job(JobDefinitionInput::new(queue.clone()), || async move { Ok(()) })
        .await
        .unwrap();
    app.declare_amq_resources().await.unwrap();

    let mut results = app
        .worker(WorkerConfig {
            queues: vec![queue.clone()],
            concurrency: 1,
            prefetch: None,
        })
        .await
        .unwrap();

    app.pause_queue(&queue).await.unwrap();
    app.resume_queue(&queue).await.unwrap();

    app.call(&queue, serde_json::json!({})).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .expect("timed out waiting for a worker result after resume")
        .expect("worker result stream ended");
    assert_eq!(result.status, JobStatus::Success);

    app.shutdown(Duration::from_secs(5)).await.unwrap();
}

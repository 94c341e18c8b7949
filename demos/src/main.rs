//! Minimal example wiring up a `jobq` app: one job, one worker, one enqueue.

use std::time::Duration;

use jobq::extract::Args;
use jobq::registry::JobDefinitionInput;
use jobq::worker::WorkerConfig;
use jobq::{App, Broker, ConnectionParams, HandlerOutcome};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
struct SendEmail {
    to: String,
}

async fn send_email(Args(args): Args<SendEmail>) -> HandlerOutcome {
    info!(to = %args.to, "sending email");
    Ok(())
}

#[tokio::main]
async fn main() -> jobq::Result<()> {
    tracing_subscriber::fmt::init();

    let broker = Broker::new(ConnectionParams::from_env());
    let app = App::new(broker);

    app.job(JobDefinitionInput::new("email").name("send_email"), send_email)
        .await?;
    app.declare_amq_resources().await?;

    let mut results = app
        .worker(WorkerConfig {
            queues: vec!["email".to_string()],
            concurrency: 8,
            prefetch: Some(8),
        })
        .await?;
    tokio::spawn(async move {
        while let Some(result) = results.recv().await {
            info!(?result, "job finished");
        }
    });

    app.call("send_email", serde_json::json!({"to": "a@b.com"}))
        .await?;

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    app.shutdown(Duration::from_secs(10)).await
}

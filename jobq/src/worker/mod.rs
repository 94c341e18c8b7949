//! The worker pipeline : consume → dispatch → handler → ack/nack/retry/error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::broker::{Broker, ConsumerHandle, OutboundMessage, RawDelivery};
use crate::context::JobContext;
use crate::error::{Error, HandlerOutcome, JobError};
use crate::job::JobRequest;
use crate::registry::{JobDefinition, Registry};
use crate::state::StateMap;

/// A type-erased job handler: built from a concrete `H: Handler<Args>` via [`erase`].
pub type DynHandler = Arc<dyn for<'a> Fn(&'a mut JobContext) -> BoxFuture<'a, HandlerOutcome> + Send + Sync>;

/// Erases a concrete handler's argument types so it can be stored in a
/// `HashMap<String, DynHandler>` alongside handlers of different arity.
pub fn erase<H, Args>(handler: H) -> DynHandler
where
    H: crate::handler::Handler<Args>,
    Args: Send + 'static,
{
    Arc::new(move |ctx: &mut JobContext| {
        let handler = handler.clone();
        Box::pin(async move { handler.call(ctx).await })
    })
}

/// What happened to a single delivery, per its per-message lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// The handler returned `Ok(())`.
    Success,
    /// The handler returned `Err` (including a timeout), and the job was routed for retry.
    RetriedAfterFailure,
    /// The handler returned `Err` (including a timeout) and retries were exhausted;
    /// routed to the error exchange.
    ErrorAfterFailure,
    /// The delivery body could not be decoded into a [`JobRequest`].
    DecodeError,
    /// The decoded job named a job that was never registered.
    UnknownJob,
}

/// One entry of the worker's observability stream (`WorkerResult`).
#[derive(Debug, Clone)]
pub struct WorkerResult {
    /// The job's id, if the delivery decoded far enough to have one.
    pub job_id: Option<Uuid>,
    /// The job's name, if known.
    pub name: Option<String>,
    /// The queue the delivery arrived on.
    pub queue: String,
    /// Final status of this delivery.
    pub status: JobStatus,
    /// Stringified error, if any.
    pub error: Option<String>,
}

/// Configuration for one [`Worker::run`] call (`worker({queues, concurrency, prefetch})`).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queues to consume from, one dedicated consumer each.
    pub queues: Vec<String>,
    /// Maximum number of in-flight handler dispatches across all of this worker's queues.
    pub concurrency: usize,
    /// Prefetch applied to each consumer. Defaults to the broker's configured default.
    pub prefetch: Option<u16>,
}

/// Shared, cloneable context every dispatch needs; kept small and `Clone` so each spawned
/// dispatch task can own a copy instead of borrowing across an `.await`.
#[derive(Clone)]
pub(crate) struct DispatchContext {
    broker: Broker,
    registry: Registry,
    state: Arc<StateMap>,
    handlers: Arc<HashMap<String, DynHandler>>,
}

impl DispatchContext {
    pub(crate) fn new(
        broker: Broker,
        registry: Registry,
        state: Arc<StateMap>,
        handlers: Arc<HashMap<String, DynHandler>>,
    ) -> Self {
        Self {
            broker,
            registry,
            state,
            handlers,
        }
    }
}

/// Spawns one queue's dispatch loop for an already-registered [`ConsumerHandle`].
///
/// Exposed so [`crate::app::App`] can start the same loop for a queue resumed via
/// [`crate::app::App::resume_queue`] without going through [`Worker::run`]'s own
/// `consume_over` call.
pub(crate) fn spawn_consumer_loop(
    handle: ConsumerHandle,
    ctx: DispatchContext,
    semaphore: Arc<Semaphore>,
    result_tx: mpsc::UnboundedSender<WorkerResult>,
    shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(consume_loop(handle, ctx, semaphore, result_tx, shutdown));
}

/// Runs registered job handlers against deliveries pulled from a set of queues.
pub struct Worker {
    broker: Broker,
    registry: Registry,
    state: Arc<StateMap>,
    handlers: Arc<HashMap<String, DynHandler>>,
}

impl Worker {
    /// Builds a worker bound to `broker`, dispatching into `handlers` using `registry` for
    /// retry/error topology lookups.
    pub fn new(
        broker: Broker,
        registry: Registry,
        state: Arc<StateMap>,
        handlers: Arc<HashMap<String, DynHandler>>,
    ) -> Self {
        Self {
            broker,
            registry,
            state,
            handlers,
        }
    }

    /// Starts consuming `config.queues`, spawning one dispatch loop per queue, bounded to
    /// `config.concurrency` in-flight handler calls in total.
    ///
    /// Returns a receiver of [`WorkerResult`]s for observability; dropping it does not
    /// stop the worker. The worker stops when `shutdown` fires, per phase 1
    /// ("cancel all consumers so no new deliveries arrive" happens at the broker/consumer
    /// level; this loop additionally stops pulling from its handle).
    #[instrument(skip_all, fields(queues = ?config.queues, concurrency = config.concurrency))]
    pub async fn run(
        &self,
        config: WorkerConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<mpsc::UnboundedReceiver<WorkerResult>, Error> {
        let (result_rx, _handles) = self.run_tracked(config, shutdown).await?;
        Ok(result_rx)
    }

    /// Like [`Self::run`], but also returns the [`ConsumerHandle`]s backing each queue, so
    /// a caller that needs per-queue pause/resume (see [`crate::app::App`]) can act on
    /// them directly instead of cancelling the whole worker.
    pub(crate) async fn run_tracked(
        &self,
        config: WorkerConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(mpsc::UnboundedReceiver<WorkerResult>, Vec<ConsumerHandle>), Error> {
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let handles = self.run_tracked_with_sender(config, shutdown, result_tx).await?;
        Ok((result_rx, handles))
    }

    /// Like [`Self::run_tracked`], but publishes into a caller-supplied sender instead of
    /// creating its own channel -- lets [`crate::app::App`] keep the sender half around so
    /// [`crate::app::App::resume_queue`] can feed results for a resumed queue back into
    /// the same stream the caller originally received from [`crate::app::App::worker`].
    pub(crate) async fn run_tracked_with_sender(
        &self,
        config: WorkerConfig,
        shutdown: broadcast::Receiver<()>,
        result_tx: mpsc::UnboundedSender<WorkerResult>,
    ) -> Result<Vec<ConsumerHandle>, Error> {
        let queue_refs: Vec<&str> = config.queues.iter().map(String::as_str).collect();
        let consumer_handles = self.broker.consume_over(&queue_refs, config.prefetch).await?;

        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let ctx = DispatchContext::new(
            self.broker.clone(),
            self.registry.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.handlers),
        );

        for handle in &consumer_handles {
            spawn_consumer_loop(
                handle.clone(),
                ctx.clone(),
                Arc::clone(&semaphore),
                result_tx.clone(),
                shutdown.resubscribe(),
            );
        }

        Ok(consumer_handles)
    }
}

/// One queue's dispatch loop: pulls deliveries, bounds concurrency with `semaphore`,
/// tracks in-flight dispatches with a `FuturesUnordered`, and prioritizes shutdown and
/// completed work over pulling new deliveries via a biased `tokio::select!`.
async fn consume_loop(
    handle: ConsumerHandle,
    ctx: DispatchContext,
    semaphore: Arc<Semaphore>,
    result_tx: mpsc::UnboundedSender<WorkerResult>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tasks = FuturesUnordered::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                info!(queue = handle.queue(), "worker received shutdown signal");
                break;
            }

            Some(result) = tasks.next(), if !tasks.is_empty() => {
                if let Err(e) = result {
                    error!(queue = handle.queue(), "dispatch task panicked: {e}");
                }
                continue;
            }

            permit = semaphore.clone().acquire_owned() => {
                let Ok(permit) = permit else { break };
                match handle.recv().await {
                    None => {
                        info!(queue = handle.queue(), "consumer exhausted, stopping");
                        drop(permit);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(queue = handle.queue(), error = %e, "error receiving delivery");
                        drop(permit);
                    }
                    Some(Ok(delivery)) => {
                        let ctx = ctx.clone();
                        let result_tx = result_tx.clone();
                        tasks.push(tokio::spawn(async move {
                            dispatch_one(delivery, ctx, result_tx).await;
                            drop(permit);
                        }));
                    }
                }
            }
        }
    }

    // Drain in-flight dispatches; phase 2 bounds this at the caller via the
    // shutdown timeout wrapping `Worker::run`'s returned handles, not here.
    while tasks.next().await.is_some() {}
}

/// Decodes, dispatches, and disposes of a single delivery -- the full per-message state
/// machine.
async fn dispatch_one(delivery: RawDelivery, ctx: DispatchContext, result_tx: mpsc::UnboundedSender<WorkerResult>) {
    let RawDelivery { channel, delivery, queue } = delivery;

    let job = match JobRequest::from_bytes(&delivery.data) {
        Ok(job) => job,
        Err(e) => {
            warn!(queue, error = %e, "delivery could not be decoded, nacking without requeue");
            let acker = delivery.acker.clone();
            if let Err(e) = acker
                .nack(lapin::options::BasicNackOptions {
                    multiple: false,
                    requeue: false,
                })
                .await
            {
                error!(queue, error = %e, "failed to nack undecodable delivery");
            }
            let _ = result_tx.send(WorkerResult {
                job_id: None,
                name: None,
                queue,
                status: JobStatus::DecodeError,
                error: Some(e.to_string()),
            });
            return;
        }
    };

    let Some(job_def) = ctx.registry.get(&job.name) else {
        warn!(queue, job = %job.name, "delivery named an unregistered job");
        let error_message = Error::UnknownJob(job.name.clone()).to_string();
        let mut context = JobContext::new(channel, delivery, job.clone(), queue.clone(), Arc::clone(&ctx.state));
        let _ = context.nack_no_requeue().await;
        let _ = result_tx.send(WorkerResult {
            job_id: Some(job.id),
            name: Some(job.name),
            queue,
            status: JobStatus::UnknownJob,
            error: Some(error_message),
        });
        return;
    };

    let Some(handler) = ctx.handlers.get(&job.name).cloned() else {
        warn!(queue, job = %job.name, "job registered but no handler bound to it");
        let mut context = JobContext::new(channel, delivery, job.clone(), queue.clone(), Arc::clone(&ctx.state));
        let _ = context.nack_no_requeue().await;
        let _ = result_tx.send(WorkerResult {
            job_id: Some(job.id),
            name: Some(job.name),
            queue,
            status: JobStatus::UnknownJob,
            error: Some("no handler bound for this job name".to_string()),
        });
        return;
    };

    let job_id = job.id;
    let job_name = job.name.clone();
    let attempt = job.attempt;
    let mut context = JobContext::new(channel, delivery, job.clone(), queue.clone(), Arc::clone(&ctx.state));

    let outcome = match job_def.timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), handler(&mut context)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(JobError::Timeout),
        },
        None => handler(&mut context).await,
    };

    let (status, error) = match outcome {
        Ok(()) => {
            if let Err(e) = context.ack().await {
                error!(queue, job = %job_name, error = %e, "failed to ack successful job");
            }
            (JobStatus::Success, None)
        }
        Err(job_error) => {
            let error_message = job_error.to_string();
            let status = if attempt < job_def.max_retries {
                retry_publish(&ctx, &job_def, &job, &job_error).await
            } else {
                error_publish(&ctx, &job_def, &job, &job_error).await
            };
            if let Err(e) = context.ack().await {
                error!(queue, job = %job_name, error = %e, "failed to ack failed job after retry/error routing");
            }
            (status, Some(error_message))
        }
    };

    let _ = result_tx.send(WorkerResult {
        job_id: Some(job_id),
        name: Some(job_name),
        queue,
        status,
        error,
    });
}

/// FAILURE with `attempt < max_retries`: republish with an incremented attempt to the
/// retry exchange ("Retry path").
async fn retry_publish(
    ctx: &DispatchContext,
    job_def: &Arc<JobDefinition>,
    job: &JobRequest,
    error: &JobError,
) -> JobStatus {
    let retried = job.next_attempt();
    let Ok(body) = retried.to_bytes() else {
        error!(job = %job.name, "failed to encode retry publish body");
        return JobStatus::ErrorAfterFailure;
    };

    let mut message = OutboundMessage::new(job_def.routing_key.clone(), body).exchange(job_def.retry_exchange.clone());
    if let Some(correlation_id) = &job.correlation_id {
        message = message.correlation_id(correlation_id.clone());
    }

    match ctx.broker.publish(message).await {
        Ok(_accepted) => {
            debug!(job = %job.name, attempt = retried.attempt, "published retry");
            JobStatus::RetriedAfterFailure
        }
        Err(e) => {
            error!(job = %job.name, error = %e, source = %error, "failed to publish retry");
            JobStatus::RetriedAfterFailure
        }
    }
}

/// FAILURE with retries exhausted: republish to the error exchange, carrying the final
/// error in message headers ("Error path").
async fn error_publish(
    ctx: &DispatchContext,
    job_def: &Arc<JobDefinition>,
    job: &JobRequest,
    error: &JobError,
) -> JobStatus {
    let Ok(body) = job.to_bytes() else {
        error!(job = %job.name, "failed to encode error publish body");
        return JobStatus::ErrorAfterFailure;
    };

    let mut message = OutboundMessage::new(job_def.routing_key.clone(), body)
        .exchange(job_def.error_exchange.clone())
        .header("x-jobq-error", error.to_string());
    if let Some(correlation_id) = &job.correlation_id {
        message = message.correlation_id(correlation_id.clone());
    }

    if let Err(e) = ctx.broker.publish(message).await {
        error!(job = %job.name, error = %e, "failed to publish to error exchange");
    } else {
        warn!(job = %job.name, attempts = job.attempt, %error, "job exhausted retries, routed to error exchange");
    }
    JobStatus::ErrorAfterFailure
}

//! The application builder: registers jobs and state, declares AMQ topology,
//! starts workers, and owns the pause/resume/shutdown lifecycle.
//!
//! `App` stays `Clone`/shareable after it starts consuming, rather than being consumed
//! whole by a single run call, so `pause_queue`/`resume_queue`/`shutdown` remain callable
//! for the lifetime of the process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex, OnceCell, Semaphore};
use tracing::{info, instrument, warn};

use crate::broker::{Broker, ConsumerHandle, OutboundMessage};
use crate::error::Error;
use crate::handler::Handler;
use crate::job::JobRequest;
use crate::registry::{JobDefinition, JobDefinitionInput, Registry};
use crate::state::StateMap;
use crate::transactor::Transactor;
use crate::worker::{erase, spawn_consumer_loop, DispatchContext, DynHandler, Worker, WorkerConfig, WorkerResult};

/// Bookkeeping for one queue's live consumer(s), kept so [`App::pause_queue`] and
/// [`App::resume_queue`] can act on a single queue without disturbing the rest of the
/// worker it was started with.
struct ConsumerSlot {
    handles: Vec<ConsumerHandle>,
    config: WorkerConfig,
    paused: bool,
    result_tx: mpsc::UnboundedSender<WorkerResult>,
}

struct Inner {
    broker: Broker,
    registry: Mutex<Registry>,
    state_builder: Mutex<Option<StateMap>>,
    state_frozen: OnceCell<Arc<StateMap>>,
    handlers: Mutex<HashMap<String, DynHandler>>,
    shutdown_tx: broadcast::Sender<()>,
    transactors: Mutex<Vec<Transactor>>,
    consumers: Mutex<HashMap<String, ConsumerSlot>>,
}

/// The central struct of a `jobq` application.
#[derive(Clone)]
pub struct App(Arc<Inner>);

impl App {
    /// Builds a new, empty app bound to `broker`. `broker.connect()` has not necessarily
    /// run yet; [`Self::worker`] and [`Self::declare_amq_resources`] connect lazily.
    pub fn new(broker: Broker) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self(Arc::new(Inner {
            broker,
            registry: Mutex::new(Registry::new()),
            state_builder: Mutex::new(Some(StateMap::new())),
            state_frozen: OnceCell::new(),
            handlers: Mutex::new(HashMap::new()),
            shutdown_tx,
            transactors: Mutex::new(Vec::new()),
            consumers: Mutex::new(HashMap::new()),
        }))
    }

    /// The broker this app runs over. Handed to [`Transactor::commit`]/[`Transactor::rollback`]
    /// directly.
    pub fn broker(&self) -> &Broker {
        &self.0.broker
    }

    /// Registers a job definition and binds `handler` to it.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateJob`] if a job with the same name was already registered.
    #[instrument(skip(self, handler))]
    pub async fn job<H, Args>(&self, input: JobDefinitionInput, handler: H) -> Result<Arc<JobDefinition>, Error>
    where
        H: Handler<Args>,
        Args: Send + 'static,
    {
        let def = self.0.registry.lock().await.register_job(input)?;
        self.0.handlers.lock().await.insert(def.name.clone(), erase(handler));
        info!(job = %def.name, queue = %def.queue, "job registered");
        Ok(def)
    }

    /// Registers a value of type `T` as app state, available to handlers via
    /// [`crate::extract::State`]. Replaces any previous value of the same type.
    ///
    /// Has no effect (and logs a warning) if called after the first [`Self::worker`] call,
    /// since state is frozen into an `Arc` the first time a worker starts.
    pub async fn state<T: Send + Sync + 'static>(&self, value: T) {
        let mut builder = self.0.state_builder.lock().await;
        match builder.as_mut() {
            Some(state) => state.insert(value),
            None => warn!(
                "state of type {} registered after workers started; ignored",
                std::any::type_name::<T>()
            ),
        }
    }

    async fn state_snapshot(&self) -> Arc<StateMap> {
        if let Some(state) = self.0.state_frozen.get() {
            return Arc::clone(state);
        }
        let mut builder = self.0.state_builder.lock().await;
        let state = Arc::new(builder.take().unwrap_or_default());
        let _ = self.0.state_frozen.set(Arc::clone(&state));
        state
    }

    /// Declares every queue, exchange and binding derived from the registered jobs
    /// Connects the broker first if it hasn't already.
    pub async fn declare_amq_resources(&self) -> Result<(), Error> {
        if !self.0.broker.is_connected() {
            self.0.broker.connect().await?;
        }
        let registry = self.0.registry.lock().await.clone();
        self.0.broker.declare_queues(&registry.queues()).await?;
        self.0.broker.declare_exchanges(&registry.exchanges()).await?;
        self.0.broker.declare_bindings(&registry.bindings()).await?;
        Ok(())
    }

    async fn job_def(&self, name: &str) -> Result<Arc<JobDefinition>, Error> {
        self.0
            .registry
            .lock()
            .await
            .get(name)
            .ok_or_else(|| Error::UnknownJob(name.to_string()))
    }

    fn message_for(job_def: &JobDefinition, body: Vec<u8>) -> OutboundMessage {
        let mut message = OutboundMessage::new(job_def.routing_key.clone(), body);
        if let Some(exchange) = &job_def.exchange {
            message = message.exchange(exchange.clone());
        }
        if let Some(reply_to) = &job_def.reply_to {
            message = message.reply_to(reply_to.clone());
        }
        message
    }

    /// Looks up the registered job named `name` and publishes it immediately
    /// (`call(name, args)`).
    pub async fn call(&self, name: &str, args: Value) -> Result<bool, Error> {
        let job_def = self.job_def(name).await?;
        let job = JobRequest::new(name, args);
        let message = Self::message_for(&job_def, job.to_bytes()?);
        self.0.broker.publish(message).await
    }

    /// Like [`Self::call`], but publishes to the job's delayed queue
    /// ([`JobDefinition::delayed_queue`]) with an expiration of `delay`, relying on the
    /// delayed-enqueue topology documented there.
    pub async fn call_delayed(&self, name: &str, args: Value, delay: Duration) -> Result<bool, Error> {
        let job_def = self.job_def(name).await?;
        let job = JobRequest::new(name, args);
        let message = OutboundMessage::new(job_def.delayed_queue(), job.to_bytes()?).expiration(delay);
        self.0.broker.publish(message).await
    }

    /// Opens a new [`Transactor`], tracked by this app so [`Self::shutdown`] waits for it
    /// to conclude ("the app maintains the set of open transactors").
    pub async fn open_transaction(&self) -> Transactor {
        let transactor = Transactor::new();
        self.0.transactors.lock().await.push(transactor.clone());
        transactor
    }

    /// Stages a call to job `name` on `transactor` instead of publishing it immediately.
    pub async fn stage(&self, transactor: &Transactor, name: &str, args: Value) -> Result<(), Error> {
        let job_def = self.job_def(name).await?;
        let job = JobRequest::new(name, args);
        let message = Self::message_for(&job_def, job.to_bytes()?);
        transactor.enqueue(message, job).await
    }

    /// Starts consuming `config.queues`, connecting and declaring resources first if
    /// needed. Returns a stream of [`WorkerResult`]s for observability.
    #[instrument(skip(self, config), fields(queues = ?config.queues))]
    pub async fn worker(&self, config: WorkerConfig) -> Result<mpsc::UnboundedReceiver<WorkerResult>, Error> {
        if !self.0.broker.is_connected() {
            self.0.broker.connect().await?;
        }

        let registry = self.0.registry.lock().await.clone();
        let handlers = Arc::new(self.0.handlers.lock().await.clone());
        let state = self.state_snapshot().await;
        let worker = Worker::new(self.0.broker.clone(), registry, state, handlers);

        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let shutdown_rx = self.0.shutdown_tx.subscribe();
        let handles = worker
            .run_tracked_with_sender(config.clone(), shutdown_rx, result_tx.clone())
            .await?;

        let mut consumers = self.0.consumers.lock().await;
        for (queue, handle) in config.queues.iter().cloned().zip(handles.into_iter()) {
            consumers.insert(
                queue,
                ConsumerSlot {
                    handles: vec![handle],
                    config: config.clone(),
                    paused: false,
                    result_tx: result_tx.clone(),
                },
            );
        }

        Ok(result_rx)
    }

    /// Cancels every active consumer on `queue`, stopping new deliveries from arriving
    /// without affecting any other queue the same worker was consuming.
    pub async fn pause_queue(&self, queue: &str) -> Result<(), Error> {
        let mut consumers = self.0.consumers.lock().await;
        let slot = consumers
            .get_mut(queue)
            .ok_or_else(|| Error::UnknownQueue(queue.to_string()))?;
        if slot.paused {
            return Ok(());
        }
        for handle in slot.handles.drain(..) {
            if let Err(e) = self.0.broker.cancel(&handle).await {
                warn!(queue, error = %e, "failed to cancel consumer while pausing queue");
            }
        }
        slot.paused = true;
        info!(queue, "queue paused");
        Ok(())
    }

    /// Re-registers a consumer on `queue` using the prefetch/concurrency it was originally
    /// started with, resuming delivery.
    pub async fn resume_queue(&self, queue: &str) -> Result<(), Error> {
        let (config, result_tx) = {
            let consumers = self.0.consumers.lock().await;
            let slot = consumers
                .get(queue)
                .ok_or_else(|| Error::UnknownQueue(queue.to_string()))?;
            if !slot.paused {
                return Ok(());
            }
            (slot.config.clone(), slot.result_tx.clone())
        };

        let mut new_handles = self.0.broker.consume_over(&[queue], config.prefetch).await?;
        let handle = new_handles.remove(0);

        let registry = self.0.registry.lock().await.clone();
        let handlers = Arc::new(self.0.handlers.lock().await.clone());
        let state = self.state_snapshot().await;
        let ctx = DispatchContext::new(self.0.broker.clone(), registry, state, handlers);
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let shutdown_rx = self.0.shutdown_tx.subscribe();
        spawn_consumer_loop(handle.clone(), ctx, semaphore, result_tx.clone(), shutdown_rx);

        let mut consumers = self.0.consumers.lock().await;
        if let Some(slot) = consumers.get_mut(queue) {
            slot.handles = vec![handle];
            slot.paused = false;
        }
        info!(queue, "queue resumed");
        Ok(())
    }

    /// Shuts down in three phases: stop pulling new deliveries, wait up to `timeout` for
    /// open transactors to conclude, then close the pool and connection.
    /// Individual transactor timeouts are logged; shutdown still completes.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), Error> {
        let _ = self.0.shutdown_tx.send(());

        let transactors = self.0.transactors.lock().await.clone();
        let waits = transactors.iter().map(|t| async move {
            if let Err(e) = t.wait_until(timeout).await {
                warn!("transactor did not conclude before shutdown timeout: {e}");
            }
        });
        join_all(waits).await;

        self.0.broker.shutdown(timeout).await
    }
}

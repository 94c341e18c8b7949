//! The broker façade : owns the connection, declares topology, publishes
//! with a soft flow-control signal, and owns the consumer registry's rewire-on-loss
//! protocol.

pub mod consumer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Connection, ConnectionProperties};
use tokio::sync::{mpsc, Mutex, OnceCell, RwLock};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::ConnectionParams;
use crate::error::Error;
use crate::pool::ChannelPool;
use crate::registry::{BindingDef, ExchangeDef, QueueDef};

pub use consumer::{ConsumerHandle, RawDelivery};
use consumer::{deactivate, ConsumerHandleInner, ConsumerRegistry};

/// A message ready to be published (`publish(msg)`).
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Exchange to publish to; empty string means the default exchange.
    pub exchange: String,
    /// Routing key.
    pub routing_key: String,
    /// Message body (already-encoded bytes, e.g. a [`crate::job::JobRequest`]).
    pub body: Vec<u8>,
    /// `BasicProperties.correlation_id`.
    pub correlation_id: Option<String>,
    /// `BasicProperties.reply_to`.
    pub reply_to: Option<String>,
    /// `BasicProperties.expiration`, as a decimal string of milliseconds.
    pub expiration: Option<String>,
    /// Extra headers, e.g. the final handler error carried on an error-exchange publish
    /// ("Handler failure").
    pub headers: Vec<(String, String)>,
}

impl OutboundMessage {
    /// Builds a message to the default exchange under `routing_key`.
    pub fn new(routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            exchange: String::new(),
            routing_key: routing_key.into(),
            body,
            correlation_id: None,
            reply_to: None,
            expiration: None,
            headers: Vec::new(),
        }
    }

    /// Publishes to `exchange` instead of the default exchange.
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Sets `correlation_id`.
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets `reply_to`.
    pub fn reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Sets `expiration` from a duration, encoded as a decimal-millisecond string.
    pub fn expiration(mut self, expiration: std::time::Duration) -> Self {
        self.expiration = Some(expiration.as_millis().to_string());
        self
    }

    /// Adds a header, e.g. a terminal handler error for an error-exchange publish.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    fn properties(&self) -> BasicProperties {
        let mut props = BasicProperties::default();
        if let Some(id) = &self.correlation_id {
            props = props.with_correlation_id(ShortString::from(id.as_str()));
        }
        if let Some(reply_to) = &self.reply_to {
            props = props.with_reply_to(ShortString::from(reply_to.as_str()));
        }
        if let Some(expiration) = &self.expiration {
            props = props.with_expiration(ShortString::from(expiration.as_str()));
        }
        if !self.headers.is_empty() {
            let mut table = FieldTable::default();
            for (key, value) in &self.headers {
                table.insert(
                    key.as_str().into(),
                    lapin::types::AMQPValue::LongString(value.as_str().into()),
                );
            }
            props = props.with_headers(table);
        }
        props
    }
}

/// `lapin` doesn't expose a socket-write-buffer boolean from a publish call; this is a
/// soft in-flight-publish watermark used as a stand-in flow-control signal.
const HIGH_WATERMARK: usize = 2000;

/// Pure decision function extracted so the watermark behavior is unit-testable without
/// a live broker.
fn accept_decision(inflight_before: usize, watermark: usize) -> bool {
    inflight_before < watermark
}

struct Inner {
    params: ConnectionParams,
    connection: RwLock<Option<Connection>>,
    pool: OnceCell<ChannelPool>,
    registry: Mutex<ConsumerRegistry>,
    connect_state: Mutex<Option<Shared<BoxFuture<'static, Result<(), String>>>>>,
    inflight_publishes: AtomicUsize,
    died_tx: mpsc::UnboundedSender<u16>,
    died_rx: Mutex<Option<mpsc::UnboundedReceiver<u16>>>,
}

/// The broker façade. Cheaply `Clone`able; every clone shares the same connection, pool
/// and consumer registry.
#[derive(Clone)]
pub struct Broker(Arc<Inner>);

impl Broker {
    /// Builds a broker that has not yet connected.
    pub fn new(params: ConnectionParams) -> Self {
        let (died_tx, died_rx) = mpsc::unbounded_channel();
        Self(Arc::new(Inner {
            params,
            connection: RwLock::new(None),
            pool: OnceCell::new(),
            registry: Mutex::new(ConsumerRegistry::new()),
            connect_state: Mutex::new(None),
            inflight_publishes: AtomicUsize::new(0),
            died_tx,
            died_rx: Mutex::new(Some(died_rx)),
        }))
    }

    /// The connection parameters this broker was built with.
    pub fn params(&self) -> &ConnectionParams {
        &self.0.params
    }

    /// Whether `connect()` has completed and the pool is open.
    pub fn is_connected(&self) -> bool {
        self.0.pool.get().map(ChannelPool::is_open).unwrap_or(false)
    }

    /// Dials the broker, retrying up to `max_retries + 1` total attempts with
    /// `retry_delay` between them. Concurrent callers join the same
    /// in-flight attempt instead of dialing twice (idempotent join).
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), Error> {
        let shared = {
            let mut guard = self.0.connect_state.lock().await;
            match guard.as_ref() {
                Some(shared) => shared.clone(),
                None => {
                    let inner = Arc::clone(&self.0);
                    let fut: BoxFuture<'static, Result<(), String>> = async move {
                        Inner::dial_with_retry(inner).await.map_err(|e| e.to_string())
                    }
                    .boxed();
                    let shared = fut.shared();
                    *guard = Some(shared.clone());
                    shared
                }
            }
        };

        let result = shared.await;
        if let Err(message) = result {
            // Clear the slot so a later caller retries instead of replaying this
            // failure forever.
            *self.0.connect_state.lock().await = None;
            return Err(Error::Join(message));
        }
        Ok(())
    }

    fn pool(&self) -> Result<&ChannelPool, Error> {
        self.0.pool.get().ok_or(Error::NotConnected)
    }

    async fn connection(&self) -> Result<Connection, Error> {
        self.0
            .connection
            .read()
            .await
            .clone()
            .ok_or(Error::NotConnected)
    }

    /// Idempotently asserts every queue in `queues` (`queues(list)`).
    pub async fn declare_queues(&self, queues: &[QueueDef]) -> Result<(), Error> {
        let connection = self.connection().await?;
        let pool = self.pool()?;
        for queue in queues {
            pool.acquire_and_run(
                |channel| async move {
                    let options = QueueDeclareOptions {
                        durable: queue.durable,
                        auto_delete: queue.auto_delete,
                        exclusive: queue.exclusive,
                        ..QueueDeclareOptions::default()
                    };
                    channel
                        .queue_declare(&queue.name, options, FieldTable::default())
                        .await?;
                    Ok(())
                },
                &connection,
            )
            .await?;
        }
        Ok(())
    }

    /// Idempotently asserts every exchange in `exchanges` (`exchanges(list)`).
    pub async fn declare_exchanges(&self, exchanges: &[ExchangeDef]) -> Result<(), Error> {
        let connection = self.connection().await?;
        let pool = self.pool()?;
        for exchange in exchanges {
            pool.acquire_and_run(
                |channel| async move {
                    let kind = exchange_kind(&exchange.kind);
                    let options = ExchangeDeclareOptions {
                        durable: exchange.durable,
                        ..ExchangeDeclareOptions::default()
                    };
                    channel
                        .exchange_declare(&exchange.name, kind, options, FieldTable::default())
                        .await?;
                    Ok(())
                },
                &connection,
            )
            .await?;
        }
        Ok(())
    }

    /// Idempotently asserts every binding in `bindings` (`bindings(list)`).
    pub async fn declare_bindings(&self, bindings: &[BindingDef]) -> Result<(), Error> {
        let connection = self.connection().await?;
        let pool = self.pool()?;
        for binding in bindings {
            pool.acquire_and_run(
                |channel| async move {
                    channel
                        .queue_bind(
                            &binding.queue,
                            &binding.exchange,
                            &binding.routing_key,
                            QueueBindOptions::default(),
                            FieldTable::default(),
                        )
                        .await?;
                    Ok(())
                },
                &connection,
            )
            .await?;
        }
        Ok(())
    }

    /// Publishes `message`, returning whether the publish was accepted without signaling
    /// back-pressure. The message is queued either way.
    pub async fn publish(&self, message: OutboundMessage) -> Result<bool, Error> {
        let connection = self.connection().await?;
        let pool = self.pool()?;

        let inflight_before = self.0.inflight_publishes.fetch_add(1, Ordering::AcqRel);
        let accepted = accept_decision(inflight_before, HIGH_WATERMARK);

        let result = pool
            .acquire_and_run(
                |channel| {
                    let message = message.clone();
                    async move {
                        channel
                            .basic_publish(
                                &message.exchange,
                                &message.routing_key,
                                BasicPublishOptions::default(),
                                &message.body,
                                message.properties(),
                            )
                            .await?;
                        Ok(())
                    }
                },
                &connection,
            )
            .await;

        // The watermark settles shortly after the frame is actually written; spawn the
        // decrement so bursts build up the heuristic pressure they are meant to model
        // instead of draining instantly and never tripping.
        let inner = Arc::clone(&self.0);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            inner.inflight_publishes.fetch_sub(1, Ordering::AcqRel);
        });

        result?;
        Ok(accepted)
    }

    /// Registers one consumer on `queue` with the given `prefetch` (or the broker's
    /// default), on a freshly-opened dedicated channel (`consume`).
    pub async fn consume(&self, queue: &str, prefetch: Option<u16>) -> Result<ConsumerHandle, Error> {
        let mut handles = self.consume_over(&[queue], prefetch).await?;
        Ok(handles.remove(0))
    }

    /// Registers one consumer per entry of `queues`, distributed across dedicated
    /// channels (`consumeOver`). Consumers for the same queue are
    /// co-located on one channel so their prefetches sum, mirroring a worker whose
    /// `concurrency` calls for several parallel consumers per queue.
    #[instrument(skip(self))]
    pub async fn consume_over(
        &self,
        queues: &[&str],
        prefetch: Option<u16>,
    ) -> Result<Vec<ConsumerHandle>, Error> {
        let connection = self.connection().await?;
        let prefetch = prefetch.unwrap_or(self.0.params.default_prefetch);

        // Group requested consumers by queue name so duplicates share one channel: its
        // prefetch is the sum of the group's, matching `rewire`'s summed-prefetch
        // reapplication.
        let mut order: Vec<&str> = Vec::new();
        let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, &queue) in queues.iter().enumerate() {
            let indices = groups.entry(queue).or_insert_with(|| {
                order.push(queue);
                Vec::new()
            });
            indices.push(index);
        }

        let mut handles: Vec<Option<ConsumerHandle>> = (0..queues.len()).map(|_| None).collect();
        for queue in order {
            let indices = &groups[queue];
            let channel = connection.create_channel().await?;
            install_channel_error_hook(&channel, self.0.died_tx.clone());

            let total_prefetch = prefetch.saturating_mul(
                u16::try_from(indices.len()).unwrap_or(u16::MAX),
            );
            channel
                .basic_qos(total_prefetch, BasicQosOptions::default())
                .await?;

            for &index in indices {
                let tag = format!("jobq-{}", Uuid::new_v4());
                let consumer = channel
                    .basic_consume(
                        queue,
                        &tag,
                        BasicConsumeOptions::default(),
                        FieldTable::default(),
                    )
                    .await?;

                let (resume_tx, _resume_rx) = tokio::sync::watch::channel(0u64);
                let inner = Arc::new(ConsumerHandleInner {
                    queue: queue.to_string(),
                    prefetch,
                    channel: Mutex::new(channel.clone()),
                    consumer: Mutex::new(consumer),
                    consumer_tag: Mutex::new(tag),
                    active: std::sync::atomic::AtomicBool::new(true),
                    resume_tx,
                });

                self.0
                    .registry
                    .lock()
                    .await
                    .insert(channel.id(), Arc::clone(&inner));

                info!(queue, prefetch, channel = channel.id(), "consumer registered");
                handles[index] = Some(ConsumerHandle(inner));
            }
        }
        Ok(handles.into_iter().map(|h| h.expect("every index was filled")).collect())
    }

    /// Cancels `handle`: sends basic.cancel, marks it inactive, removes it from the
    /// registry, and ends its downstream stream (`handle.cancel()`).
    pub async fn cancel(&self, handle: &ConsumerHandle) -> Result<(), Error> {
        deactivate(&handle.0);
        let channel = handle.channel().await;
        let tag = handle.consumer_tag().await;
        channel
            .basic_cancel(&tag, BasicCancelOptions::default())
            .await?;

        let now_empty = self.0.registry.lock().await.remove(channel.id(), &handle.0);
        if now_empty {
            let _ = channel.close(0, "last consumer on channel cancelled").await;
        }
        Ok(())
    }

    /// Closes consumers, then the pool, then the connection, each phase bounded by
    /// `timeout` (`shutdown(timeoutMs)`).
    ///
    /// Fails with [`Error::NotConnected`] if called before `connect()` completed, and
    /// with [`Error::PoolNotInitialized`] if `connect()` never got as far as opening the
    /// pool.
    pub async fn shutdown(&self, timeout: std::time::Duration) -> Result<(), Error> {
        if self.0.connection.read().await.is_none() {
            return Err(Error::NotConnected);
        }
        let Some(pool) = self.0.pool.get() else {
            return Err(Error::PoolNotInitialized);
        };

        let cancel_all = async {
            let handles = self.0.registry.lock().await.snapshot();
            for handle in handles {
                let _: Result<(), Error> = self.cancel(&ConsumerHandle(handle)).await;
            }
        };
        let _ = tokio::time::timeout(timeout, cancel_all).await;

        pool.close().await;

        if let Some(connection) = self.0.connection.write().await.take() {
            let _ = connection.close(0, "shutdown").await;
        }
        Ok(())
    }
}

impl Inner {
    #[instrument(skip(inner))]
    async fn dial_with_retry(inner: Arc<Inner>) -> Result<(), Error> {
        let uri = inner.params.uri();
        let total_attempts = inner.params.max_retries + 1;
        let mut last_error = None;

        for attempt in 1..=total_attempts {
            debug!(attempt, total_attempts, "dialing AMQP broker");
            match Connection::connect(&uri, ConnectionProperties::default()).await {
                Ok(connection) => {
                    info!(attempt, "connected to AMQP broker");
                    let pool = ChannelPool::open(&connection, inner.params.pool_size).await?;
                    let _ = inner.pool.set(pool);
                    *inner.connection.write().await = Some(connection);

                    if let Some(died_rx) = inner.died_rx.lock().await.take() {
                        let rewire_inner = Arc::clone(&inner);
                        tokio::spawn(rewire_loop(rewire_inner, died_rx));
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, total_attempts, error = %e, "dial attempt failed");
                    last_error = Some(e.to_string());
                    if attempt < total_attempts {
                        tokio::time::sleep(inner.params.retry_delay).await;
                    }
                }
            }
        }

        Err(Error::ConnectFailed {
            attempts: total_attempts,
            message: last_error.unwrap_or_default(),
        })
    }

    /// Rewires every active handle attached to `channel_id` onto a fresh channel
    /// ("Rewire on channel loss", 5 steps).
    #[instrument(skip(self))]
    async fn rewire(&self, channel_id: u16) {
        let handles = self.registry.lock().await.take(channel_id);
        let active: Vec<_> = handles
            .into_iter()
            .filter(|h| h.active.load(Ordering::Acquire))
            .collect();

        if active.is_empty() {
            debug!(channel_id, "channel died with no active handles; not rewiring");
            return;
        }

        let Some(connection) = self.connection.read().await.clone() else {
            warn!(channel_id, "channel died with no live connection; dropping handles");
            return;
        };

        let new_channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(error) => {
                error!(channel_id, %error, "failed to open replacement channel during rewire");
                // Put the handles back under their old id; a later died_tx signal (or
                // shutdown) will try again rather than leaking them silently.
                let mut registry = self.registry.lock().await;
                for handle in active {
                    registry.insert(channel_id, handle);
                }
                return;
            }
        };
        install_channel_error_hook(&new_channel, self.died_tx.clone());

        let total_prefetch: u16 = active.iter().map(|h| h.prefetch).sum();
        if let Err(error) = new_channel
            .basic_qos(total_prefetch, BasicQosOptions::default())
            .await
        {
            error!(%error, "failed to reapply summed prefetch during rewire");
        }

        let new_channel_id = new_channel.id();
        let mut rewired = Vec::with_capacity(active.len());
        for handle in active {
            let tag = format!("jobq-{}", Uuid::new_v4());
            match new_channel
                .basic_consume(
                    &handle.queue,
                    &tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
            {
                Ok(consumer) => {
                    *handle.channel.lock().await = new_channel.clone();
                    *handle.consumer.lock().await = consumer;
                    *handle.consumer_tag.lock().await = tag;
                    let next = handle.resume_tx.borrow().wrapping_add(1);
                    let _ = handle.resume_tx.send(next);
                    info!(queue = %handle.queue, new_channel_id, "consumer rewired");
                    rewired.push(handle);
                }
                Err(error) => {
                    error!(queue = %handle.queue, %error, "failed to re-consume during rewire; dropping handle");
                    deactivate(&handle);
                }
            }
        }

        let mut registry = self.registry.lock().await;
        for handle in rewired {
            registry.insert(new_channel_id, handle);
        }
    }
}

async fn rewire_loop(inner: Arc<Inner>, mut died_rx: mpsc::UnboundedReceiver<u16>) {
    while let Some(channel_id) = died_rx.recv().await {
        inner.rewire(channel_id).await;
    }
}

fn exchange_kind(kind: &str) -> lapin::ExchangeKind {
    match kind {
        "direct" => lapin::ExchangeKind::Direct,
        "fanout" => lapin::ExchangeKind::Fanout,
        "topic" => lapin::ExchangeKind::Topic,
        "headers" => lapin::ExchangeKind::Headers,
        other => lapin::ExchangeKind::Custom(other.to_string()),
    }
}

fn install_channel_error_hook(channel: &lapin::Channel, died_tx: mpsc::UnboundedSender<u16>) {
    let channel_id = channel.id();
    channel.on_error(move |error| {
        warn!(channel_id, %error, "channel reported an error");
        let _ = died_tx.send(channel_id);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_decision_holds_below_watermark() {
        assert!(accept_decision(0, HIGH_WATERMARK));
        assert!(accept_decision(HIGH_WATERMARK - 1, HIGH_WATERMARK));
    }

    #[test]
    fn accept_decision_trips_at_watermark() {
        assert!(!accept_decision(HIGH_WATERMARK, HIGH_WATERMARK));
        assert!(!accept_decision(HIGH_WATERMARK + 1, HIGH_WATERMARK));
    }

    #[test]
    fn outbound_message_defaults_to_default_exchange() {
        let message = OutboundMessage::new("q1", b"{}".to_vec());
        assert_eq!(message.exchange, "");
        assert_eq!(message.routing_key, "q1");
    }
}

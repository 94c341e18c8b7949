//! Consumer handles and the rewire-on-channel-loss protocol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lapin::message::Delivery as LapinDelivery;
use lapin::Channel;
use lapin::Consumer as LapinConsumer;
use tokio::sync::{watch, Mutex};
use tracing::warn;

/// A single message delivered by a [`ConsumerHandle`], carrying the channel it must be
/// ack'ed/nack'ed on alongside the raw lapin delivery (`Delivery`).
pub struct RawDelivery {
    /// The channel the message was received on (the channel identity required for acking).
    pub channel: Channel,
    /// The raw lapin delivery.
    pub delivery: LapinDelivery,
    /// The queue this handle consumes from.
    pub queue: String,
}

/// Inner, shared state of a [`ConsumerHandle`].
///
/// Held by both the registry (keyed by channel id) and the handle itself -- a relation
/// stored by the registry rather than an owning pointer in either direction, so a
/// channel's death can rewire every handle attached to it.
pub(crate) struct ConsumerHandleInner {
    pub(crate) queue: String,
    pub(crate) prefetch: u16,
    pub(crate) channel: Mutex<Channel>,
    pub(crate) consumer: Mutex<LapinConsumer>,
    pub(crate) consumer_tag: Mutex<String>,
    pub(crate) active: AtomicBool,
    pub(crate) resume_tx: watch::Sender<u64>,
}

/// A handle to one registered consumer.
///
/// Survives channel death transparently: the worker pipeline keeps calling
/// [`ConsumerHandle::recv`] and reading [`ConsumerHandle::channel`] across a rewire
/// without needing to know it happened, while [`ConsumerHandle::resume`] lets interested
/// observers (tests, metrics) notice that it did.
#[derive(Clone)]
pub struct ConsumerHandle(pub(crate) Arc<ConsumerHandleInner>);

impl ConsumerHandle {
    /// The queue this handle consumes from.
    pub fn queue(&self) -> &str {
        &self.0.queue
    }

    /// The prefetch this handle requested.
    pub fn prefetch(&self) -> u16 {
        self.0.prefetch
    }

    /// Whether this handle is still active (not yet cancelled).
    pub fn is_active(&self) -> bool {
        self.0.active.load(Ordering::Acquire)
    }

    /// The current consumer tag (changes across a rewire).
    pub async fn consumer_tag(&self) -> String {
        self.0.consumer_tag.lock().await.clone()
    }

    /// The channel currently backing this handle. Always the live channel, even
    /// immediately after a rewire ("ack channel identity").
    pub async fn channel(&self) -> Channel {
        self.0.channel.lock().await.clone()
    }

    /// A receiver that changes every time this handle is rewired onto a fresh channel.
    /// The carried value is a monotonic rewire counter, not meaningful beyond ordering.
    pub fn resume(&self) -> watch::Receiver<u64> {
        self.0.resume_tx.subscribe()
    }

    /// Awaits the next delivery for this handle, transparently following a rewire onto a
    /// new consumer if one occurs mid-wait. Returns `None` once the consumer is
    /// exhausted (cancelled).
    pub async fn recv(&self) -> Option<Result<RawDelivery, lapin::Error>> {
        use futures::StreamExt;

        loop {
            let mut resume = self.resume();
            let mut consumer = self.0.consumer.lock().await;
            tokio::select! {
                biased;
                changed = resume.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                    // The handle was rewired while we were about to poll; loop to pick
                    // up the new consumer instead of a delivery from the dead one.
                    drop(consumer);
                    continue;
                }
                delivery = consumer.next() => {
                    return match delivery {
                        None => None,
                        Some(Err(e)) => Some(Err(e)),
                        Some(Ok(delivery)) => {
                            let channel = self.channel().await;
                            Some(Ok(RawDelivery {
                                channel,
                                delivery,
                                queue: self.0.queue.clone(),
                            }))
                        }
                    };
                }
            }
        }
    }
}

/// The consumer registry: `channel id -> active handles on that channel`.
///
/// Mutated only by the [`super::Broker`] (consume, cancel, rewire) under a single lock;
/// everything else only ever reads a snapshot.
#[derive(Default)]
pub(crate) struct ConsumerRegistry {
    by_channel: HashMap<u16, Vec<Arc<ConsumerHandleInner>>>,
}

impl ConsumerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` under `channel_id`.
    pub(crate) fn insert(&mut self, channel_id: u16, handle: Arc<ConsumerHandleInner>) {
        self.by_channel.entry(channel_id).or_default().push(handle);
    }

    /// Removes `handle` from `channel_id`'s entry, dropping the entry if it becomes empty.
    /// Returns true if the removed handle was the last one on that channel.
    pub(crate) fn remove(&mut self, channel_id: u16, handle: &Arc<ConsumerHandleInner>) -> bool {
        let Some(handles) = self.by_channel.get_mut(&channel_id) else {
            return false;
        };
        handles.retain(|h| !Arc::ptr_eq(h, handle));
        let now_empty = handles.is_empty();
        if now_empty {
            self.by_channel.remove(&channel_id);
        }
        now_empty
    }

    /// Takes every handle registered under `channel_id`, removing the entry entirely.
    /// Used at the start of a rewire: the dead channel's entry is fully consumed.
    pub(crate) fn take(&mut self, channel_id: u16) -> Vec<Arc<ConsumerHandleInner>> {
        self.by_channel.remove(&channel_id).unwrap_or_default()
    }

    /// Number of channels currently hosting at least one active handle.
    #[cfg(test)]
    pub(crate) fn channel_count(&self) -> usize {
        self.by_channel.len()
    }

    /// A snapshot of every handle currently registered, across all channels. Used by
    /// shutdown to cancel every outstanding consumer.
    pub(crate) fn snapshot(&self) -> Vec<Arc<ConsumerHandleInner>> {
        self.by_channel.values().flatten().cloned().collect()
    }
}

/// Marks a handle inactive without touching the registry; used both by `cancel` and as
/// a defensive no-op guard during rewire for handles that raced a concurrent cancel.
pub(crate) fn deactivate(handle: &Arc<ConsumerHandleInner>) {
    if handle.active.swap(false, Ordering::AcqRel) {
        warn!("deactivated consumer handle on queue {:?}", handle.queue);
    }
}

// `ConsumerHandleInner` embeds a real lapin `Channel`/`Consumer`, which can only be
// constructed against a live connection, so `ConsumerRegistry`'s bookkeeping is covered
// by the broker integration tests (`tests/rewire.rs`) rather than here.

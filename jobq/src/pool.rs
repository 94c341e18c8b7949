//! The channel pool : a bounded collection of channels multiplexed over a
//! single AMQP connection, handed out one at a time in FIFO order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use lapin::{Channel, Connection};
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{debug, trace, warn};

use crate::error::Error;

/// A single slot in the pool. Replaced in place when its channel is marked BROKEN.
struct Slot {
    channel: Mutex<Channel>,
}

/// Returns a slot's index to the free list when dropped, unless its `index` field was
/// already cleared. Covers the case where `f` panics mid-poll: without this, the index
/// popped in [`ChannelPool::acquire_and_run`] would never be pushed back, permanently
/// desyncing the free list from the semaphore's permit count.
struct SlotGuard<'a> {
    pool: &'a ChannelPool,
    index: Option<usize>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Some(index) = self.index.take() {
            warn!("pool slot {index} released by unwind guard without replacement");
            self.pool.free.lock().unwrap().push_back(index);
        }
    }
}

/// A bounded pool of `pool_size` AMQP channels over one connection.
///
/// Every channel is in exactly one of the states FREE, ACQUIRED or BROKEN.
/// `FREE` slot indices live in `free`; a slot not present there is implicitly ACQUIRED
/// (lent out) or, transiently, being replaced after having been marked BROKEN.
pub struct ChannelPool {
    slots: Vec<Arc<Slot>>,
    /// Plain blocking mutex: only ever held across a push/pop, never across an `.await`,
    /// so it can also be locked from [`SlotGuard`]'s synchronous `Drop`.
    free: StdMutex<VecDeque<usize>>,
    /// Bounds concurrent acquisitions to `slots.len()` and provides FIFO fairness:
    /// tokio's semaphore wakes waiters in acquisition order.
    permits: Semaphore,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl ChannelPool {
    /// Opens `pool_size` channels on `connection` and returns the pool holding them.
    ///
    /// After this call, `is_open()` is true and `num_free_channels() == pool_size`.
    pub async fn open(connection: &Connection, pool_size: usize) -> Result<Self, Error> {
        let mut slots = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            trace!("opening pool channel {i}/{pool_size}");
            let channel = connection.create_channel().await?;
            slots.push(Arc::new(Slot {
                channel: Mutex::new(channel),
            }));
        }
        let free = (0..pool_size).collect();
        debug!("channel pool opened with {pool_size} channels");
        Ok(Self {
            slots,
            free: StdMutex::new(free),
            permits: Semaphore::new(pool_size),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        })
    }

    /// Total number of channels managed by the pool.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Number of channels currently FREE (not lent out).
    pub async fn num_free_channels(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Whether the pool is open (not yet closed).
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Acquires a FREE channel, runs `f` with it, and releases the channel on every exit
    /// path of `f` -- success, error, or panic unwinding through the acquire guard.
    ///
    /// Concurrent callers beyond `pool_size` wait in FIFO order.
    /// If `f` returns an error, the channel is marked BROKEN and replaced with a fresh
    /// one before the slot is returned to the free list. If the replacement itself fails,
    /// the slot is permanently dropped from the free list and the pool's permit count is
    /// reduced by one to match, rather than handing the still-broken channel to the next
    /// acquirer.
    pub async fn acquire_and_run<F, Fut, T>(&self, f: F, connection: &Connection) -> Result<T, Error>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        let _permit = tokio::select! {
            biased;
            () = self.closed_notify.notified() => return Err(Error::PoolClosed),
            permit = self.permits.acquire() => permit.map_err(|_| Error::PoolClosed)?,
        };
        if !self.is_open() {
            return Err(Error::PoolClosed);
        }

        let index = self
            .free
            .lock()
            .unwrap()
            .pop_front()
            .expect("a permit was granted, so a free slot must exist");
        let mut guard = SlotGuard {
            pool: self,
            index: Some(index),
        };

        let slot = Arc::clone(&self.slots[index]);
        let channel = slot.channel.lock().await.clone();

        let result = f(channel).await;

        match &result {
            Err(e) => {
                warn!("channel in pool slot {index} raised an error, marking BROKEN: {e}");
                match connection.create_channel().await {
                    Ok(replacement) => {
                        *slot.channel.lock().await = replacement;
                        debug!("replaced broken channel in pool slot {index}");
                        self.free.lock().unwrap().push_back(index);
                    }
                    Err(replace_err) => {
                        warn!(
                            "failed to replace broken channel in pool slot {index}, \
                             dropping it from the free list: {replace_err}"
                        );
                        self.permits.forget_permits(1);
                    }
                }
            }
            Ok(_) => self.free.lock().unwrap().push_back(index),
        }

        guard.index = None;
        // `_permit` drops here, releasing the slot for the next FIFO waiter.
        result
    }

    /// Closes the pool: cancels any waiters with [`Error::PoolClosed`] and marks the pool closed.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.closed_notify.notify_waiters();
        for slot in &self.slots {
            let channel = slot.channel.lock().await;
            let _ = channel.close(0, "pool closed").await;
        }
        debug!("channel pool closed");
    }
}

#[cfg(test)]
mod tests {
    // The pool's FIFO/acquire-release/broken-replacement behavior requires a real
    // `lapin::Connection` to construct a `Channel`, so it is exercised by the
    // integration tests in `tests/pool.rs` against a live broker. Pure state-machine
    // invariants that do not need a channel are covered here.

    use std::collections::VecDeque;

    /// Mirrors the free-list bookkeeping `ChannelPool` performs, without requiring a
    /// broker: FIFO order of indices must be preserved across push/pop cycles.
    #[test]
    fn free_list_is_fifo() {
        let mut free: VecDeque<usize> = (0..3).collect();
        let first = free.pop_front().unwrap();
        let second = free.pop_front().unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 1);
        free.push_back(first);
        assert_eq!(free, VecDeque::from([2, 0]));
    }
}

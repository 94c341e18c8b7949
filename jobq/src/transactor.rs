//! The transactor : a staged-publish buffer with commit/rollback semantics.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::broker::{Broker, OutboundMessage};
use crate::error::{Error, TransactorError};
use crate::job::JobRequest;

/// Tagged lifecycle state ("Transactors as short-lived mutable objects").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    /// `commit()` has reserved the transactor and is flushing its buffer; no longer
    /// accepts `enqueue`/`commit`/`rollback`, but not yet CONCLUDED for `wait_until`.
    Flushing,
    Concluded,
}

struct Inner {
    buffer: Mutex<Vec<(OutboundMessage, JobRequest)>>,
    state: Mutex<State>,
    concluded: Notify,
}

/// A buffered batch of job publications that either flushes atomically-ish on
/// [`Transactor::commit`] or is discarded on [`Transactor::rollback`].
#[derive(Clone)]
pub struct Transactor(Arc<Inner>);

impl Transactor {
    /// Starts a new, empty, OPEN transactor.
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            buffer: Mutex::new(Vec::new()),
            state: Mutex::new(State::Open),
            concluded: Notify::new(),
        }))
    }

    /// Stages `message`/`job` for publication on [`Self::commit`]. No wire traffic occurs
    /// until then.
    pub async fn enqueue(&self, message: OutboundMessage, job: JobRequest) -> Result<(), Error> {
        let state = *self.0.state.lock().await;
        if state != State::Open {
            return Err(Error::Transactor(TransactorError::AlreadyConcluded));
        }
        self.0.buffer.lock().await.push((message, job));
        Ok(())
    }

    /// Flushes the buffered messages in order through `broker`, then concludes.
    ///
    /// The flush completes before the transactor is marked CONCLUDED, so a concurrent
    /// [`Self::wait_until`] never returns while messages are still being published.
    ///
    /// # Errors
    /// Returns [`TransactorError::AlreadyConcluded`] if `commit`/`rollback` was already
    /// called. Individual publish failures are logged and do not stop the remaining
    /// flush ("best-effort batch flush").
    pub async fn commit(&self, broker: &Broker) -> Result<(), Error> {
        {
            let mut state = self.0.state.lock().await;
            if *state != State::Open {
                return Err(Error::Transactor(TransactorError::AlreadyConcluded));
            }
            // Reserved here (without flipping to Concluded yet) so a second concurrent
            // `commit`/`rollback` call can't also pass this check and flush twice.
            *state = State::Flushing;
        }

        let buffer = std::mem::take(&mut *self.0.buffer.lock().await);
        debug!(count = buffer.len(), "flushing transactor buffer");
        for (message, job) in buffer {
            if let Err(e) = broker.publish(message).await {
                warn!(job = %job.name, error = %e, "failed to publish buffered job during commit");
            }
        }

        *self.0.state.lock().await = State::Concluded;
        self.0.concluded.notify_waiters();
        Ok(())
    }

    /// Drops the buffered messages without publishing them, then concludes.
    ///
    /// # Errors
    /// Returns [`TransactorError::AlreadyConcluded`] if `commit`/`rollback` was already called.
    pub async fn rollback(&self) -> Result<(), Error> {
        self.conclude_once().await?;
        let dropped = std::mem::take(&mut *self.0.buffer.lock().await).len();
        info!(dropped, "transactor rolled back");
        self.0.concluded.notify_waiters();
        Ok(())
    }

    /// Resolves once `commit`/`rollback` has been called, or errors after `timeout`.
    ///
    /// # Errors
    /// Returns [`TransactorError::WaitTimeout`] if the transactor has not concluded
    /// within `timeout`.
    pub async fn wait_until(&self, timeout: Duration) -> Result<(), Error> {
        if *self.0.state.lock().await == State::Concluded {
            return Ok(());
        }
        let notified = self.0.concluded.notified();
        tokio::time::timeout(timeout, notified)
            .await
            .map_err(|_| Error::Transactor(TransactorError::WaitTimeout))
    }

    /// Whether `commit` or `rollback` has already been called.
    pub async fn is_concluded(&self) -> bool {
        *self.0.state.lock().await == State::Concluded
    }

    async fn conclude_once(&self) -> Result<(), Error> {
        let mut state = self.0.state.lock().await;
        if *state != State::Open {
            return Err(Error::Transactor(TransactorError::AlreadyConcluded));
        }
        *state = State::Concluded;
        Ok(())
    }
}

impl Default for Transactor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rollback_drops_buffer_without_publishing() {
        let transactor = Transactor::new();
        transactor
            .enqueue(
                OutboundMessage::new("q", b"{}".to_vec()),
                JobRequest::new("noop", serde_json::json!(null)),
            )
            .await
            .unwrap();
        transactor.rollback().await.unwrap();
        assert!(transactor.is_concluded().await);
    }

    #[tokio::test]
    async fn second_conclude_call_errors() {
        let transactor = Transactor::new();
        transactor.rollback().await.unwrap();
        let err = transactor.rollback().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transactor(TransactorError::AlreadyConcluded)
        ));
    }

    #[tokio::test]
    async fn enqueue_after_conclude_errors() {
        let transactor = Transactor::new();
        transactor.rollback().await.unwrap();
        let err = transactor
            .enqueue(
                OutboundMessage::new("q", b"{}".to_vec()),
                JobRequest::new("noop", serde_json::json!(null)),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transactor(TransactorError::AlreadyConcluded)
        ));
    }

    #[tokio::test]
    async fn wait_until_times_out_before_conclusion() {
        let transactor = Transactor::new();
        let err = transactor
            .wait_until(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transactor(TransactorError::WaitTimeout)
        ));
    }

    #[tokio::test]
    async fn wait_until_resolves_after_rollback() {
        let transactor = Transactor::new();
        transactor.rollback().await.unwrap();
        transactor.wait_until(Duration::from_millis(10)).await.unwrap();
    }
}

//! The context handed to a job handler.

use std::mem;
use std::sync::Arc;

use lapin::acker::Acker as LapinAcker;
use lapin::message::Delivery as LapinDelivery;
use lapin::options::BasicAckOptions;
use lapin::Channel;
use tracing::{error, warn};

use crate::job::JobRequest;
use crate::state::StateMap;

/// A received message, carrying its decoded [`JobRequest`], the queue it arrived on, and
/// the channel identity it must be ack'ed/nack'ed on (`Delivery`).
///
/// Handed to job handlers as `&mut JobContext`. Extractors (see [`crate::extract`]) pull
/// pieces out of it; some extractions (the manual [`crate::extract::Acker`]) are
/// one-shot and leave the context unable to ack on drop.
pub struct JobContext {
    state: Arc<StateMap>,
    queue: String,
    job: JobRequest,
    channel: Channel,
    delivery: LapinDelivery,
    acked: bool,
    acker_taken: bool,
}

impl JobContext {
    /// Builds a new context from a channel, its delivery, the already-decoded job
    /// request, and the app state map.
    pub fn new(
        channel: Channel,
        delivery: LapinDelivery,
        job: JobRequest,
        queue: String,
        state: Arc<StateMap>,
    ) -> Self {
        Self {
            state,
            queue,
            job,
            channel,
            delivery,
            acked: false,
            acker_taken: false,
        }
    }

    /// The decoded job request.
    pub fn job(&self) -> &JobRequest {
        &self.job
    }

    /// The queue this delivery arrived on.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The channel this delivery must be ack'ed/nack'ed on. After a rewire, this is
    /// always the surviving channel for the handle that delivered this message.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// The raw AMQP delivery tag.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag
    }

    /// Whether this is a redelivery (e.g. after a rewire or a requeueing nack).
    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    /// The app state map. See [`crate::extract::State`] for the extractor built on top
    /// of this.
    pub fn state(&self) -> &StateMap {
        &self.state
    }

    /// Takes the manual acker out of the context, marking it as externally owned.
    /// Used by [`crate::extract::Acker`]; returns `None` if already taken.
    pub(crate) fn take_acker(&mut self) -> Option<LapinAcker> {
        if self.acker_taken {
            return None;
        }
        self.acker_taken = true;
        self.acked = true;
        Some(mem::take(&mut self.delivery.acker))
    }

    /// Acks the delivery on its channel. Called by the worker pipeline at the end of a
    /// job's lifecycle unless a handler already took the [`crate::extract::Acker`] itself.
    pub(crate) async fn ack(&mut self) -> Result<(), lapin::Error> {
        if self.acked {
            return Ok(());
        }
        self.delivery.ack(BasicAckOptions { multiple: false }).await?;
        self.acked = true;
        Ok(())
    }

    /// Nacks the delivery without requeueing, per its decode-error handling.
    pub(crate) async fn nack_no_requeue(&mut self) -> Result<(), lapin::Error> {
        if self.acked {
            return Ok(());
        }
        use lapin::options::BasicNackOptions;
        self.delivery
            .nack(BasicNackOptions {
                multiple: false,
                requeue: false,
            })
            .await?;
        self.acked = true;
        Ok(())
    }
}

/// Nacks with requeue if a context is dropped still unacknowledged -- almost always a
/// sign the worker task panicked before completing the state machine.
impl Drop for JobContext {
    fn drop(&mut self) {
        if self.acked {
            return;
        }

        let job_id = self.job.id;
        warn!("nacking unacked job {job_id} due to drop (requeue=true)");

        let acker = mem::take(&mut self.delivery.acker);
        tokio::spawn(async move {
            use lapin::options::BasicNackOptions;
            match acker
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: true,
                })
                .await
            {
                Ok(()) => {}
                Err(e) => error!("failed to nack job {job_id} during drop: {e}"),
            }
        });
        self.acked = true;
    }
}

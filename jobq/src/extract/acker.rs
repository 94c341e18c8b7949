//! Manual acknowledgement and rejection.

use async_trait::async_trait;
use lapin::{
    acker::Acker as LapinAcker,
    options::{BasicAckOptions, BasicRejectOptions},
};

use crate::context::JobContext;
use crate::error::ExtractionError;
use crate::extract::Extract;

/// An extractor that gives a handler manual control over acknowledgement of its message.
///
/// Once extracted, the worker pipeline will *not* ack the original delivery for you on
/// SUCCESS, nor will retry/error publishing touch the original delivery's ack state --
/// you are responsible for acknowledging or rejecting it yourself.
#[must_use = "you must call .ack() or .reject() to acknowledge or reject the message"]
#[derive(Debug)]
pub struct Acker(LapinAcker);

impl Acker {
    /// Acks the message.
    ///
    /// # Errors
    /// Returns `Err` on network failure talking to the broker.
    pub async fn ack(self) -> Result<(), lapin::Error> {
        self.0.ack(BasicAckOptions { multiple: false }).await
    }

    /// Rejects the message with the given options.
    ///
    /// # Errors
    /// Returns `Err` on network failure talking to the broker.
    pub async fn reject(self, options: BasicRejectOptions) -> Result<(), lapin::Error> {
        self.0.reject(options).await
    }
}

#[async_trait]
impl Extract for Acker {
    type Error = ExtractionError;

    async fn extract(ctx: &mut JobContext) -> Result<Self, Self::Error> {
        match ctx.take_acker() {
            Some(acker) => Ok(Acker(acker)),
            None => Err(ExtractionError::AckerAlreadyExtracted),
        }
    }
}

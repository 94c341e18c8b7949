//! Error types used throughout `jobq`.

use std::convert::Infallible;

use thiserror::Error as ThisError;

/// Top-level errors returned by the broker-facing runtime (pool, broker, transactor, registry).
#[derive(Debug, ThisError)]
pub enum Error {
    /// `connect()` exhausted its retry budget.
    #[error("failed to connect to the AMQP broker after {attempts} attempt(s): {message}")]
    ConnectFailed {
        /// Number of dial attempts made (`max_retries + 1`).
        attempts: u32,
        /// The last underlying error, stringified.
        ///
        /// Not kept as a `lapin::Error` because `connect()` joins concurrent callers
        /// through a `futures::future::Shared`, whose output must be `Clone`.
        message: String,
    },

    /// An operation was attempted on a broker that has not finished `connect()`.
    #[error("operation attempted before connect() completed")]
    NotConnected,

    /// `connect()` was already in progress on another task and that attempt failed.
    #[error("a concurrent connect() attempt failed: {0}")]
    Join(String),

    /// `shutdown()` was called on a broker whose channel pool was never opened.
    #[error("shutdown() called but the channel pool was never initialized")]
    PoolNotInitialized,

    /// The channel pool has been closed.
    #[error("channel pool is closed")]
    PoolClosed,

    /// No job with the given name has been registered.
    #[error("no job named {0:?} has been registered")]
    UnknownJob(String),

    /// A job name was registered more than once.
    #[error("a job named {0:?} has already been registered")]
    DuplicateJob(String),

    /// `pause_queue`/`resume_queue` named a queue with no registered consumer.
    #[error("queue {0:?} has no registered consumer to pause/resume")]
    UnknownQueue(String),

    /// A [`crate::job::JobRequest`] failed to encode to its wire JSON form.
    #[error("failed to encode a job request: {0}")]
    Encode(#[from] serde_json::Error),

    /// An underlying `lapin` call failed.
    #[error("an underlying lapin call failed: {0}")]
    Lapin(#[from] lapin::Error),

    /// A transactor's `commit`/`rollback` protocol was violated.
    #[error(transparent)]
    Transactor(#[from] TransactorError),
}

/// Errors produced while dispatching a single job delivery to its handler.
///
/// Every variant here is a FAILURE in the worker's state machine: it is either retried
/// or routed to the error exchange depending on the job's remaining attempts, never a
/// crash of the worker pipeline.
#[derive(Debug, ThisError)]
pub enum JobError {
    /// The delivery body was not valid JSON, or the envelope lacked a `name` field.
    #[error("delivery could not be decoded into a job request: {0}")]
    Decode(#[from] serde_json::Error),

    /// An extractor failed while building the job context for the handler.
    #[error("failed to extract a handler argument: {0}")]
    Extraction(#[from] ExtractionError),

    /// The user-supplied handler returned an error.
    #[error("handler failed: {0}")]
    Handler(Box<dyn std::error::Error + Send + Sync>),

    /// The handler did not finish within the job's `timeout_ms`.
    #[error("handler timed out")]
    Timeout,
}

/// The result type every job handler returns. `Ok(())` is SUCCESS, `Err` is FAILURE.
pub type HandlerOutcome = Result<(), JobError>;

/// Errors produced by [`crate::extract::Extract`] implementations.
#[derive(Debug, ThisError)]
pub enum ExtractionError {
    /// Attempted to extract the job arguments twice from the same context.
    #[error("the job arguments were already extracted from this context")]
    AlreadyExtracted,

    /// Attempted to extract the manual acker twice.
    #[error("the acker was already extracted from this context")]
    AckerAlreadyExtracted,

    /// Requested app state of a type that was never registered on the app.
    #[error("state of type {0} was not registered on the app")]
    StateNotFound(&'static str),

    /// The job arguments could not be deserialized into the requested type.
    #[error("failed to deserialize job arguments: {0}")]
    Args(#[from] serde_json::Error),
}

/// Types that may be constructed from an extractor error.
///
/// Every handler's return type must implement `FromError<ExtractionError>` so that a
/// failing extractor can short-circuit straight to a result, without ever calling the
/// handler body.
pub trait FromError<Err> {
    /// Converts the error into `Self`.
    fn from_error(error: Err) -> Self;
}

/// Extractors with an `Infallible` error type never need their own `FromError` impl.
impl<T> FromError<Infallible> for T {
    fn from_error(error: Infallible) -> Self {
        match error {}
    }
}

impl FromError<ExtractionError> for HandlerOutcome {
    fn from_error(error: ExtractionError) -> Self {
        Err(JobError::Extraction(error))
    }
}

/// Errors raised by the [`crate::transactor::Transactor`] staged-publish buffer.
#[derive(Debug, ThisError)]
pub enum TransactorError {
    /// `commit()` or `rollback()` was called more than once, or after the other was called.
    #[error("transactor has already concluded (commit or rollback already called)")]
    AlreadyConcluded,

    /// `wait_until` timed out before the transactor concluded.
    #[error("timed out waiting for transactor to conclude")]
    WaitTimeout,
}

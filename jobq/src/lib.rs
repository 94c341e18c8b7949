//! # jobq
//!
//! A background job queue built on top of [lapin](https://github.com/amqp-rs/lapin).
//!
//! `jobq` turns AMQP 0-9-1 into named, argument-carrying background jobs: a bounded pool
//! of multiplexed publishing channels, a consumer registry that survives channel death by
//! transparently rewiring to a fresh channel, a worker pipeline with bounded concurrency
//! and graceful shutdown, and a transactional staged-publish buffer.

// jobq is 100% Safe Rust.
#![forbid(unsafe_code)]
#![warn(
    // Warns on ::path, allows crate::path.
    absolute_paths_not_starting_with_crate,

    // Warns you about missing documentation comments.
    // Writing documentation is a good idea! They will show up in your IDE as well.
    // Consider this a friendly nudge :)
    missing_docs,
    clippy::missing_docs_in_private_items,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,

    // Warns you when you have dependencies you're not using.
    unused_crate_dependencies,

    // Warns on converting values using the `as` keyword.
    // Converting in this way panics in case of errors. Consider using the `Into` or `TryInto` traits instead.
    clippy::as_conversions,
)]

// Re-exporting underlying lapin version so you don't have to add the same version as a dependency.
pub use lapin;

pub mod app;
pub mod broker;
pub mod config;
pub mod context;
pub mod error;
pub mod extract;
pub mod handler;
pub mod job;
pub mod pool;
pub mod registry;
pub mod state;
pub mod transactor;
pub mod worker;

// pub-using every name::Name to avoid having to have jobq::name::Name repetition.
// This way you can just do jobq::Name.
pub use app::App;
pub use broker::{Broker, ConsumerHandle, OutboundMessage};
pub use config::ConnectionParams;
pub use context::JobContext;
pub use error::{Error, ExtractionError, HandlerOutcome, JobError};
pub use extract::Extract;
pub use handler::Handler;
pub use job::JobRequest;
pub use pool::ChannelPool;
pub use registry::{JobDefinition, JobDefinitionInput, Registry};
pub use state::StateMap;
pub use transactor::Transactor;
pub use worker::{JobStatus, Worker, WorkerConfig, WorkerResult};

/// Convenience type for a result with `jobq`'s error.
pub type Result<T> = std::result::Result<T, Error>;

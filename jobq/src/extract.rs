//! Interface for types that can extract themselves from a [`JobContext`].
//!
//! Handlers are plain async functions whose arguments implement [`Extract`], so adding a
//! new way to pull information out of a job context never requires touching the handler
//! macro.

mod acker;
mod args;
mod state;

pub use acker::Acker;
pub use args::Args;
pub use state::State;

use std::convert::Infallible;

use async_trait::async_trait;
use lapin::Channel;

use crate::context::JobContext;

/// A type that can be extracted from a [`JobContext`].
///
/// Note that extraction can mutate the context (e.g. taking the manual acker).
#[async_trait]
pub trait Extract: Sized {
    /// The error returned if extraction fails.
    type Error: std::error::Error;

    /// Extracts `Self` from the context.
    async fn extract(ctx: &mut JobContext) -> Result<Self, Self::Error>;
}

#[async_trait]
impl Extract for Channel {
    type Error = Infallible;

    async fn extract(ctx: &mut JobContext) -> Result<Self, Self::Error> {
        Ok(ctx.channel().clone())
    }
}

/// Extracting an `Option` simply discards the error and returns `None` on failure.
#[async_trait]
impl<T> Extract for Option<T>
where
    T: Extract,
{
    type Error = Infallible;

    async fn extract(ctx: &mut JobContext) -> Result<Self, Self::Error> {
        Ok(Extract::extract(ctx).await.ok())
    }
}

/// Extracting a `Result` returns the extraction error instead of discarding it, so a
/// handler can decide for itself what to do with it.
#[async_trait]
impl<T> Extract for Result<T, <T as Extract>::Error>
where
    T: Extract,
{
    type Error = Infallible;

    async fn extract(ctx: &mut JobContext) -> Result<Self, Self::Error> {
        Ok(Extract::extract(ctx).await)
    }
}

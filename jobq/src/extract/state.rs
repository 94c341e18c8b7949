//! Extracting application state.

use async_trait::async_trait;
use derive_more::{Deref, DerefMut};
use tracing::error;

use crate::context::JobContext;
use crate::error::ExtractionError;
use crate::extract::Extract;

/// Extracts a clone of a previously-registered state value of type `T`.
///
/// `T` must have been added to the app via `App::state` before the app runs; see
/// [`crate::state::StateMap`].
#[derive(Debug, Deref, DerefMut)]
pub struct State<T>(pub T);

impl<T: Clone> Clone for State<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Extract for State<T> {
    type Error = ExtractionError;

    async fn extract(ctx: &mut JobContext) -> Result<Self, Self::Error> {
        match ctx.state().get::<T>() {
            None => {
                error!(
                    "attempted to retrieve state of type {}, but it was never registered with App::state",
                    std::any::type_name::<T>()
                );
                Err(ExtractionError::StateNotFound(std::any::type_name::<T>()))
            }
            Some(t) => Ok(State(t.clone())),
        }
    }
}

//! [Handler]s are async functions whose arguments can be constructed from a [`JobContext`].

use std::future::Future;

use async_trait::async_trait;

use crate::context::JobContext;
use crate::error::{FromError, HandlerOutcome};
use crate::extract::Extract;

/// A job handler: an async function whose parameters are each [`Extract`]able from the
/// job context, returning a [`HandlerOutcome`].
///
/// Implemented for plain async functions of up to 8 parameters via the macro below.
#[async_trait]
pub trait Handler<Args>: Send + 'static + Clone {
    /// Calls the handler with the given context.
    async fn call(self, ctx: &mut JobContext) -> HandlerOutcome;
}

/// Special-cases the 0-args case to avoid unused type parameter warnings.
#[async_trait]
impl<Func, Fut> Handler<()> for Func
where
    Func: FnOnce() -> Fut + Send + 'static + Clone,
    Fut: Future<Output = HandlerOutcome> + Send,
{
    async fn call(self, _ctx: &mut JobContext) -> HandlerOutcome {
        self().await
    }
}

/// Implements [`Handler`] for functions of the given arity.
macro_rules! impl_handler {
    ( $($ty:ident),* $(,)? ) => {
        #[allow(non_snake_case)]
        #[async_trait]
        impl<Func, Fut, $($ty,)*> Handler<($($ty,)*)> for Func
        where
            Func: FnOnce($($ty,)*) -> Fut + Send + 'static + Clone,
            Fut: Future<Output = HandlerOutcome> + Send,
            $( $ty: Extract + Send,)*
            $( HandlerOutcome: FromError<<$ty as Extract>::Error>,)*
        {
            async fn call(self, ctx: &mut JobContext) -> HandlerOutcome {
                $(
                    let $ty = match $ty::extract(ctx).await {
                        Ok(value) => value,
                        Err(error) => {
                            tracing::error!("failed to extract {}: {error}", std::any::type_name::<$ty>());
                            return FromError::from_error(error);
                        }
                    };
                )*

                self($($ty,)*).await
            }
        }
    };
}

impl_handler!(T1);
impl_handler!(T1, T2);
impl_handler!(T1, T2, T3);
impl_handler!(T1, T2, T3, T4);
impl_handler!(T1, T2, T3, T4, T5);
impl_handler!(T1, T2, T3, T4, T5, T6);
impl_handler!(T1, T2, T3, T4, T5, T6, T7);
impl_handler!(T1, T2, T3, T4, T5, T6, T7, T8);

//! Extracting typed job arguments.

use async_trait::async_trait;
use derive_more::{Deref, DerefMut};
use serde::de::DeserializeOwned;

use crate::context::JobContext;
use crate::error::ExtractionError;
use crate::extract::Extract;

/// A wrapper that extracts and deserializes the job's `args` field into `T`.
#[derive(Debug, Deref, DerefMut)]
pub struct Args<T>(pub T);

#[async_trait]
impl<T> Extract for Args<T>
where
    T: DeserializeOwned,
{
    type Error = ExtractionError;

    async fn extract(ctx: &mut JobContext) -> Result<Self, Self::Error> {
        let value: T = serde_json::from_value(ctx.job().args.clone())?;
        Ok(Args(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRequest;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Payload {
        to: String,
    }

    #[test]
    fn deserializes_args_value_into_target_type() {
        let job = JobRequest::new("send_email", serde_json::json!({"to": "a@b.com"}));
        let value: Payload = serde_json::from_value(job.args).unwrap();
        assert_eq!(
            value,
            Payload {
                to: "a@b.com".to_string()
            }
        );
    }
}

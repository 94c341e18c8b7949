//! The job request envelope.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A job request, either about to be published or just decoded from a delivery.
///
/// Wire format is UTF-8 JSON: `{"id", "name", "args", "attempt"}`. Unknown
/// extra fields are ignored on decode so the envelope can grow without breaking older
/// consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Unique request id.
    pub id: Uuid,
    /// Name of the registered job this request targets.
    pub name: String,
    /// Opaque, application-defined arguments.
    pub args: serde_json::Value,
    /// Attempt number, starting at 1. Incremented on every retry publish.
    #[serde(default = "JobRequest::first_attempt")]
    pub attempt: u32,
    /// Correlation id, propagated through retries so logs/traces can be joined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl JobRequest {
    fn first_attempt() -> u32 {
        1
    }

    /// Creates a new, first-attempt job request with a random id.
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            args,
            attempt: Self::first_attempt(),
            correlation_id: None,
        }
    }

    /// Sets the correlation id, returning `self` for chaining.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Builds the next-attempt request used for a retry publish: same id and args, the
    /// correlation id carried over unchanged, and `attempt` incremented by one.
    ///
    /// Always increments `attempt` here, so retry accounting stays consistent regardless
    /// of whether a handler read it.
    pub fn next_attempt(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            args: self.args.clone(),
            attempt: self.attempt + 1,
            correlation_id: self.correlation_id.clone(),
        }
    }

    /// Encodes this request as the UTF-8 JSON body used on the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes a request from a delivery body.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let req = JobRequest::new("send_email", serde_json::json!({"to": "a@b.com"}))
            .with_correlation_id("corr-1");
        let bytes = req.to_bytes().unwrap();
        let decoded = JobRequest::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.id, req.id);
        assert_eq!(decoded.name, "send_email");
        assert_eq!(decoded.attempt, 1);
        assert_eq!(decoded.correlation_id.as_deref(), Some("corr-1"));
    }

    #[test]
    fn next_attempt_increments_and_preserves_identity() {
        let req = JobRequest::new("send_email", serde_json::json!(null));
        let retried = req.next_attempt();
        assert_eq!(retried.id, req.id);
        assert_eq!(retried.attempt, 2);
        let retried_again = retried.next_attempt();
        assert_eq!(retried_again.attempt, 3);
    }

    #[test]
    fn decode_rejects_missing_name() {
        let err = JobRequest::from_bytes(br#"{"id":"00000000-0000-0000-0000-000000000000","args":null}"#)
            .unwrap_err();
        assert!(err.to_string().contains("name") || err.is_data());
    }

    #[test]
    fn attempt_defaults_to_one_when_absent() {
        let json = format!(
            r#"{{"id":"{}","name":"x","args":null}}"#,
            Uuid::new_v4()
        );
        let decoded = JobRequest::from_bytes(json.as_bytes()).unwrap();
        assert_eq!(decoded.attempt, 1);
    }
}

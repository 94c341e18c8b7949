//! The job registry : a static, in-process catalogue mapping job names to
//! their queues, exchanges, bindings and retry/error topology.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;

/// Declarative definition of a queue to be asserted (`queues(list)`).
#[derive(Debug, Clone)]
pub struct QueueDef {
    /// Queue name.
    pub name: String,
    /// Whether the queue survives a broker restart.
    pub durable: bool,
    /// Whether the queue is deleted once its last consumer disconnects.
    pub auto_delete: bool,
    /// Whether the queue is restricted to its declaring connection.
    pub exclusive: bool,
}

/// Declarative definition of an exchange to be asserted (`exchanges(list)`).
#[derive(Debug, Clone)]
pub struct ExchangeDef {
    /// Exchange name.
    pub name: String,
    /// AMQP exchange type (`direct`, `topic`, `fanout`, ...).
    pub kind: String,
    /// Whether the exchange survives a broker restart.
    pub durable: bool,
}

/// Declarative definition of a binding (`bindings(list)`).
#[derive(Debug, Clone)]
pub struct BindingDef {
    /// Source exchange.
    pub exchange: String,
    /// Destination queue.
    pub queue: String,
    /// Routing key pattern.
    pub routing_key: String,
}

/// A registered job definition.
///
/// Created once by [`Registry::register_job`] and lives for the process's lifetime.
#[derive(Clone)]
pub struct JobDefinition {
    /// Unique job name. Used as the routing key when no explicit one is given.
    pub name: String,
    /// Queue the job is consumed from.
    pub queue: String,
    /// Routing key used to publish this job.
    pub routing_key: String,
    /// Exchange the job is published through. `None` means the default (nameless) exchange.
    pub exchange: Option<String>,
    /// Optional `reply_to` queue set on published messages.
    pub reply_to: Option<String>,
    /// Exchange failed jobs are republished to for delayed retry.
    pub retry_exchange: String,
    /// Exchange failed jobs are republished to once retries are exhausted.
    pub error_exchange: String,
    /// Maximum number of attempts before a job is routed to the error exchange.
    pub max_retries: u32,
    /// Delay, in milliseconds, the retry topology is expected to apply before redelivery.
    pub retry_delay_ms: u64,
    /// Queue TTL applied via `x-expires`, if any.
    pub expires_ms: Option<u64>,
    /// Per-attempt handler timeout, if any.
    pub timeout_ms: Option<u64>,
    /// Free-form class/category tag carried through to the AMQP message headers.
    pub job_class: Option<String>,
}

impl JobDefinition {
    /// The delayed-enqueue queue name: `"<queue>.delayed"`, published via the default
    /// exchange.
    ///
    /// This topology is not enforced by the registry and must be separately declared by
    /// the application; `delayed_queue()` exists so that declaration is at least
    /// discoverable instead of being a magic string the caller has to reconstruct
    /// themselves.
    pub fn delayed_queue(&self) -> String {
        format!("{}.delayed", self.queue)
    }

    /// The retry queue name conventionally dead-lettered back to `queue`.
    pub fn retry_queue(&self) -> String {
        format!("{}.retry", self.queue)
    }
}

/// Builder-style input to [`Registry::register_job`].
pub struct JobDefinitionInput {
    name: Option<String>,
    queue: String,
    routing_key: Option<String>,
    exchange: Option<String>,
    reply_to: Option<String>,
    retry_exchange: Option<String>,
    error_exchange: Option<String>,
    max_retries: u32,
    retry_delay: Duration,
    expires: Option<Duration>,
    timeout: Option<Duration>,
    job_class: Option<String>,
}

impl JobDefinitionInput {
    /// Starts building a job definition for the given queue. The job name defaults to
    /// the queue name if not overridden with [`Self::name`].
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            name: None,
            queue: queue.into(),
            routing_key: None,
            exchange: None,
            reply_to: None,
            retry_exchange: None,
            error_exchange: None,
            max_retries: 3,
            retry_delay: Duration::from_secs(30),
            expires: None,
            timeout: None,
            job_class: None,
        }
    }

    /// Sets an explicit job name (defaults to the queue name).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the routing key (defaults to the job name).
    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Sets the publishing exchange (defaults to the default/nameless exchange).
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Sets a `reply_to` queue for replies.
    pub fn reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Overrides the synthesized retry exchange name.
    pub fn retry_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.retry_exchange = Some(exchange.into());
        self
    }

    /// Overrides the synthesized error exchange name.
    pub fn error_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.error_exchange = Some(exchange.into());
        self
    }

    /// Sets the maximum number of attempts before a job is routed to the error exchange.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the delay the retry topology is expected to apply before redelivery.
    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Sets the queue's `x-expires` TTL.
    pub fn expires(mut self, expires: Duration) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Sets a per-attempt handler timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets a free-form job class tag.
    pub fn job_class(mut self, job_class: impl Into<String>) -> Self {
        self.job_class = Some(job_class.into());
        self
    }

    fn build(self) -> JobDefinition {
        let name = self.name.unwrap_or_else(|| self.queue.clone());
        let routing_key = self.routing_key.unwrap_or_else(|| name.clone());
        let retry_exchange = self
            .retry_exchange
            .unwrap_or_else(|| format!("{name}.retry"));
        let error_exchange = self
            .error_exchange
            .unwrap_or_else(|| format!("{name}.error"));
        JobDefinition {
            name,
            queue: self.queue,
            routing_key,
            exchange: self.exchange,
            reply_to: self.reply_to,
            retry_exchange,
            error_exchange,
            max_retries: self.max_retries,
            retry_delay_ms: u64::try_from(self.retry_delay.as_millis()).unwrap_or(u64::MAX),
            expires_ms: self
                .expires
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            timeout_ms: self
                .timeout
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            job_class: self.job_class,
        }
    }
}

/// The static catalogue of registered [`JobDefinition`]s.
///
/// Append-only after [`Registry::register_job`] has been called for every job the
/// application registers and before `declare_amq_resources` runs.
#[derive(Default, Clone)]
pub struct Registry {
    jobs: HashMap<String, Arc<JobDefinition>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalizes `input` into a [`JobDefinition`] and stores it under its name.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateJob`] if a job with the same name was already registered.
    pub fn register_job(&mut self, input: JobDefinitionInput) -> Result<Arc<JobDefinition>, Error> {
        let def = Arc::new(input.build());
        if self.jobs.contains_key(&def.name) {
            return Err(Error::DuplicateJob(def.name.clone()));
        }
        self.jobs.insert(def.name.clone(), Arc::clone(&def));
        Ok(def)
    }

    /// Looks up a registered job definition by name.
    pub fn get(&self, name: &str) -> Option<Arc<JobDefinition>> {
        self.jobs.get(name).cloned()
    }

    /// All registered job definitions.
    pub fn jobs(&self) -> impl Iterator<Item = &Arc<JobDefinition>> {
        self.jobs.values()
    }

    /// Derived queue declarations for every registered job: the job's own queue plus its
    /// retry queue, deduplicated by name.
    pub fn queues(&self) -> Vec<QueueDef> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for job in self.jobs.values() {
            for name in [job.queue.clone(), job.retry_queue()] {
                if seen.insert(name.clone()) {
                    out.push(QueueDef {
                        name,
                        durable: true,
                        auto_delete: false,
                        exclusive: false,
                    });
                }
            }
        }
        out
    }

    /// Derived exchange declarations: each job's publishing exchange (if any), plus its
    /// retry and error exchanges, deduplicated by name.
    pub fn exchanges(&self) -> Vec<ExchangeDef> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for job in self.jobs.values() {
            let mut names = vec![job.retry_exchange.clone(), job.error_exchange.clone()];
            if let Some(exchange) = &job.exchange {
                names.push(exchange.clone());
            }
            for name in names {
                if seen.insert(name.clone()) {
                    out.push(ExchangeDef {
                        name,
                        kind: "direct".to_string(),
                        durable: true,
                    });
                }
            }
        }
        out
    }

    /// Derived bindings: each job's exchange bound to its queue under its routing key.
    pub fn bindings(&self) -> Vec<BindingDef> {
        self.jobs
            .values()
            .filter_map(|job| {
                job.exchange.as_ref().map(|exchange| BindingDef {
                    exchange: exchange.clone(),
                    queue: job.queue.clone(),
                    routing_key: job.routing_key.clone(),
                })
            })
            .collect()
    }

    /// Distinct queue names a worker needs to consume from to service every registered job.
    pub fn worker_queues(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.jobs
            .values()
            .map(|job| job.queue.clone())
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_job_defaults_name_and_routing_key_to_queue() {
        let mut registry = Registry::new();
        let def = registry
            .register_job(JobDefinitionInput::new("emails"))
            .unwrap();
        assert_eq!(def.name, "emails");
        assert_eq!(def.routing_key, "emails");
        assert_eq!(def.retry_exchange, "emails.retry");
        assert_eq!(def.error_exchange, "emails.error");
    }

    #[test]
    fn register_job_rejects_duplicate_names() {
        let mut registry = Registry::new();
        registry
            .register_job(JobDefinitionInput::new("emails"))
            .unwrap();
        let err = registry
            .register_job(JobDefinitionInput::new("emails"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateJob(name) if name == "emails"));
    }

    #[test]
    fn delayed_and_retry_queue_names_are_synthesized() {
        let mut registry = Registry::new();
        let def = registry
            .register_job(JobDefinitionInput::new("emails"))
            .unwrap();
        assert_eq!(def.delayed_queue(), "emails.delayed");
        assert_eq!(def.retry_queue(), "emails.retry");
    }

    #[test]
    fn derived_collections_cover_every_job() {
        let mut registry = Registry::new();
        registry
            .register_job(
                JobDefinitionInput::new("emails")
                    .exchange("jobs")
                    .routing_key("send_email"),
            )
            .unwrap();
        registry
            .register_job(JobDefinitionInput::new("reports"))
            .unwrap();

        let queue_names: Vec<_> = registry.queues().into_iter().map(|q| q.name).collect();
        assert!(queue_names.contains(&"emails".to_string()));
        assert!(queue_names.contains(&"emails.retry".to_string()));
        assert!(queue_names.contains(&"reports".to_string()));

        let exchange_names: Vec<_> = registry.exchanges().into_iter().map(|e| e.name).collect();
        assert!(exchange_names.contains(&"jobs".to_string()));
        assert!(exchange_names.contains(&"emails.retry".to_string()));
        assert!(exchange_names.contains(&"reports.error".to_string()));

        let bindings = registry.bindings();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].exchange, "jobs");
        assert_eq!(bindings[0].queue, "emails");
        assert_eq!(bindings[0].routing_key, "send_email");

        let mut worker_queues = registry.worker_queues();
        worker_queues.sort();
        assert_eq!(worker_queues, vec!["emails".to_string(), "reports".to_string()]);
    }
}

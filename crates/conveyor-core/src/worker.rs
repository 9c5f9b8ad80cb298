//! Client-side worker layer: a handler trait, a registry, and a polling
//! worker group that drives `activate_jobs` in a loop and reports outcomes
//! back to the engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::{ActivateJobsRequest, ActivatedJob, JobType};
use crate::engine::Engine;
use crate::error::EngineError;

/// A handler's verdict on a failed attempt.
#[derive(Debug)]
pub struct JobFailure {
    pub message: String,
    /// Remaining retries to report; `0` parks the job for incident handling.
    pub retries: u32,
    pub backoff: Option<Duration>,
}

impl JobFailure {
    /// Fail with one attempt consumed, no backoff.
    pub fn retry(job: &ActivatedJob, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retries: job.retries.saturating_sub(1),
            backoff: None,
        }
    }

    /// Fail with one attempt consumed, gated by `backoff`.
    pub fn retry_after(job: &ActivatedJob, message: impl Into<String>, backoff: Duration) -> Self {
        Self {
            backoff: Some(backoff),
            ..Self::retry(job, message)
        }
    }

    /// Give up: zero retries, the job parks in `Failed`.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retries: 0,
            backoff: None,
        }
    }
}

/// A handler for a specific job type.
///
/// Returning `Ok(Some(vars))` completes the job with a result payload,
/// `Ok(None)` completes it without one.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &ActivatedJob) -> Result<Option<serde_json::Value>, JobFailure>;
}

/// Registry of handlers (job_type -> handler).
///
/// Built during initialization (mutable), shared immutably afterwards; no
/// locks needed at runtime.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        job_type: JobType,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), EngineError> {
        if self.handlers.contains_key(&job_type) {
            return Err(EngineError::DuplicateHandler(job_type));
        }
        self.handlers.insert(job_type, handler);
        Ok(())
    }

    pub fn get(&self, job_type: &JobType) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(job_type)
    }

    pub fn job_types(&self) -> impl Iterator<Item = &JobType> {
        self.handlers.keys()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PollWorkerOptions {
    /// Worker name reported on activations.
    pub worker: String,
    pub max_jobs_to_activate: u32,
    /// Long-poll duration per activation round.
    pub request_timeout: Duration,
    pub job_timeout: Option<Duration>,
}

impl Default for PollWorkerOptions {
    fn default() -> Self {
        Self {
            worker: "poll-worker".to_string(),
            max_jobs_to_activate: 8,
            request_timeout: Duration::from_secs(10),
            job_timeout: None,
        }
    }
}

/// Polling worker group handle.
/// - `request_shutdown()` stops taking new activations
/// - `shutdown_and_join()` waits for all workers to exit
pub struct PollWorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl PollWorkerGroup {
    /// Spawn `n` workers that long-poll for every type in `registry` and run
    /// the registered handlers.
    pub fn spawn(
        n: usize,
        engine: Arc<Engine>,
        registry: Arc<HandlerRegistry>,
        options: PollWorkerOptions,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let engine = Arc::clone(&engine);
            let registry = Arc::clone(&registry);
            let options = options.clone();
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                poll_loop(worker_id, engine, registry, options, &mut rx).await;
            });
            joins.push(join);
        }

        Self { shutdown_tx, joins }
    }

    /// Request shutdown for all workers. In-flight handler executions finish;
    /// no new activations are taken.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
    }
}

async fn poll_loop(
    worker_id: usize,
    engine: Arc<Engine>,
    registry: Arc<HandlerRegistry>,
    options: PollWorkerOptions,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let job_types: Vec<JobType> = registry.job_types().cloned().collect();
    if job_types.is_empty() {
        return;
    }
    let worker_name = format!("{}-{worker_id}", options.worker);
    let mut cursor = 0usize;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let job_type = job_types[cursor % job_types.len()].clone();
        cursor += 1;

        let mut request =
            ActivateJobsRequest::new(job_type, &worker_name, options.max_jobs_to_activate)
                .with_request_timeout(options.request_timeout);
        if let Some(job_timeout) = options.job_timeout {
            request = request.with_job_timeout(job_timeout);
        }

        // Activation may block for the full request timeout; race it against
        // shutdown.
        let jobs = tokio::select! {
            _ = shutdown_rx.changed() => continue,
            result = engine.activate_jobs(request) => match result {
                Ok(jobs) => jobs,
                Err(err) => {
                    tracing::warn!(worker = %worker_name, error = %err, "activation failed");
                    continue;
                }
            },
        };

        for job in jobs {
            run_one(&engine, &registry, &worker_name, job).await;
        }
    }
}

async fn run_one(
    engine: &Engine,
    registry: &HandlerRegistry,
    worker_name: &str,
    job: ActivatedJob,
) {
    let Some(handler) = registry.get(&job.job_type) else {
        // Activated a type nobody handles anymore; give it back untouched.
        let failure = JobFailure {
            message: format!("no handler registered for {}", job.job_type),
            retries: job.retries,
            backoff: None,
        };
        report_failure(engine, worker_name, &job, failure).await;
        return;
    };

    match handler.handle(&job).await {
        Ok(variables) => {
            if let Err(err) = engine.complete_job(job.key, variables).await {
                tracing::warn!(worker = %worker_name, job = %job.key, error = %err,
                    "complete rejected");
            }
        }
        Err(failure) => report_failure(engine, worker_name, &job, failure).await,
    }
}

async fn report_failure(
    engine: &Engine,
    worker_name: &str,
    job: &ActivatedJob,
    failure: JobFailure,
) {
    tracing::debug!(worker = %worker_name, job = %job.key, retries = failure.retries,
        "job failed: {}", failure.message);
    if let Err(err) = engine
        .fail_job(job.key, failure.retries, Some(failure.message), failure.backoff)
        .await
    {
        tracing::warn!(worker = %worker_name, job = %job.key, error = %err,
            "fail report rejected");
    }
}

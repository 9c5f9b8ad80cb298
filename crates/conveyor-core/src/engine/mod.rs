//! Engine: the worker-facing surface over a set of partition actors.
//!
//! Pull activations fan out to every partition; batches flow back over one
//! channel and are merged order-independently until the cap or the request
//! timeout. Anything a partition activated that the merge can no longer use
//! (cap reached, caller gone) is yielded back to its partition, so no job is
//! lost to a dead request.

mod builder;

pub use builder::{BuildError, EngineBuilder, EngineConfig};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::domain::{
    ActivateJobsRequest, ActivatedJob, JobKey, JobSpec, JobType, PartitionId, StreamId,
};
use crate::error::EngineError;
use crate::partition::{PartitionCommand, PartitionHandle, PollDemand, StreamRegistration};
use crate::status::{EngineStatus, PartitionStatus};

pub struct Engine {
    pub(crate) partitions: Vec<PartitionHandle>,
    pub(crate) joins: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) next_partition: AtomicUsize,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Create a job on a round-robin-chosen partition.
    pub async fn create_job(&self, spec: JobSpec) -> Result<JobKey, EngineError> {
        let idx = self.next_partition.fetch_add(1, Ordering::Relaxed) % self.partitions.len();
        self.create_job_on(PartitionId::new(idx as u16), spec).await
    }

    /// Create a job on a specific partition.
    pub async fn create_job_on(
        &self,
        partition: PartitionId,
        spec: JobSpec,
    ) -> Result<JobKey, EngineError> {
        let handle = self
            .partition(partition)
            .ok_or(EngineError::PartitionUnavailable(partition))?;
        let (reply, rx) = oneshot::channel();
        handle
            .tx
            .send(PartitionCommand::CreateJob { spec, reply })
            .await
            .map_err(|_| EngineError::PartitionUnavailable(partition))?;
        rx.await.map_err(|_| EngineError::PartitionUnavailable(partition))
    }

    /// Pull activation: returns up to `max_jobs_to_activate` jobs, waiting up
    /// to `request_timeout` for work to appear. An elapsed timeout yields an
    /// empty result, never an error.
    pub async fn activate_jobs(
        &self,
        request: ActivateJobsRequest,
    ) -> Result<Vec<ActivatedJob>, EngineError> {
        if request.max_jobs_to_activate == 0 {
            return Err(EngineError::CapacityRejected(format!(
                "max_jobs_to_activate must be >= 1, got {}",
                request.max_jobs_to_activate
            )));
        }
        let max = request.max_jobs_to_activate as usize;
        let job_timeout = request.job_timeout.unwrap_or(self.config.default_job_timeout);
        let now = Instant::now();
        let expires_at = now + request.request_timeout;

        let (batch_tx, mut batch_rx) = mpsc::channel::<Vec<ActivatedJob>>(self.partitions.len());
        for handle in &self.partitions {
            let demand = PollDemand {
                job_type: request.job_type.clone(),
                kind: request.kind,
                worker: request.worker.clone(),
                capacity: max,
                job_timeout,
                fetch_variables: request.fetch_variables.clone(),
                expires_at,
                sink: batch_tx.clone(),
            };
            handle
                .tx
                .send(PartitionCommand::Activate { demand })
                .await
                .map_err(|_| EngineError::PartitionUnavailable(handle.id))?;
        }
        drop(batch_tx);

        let mut collected: Vec<ActivatedJob> = Vec::new();
        if request.request_timeout.is_zero() {
            // Non-blocking: every partition answers exactly once.
            let mut reports = 0;
            while reports < self.partitions.len() {
                match batch_rx.recv().await {
                    Some(batch) => {
                        reports += 1;
                        self.absorb(&mut collected, batch, max).await;
                    }
                    None => break,
                }
            }
        } else {
            while collected.len() < max {
                match time::timeout_at(expires_at, batch_rx.recv()).await {
                    Err(_) => break,   // request timeout: empty is a result
                    Ok(None) => break, // no partition holds demand anymore
                    Ok(Some(batch)) => self.absorb(&mut collected, batch, max).await,
                }
            }
        }
        // Closing the receiver purges residual parked demand; draining first
        // keeps a batch already in flight from stranding its jobs as
        // activated-but-undelivered.
        batch_rx.close();
        while let Some(batch) = batch_rx.recv().await {
            self.absorb(&mut collected, batch, max).await;
        }
        Ok(collected)
    }

    /// Open a push stream: jobs of `job_type` are delivered as they become
    /// available, across all partitions. Dropping the stream without closing
    /// it is safe; registrations are removed on the next push attempt.
    pub async fn open_job_stream(
        &self,
        job_type: JobType,
        worker: impl Into<String>,
    ) -> Result<JobStream, EngineError> {
        let worker = worker.into();
        let id = StreamId::generate();
        let (tx, rx) = mpsc::channel(self.config.stream_buffer);
        for handle in &self.partitions {
            let registration = StreamRegistration {
                id,
                job_type: job_type.clone(),
                worker: worker.clone(),
                sender: tx.clone(),
            };
            handle
                .tx
                .send(PartitionCommand::OpenStream { registration })
                .await
                .map_err(|_| EngineError::PartitionUnavailable(handle.id))?;
        }
        Ok(JobStream {
            id,
            receiver: rx,
            partitions: self.partitions.iter().map(|h| h.tx.clone()).collect(),
        })
    }

    pub async fn complete_job(
        &self,
        key: JobKey,
        variables: Option<serde_json::Value>,
    ) -> Result<(), EngineError> {
        self.job_command(key, |reply| PartitionCommand::CompleteJob { key, variables, reply })
            .await
    }

    pub async fn fail_job(
        &self,
        key: JobKey,
        retries: u32,
        error_message: Option<String>,
        backoff: Option<Duration>,
    ) -> Result<(), EngineError> {
        self.job_command(key, |reply| PartitionCommand::FailJob {
            key,
            retries,
            error_message,
            backoff,
            reply,
        })
        .await
    }

    pub async fn throw_error(
        &self,
        key: JobKey,
        error_code: impl Into<String>,
        error_message: Option<String>,
    ) -> Result<(), EngineError> {
        let error_code = error_code.into();
        self.job_command(key, |reply| PartitionCommand::ThrowError {
            key,
            error_code,
            error_message,
            reply,
        })
        .await
    }

    pub async fn cancel_job(&self, key: JobKey) -> Result<(), EngineError> {
        self.job_command(key, |reply| PartitionCommand::CancelJob { key, reply })
            .await
    }

    /// Externally set the remaining retries of a job (e.g., to resolve an
    /// exhausted-retries failure).
    pub async fn update_retries(&self, key: JobKey, retries: u32) -> Result<(), EngineError> {
        if retries == 0 {
            return Err(EngineError::CapacityRejected(
                "retries must be >= 1".to_string(),
            ));
        }
        self.job_command(key, |reply| PartitionCommand::UpdateRetries { key, retries, reply })
            .await
    }

    /// Grant an activated job a fresh deadline of `timeout` from now.
    pub async fn update_timeout(&self, key: JobKey, timeout: Duration) -> Result<(), EngineError> {
        self.job_command(key, |reply| PartitionCommand::UpdateTimeout { key, timeout, reply })
            .await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let mut partitions = Vec::with_capacity(self.partitions.len());
        for handle in &self.partitions {
            let (reply, rx) = oneshot::channel();
            handle
                .tx
                .send(PartitionCommand::Counts { reply })
                .await
                .map_err(|_| EngineError::PartitionUnavailable(handle.id))?;
            let counts = rx
                .await
                .map_err(|_| EngineError::PartitionUnavailable(handle.id))?;
            partitions.push(PartitionStatus { partition_id: handle.id, counts });
        }
        Ok(EngineStatus { captured_at: Utc::now(), partitions })
    }

    /// Stop all partition actors and wait for them to finish.
    pub async fn shutdown(&self) {
        for handle in &self.partitions {
            let _ = handle.tx.send(PartitionCommand::Shutdown).await;
        }
        let mut joins = self.joins.lock().await;
        for join in joins.drain(..) {
            let _ = join.await;
        }
    }

    async fn job_command(
        &self,
        key: JobKey,
        build: impl FnOnce(oneshot::Sender<Result<(), EngineError>>) -> PartitionCommand,
    ) -> Result<(), EngineError> {
        let partition = key.partition_id();
        let handle = self
            .partition(partition)
            .ok_or(EngineError::NotFound(key))?;
        let (reply, rx) = oneshot::channel();
        handle
            .tx
            .send(build(reply))
            .await
            .map_err(|_| EngineError::PartitionUnavailable(partition))?;
        rx.await
            .map_err(|_| EngineError::PartitionUnavailable(partition))?
    }

    async fn absorb(&self, collected: &mut Vec<ActivatedJob>, batch: Vec<ActivatedJob>, max: usize) {
        for job in batch {
            if collected.len() < max {
                collected.push(job);
            } else {
                // Cap reached mid-batch: return the surplus.
                self.yield_back(job.key).await;
            }
        }
    }

    async fn yield_back(&self, key: JobKey) {
        if let Some(handle) = self.partition(key.partition_id()) {
            let _ = handle.tx.send(PartitionCommand::YieldJob { key }).await;
        }
    }

    fn partition(&self, id: PartitionId) -> Option<&PartitionHandle> {
        self.partitions.get(id.as_u16() as usize)
    }
}

/// Consumer side of a push stream.
pub struct JobStream {
    id: StreamId,
    receiver: mpsc::Receiver<ActivatedJob>,
    partitions: Vec<mpsc::Sender<PartitionCommand>>,
}

impl JobStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Next pushed job; `None` once the stream is closed on the server side.
    pub async fn recv(&mut self) -> Option<ActivatedJob> {
        self.receiver.recv().await
    }

    /// Deregister from all partitions. Jobs already pushed stay with the
    /// caller; jobs activated but undelivered come back via deadline expiry.
    pub async fn close(self) {
        for tx in &self.partitions {
            let _ = tx.send(PartitionCommand::CloseStream { id: self.id }).await;
        }
    }
}

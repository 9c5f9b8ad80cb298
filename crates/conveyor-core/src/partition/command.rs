//! Commands accepted by a partition actor's mailbox.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::domain::{JobKey, JobSpec, StreamId};
use crate::error::EngineError;
use crate::status::JobCounts;

use super::longpoll::PollDemand;
use super::streams::StreamRegistration;

pub(crate) type Reply = oneshot::Sender<Result<(), EngineError>>;

pub(crate) enum PartitionCommand {
    CreateJob {
        spec: JobSpec,
        reply: oneshot::Sender<JobKey>,
    },
    CancelJob {
        key: JobKey,
        reply: Reply,
    },
    /// Pull demand: match immediately, park the rest until expiry.
    Activate {
        demand: PollDemand,
    },
    CompleteJob {
        key: JobKey,
        variables: Option<serde_json::Value>,
        reply: Reply,
    },
    FailJob {
        key: JobKey,
        retries: u32,
        error_message: Option<String>,
        backoff: Option<Duration>,
        reply: Reply,
    },
    ThrowError {
        key: JobKey,
        error_code: String,
        error_message: Option<String>,
        reply: Reply,
    },
    UpdateRetries {
        key: JobKey,
        retries: u32,
        reply: Reply,
    },
    UpdateTimeout {
        key: JobKey,
        timeout: Duration,
        reply: Reply,
    },
    /// Return an activated-but-undelivered job to the pool (merge overflow).
    YieldJob {
        key: JobKey,
    },
    OpenStream {
        registration: StreamRegistration,
    },
    CloseStream {
        id: StreamId,
    },
    Counts {
        reply: oneshot::Sender<JobCounts>,
    },
    Shutdown,
}

use thiserror::Error;

use crate::domain::{JobKey, JobState, JobType, PartitionId};

/// Engine error taxonomy.
///
/// `InvalidStateTransition` is recoverable (a lost activation race); the
/// matcher handles it internally and it never reaches a worker. `NotFound` is
/// the uniform answer for any terminal command on a job that is not currently
/// ACTIVATED: the caller's command definitively did not apply.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("job {key} cannot {transition} from state {state:?}")]
    InvalidStateTransition {
        key: JobKey,
        state: JobState,
        transition: &'static str,
    },

    #[error("no such job: {0}")]
    NotFound(JobKey),

    #[error("invalid request: {0}")]
    CapacityRejected(String),

    #[error("partition {0} is unavailable")]
    PartitionUnavailable(PartitionId),

    #[error("duplicate handler for job type {0}")]
    DuplicateHandler(JobType),
}

//! Domain model (keys, job type, state machine, request/response types).

pub mod activation;
pub mod ids;
pub mod job;
pub mod job_type;
pub mod state;

pub use activation::{ActivateJobsRequest, ActivatedJob};
pub use ids::{JobKey, PartitionId, StreamId};
pub use job::{JobRecord, JobSpec};
pub use job_type::JobType;
pub use state::{JobKind, JobState};

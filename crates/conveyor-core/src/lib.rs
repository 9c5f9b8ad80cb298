//! conveyor-core
//!
//! Job activation and distribution engine.
//!
//! Jobs are created by an external process engine, stored per partition, and
//! handed out to competing workers under two delivery modes:
//! - **pull**: [`Engine::activate_jobs`] long-polls until work appears or the
//!   request times out (an empty result, never an error),
//! - **push**: [`Engine::open_job_stream`] delivers jobs as they become
//!   available, yielding them back to the pool when the consumer is saturated.
//!
//! Module layout:
//! - **domain**: job record, state machine, keys, request/response types
//! - **partition**: one single-writer actor per partition (matcher,
//!   long-polling queue, stream registry, timeout monitor)
//! - **engine**: partition fan-out, merge, and key-based command routing
//! - **worker**: client-side handler trait and polling worker group
//! - **status**: per-state job counts for observability

pub mod domain;
pub mod engine;
pub mod error;
pub mod status;
pub mod worker;

mod partition;

pub use domain::{
    ActivateJobsRequest, ActivatedJob, JobKey, JobKind, JobRecord, JobSpec, JobState, JobType,
    PartitionId, StreamId,
};
pub use engine::{Engine, EngineBuilder, JobStream};
pub use error::EngineError;
pub use status::{EngineStatus, JobCounts};

//! Job record: the single source of truth for one job's state.
//!
//! Design:
//! - All state transitions happen here, as methods; partition structures
//!   (type index, timer heap) hold keys only.
//! - Transition legality follows the matcher contract: `activate` failing with
//!   `InvalidStateTransition` means "lost the race, try the next candidate";
//!   terminal commands failing with `NotFound` mean "your command did not
//!   apply", full stop.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::domain::{JobKey, JobKind, JobState, JobType};
use crate::error::EngineError;

/// Description of a job to create, supplied by the process engine.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_type: JobType,
    pub kind: JobKind,
    pub retries: u32,
    pub variables: serde_json::Value,
    pub custom_headers: HashMap<String, String>,
    pub tags: Vec<String>,
}

impl JobSpec {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            kind: JobKind::Ordinary,
            retries: 3,
            variables: serde_json::json!({}),
            custom_headers: HashMap::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_variables(mut self, variables: serde_json::Value) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(key.into(), value.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub key: JobKey,
    pub job_type: JobType,
    pub kind: JobKind,
    pub state: JobState,
    pub retries: u32,
    pub variables: serde_json::Value,
    pub custom_headers: HashMap<String, String>,
    pub tags: Vec<String>,

    /// Name of the worker holding the current activation.
    pub worker: Option<String>,
    /// Absolute reclaim deadline, set while `Activated`.
    pub deadline: Option<Instant>,
    /// Earliest instant this job may be activated again after a failure.
    pub backoff_until: Option<Instant>,

    pub error_code: Option<String>,
    pub error_message: Option<String>,

    /// How often this job was yielded back by a saturated consumer.
    pub yield_count: u32,

    pub created_at: Instant,
    pub updated_at: Instant,
}

impl JobRecord {
    pub fn new(key: JobKey, spec: JobSpec, now: Instant) -> Self {
        Self {
            key,
            job_type: spec.job_type,
            kind: spec.kind,
            state: JobState::Created,
            retries: spec.retries,
            variables: spec.variables,
            custom_headers: spec.custom_headers,
            tags: spec.tags,
            worker: None,
            deadline: None,
            backoff_until: None,
            error_code: None,
            error_message: None,
            yield_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// A job is activatable once it is `Created` and any failure backoff has
    /// elapsed. This is the matcher's availability predicate.
    pub fn is_activatable(&self, now: Instant) -> bool {
        self.state == JobState::Created && self.backoff_until.is_none_or(|until| until <= now)
    }

    /// Claim this job for `worker` until `deadline`. Legal only from `Created`.
    pub fn activate(
        &mut self,
        worker: &str,
        deadline: Instant,
        now: Instant,
    ) -> Result<(), EngineError> {
        if self.state != JobState::Created {
            return Err(self.invalid("activate"));
        }
        self.state = JobState::Activated;
        self.worker = Some(worker.to_string());
        self.deadline = Some(deadline);
        self.backoff_until = None;
        self.updated_at = now;
        Ok(())
    }

    /// Finish the job. The variables payload is merged into the job's
    /// variables (it is forwarded to the process engine; we keep it on the
    /// record for observability).
    pub fn complete(
        &mut self,
        variables: Option<serde_json::Value>,
        now: Instant,
    ) -> Result<(), EngineError> {
        if self.state != JobState::Activated {
            return Err(EngineError::NotFound(self.key));
        }
        if let Some(vars) = variables {
            merge_variables(&mut self.variables, vars);
        }
        self.state = JobState::Completed;
        self.clear_activation(now);
        Ok(())
    }

    /// Report a failed attempt. With `retries > 0` the job returns to
    /// `Created` (gated by `backoff` if given); with `retries == 0` it parks
    /// in `Failed` awaiting external incident handling.
    pub fn fail(
        &mut self,
        retries: u32,
        error_message: Option<String>,
        backoff: Option<Duration>,
        now: Instant,
    ) -> Result<(), EngineError> {
        if self.state != JobState::Activated {
            return Err(EngineError::NotFound(self.key));
        }
        self.retries = retries;
        self.error_message = error_message;
        if retries > 0 {
            self.state = JobState::Created;
            self.backoff_until = backoff.map(|b| now + b);
        } else {
            self.state = JobState::Failed;
        }
        self.clear_activation(now);
        Ok(())
    }

    /// Raise a business error. Terminal for this subsystem; the process-level
    /// error boundary is an external concern.
    pub fn throw_error(
        &mut self,
        error_code: String,
        error_message: Option<String>,
        now: Instant,
    ) -> Result<(), EngineError> {
        if self.state != JobState::Activated {
            return Err(EngineError::NotFound(self.key));
        }
        self.state = JobState::ErrorThrown;
        self.error_code = Some(error_code);
        self.error_message = error_message;
        self.clear_activation(now);
        Ok(())
    }

    /// Reclaim an activation whose deadline has passed. Expiry is not a
    /// failure: `retries` is untouched.
    pub fn reclaim_expired(&mut self, now: Instant) -> Result<(), EngineError> {
        if self.state != JobState::Activated || self.deadline.is_none_or(|d| d > now) {
            return Err(self.invalid("reclaim"));
        }
        self.state = JobState::Created;
        self.clear_activation(now);
        Ok(())
    }

    /// Return an activated-but-undelivered job to the pool, without penalty.
    pub fn yield_back(&mut self, now: Instant) -> Result<(), EngineError> {
        if self.state != JobState::Activated {
            return Err(self.invalid("yield"));
        }
        self.state = JobState::Created;
        self.yield_count += 1;
        self.clear_activation(now);
        Ok(())
    }

    /// Cancel the job (external, terminal). Legal from `Created` or
    /// `Activated`.
    pub fn cancel(&mut self, now: Instant) -> Result<(), EngineError> {
        if !matches!(self.state, JobState::Created | JobState::Activated) {
            return Err(EngineError::NotFound(self.key));
        }
        self.state = JobState::Canceled;
        self.clear_activation(now);
        Ok(())
    }

    /// Externally update the remaining retries. A `Failed` job becomes
    /// `Created` (activatable) again.
    pub fn update_retries(&mut self, retries: u32, now: Instant) -> Result<(), EngineError> {
        if !matches!(
            self.state,
            JobState::Created | JobState::Activated | JobState::Failed
        ) {
            return Err(EngineError::NotFound(self.key));
        }
        self.retries = retries;
        if self.state == JobState::Failed {
            self.state = JobState::Created;
            self.error_message = None;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Move the activation deadline of an `Activated` job.
    pub fn update_deadline(&mut self, deadline: Instant, now: Instant) -> Result<(), EngineError> {
        if self.state != JobState::Activated {
            return Err(EngineError::NotFound(self.key));
        }
        self.deadline = Some(deadline);
        self.updated_at = now;
        Ok(())
    }

    /// Backoff has elapsed; make the availability predicate cheap again.
    pub fn clear_backoff(&mut self, now: Instant) {
        self.backoff_until = None;
        self.updated_at = now;
    }

    fn clear_activation(&mut self, now: Instant) {
        self.worker = None;
        self.deadline = None;
        self.updated_at = now;
    }

    fn invalid(&self, transition: &'static str) -> EngineError {
        EngineError::InvalidStateTransition {
            key: self.key,
            state: self.state,
            transition,
        }
    }
}

/// Merge `incoming` into `target`. Two JSON objects merge key-wise; any other
/// combination replaces the target wholesale.
fn merge_variables(target: &mut serde_json::Value, incoming: serde_json::Value) {
    match (target, incoming) {
        (serde_json::Value::Object(t), serde_json::Value::Object(i)) => {
            for (k, v) in i {
                t.insert(k, v);
            }
        }
        (t, i) => *t = i,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PartitionId;
    use rstest::rstest;

    fn record() -> JobRecord {
        let key = JobKey::new(PartitionId::new(0), 1);
        JobRecord::new(key, JobSpec::new(JobType::new("test")), Instant::now())
    }

    fn activated() -> JobRecord {
        let mut job = record();
        let now = Instant::now();
        job.activate("w", now + Duration::from_secs(30), now).unwrap();
        job
    }

    #[test]
    fn activate_only_from_created() {
        let mut job = record();
        let now = Instant::now();
        job.activate("w", now + Duration::from_secs(10), now).unwrap();
        assert_eq!(job.state, JobState::Activated);
        assert_eq!(job.worker.as_deref(), Some("w"));

        let err = job.activate("other", now + Duration::from_secs(10), now);
        assert!(matches!(
            err,
            Err(EngineError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn complete_twice_is_not_found() {
        let mut job = activated();
        let now = Instant::now();
        job.complete(None, now).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(matches!(
            job.complete(None, now),
            Err(EngineError::NotFound(_))
        ));
    }

    #[rstest]
    #[case::created(JobState::Created)]
    #[case::completed(JobState::Completed)]
    #[case::failed(JobState::Failed)]
    #[case::canceled(JobState::Canceled)]
    fn terminal_commands_require_activated(#[case] state: JobState) {
        let mut job = record();
        job.state = state;
        let now = Instant::now();
        assert!(matches!(job.complete(None, now), Err(EngineError::NotFound(_))));
        assert!(matches!(
            job.fail(1, None, None, now),
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            job.throw_error("code".into(), None, now),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn fail_with_retries_returns_to_created() {
        let mut job = activated();
        let now = Instant::now();
        job.fail(2, Some("boom".into()), None, now).unwrap();
        assert_eq!(job.state, JobState::Created);
        assert_eq!(job.retries, 2);
        assert!(job.is_activatable(now));
    }

    #[test]
    fn fail_with_zero_retries_parks_in_failed() {
        let mut job = activated();
        let now = Instant::now();
        job.fail(0, Some("boom".into()), None, now).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(!job.is_activatable(now));
    }

    #[test]
    fn fail_with_backoff_gates_activatability() {
        let mut job = activated();
        let now = Instant::now();
        job.fail(1, None, Some(Duration::from_secs(30)), now).unwrap();
        assert_eq!(job.state, JobState::Created);
        assert!(!job.is_activatable(now + Duration::from_secs(10)));
        assert!(job.is_activatable(now + Duration::from_secs(31)));
    }

    #[test]
    fn reclaim_requires_elapsed_deadline() {
        let mut job = record();
        let now = Instant::now();
        job.activate("w", now + Duration::from_secs(30), now).unwrap();

        // Deadline not reached yet.
        assert!(job.reclaim_expired(now).is_err());

        let later = now + Duration::from_secs(31);
        job.reclaim_expired(later).unwrap();
        assert_eq!(job.state, JobState::Created);
        assert_eq!(job.retries, 3, "expiry is not a failure");
        assert!(job.worker.is_none());

        // Idempotent under a racing second reclaim: already Created.
        assert!(job.reclaim_expired(later).is_err());
        assert_eq!(job.state, JobState::Created);
    }

    #[test]
    fn yield_back_counts_and_returns_to_created() {
        let mut job = activated();
        let now = Instant::now();
        job.yield_back(now).unwrap();
        assert_eq!(job.state, JobState::Created);
        assert_eq!(job.yield_count, 1);
        assert!(job.is_activatable(now));
    }

    #[test]
    fn update_retries_resurrects_failed_job() {
        let mut job = activated();
        let now = Instant::now();
        job.fail(0, Some("dead".into()), None, now).unwrap();
        assert_eq!(job.state, JobState::Failed);

        job.update_retries(3, now).unwrap();
        assert_eq!(job.state, JobState::Created);
        assert_eq!(job.retries, 3);
        assert!(job.is_activatable(now));
    }

    #[test]
    fn cancel_from_created_and_activated_only() {
        let mut job = record();
        let now = Instant::now();
        job.cancel(now).unwrap();
        assert_eq!(job.state, JobState::Canceled);
        assert!(matches!(job.cancel(now), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn complete_merges_object_variables() {
        let mut job = activated();
        job.variables = serde_json::json!({"a": 1});
        let now = Instant::now();
        job.complete(Some(serde_json::json!({"b": 2})), now).unwrap();
        assert_eq!(job.variables, serde_json::json!({"a": 1, "b": 2}));
    }
}

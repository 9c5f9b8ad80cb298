//! Activation matching: pairs available CREATED jobs with demand.
//!
//! Candidates are taken from the front of the type's FIFO index. A candidate
//! that lost a race (stale key, state already moved on) is skipped and
//! dropped; a candidate of the wrong kind or still inside its failure backoff
//! is skipped but kept in place, preserving its position.

use std::time::Duration;

use tokio::time::Instant;

use crate::domain::{ActivatedJob, JobKind, JobState, JobType};

use super::state::PartitionState;

/// Everything the matcher needs to know about one demand source.
pub(crate) struct MatchDemand<'a> {
    pub job_type: &'a JobType,
    pub kind: JobKind,
    pub worker: &'a str,
    pub capacity: usize,
    pub job_timeout: Duration,
    pub fetch_variables: Option<&'a [String]>,
}

/// Activate up to `demand.capacity` eligible jobs and return their
/// worker-facing views. Deadline timers for each activation are scheduled
/// here.
pub(crate) fn match_jobs(
    state: &mut PartitionState,
    demand: &MatchDemand<'_>,
    now: Instant,
) -> Vec<ActivatedJob> {
    let mut activated = Vec::new();
    let mut kept = Vec::new();
    while activated.len() < demand.capacity {
        let Some(key) = state
            .created
            .get_mut(demand.job_type)
            .and_then(|queue| queue.pop_front())
        else {
            break;
        };
        let deadline = now + demand.job_timeout;
        let view = match state.jobs.get_mut(&key) {
            None => continue, // stale key, record gone
            Some(record) if record.state != JobState::Created => {
                continue; // lost a race; drop the stale index entry
            }
            Some(record) if record.kind != demand.kind || !record.is_activatable(now) => {
                kept.push(key);
                continue;
            }
            Some(record) => {
                if record.activate(demand.worker, deadline, now).is_err() {
                    continue;
                }
                ActivatedJob::from_record(record, demand.fetch_variables)
            }
        };
        activated.push(view);
        state.schedule_deadline(key, deadline);
    }

    // Put skipped-but-eligible-later keys back at the front, original order.
    if !kept.is_empty() {
        if let Some(queue) = state.created.get_mut(demand.job_type) {
            for key in kept.into_iter().rev() {
                queue.push_front(key);
            }
        }
    }
    activated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobSpec, PartitionId};

    fn demand(job_type: &JobType, capacity: usize) -> MatchDemand<'_> {
        MatchDemand {
            job_type,
            kind: JobKind::Ordinary,
            worker: "w",
            capacity,
            job_timeout: Duration::from_secs(30),
            fetch_variables: None,
        }
    }

    #[test]
    fn matches_in_fifo_order_up_to_capacity() {
        let mut state = PartitionState::new(PartitionId::new(0));
        let now = Instant::now();
        let t = JobType::new("t");
        let a = state.create_job(JobSpec::new(t.clone()), now);
        let b = state.create_job(JobSpec::new(t.clone()), now);
        let c = state.create_job(JobSpec::new(t.clone()), now);

        let jobs = match_jobs(&mut state, &demand(&t, 2), now);
        let keys: Vec<_> = jobs.iter().map(|j| j.key).collect();
        assert_eq!(keys, vec![a, b]);
        assert_eq!(state.jobs[&a].state, JobState::Activated);
        assert_eq!(state.jobs[&c].state, JobState::Created);
        assert!(state.created[&t].contains(&c));
    }

    #[test]
    fn skips_stale_keys_without_reducing_satisfaction() {
        let mut state = PartitionState::new(PartitionId::new(0));
        let now = Instant::now();
        let t = JobType::new("t");
        let a = state.create_job(JobSpec::new(t.clone()), now);
        let b = state.create_job(JobSpec::new(t.clone()), now);
        // `a` is canceled but its key still sits in the index.
        state.jobs.get_mut(&a).unwrap().cancel(now).unwrap();

        let jobs = match_jobs(&mut state, &demand(&t, 1), now);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].key, b);
        // The stale key is gone from the index.
        assert!(!state.created[&t].contains(&a));
    }

    #[test]
    fn wrong_kind_stays_in_place() {
        let mut state = PartitionState::new(PartitionId::new(0));
        let now = Instant::now();
        let t = JobType::new("t");
        let listener =
            state.create_job(JobSpec::new(t.clone()).with_kind(JobKind::Listener), now);
        let ordinary = state.create_job(JobSpec::new(t.clone()), now);

        let jobs = match_jobs(&mut state, &demand(&t, 5), now);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].key, ordinary);
        assert_eq!(state.created[&t].front(), Some(&listener));

        let mut listener_demand = demand(&t, 5);
        listener_demand.kind = JobKind::Listener;
        let jobs = match_jobs(&mut state, &listener_demand, now);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].key, listener);
    }

    #[test]
    fn backoff_job_is_kept_but_not_matched() {
        let mut state = PartitionState::new(PartitionId::new(0));
        let now = Instant::now();
        let t = JobType::new("t");
        let key = state.create_job(JobSpec::new(t.clone()), now);
        let record = state.jobs.get_mut(&key).unwrap();
        record.activate("w", now + Duration::from_secs(60), now).unwrap();
        record
            .fail(1, None, Some(Duration::from_secs(30)), now)
            .unwrap();
        // fail path re-indexes via the partition actor; emulate it here
        state.created.get_mut(&t).unwrap().clear();
        state.requeue(key);

        let jobs = match_jobs(&mut state, &demand(&t, 1), now);
        assert!(jobs.is_empty());
        assert!(state.created[&t].contains(&key));
    }
}

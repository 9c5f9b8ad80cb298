//! Parked pull-style demand, woken when jobs of its type become available.
//!
//! Entries are FIFO per type to approximate fairness across competing
//! workers. Each carries an absolute expiry; when it passes, the entry is
//! simply dropped — the merge layer answers the caller with whatever it
//! collected (possibly nothing), which is the defined "no work right now"
//! outcome, not an error. A caller that went away is detected through its
//! closed reply channel and purged, so dead requests cannot accumulate.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

use crate::domain::{ActivatedJob, JobKind, JobType};

use super::matcher::{MatchDemand, match_jobs};
use super::state::PartitionState;

/// One partition's share of a pull activation request.
pub(crate) struct PollDemand {
    pub job_type: JobType,
    pub kind: JobKind,
    pub worker: String,
    /// Residual demand this partition may still satisfy.
    pub capacity: usize,
    pub job_timeout: Duration,
    pub fetch_variables: Option<Vec<String>>,
    pub expires_at: Instant,
    /// Batches of activated jobs flow back to the merge layer through this.
    pub sink: mpsc::Sender<Vec<ActivatedJob>>,
}

impl PollDemand {
    pub(super) fn as_match(&self) -> MatchDemand<'_> {
        MatchDemand {
            job_type: &self.job_type,
            kind: self.kind,
            worker: &self.worker,
            capacity: self.capacity,
            job_timeout: self.job_timeout,
            fetch_variables: self.fetch_variables.as_deref(),
        }
    }
}

#[derive(Default)]
pub(crate) struct LongPollQueue {
    parked: HashMap<JobType, VecDeque<PollDemand>>,
}

impl LongPollQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn park(&mut self, demand: PollDemand) {
        self.parked
            .entry(demand.job_type.clone())
            .or_default()
            .push_back(demand);
    }

    /// Earliest expiry across all parked entries.
    pub(crate) fn next_expiry(&self) -> Option<Instant> {
        self.parked
            .values()
            .flatten()
            .map(|demand| demand.expires_at)
            .min()
    }

    /// Drop expired entries and entries whose caller is gone.
    pub(crate) fn expire_due(&mut self, now: Instant) {
        self.parked.retain(|_, queue| {
            queue.retain(|demand| demand.expires_at > now && !demand.sink.is_closed());
            !queue.is_empty()
        });
    }

    /// Jobs of `job_type` became available: feed parked demand in arrival
    /// order. Jobs the merge layer can no longer take are yielded back.
    pub(crate) fn wake(&mut self, state: &mut PartitionState, job_type: &JobType, now: Instant) {
        let Some(mut queue) = self.parked.remove(job_type) else {
            return;
        };
        let mut still_parked = VecDeque::new();
        while let Some(mut demand) = queue.pop_front() {
            if demand.expires_at <= now || demand.sink.is_closed() {
                continue;
            }
            let jobs = match_jobs(state, &demand.as_match(), now);
            let got = jobs.len();
            if got == 0 {
                still_parked.push_back(demand);
                continue;
            }
            match demand.sink.try_send(jobs) {
                Ok(()) => {
                    demand.capacity -= got;
                    if demand.capacity > 0 {
                        still_parked.push_back(demand);
                    }
                }
                Err(TrySendError::Full(jobs)) => {
                    // Merge layer saturated; return the jobs and retry later.
                    for job in jobs {
                        state.yield_job(job.key, now);
                    }
                    still_parked.push_back(demand);
                }
                Err(TrySendError::Closed(jobs)) => {
                    // Caller is gone; return the jobs, drop the entry.
                    for job in jobs {
                        state.yield_job(job.key, now);
                    }
                }
            }
        }
        if !still_parked.is_empty() {
            self.parked.insert(job_type.clone(), still_parked);
        }
    }

    #[cfg(test)]
    fn parked_len(&self, job_type: &JobType) -> usize {
        self.parked.get(job_type).map_or(0, |q| q.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobSpec, PartitionId};

    fn demand(
        job_type: &JobType,
        capacity: usize,
        expires_at: Instant,
    ) -> (PollDemand, mpsc::Receiver<Vec<ActivatedJob>>) {
        let (tx, rx) = mpsc::channel(4);
        let demand = PollDemand {
            job_type: job_type.clone(),
            kind: JobKind::Ordinary,
            worker: "w".into(),
            capacity,
            job_timeout: Duration::from_secs(30),
            fetch_variables: None,
            expires_at,
            sink: tx,
        };
        (demand, rx)
    }

    #[tokio::test]
    async fn wake_delivers_in_arrival_order() {
        let mut state = PartitionState::new(PartitionId::new(0));
        let mut queue = LongPollQueue::new();
        let t = JobType::new("t");
        let now = Instant::now();
        let expiry = now + Duration::from_secs(10);

        let (first, mut first_rx) = demand(&t, 1, expiry);
        let (second, mut second_rx) = demand(&t, 1, expiry);
        queue.park(first);
        queue.park(second);

        let key = state.create_job(JobSpec::new(t.clone()), now);
        queue.wake(&mut state, &t, now);

        let batch = first_rx.try_recv().unwrap();
        assert_eq!(batch[0].key, key);
        assert!(second_rx.try_recv().is_err());
        assert_eq!(queue.parked_len(&t), 1);
    }

    #[tokio::test]
    async fn satisfied_demand_is_removed_partial_stays() {
        let mut state = PartitionState::new(PartitionId::new(0));
        let mut queue = LongPollQueue::new();
        let t = JobType::new("t");
        let now = Instant::now();

        let (entry, mut rx) = demand(&t, 3, now + Duration::from_secs(10));
        queue.park(entry);

        state.create_job(JobSpec::new(t.clone()), now);
        state.create_job(JobSpec::new(t.clone()), now);
        queue.wake(&mut state, &t, now);

        assert_eq!(rx.try_recv().unwrap().len(), 2);
        // 1 of 3 still wanted.
        assert_eq!(queue.parked_len(&t), 1);

        state.create_job(JobSpec::new(t.clone()), now);
        queue.wake(&mut state, &t, now);
        assert_eq!(rx.try_recv().unwrap().len(), 1);
        assert_eq!(queue.parked_len(&t), 0);
    }

    #[tokio::test]
    async fn expired_and_closed_entries_are_purged() {
        let mut state = PartitionState::new(PartitionId::new(0));
        let mut queue = LongPollQueue::new();
        let t = JobType::new("t");
        let now = Instant::now();

        let (expired, _rx) = demand(&t, 1, now + Duration::from_secs(1));
        let (closed, closed_rx) = demand(&t, 1, now + Duration::from_secs(60));
        drop(closed_rx);
        queue.park(expired);
        queue.park(closed);

        queue.expire_due(now + Duration::from_secs(2));
        assert_eq!(queue.parked_len(&t), 0);
        // no demand left: an arriving job stays in the index
        let key = state.create_job(JobSpec::new(t.clone()), now);
        queue.wake(&mut state, &t, now);
        assert!(state.created[&t].contains(&key));
    }

    #[tokio::test]
    async fn closed_sink_on_wake_yields_jobs_back() {
        let mut state = PartitionState::new(PartitionId::new(0));
        let mut queue = LongPollQueue::new();
        let t = JobType::new("t");
        let now = Instant::now();

        let (entry, rx) = demand(&t, 1, now + Duration::from_secs(10));
        queue.park(entry);
        drop(rx);

        let key = state.create_job(JobSpec::new(t.clone()), now);
        queue.wake(&mut state, &t, now);

        // Entry purged, job still available.
        assert_eq!(queue.parked_len(&t), 0);
        assert!(state.jobs[&key].is_activatable(now));
        assert!(state.created[&t].contains(&key));
    }
}

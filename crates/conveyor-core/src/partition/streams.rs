//! Push-stream registry and backpressure control.
//!
//! Each stream is a bounded channel; its free capacity is the credit
//! protocol. The registry round-robins availability over open streams and
//! never waits on a slow consumer: a push that would exceed the channel's
//! budget marks the stream saturated for this pass and **yields** the job,
//! returning it to the pool for any other consumer. Closed channels are
//! removed lazily on the next push attempt.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

use crate::domain::{ActivatedJob, JobKind, JobType, StreamId};

use super::matcher::{MatchDemand, match_jobs};
use super::state::PartitionState;

/// An open push stream for one job type.
pub(crate) struct StreamRegistration {
    pub id: StreamId,
    pub job_type: JobType,
    pub worker: String,
    pub sender: mpsc::Sender<ActivatedJob>,
}

#[derive(Default)]
pub(crate) struct StreamRegistry {
    streams: HashMap<JobType, Vec<StreamRegistration>>,
    cursors: HashMap<JobType, usize>,
}

impl StreamRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a stream. Re-registering the same (type, worker, channel)
    /// replaces the prior entry.
    pub(crate) fn register(&mut self, registration: StreamRegistration) {
        let list = self.streams.entry(registration.job_type.clone()).or_default();
        if let Some(existing) = list.iter_mut().find(|s| {
            s.worker == registration.worker && s.sender.same_channel(&registration.sender)
        }) {
            *existing = registration;
        } else {
            list.push(registration);
        }
    }

    pub(crate) fn close(&mut self, id: StreamId) {
        self.streams.retain(|_, list| {
            list.retain(|s| s.id != id);
            !list.is_empty()
        });
    }

    pub(crate) fn has_streams(&self, job_type: &JobType) -> bool {
        self.streams.get(job_type).is_some_and(|list| !list.is_empty())
    }

    /// Jobs of `job_type` became available: push them to accepting streams,
    /// one at a time, round-robin. Streams serve ordinary jobs; listener jobs
    /// go through the pull path.
    pub(crate) fn push_available(
        &mut self,
        state: &mut PartitionState,
        job_timeout: Duration,
        job_type: &JobType,
        now: Instant,
    ) {
        let Some(list) = self.streams.get_mut(job_type) else {
            return;
        };
        let mut saturated: HashSet<StreamId> = HashSet::new();
        loop {
            list.retain(|s| !s.sender.is_closed());
            if list.is_empty() {
                break;
            }
            let cursor = self.cursors.entry(job_type.clone()).or_insert(0);
            let len = list.len();
            let Some(idx) = (0..len)
                .map(|i| (*cursor + i) % len)
                .find(|&i| !saturated.contains(&list[i].id))
            else {
                break; // every open stream is saturated; yield path already ran
            };
            *cursor = (idx + 1) % len;

            let demand = MatchDemand {
                job_type,
                kind: JobKind::Ordinary,
                worker: &list[idx].worker,
                capacity: 1,
                job_timeout,
                fetch_variables: None,
            };
            let Some(job) = match_jobs(state, &demand, now).pop() else {
                break; // nothing available
            };
            let key = job.key;
            match list[idx].sender.try_send(job) {
                Ok(()) => {
                    tracing::trace!(job = %key, stream = %list[idx].id, "pushed job");
                }
                Err(TrySendError::Full(job)) => {
                    saturated.insert(list[idx].id);
                    state.yield_job(job.key, now);
                }
                Err(TrySendError::Closed(job)) => {
                    state.yield_job(job.key, now);
                    let id = list[idx].id;
                    list.retain(|s| s.id != id);
                }
            }
        }
        if self.streams.get(job_type).is_some_and(|l| l.is_empty()) {
            self.streams.remove(job_type);
            self.cursors.remove(job_type);
        }
    }

    #[cfg(test)]
    fn stream_count(&self, job_type: &JobType) -> usize {
        self.streams.get(job_type).map_or(0, |l| l.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobSpec, JobState, PartitionId};

    fn registration(
        job_type: &JobType,
        worker: &str,
        buffer: usize,
    ) -> (StreamRegistration, mpsc::Receiver<ActivatedJob>) {
        let (tx, rx) = mpsc::channel(buffer);
        let reg = StreamRegistration {
            id: StreamId::generate(),
            job_type: job_type.clone(),
            worker: worker.into(),
            sender: tx,
        };
        (reg, rx)
    }

    #[tokio::test]
    async fn pushes_available_job_to_open_stream() {
        let mut state = PartitionState::new(PartitionId::new(0));
        let mut registry = StreamRegistry::new();
        let t = JobType::new("t");
        let now = Instant::now();

        let (reg, mut rx) = registration(&t, "w", 4);
        registry.register(reg);

        let key = state.create_job(JobSpec::new(t.clone()), now);
        registry.push_available(&mut state, Duration::from_secs(30), &t, now);

        let job = rx.try_recv().unwrap();
        assert_eq!(job.key, key);
        assert_eq!(state.jobs[&key].state, JobState::Activated);
        assert_eq!(state.jobs[&key].worker.as_deref(), Some("w"));
    }

    #[tokio::test]
    async fn saturated_stream_yields_instead_of_blocking() {
        let mut state = PartitionState::new(PartitionId::new(0));
        let mut registry = StreamRegistry::new();
        let t = JobType::new("t");
        let now = Instant::now();

        let (reg, mut rx) = registration(&t, "w", 1);
        registry.register(reg);

        let first = state.create_job(JobSpec::new(t.clone()), now);
        let second = state.create_job(JobSpec::new(t.clone()), now);
        let third = state.create_job(JobSpec::new(t.clone()), now);
        registry.push_available(&mut state, Duration::from_secs(30), &t, now);

        // One pushed; the next candidate was yielded back, and the pass
        // stopped once the only stream was saturated.
        assert_eq!(state.jobs[&second].yield_count, 1);
        assert_eq!(state.jobs[&second].state, JobState::Created);
        assert_eq!(state.jobs[&third].state, JobState::Created);
        assert_eq!(state.counts().yielded_total, 1);

        // Consumer drains; each availability pass delivers one more job.
        // The yield moved `second` behind `third` in the index.
        assert_eq!(rx.try_recv().unwrap().key, first);
        registry.push_available(&mut state, Duration::from_secs(30), &t, now);
        assert_eq!(rx.try_recv().unwrap().key, third);
        registry.push_available(&mut state, Duration::from_secs(30), &t, now);
        assert_eq!(rx.try_recv().unwrap().key, second);
    }

    #[tokio::test]
    async fn round_robin_across_accepting_streams() {
        let mut state = PartitionState::new(PartitionId::new(0));
        let mut registry = StreamRegistry::new();
        let t = JobType::new("t");
        let now = Instant::now();

        let (a, mut a_rx) = registration(&t, "a", 4);
        let (b, mut b_rx) = registration(&t, "b", 4);
        registry.register(a);
        registry.register(b);

        for _ in 0..4 {
            state.create_job(JobSpec::new(t.clone()), now);
        }
        registry.push_available(&mut state, Duration::from_secs(30), &t, now);

        let mut a_jobs = 0;
        while a_rx.try_recv().is_ok() {
            a_jobs += 1;
        }
        let mut b_jobs = 0;
        while b_rx.try_recv().is_ok() {
            b_jobs += 1;
        }
        assert_eq!(a_jobs, 2);
        assert_eq!(b_jobs, 2);
    }

    #[tokio::test]
    async fn reregistering_same_channel_replaces_entry() {
        let mut registry = StreamRegistry::new();
        let t = JobType::new("t");
        let (tx, _rx) = mpsc::channel(4);

        let first = StreamRegistration {
            id: StreamId::generate(),
            job_type: t.clone(),
            worker: "w".into(),
            sender: tx.clone(),
        };
        let replacement_id = StreamId::generate();
        let second = StreamRegistration {
            id: replacement_id,
            job_type: t.clone(),
            worker: "w".into(),
            sender: tx,
        };
        registry.register(first);
        registry.register(second);
        assert_eq!(registry.stream_count(&t), 1);

        registry.close(replacement_id);
        assert_eq!(registry.stream_count(&t), 0);
    }

    #[tokio::test]
    async fn closed_stream_is_dropped_and_job_yielded() {
        let mut state = PartitionState::new(PartitionId::new(0));
        let mut registry = StreamRegistry::new();
        let t = JobType::new("t");
        let now = Instant::now();

        let (reg, rx) = registration(&t, "w", 4);
        registry.register(reg);
        drop(rx);

        let key = state.create_job(JobSpec::new(t.clone()), now);
        registry.push_available(&mut state, Duration::from_secs(30), &t, now);

        assert_eq!(registry.stream_count(&t), 0);
        assert_eq!(state.jobs[&key].state, JobState::Created);
    }
}

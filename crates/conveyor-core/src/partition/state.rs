//! Per-partition job table, availability index, and timer heap.
//!
//! Design:
//! - `jobs` is the single source of truth; `created` holds keys only, in
//!   creation/requeue order, giving the matcher its approximate-FIFO view.
//! - One min-heap drives both deadline reclaim and backoff promotion. Stale
//!   entries are harmless: firing re-checks the record before acting.
//! - Terminal records are evicted by the periodic purge; their states live on
//!   in the `finished` counts, and commands addressing an evicted key get
//!   `NotFound` (the same answer a retained terminal record gives).

use std::collections::{BinaryHeap, HashMap, VecDeque};

use tokio::time::Instant;

use crate::domain::{JobKey, JobRecord, JobSpec, JobType};
use crate::status::JobCounts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Activation deadline: reclaim the job if still activated.
    Deadline,
    /// Failure backoff elapsed: promote the job into the availability index.
    Backoff,
}

/// Timer heap entry.
///
/// Reverse ordering so `BinaryHeap` acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TimerEntry {
    pub(crate) at: Instant,
    pub(crate) key: JobKey,
    pub(crate) kind: TimerKind,
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.at.cmp(&self.at)
    }
}

pub(crate) struct PartitionState {
    pub(crate) partition_id: crate::domain::PartitionId,
    pub(crate) jobs: HashMap<JobKey, JobRecord>,
    /// CREATED keys per type, front = oldest. May contain stale keys; the
    /// matcher drops them lazily.
    pub(crate) created: HashMap<JobType, VecDeque<JobKey>>,
    timers: BinaryHeap<TimerEntry>,
    next_sequence: u64,
    /// Running total of yield events, for observability.
    pub(crate) yields: u64,
    /// Accumulated states of evicted terminal records.
    finished: JobCounts,
}

impl PartitionState {
    pub(crate) fn new(partition_id: crate::domain::PartitionId) -> Self {
        Self {
            partition_id,
            jobs: HashMap::new(),
            created: HashMap::new(),
            timers: BinaryHeap::new(),
            next_sequence: 1,
            yields: 0,
            finished: JobCounts::default(),
        }
    }

    /// Create a job and index it as available.
    pub(crate) fn create_job(&mut self, spec: JobSpec, now: Instant) -> JobKey {
        let key = JobKey::new(self.partition_id, self.next_sequence);
        self.next_sequence += 1;
        let record = JobRecord::new(key, spec, now);
        self.created
            .entry(record.job_type.clone())
            .or_default()
            .push_back(key);
        self.jobs.insert(key, record);
        key
    }

    /// Push a CREATED job's key back into the availability index.
    pub(crate) fn requeue(&mut self, key: JobKey) {
        if let Some(record) = self.jobs.get(&key) {
            self.created
                .entry(record.job_type.clone())
                .or_default()
                .push_back(key);
        }
    }

    pub(crate) fn schedule_deadline(&mut self, key: JobKey, at: Instant) {
        self.timers.push(TimerEntry { at, key, kind: TimerKind::Deadline });
    }

    pub(crate) fn schedule_backoff(&mut self, key: JobKey, at: Instant) {
        self.timers.push(TimerEntry { at, key, kind: TimerKind::Backoff });
    }

    pub(crate) fn next_timer(&self) -> Option<Instant> {
        self.timers.peek().map(|entry| entry.at)
    }

    /// Fire all due timers; returns the job types that gained availability.
    pub(crate) fn fire_due_timers(&mut self, now: Instant) -> Vec<JobType> {
        let mut woken: Vec<JobType> = Vec::new();
        while let Some(entry) = self.timers.peek() {
            if entry.at > now {
                break;
            }
            let entry = match self.timers.pop() {
                Some(entry) => entry,
                None => break,
            };
            let Some(record) = self.jobs.get_mut(&entry.key) else {
                continue;
            };
            let job_type = record.job_type.clone();
            let became_available = match entry.kind {
                TimerKind::Deadline => record.reclaim_expired(now).is_ok(),
                TimerKind::Backoff => {
                    if record.state == crate::domain::JobState::Created
                        && record.backoff_until.is_some_and(|until| until <= now)
                    {
                        record.clear_backoff(now);
                        true
                    } else {
                        false
                    }
                }
            };
            if became_available {
                self.requeue(entry.key);
                if !woken.contains(&job_type) {
                    woken.push(job_type);
                }
            }
        }
        woken
    }

    /// Yield an activated job back into the pool. Stale keys (late races with
    /// complete/fail) are ignored.
    pub(crate) fn yield_job(&mut self, key: JobKey, now: Instant) -> Option<JobType> {
        let record = self.jobs.get_mut(&key)?;
        if record.yield_back(now).is_err() {
            return None;
        }
        let job_type = record.job_type.clone();
        self.yields += 1;
        self.requeue(key);
        Some(job_type)
    }

    /// Evict terminal records (Completed / ErrorThrown / Canceled), keeping
    /// their states in `finished`. `Failed` stays: an external retries update
    /// can still resurrect it.
    pub(crate) fn purge_terminal(&mut self) {
        let finished = &mut self.finished;
        self.jobs.retain(|_, record| {
            if record.state.is_terminal() {
                finished.record(record.state);
                false
            } else {
                true
            }
        });
    }

    pub(crate) fn counts(&self) -> JobCounts {
        let mut counts = self.finished;
        for record in self.jobs.values() {
            counts.record(record.state);
        }
        counts.yielded_total = self.yields;
        counts
    }
}

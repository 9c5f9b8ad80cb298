//! Per-state job counts for observability.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{JobState, PartitionId};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobCounts {
    pub created: usize,
    pub activated: usize,
    pub completed: usize,
    pub failed: usize,
    pub error_thrown: usize,
    pub canceled: usize,
    /// Total yield events observed (a job may be yielded more than once).
    pub yielded_total: u64,
}

impl JobCounts {
    pub fn record(&mut self, state: JobState) {
        match state {
            JobState::Created => self.created += 1,
            JobState::Activated => self.activated += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
            JobState::ErrorThrown => self.error_thrown += 1,
            JobState::Canceled => self.canceled += 1,
        }
    }

    pub fn merge(&mut self, other: &JobCounts) {
        self.created += other.created;
        self.activated += other.activated;
        self.completed += other.completed;
        self.failed += other.failed;
        self.error_thrown += other.error_thrown;
        self.canceled += other.canceled;
        self.yielded_total += other.yielded_total;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionStatus {
    pub partition_id: PartitionId,
    pub counts: JobCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub captured_at: DateTime<Utc>,
    pub partitions: Vec<PartitionStatus>,
}

impl EngineStatus {
    pub fn totals(&self) -> JobCounts {
        let mut totals = JobCounts::default();
        for p in &self.partitions {
            totals.merge(&p.counts);
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_sum_partitions() {
        let mut a = JobCounts::default();
        a.record(JobState::Created);
        a.record(JobState::Activated);
        let mut b = JobCounts::default();
        b.record(JobState::Completed);
        b.yielded_total = 2;

        let status = EngineStatus {
            captured_at: Utc::now(),
            partitions: vec![
                PartitionStatus { partition_id: PartitionId::new(0), counts: a },
                PartitionStatus { partition_id: PartitionId::new(1), counts: b },
            ],
        };
        let totals = status.totals();
        assert_eq!(totals.created, 1);
        assert_eq!(totals.activated, 1);
        assert_eq!(totals.completed, 1);
        assert_eq!(totals.yielded_total, 2);
    }
}

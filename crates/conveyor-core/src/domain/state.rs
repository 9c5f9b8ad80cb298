//! Job states and kinds.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
///
/// Only `Created` jobs are visible to the matcher. `Failed` means retries are
/// exhausted; it is terminal for activation but an external retries update can
/// return the job to `Created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Activated,
    Completed,
    Failed,
    ErrorThrown,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::ErrorThrown | JobState::Canceled
        )
    }
}

/// Kind of a job within the same type namespace.
///
/// Listener jobs share the type index with ordinary jobs but are only claimed
/// by demand that asks for them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    #[default]
    Ordinary,
    Listener,
}

//! Domain identifiers.
//!
//! `JobKey` encodes the owning partition in its high bits, so any
//! key-addressed command can be routed without a lookup table. `StreamId` is a
//! ULID (time-sortable, generated without coordination), which is enough to
//! identify a push-stream registration for its in-memory lifetime.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

/// Bits reserved for the partition id in a `JobKey`.
const PARTITION_BITS: u32 = 13;
/// Bits left for the per-partition sequence.
const SEQUENCE_BITS: u32 = 64 - PARTITION_BITS;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Largest partition count a `JobKey` can address. Ids at or above this would
/// alias a lower partition after encoding.
pub const MAX_PARTITIONS: u16 = 1 << PARTITION_BITS;

/// Identifier of a partition (an ordered, single-writer command processor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(u16);

impl PartitionId {
    pub fn new(id: u16) -> Self {
        Self(id)
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition-{}", self.0)
    }
}

/// Identifier of a job, unique across the cluster.
///
/// Layout: `partition_id << 51 | sequence`. Sequences are assigned
/// monotonically by the owning partition, so keys are ordered by creation
/// within a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey(u64);

impl JobKey {
    pub fn new(partition: PartitionId, sequence: u64) -> Self {
        Self(((partition.0 as u64) << SEQUENCE_BITS) | (sequence & SEQUENCE_MASK))
    }

    pub fn partition_id(&self) -> PartitionId {
        PartitionId((self.0 >> SEQUENCE_BITS) as u16)
    }

    pub fn sequence(&self) -> u64 {
        self.0 & SEQUENCE_MASK
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Identifier of a push-stream registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(Ulid);

impl StreamId {
    /// Generate a fresh id (ULID from wall clock + random).
    pub fn generate() -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(Ulid::from_parts(timestamp_ms, rand::random()))
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

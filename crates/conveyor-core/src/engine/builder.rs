//! Engine construction and wiring.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::domain::PartitionId;
use crate::domain::ids::MAX_PARTITIONS;
use crate::partition;

use super::Engine;

/// Tuning knobs shared by all partitions.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of partitions (parallel single-writer processors).
    pub partitions: u16,
    /// Coarse sweep interval: dead-demand purge and stream credit re-check.
    pub tick_interval: Duration,
    /// Activation deadline granted when a request does not name one.
    pub default_job_timeout: Duration,
    /// Outstanding-push budget per stream (the credit window).
    pub stream_buffer: usize,
    /// Partition mailbox depth.
    pub mailbox_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            partitions: 1,
            tick_interval: Duration::from_secs(1),
            default_job_timeout: Duration::from_secs(300),
            stream_buffer: 8,
            mailbox_capacity: 64,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("engine needs at least one partition")]
    NoPartitions,
    #[error("job keys address at most {} partitions", MAX_PARTITIONS)]
    TooManyPartitions,
    #[error("stream buffer must be >= 1")]
    ZeroStreamBuffer,
    #[error("tick interval must be non-zero")]
    ZeroTickInterval,
}

/// Builds an [`Engine`], validating the configuration up front.
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self { config: EngineConfig::default() }
    }

    pub fn partitions(mut self, partitions: u16) -> Self {
        self.config.partitions = partitions;
        self
    }

    pub fn tick_interval(mut self, tick_interval: Duration) -> Self {
        self.config.tick_interval = tick_interval;
        self
    }

    pub fn default_job_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_job_timeout = timeout;
        self
    }

    pub fn stream_buffer(mut self, stream_buffer: usize) -> Self {
        self.config.stream_buffer = stream_buffer;
        self
    }

    /// Validate and spawn the partition actors. Must be called within a tokio
    /// runtime.
    pub fn build(self) -> Result<Engine, BuildError> {
        if self.config.partitions == 0 {
            return Err(BuildError::NoPartitions);
        }
        if self.config.partitions > MAX_PARTITIONS {
            return Err(BuildError::TooManyPartitions);
        }
        if self.config.stream_buffer == 0 {
            return Err(BuildError::ZeroStreamBuffer);
        }
        if self.config.tick_interval.is_zero() {
            return Err(BuildError::ZeroTickInterval);
        }

        let config = Arc::new(self.config);
        let mut partitions = Vec::with_capacity(config.partitions as usize);
        let mut joins = Vec::with_capacity(config.partitions as usize);
        for id in 0..config.partitions {
            let (handle, join) = partition::spawn(PartitionId::new(id), Arc::clone(&config));
            partitions.push(handle);
            joins.push(join);
        }
        tracing::info!(partitions = config.partitions, "engine started");
        Ok(Engine {
            partitions,
            joins: Mutex::new(joins),
            config,
            next_partition: AtomicUsize::new(0),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_zero_partitions() {
        let result = EngineBuilder::new().partitions(0).build();
        assert!(matches!(result, Err(BuildError::NoPartitions)));
    }

    #[tokio::test]
    async fn rejects_partition_count_beyond_key_space() {
        let result = EngineBuilder::new().partitions(MAX_PARTITIONS + 1).build();
        assert!(matches!(result, Err(BuildError::TooManyPartitions)));
    }

    #[tokio::test]
    async fn rejects_zero_stream_buffer() {
        let result = EngineBuilder::new().stream_buffer(0).build();
        assert!(matches!(result, Err(BuildError::ZeroStreamBuffer)));
    }

    #[tokio::test]
    async fn builds_with_defaults() {
        let engine = EngineBuilder::new().build().unwrap();
        engine.shutdown().await;
    }
}

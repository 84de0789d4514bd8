use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::retry::RetryPolicy;

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of parallel channels
    pub channels: usize,
    /// Records per batch; reaching it seals the buffer
    pub batch_size: usize,
    /// Longest a record may wait in a buffer before the buffer is sealed
    pub flush_interval: Duration,
    /// Capacity of each channel's inbound record queue
    pub channel_capacity: usize,
    /// Sealed batches a channel may hold before it stops taking records
    pub max_queued_batches: usize,
    /// How long shutdown waits for queued and in-flight batches
    pub shutdown_grace: Duration,
    /// Broker poll timeout
    pub poll_timeout: Duration,
    /// Consecutive broker poll failures tolerated before the engine stops;
    /// 0 keeps reconnecting until shutdown
    pub broker_failure_limit: u32,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channels: 4,
            batch_size: 1000,
            flush_interval: Duration::from_secs(2),
            channel_capacity: 1000,
            max_queued_batches: 4,
            shutdown_grace: Duration::from_secs(30),
            poll_timeout: Duration::from_millis(500),
            broker_failure_limit: 0,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(EngineError::InvalidConfig(
                "channel count must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(EngineError::InvalidConfig(
                "batch size must be at least 1".to_string(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(EngineError::InvalidConfig(
                "flush interval must be greater than zero".to_string(),
            ));
        }
        if self.channel_capacity == 0 || self.max_queued_batches == 0 {
            return Err(EngineError::InvalidConfig(
                "channel capacity and max queued batches must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "max attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(EngineError::InvalidConfig(format!(
                "retry base delay {:?} exceeds max delay {:?}",
                self.retry.base_delay, self.retry.max_delay
            )));
        }
        Ok(())
    }
}

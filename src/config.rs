//! Configuration for the metric buffer.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error returned for invalid buffer or scheduler parameters.
///
/// Invalid parameters are rejected at call time rather than silently clamped.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// `batch_count` does not allow any records per batch.
    #[error("batch_count must be at least 1")]
    InvalidBatchCount,
    /// The flush interval is zero.
    #[error("flush interval must be non-zero")]
    InvalidInterval,
}

/// Parameters used by the [`MetricBuffer`](crate::MetricBuffer).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferConfig {
    /// The namespace every submitted batch is tagged with.
    ///
    /// Defaults to the empty string.
    pub namespace: String,

    /// The maximum number of records submitted in one backend request.
    ///
    /// Defaults to `20`. Must be at least `1`.
    pub batch_count: usize,

    /// The interval of the flush scheduler in milliseconds.
    ///
    /// Defaults to `10000` (10 seconds). Used by
    /// [`MetricBuffer::start`](crate::MetricBuffer::start); an explicit
    /// interval can be given with
    /// [`start_with_interval`](crate::MetricBuffer::start_with_interval).
    pub flush_interval_ms: u64,
}

impl BufferConfig {
    /// Returns the interval of the flush scheduler.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Validates the configuration.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_count == 0 {
            return Err(ConfigError::InvalidBatchCount);
        }

        if self.flush_interval_ms == 0 {
            return Err(ConfigError::InvalidInterval);
        }

        Ok(())
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            batch_count: 20,
            flush_interval_ms: 10_000,
        }
    }
}

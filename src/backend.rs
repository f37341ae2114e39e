//! The backend collaborator contract.

use async_trait::async_trait;
use thiserror::Error;

use crate::datum::MetricDatum;

/// An opaque error reported by a [`MetricsBackend`].
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// An error reported for one failed batch submission.
///
/// Carried on the buffer's error channel. The failed batch is not retried and
/// its records are not re-inserted into the table; retry policy is owned by
/// the backend or its caller.
#[derive(Debug, Error)]
#[error("failed to submit batch of {batch_len} records to namespace {namespace:?}")]
pub struct SubmitError {
    /// The namespace the batch was tagged with.
    pub namespace: String,
    /// The number of records in the failed batch.
    pub batch_len: usize,
    /// The error reported by the backend.
    #[source]
    pub source: BackendError,
}

/// A remote metrics backend accepting batches of aggregated records.
///
/// Transport and authentication are the implementation's concern. The buffer
/// treats submissions as fire-and-forget: batches of one flush cycle are
/// submitted independently of each other and a failed batch is never retried.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// Submits one batch of records tagged with `namespace`.
    ///
    /// The batch is never empty and never longer than the configured
    /// `batch_count`.
    async fn submit(&self, namespace: &str, batch: Vec<MetricDatum>) -> Result<(), BackendError>;
}

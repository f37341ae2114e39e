//! Client-side aggregation buffer for statistical metric submission.
//!
//! Reporting every measurement to a remote metrics backend is expensive. This
//! crate buffers measurements in memory instead: values reported for the same
//! metric name and an equivalent set of dimensions fold into a single
//! statistical record (sum, minimum, maximum, sample count), and a flush
//! drains all records into size-bounded batches handed to the backend. The
//! statistical fidelity of the series is preserved while the outbound call
//! volume drops to one request per batch per flush.
//!
//! # Aggregation
//!
//! A series is identified by its metric name and the canonical encoding of
//! its dimensions. The encoding is order-normalized: dimension pairs given in
//! a different order still address the same series. Between flushes, at most
//! one record exists per series.
//!
//! # Flushing
//!
//! [`MetricBuffer::flush`] atomically swaps the aggregation table for an
//! empty one, so measurements pushed concurrently with a flush land in
//! exactly one flush cycle, never in both and never in neither. The drained
//! records are partitioned into batches of at most
//! [`BufferConfig::batch_count`] records and submitted to the backend on
//! independent tasks. Failed batches are reported on the buffer's error
//! channel and are not retried.
//!
//! [`MetricBuffer::start`] arms a recurring timer that flushes at the
//! configured interval; [`MetricBuffer::stop`] halts it. Manual flushes are
//! always possible.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use metric_buffer::{BackendError, BufferConfig, MetricBuffer, MetricDatum, MetricsBackend};
//!
//! struct NullBackend;
//!
//! #[async_trait::async_trait]
//! impl MetricsBackend for NullBackend {
//!     async fn submit(&self, _namespace: &str, _batch: Vec<MetricDatum>) -> Result<(), BackendError> {
//!         Ok(())
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let (buffer, _errors) = MetricBuffer::new(Arc::new(NullBackend), BufferConfig::default())?;
//!
//! buffer.push("endpoint.latency", metric_buffer::dims![("host", "a")], 10.0)?;
//! buffer.push("endpoint.latency", metric_buffer::dims![("host", "a")], 30.0)?;
//!
//! // One record with sum=40, min=10, max=30 and a sample count of 2.
//! assert_eq!(buffer.datum_count(), 1);
//! buffer.flush();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```
#![warn(missing_docs)]

mod aggregator;
mod backend;
mod buffer;
mod config;
mod datum;
mod protocol;

pub use self::aggregator::*;
pub use self::backend::*;
pub use self::buffer::*;
pub use self::config::*;
pub use self::datum::*;
pub use self::protocol::*;

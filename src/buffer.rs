//! The metric buffer engine: push, flush/batching, and the flush scheduler.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{AggregateError, Aggregator};
use crate::backend::{MetricsBackend, SubmitError};
use crate::config::{BufferConfig, ConfigError};
use crate::protocol::{DimensionSet, MetricUnit};

/// Locks a mutex, ignoring poisoning.
///
/// The guarded state stays consistent even if a panic unwinds while the lock
/// is held: the table is only ever mutated through single complete fold or
/// swap operations.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Optional per-measurement parameters for
/// [`MetricBuffer::push_with_opts`].
#[derive(Clone, Copy, Debug, Default)]
pub struct PushOptions {
    /// Overrides the capture time of the measurement.
    ///
    /// Defaults to the time of the push call.
    pub timestamp: Option<DateTime<Utc>>,
    /// The unit of the measurement.
    ///
    /// Defaults to [`MetricUnit::None`].
    pub unit: MetricUnit,
}

/// Client-side aggregation buffer for metric measurements.
///
/// Measurements pushed into the buffer fold into per-series statistics
/// instead of being reported individually. [`flush`](Self::flush) drains all
/// accumulated series atomically and submits them to the backend in batches
/// of at most [`BufferConfig::batch_count`] records, preserving the drained
/// order within and across batches. [`start`](Self::start) arms a recurring
/// timer that flushes automatically; manual flushes remain possible in any
/// scheduler state.
///
/// The buffer is a cheaply cloneable handle; clones share the same table,
/// scheduler, and error channel. Pushes never block on flushes: a flush swaps
/// the table for an empty one, so concurrent pushes land in exactly one of
/// the old or the new table.
///
/// Backend failures are reported per batch on the error channel returned by
/// [`new`](Self::new) and are never retried.
#[derive(Clone)]
pub struct MetricBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    config: BufferConfig,
    backend: Arc<dyn MetricsBackend>,
    aggregator: Mutex<Aggregator>,
    scheduler: Mutex<Option<CancellationToken>>,
    errors: mpsc::UnboundedSender<SubmitError>,
}

impl MetricBuffer {
    /// Creates a buffer submitting to `backend`.
    ///
    /// Returns the buffer and the receiving end of its error channel, on
    /// which one [`SubmitError`] is delivered per failed batch. Dropping the
    /// receiver is allowed; failures are still logged.
    ///
    /// Fails if `config` is invalid.
    pub fn new(
        backend: Arc<dyn MetricsBackend>,
        config: BufferConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SubmitError>), ConfigError> {
        config.validate()?;

        let (errors, error_rx) = mpsc::unbounded_channel();
        let inner = Inner {
            config,
            backend,
            aggregator: Mutex::new(Aggregator::new()),
            scheduler: Mutex::new(None),
            errors,
        };

        Ok((
            Self {
                inner: Arc::new(inner),
            },
            error_rx,
        ))
    }

    /// Records a measurement with the default timestamp and unit.
    ///
    /// Shorthand for [`push_with_opts`](Self::push_with_opts) with default
    /// [`PushOptions`]. Use [`dims!`](crate::dims) to build the dimension
    /// set, or pass an empty set for an undimensioned series.
    pub fn push(
        &self,
        name: &str,
        dimensions: DimensionSet,
        value: f64,
    ) -> Result<(), AggregateError> {
        self.push_with_opts(name, dimensions, value, PushOptions::default())
    }

    /// Records a measurement.
    ///
    /// Folds `value` into the series identified by `name` and the canonical
    /// encoding of `dimensions`. Never blocks on flushes or backend calls.
    /// Rejects non-finite values.
    pub fn push_with_opts(
        &self,
        name: &str,
        dimensions: DimensionSet,
        value: f64,
        options: PushOptions,
    ) -> Result<(), AggregateError> {
        let timestamp = options.timestamp.unwrap_or_else(Utc::now);
        lock(&self.inner.aggregator).insert(name, dimensions, value, timestamp, options.unit)
    }

    /// Returns the number of series currently buffered.
    pub fn datum_count(&self) -> usize {
        lock(&self.inner.aggregator).datum_count()
    }

    /// Drains the buffer and submits all records in batches.
    ///
    /// Each batch is handed to the backend on its own task; this method
    /// returns once every batch has been handed off, without waiting for
    /// acknowledgements. An empty buffer submits nothing. A failed batch is
    /// reported on the error channel and does not prevent submission of the
    /// remaining batches.
    ///
    /// Must be called from within a Tokio runtime unless the buffer is empty.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Arms the flush scheduler at the configured interval.
    ///
    /// See [`start_with_interval`](Self::start_with_interval).
    pub fn start(&self) -> Result<(), ConfigError> {
        self.start_with_interval(self.inner.config.flush_interval())
    }

    /// Arms the flush scheduler, flushing once per `interval`.
    ///
    /// The first flush happens one full interval after this call. Calling
    /// this while the scheduler is running replaces the previous timer; ticks
    /// of the replaced timer no longer fire. Rejects a zero interval.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_with_interval(&self, interval: Duration) -> Result<(), ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::InvalidInterval);
        }

        let cancel = CancellationToken::new();
        if let Some(previous) = lock(&self.inner.scheduler).replace(cancel.clone()) {
            previous.cancel();
        }

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        // The buffer owning this scheduler may be gone.
                        let Some(inner) = weak.upgrade() else { break };
                        inner.flush();
                    }
                }
            }
        });

        tracing::debug!(
            interval_ms = interval.as_millis() as u64,
            "metric buffer scheduler started"
        );
        Ok(())
    }

    /// Stops the flush scheduler.
    ///
    /// Idempotent. Halts future timer-driven flushes only: in-flight backend
    /// submissions are not cancelled, and manual flushes remain possible.
    pub fn stop(&self) {
        if let Some(cancel) = lock(&self.inner.scheduler).take() {
            cancel.cancel();
            tracing::debug!("metric buffer scheduler stopped");
        }
    }
}

impl fmt::Debug for MetricBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricBuffer")
            .field("config", &self.inner.config)
            .field("datum_count", &self.datum_count())
            .finish()
    }
}

impl Inner {
    fn flush(self: &Arc<Self>) {
        let records = lock(&self.aggregator).drain();
        if records.is_empty() {
            return;
        }

        tracing::trace!(records = records.len(), "flushing metric buffer");

        let mut records = records.into_iter();
        loop {
            let batch: Vec<_> = records.by_ref().take(self.config.batch_count).collect();
            if batch.is_empty() {
                break;
            }

            let inner = Arc::clone(self);
            tokio::spawn(async move {
                let batch_len = batch.len();
                if let Err(source) = inner.backend.submit(&inner.config.namespace, batch).await {
                    tracing::error!(
                        namespace = %inner.config.namespace,
                        batch_len,
                        error = %source,
                        "metric batch submission failed"
                    );

                    let error = SubmitError {
                        namespace: inner.config.namespace.clone(),
                        batch_len,
                        source,
                    };
                    inner.errors.send(error).ok();
                }
            });
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(cancel) = lock(&self.scheduler).take() {
            cancel.cancel();
        }

        let remaining = lock(&self.aggregator).datum_count();
        if remaining > 0 {
            tracing::error!("metric buffer dropping {remaining} unflushed series");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::RwLock;

    use similar_asserts::assert_eq;

    use crate::datum::MetricDatum;
    use crate::{BackendError, dims};

    use super::*;

    #[derive(Default)]
    struct ReceivedData {
        batches: Vec<(String, Vec<MetricDatum>)>,
    }

    #[derive(Clone, Default)]
    struct TestBackend {
        data: Arc<RwLock<ReceivedData>>,
        reject_all: bool,
    }

    impl TestBackend {
        fn rejecting() -> Self {
            Self {
                reject_all: true,
                ..Default::default()
            }
        }

        fn batch_count(&self) -> usize {
            self.data.read().unwrap().batches.len()
        }

        fn batch_sizes(&self) -> Vec<usize> {
            let data = self.data.read().unwrap();
            data.batches.iter().map(|(_, batch)| batch.len()).collect()
        }

        fn records(&self) -> Vec<MetricDatum> {
            let data = self.data.read().unwrap();
            data.batches
                .iter()
                .flat_map(|(_, batch)| batch.iter().cloned())
                .collect()
        }

        fn total_sample_count(&self) -> u64 {
            self.records()
                .iter()
                .map(|datum| datum.statistic_values.sample_count)
                .sum()
        }
    }

    #[async_trait::async_trait]
    impl MetricsBackend for TestBackend {
        async fn submit(
            &self,
            namespace: &str,
            batch: Vec<MetricDatum>,
        ) -> Result<(), BackendError> {
            self.data
                .write()
                .unwrap()
                .batches
                .push((namespace.to_owned(), batch));

            if self.reject_all {
                return Err("backend rejected the batch".into());
            }
            Ok(())
        }
    }

    fn buffer_with(
        backend: &TestBackend,
        config: BufferConfig,
    ) -> (MetricBuffer, mpsc::UnboundedReceiver<SubmitError>) {
        MetricBuffer::new(Arc::new(backend.clone()), config).unwrap()
    }

    /// Yields until spawned submission tasks have run.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_batches_in_order() {
        let backend = TestBackend::default();
        let (buffer, _errors) = buffer_with(&backend, BufferConfig::default());

        for i in 0..45 {
            buffer.push(&format!("metric-{i:03}"), dims![], i as f64).unwrap();
        }

        buffer.flush();
        settle().await;

        assert_eq!(backend.batch_sizes(), vec![20, 20, 5]);

        let names: Vec<_> = backend
            .records()
            .into_iter()
            .map(|datum| datum.metric_name)
            .collect();
        let expected: Vec<_> = (0..45).map(|i| format!("metric-{i:03}")).collect();
        assert_eq!(names, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_empty_submits_nothing() {
        let backend = TestBackend::default();
        let (buffer, _errors) = buffer_with(&backend, BufferConfig::default());

        buffer.flush();
        settle().await;

        assert_eq!(backend.batch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_tags_namespace() {
        let backend = TestBackend::default();
        let config = BufferConfig {
            namespace: "app/prod".to_owned(),
            ..Default::default()
        };
        let (buffer, _errors) = buffer_with(&backend, config);

        buffer.push("requests", dims![], 1.0).unwrap();
        buffer.flush();
        settle().await;

        let data = backend.data.read().unwrap();
        assert_eq!(data.batches[0].0, "app/prod");
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_after_flush_lands_in_new_table() {
        let backend = TestBackend::default();
        let (buffer, _errors) = buffer_with(&backend, BufferConfig::default());

        buffer.push("requests", dims![], 1.0).unwrap();
        buffer.flush();
        buffer.push("requests", dims![], 2.0).unwrap();
        buffer.flush();
        settle().await;

        assert_eq!(backend.batch_sizes(), vec![1, 1]);
        let records = backend.records();
        assert_eq!(records[0].statistic_values.sum, 1.0);
        assert_eq!(records[1].statistic_values.sum, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batches_surface_on_error_channel() {
        let backend = TestBackend::rejecting();
        let (buffer, mut errors) = buffer_with(&backend, BufferConfig::default());

        for i in 0..45 {
            buffer.push(&format!("metric-{i:03}"), dims![], 1.0).unwrap();
        }
        buffer.flush();

        let mut failed_lens = Vec::new();
        for _ in 0..3 {
            failed_lens.push(errors.recv().await.unwrap().batch_len);
        }

        // All batches were attempted despite every one of them failing.
        assert_eq!(backend.batch_sizes(), vec![20, 20, 5]);
        assert_eq!(failed_lens, vec![20, 20, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_flushes_at_interval() {
        let backend = TestBackend::default();
        let (buffer, _errors) = buffer_with(&backend, BufferConfig::default());

        buffer.start_with_interval(Duration::from_millis(500)).unwrap();
        buffer.push("requests", dims![], 1.0).unwrap();

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(backend.batch_count(), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(backend.batch_count(), 1);

        buffer.push("requests", dims![], 2.0).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(backend.batch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_replaces_previous_timer() {
        let backend = TestBackend::default();
        let (buffer, _errors) = buffer_with(&backend, BufferConfig::default());

        // Speeding up: the new, shorter interval takes effect immediately.
        buffer.start_with_interval(Duration::from_secs(10)).unwrap();
        buffer.start_with_interval(Duration::from_millis(500)).unwrap();
        buffer.push("requests", dims![], 1.0).unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(backend.batch_count(), 1);

        // Slowing down: the replaced short timer no longer fires.
        buffer.start_with_interval(Duration::from_secs(10)).unwrap();
        buffer.push("requests", dims![], 2.0).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.batch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_automatic_flushing() {
        let backend = TestBackend::default();
        let (buffer, _errors) = buffer_with(&backend, BufferConfig::default());

        buffer.start_with_interval(Duration::from_millis(500)).unwrap();
        buffer.stop();
        buffer.stop();

        buffer.push("requests", dims![], 1.0).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.batch_count(), 0);

        // Manual flushes stay available while stopped.
        buffer.flush();
        settle().await;
        assert_eq!(backend.batch_count(), 1);

        // The scheduler can be re-armed after a stop.
        buffer.start_with_interval(Duration::from_millis(500)).unwrap();
        buffer.push("requests", dims![], 2.0).unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(backend.batch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_zero_interval() {
        let backend = TestBackend::default();
        let (buffer, _errors) = buffer_with(&backend, BufferConfig::default());

        assert_eq!(
            buffer.start_with_interval(Duration::ZERO),
            Err(ConfigError::InvalidInterval)
        );
    }

    #[test]
    fn test_rejects_zero_batch_count() {
        let config = BufferConfig {
            batch_count: 0,
            ..Default::default()
        };
        let result = MetricBuffer::new(Arc::new(TestBackend::default()), config);
        assert_eq!(result.err(), Some(ConfigError::InvalidBatchCount));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_pushes_never_lost_or_duplicated() {
        const TASKS: u64 = 8;
        const PUSHES: u64 = 250;

        let backend = TestBackend::default();
        let (buffer, _errors) = buffer_with(&backend, BufferConfig::default());

        let mut handles = Vec::new();
        for _ in 0..TASKS {
            let buffer = buffer.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..PUSHES {
                    buffer.push("requests", dims![("host", "a")], 1.0).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }

        // Flush repeatedly while pushes are in flight.
        for _ in 0..50 {
            buffer.flush();
            tokio::task::yield_now().await;
        }

        for handle in handles {
            handle.await.unwrap();
        }
        buffer.flush();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while backend.total_sample_count() < TASKS * PUSHES
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(backend.total_sample_count(), TASKS * PUSHES);
        assert_eq!(buffer.datum_count(), 0);
    }
}

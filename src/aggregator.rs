//! Core functionality of measurement aggregation.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::mem;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::datum::MetricDatum;
use crate::protocol::{DimensionKey, DimensionSet, MetricUnit};

/// Any error that may occur during aggregation.
#[derive(Debug, Error, PartialEq)]
#[error("failed to aggregate metrics: {kind}")]
pub struct AggregateError {
    kind: AggregateErrorKind,
}

impl From<AggregateErrorKind> for AggregateError {
    fn from(kind: AggregateErrorKind) -> Self {
        AggregateError { kind }
    }
}

#[derive(Debug, Error, PartialEq)]
enum AggregateErrorKind {
    /// A measurement value was NaN or infinite.
    #[error("found non-finite value: {0}")]
    InvalidValue(f64),
}

/// In-memory aggregation table for metric measurements.
///
/// The table maps metric names to series, where a series is identified by the
/// canonical [`DimensionKey`] of its dimensions. Measurements reported for the
/// same name and an equivalent dimension set fold into a single
/// [`MetricDatum`] between drains, so at most one record exists per series at
/// any time.
#[derive(Debug, Default)]
pub struct Aggregator {
    metrics: BTreeMap<String, BTreeMap<DimensionKey, MetricDatum>>,
}

impl Aggregator {
    /// Creates an empty aggregation table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the table contains no series.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Returns the number of series currently held in the table.
    pub fn datum_count(&self) -> usize {
        self.metrics.values().map(BTreeMap::len).sum()
    }

    /// Records a single measurement.
    ///
    /// Looks up or creates the series for `name` and the canonical encoding of
    /// `dimensions`, then folds `value` into its statistics. The measurement
    /// that creates a series fixes its timestamp and unit; subsequent
    /// measurements only update the statistics.
    ///
    /// Non-finite values are rejected instead of poisoning the series.
    pub fn insert(
        &mut self,
        name: &str,
        dimensions: DimensionSet,
        value: f64,
        timestamp: DateTime<Utc>,
        unit: MetricUnit,
    ) -> Result<(), AggregateError> {
        if !value.is_finite() {
            return Err(AggregateErrorKind::InvalidValue(value).into());
        }

        let key = DimensionKey::encode(&dimensions);
        let series = self.metrics.entry(name.to_owned()).or_default();

        match series.entry(key) {
            Entry::Occupied(mut entry) => entry.get_mut().statistic_values.insert(value),
            Entry::Vacant(entry) => {
                entry.insert(MetricDatum::new(name, dimensions, value, timestamp, unit));
            }
        }

        Ok(())
    }

    /// Drains the table.
    ///
    /// Replaces the table with an empty one and returns the previous contents
    /// flattened into a single sequence, ordered by metric name and then by
    /// encoded dimension key. The order is stable for a given table state. A
    /// second drain without intervening inserts returns an empty sequence.
    pub fn drain(&mut self) -> Vec<MetricDatum> {
        let metrics = mem::take(&mut self.metrics);
        metrics
            .into_values()
            .flat_map(BTreeMap::into_values)
            .collect()
    }
}

//! Aggregated statistics and the record type submitted to the backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::protocol::{DimensionSet, MetricUnit};

/// A snapshot of the statistics folded into one series.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatisticValues {
    /// The sum of all values folded into the series.
    pub sum: f64,
    /// The minimum value folded into the series.
    pub minimum: f64,
    /// The maximum value folded into the series.
    pub maximum: f64,
    /// The number of values folded into the series.
    pub sample_count: u64,
}

impl StatisticValues {
    /// Creates a statistics snapshot from a single value.
    pub fn single(value: f64) -> Self {
        Self {
            sum: value,
            minimum: value,
            maximum: value,
            sample_count: 1,
        }
    }

    /// Folds a new value into the statistics.
    pub fn insert(&mut self, value: f64) {
        self.sum += value;
        self.minimum = self.minimum.min(value);
        self.maximum = self.maximum.max(value);
        self.sample_count += 1;
    }

    /// Merges two statistics snapshots.
    pub fn merge(&mut self, other: Self) {
        self.sum += other.sum;
        self.minimum = self.minimum.min(other.minimum);
        self.maximum = self.maximum.max(other.maximum);
        self.sample_count += other.sample_count;
    }

    /// Returns the average of all values folded into the series.
    pub fn avg(&self) -> Option<f64> {
        (self.sample_count > 0).then(|| self.sum / self.sample_count as f64)
    }
}

/// An aggregated record for one (metric name, dimension set) series.
///
/// This is the unit of submission to the backend: it carries the statistic
/// tuple of the series rather than the raw samples, which is what keeps the
/// outbound call volume bounded.
///
/// # Serialization
///
/// Records serialize with the field names of the wire protocol:
///
/// ```json
/// {
///   "MetricName": "endpoint.latency",
///   "Dimensions": [{"Name": "host", "Value": "a"}],
///   "Timestamp": "2024-01-01T00:00:00Z",
///   "Unit": "Milliseconds",
///   "StatisticValues": {"Sum": 40.0, "Minimum": 10.0, "Maximum": 30.0, "SampleCount": 2}
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricDatum {
    /// The name of the metric.
    pub metric_name: String,
    /// The dimensions of the series, as supplied by the reporting caller.
    #[serde(default, skip_serializing_if = "SmallVec::is_empty")]
    pub dimensions: DimensionSet,
    /// The representative time of the series.
    ///
    /// This is the timestamp of the measurement that created the series in
    /// the current aggregation window.
    pub timestamp: DateTime<Utc>,
    /// The unit of the measurement values.
    #[serde(default)]
    pub unit: MetricUnit,
    /// The aggregated statistics of the series.
    pub statistic_values: StatisticValues,
}

impl MetricDatum {
    /// Creates a record for a series from its first measurement.
    pub fn new(
        metric_name: impl Into<String>,
        dimensions: DimensionSet,
        value: f64,
        timestamp: DateTime<Utc>,
        unit: MetricUnit,
    ) -> Self {
        Self {
            metric_name: metric_name.into(),
            dimensions,
            timestamp,
            unit,
            statistic_values: StatisticValues::single(value),
        }
    }
}

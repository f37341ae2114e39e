//! Leaf types of the submission protocol: metric units, dimensions, and the
//! canonical dimension-key encoding.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

/// Separates the name from the value within one encoded dimension pair.
const PAIR_SEPARATOR: char = '\u{1f}';

/// Separates encoded dimension pairs from each other.
const GROUP_SEPARATOR: char = '\u{1e}';

/// A key/value tag attached to a measurement.
///
/// Dimensions distinguish independent series reported under the same metric
/// name. Measurements whose dimension sets are equivalent (see
/// [`DimensionKey`]) fold into the same series.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Dimension {
    /// The name of the dimension.
    pub name: String,
    /// The value of the dimension.
    pub value: String,
}

impl Dimension {
    /// Creates a dimension from a name and a value.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// The dimensions of a single series.
///
/// Series rarely carry more than a handful of dimensions, which makes the
/// inline representation worthwhile.
pub type DimensionSet = SmallVec<[Dimension; 4]>;

#[doc(hidden)]
pub use smallvec::smallvec as _smallvec;

/// Creates a [`DimensionSet`] from name/value pairs.
///
/// # Example
///
/// ```
/// let dimensions = metric_buffer::dims![("host", "a"), ("region", "eu")];
/// assert_eq!(dimensions.len(), 2);
/// ```
#[macro_export]
macro_rules! dims {
    ($(($k:expr, $v:expr)),*$(,)?) => {{
        let dimensions: $crate::DimensionSet =
            $crate::_smallvec![$($crate::Dimension::new($k, $v)),*];
        dimensions
    }};
}

/// Canonical lookup key of a dimension set.
///
/// Two dimension sets that differ only in the order of their pairs encode to
/// the same key: pairs are sorted before encoding. The empty set encodes to
/// the empty key, which no non-empty set can produce. Encoding never fails.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DimensionKey(String);

impl DimensionKey {
    /// Encodes `dimensions` into their canonical, order-normalized key.
    pub fn encode(dimensions: &DimensionSet) -> Self {
        let mut pairs: SmallVec<[&Dimension; 4]> = dimensions.iter().collect();
        pairs.sort();

        let mut encoded = String::new();
        for (index, dimension) in pairs.into_iter().enumerate() {
            if index > 0 {
                encoded.push(GROUP_SEPARATOR);
            }
            encoded.push_str(&dimension.name);
            encoded.push(PAIR_SEPARATOR);
            encoded.push_str(&dimension.value);
        }

        Self(encoded)
    }
}

/// An error returned when parsing an invalid [`MetricUnit`].
#[derive(Clone, Copy, Debug, Error)]
#[error("invalid metric unit")]
pub struct ParseMetricUnitError(());

macro_rules! metric_units {
    ($($variant:ident => $name:literal,)*) => {
        /// The unit of a reported measurement.
        ///
        /// Units are informational: they tag the submitted record but do not
        /// influence aggregation. Measurements without an explicit unit use
        /// the [`MetricUnit::None`] sentinel.
        #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
        pub enum MetricUnit {
            $(
                #[doc = concat!("The `", $name, "` unit.")]
                $variant,
            )*
            /// No unit was given for the measurement.
            #[default]
            None,
        }

        impl MetricUnit {
            /// Returns the string representation of this unit.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                    Self::None => "None",
                }
            }
        }

        impl std::str::FromStr for MetricUnit {
            type Err = ParseMetricUnitError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Self::$variant),)*
                    "None" => Ok(Self::None),
                    _ => Err(ParseMetricUnitError(())),
                }
            }
        }
    };
}

metric_units! {
    Seconds => "Seconds",
    Microseconds => "Microseconds",
    Milliseconds => "Milliseconds",
    Bytes => "Bytes",
    Kilobytes => "Kilobytes",
    Megabytes => "Megabytes",
    Gigabytes => "Gigabytes",
    Terabytes => "Terabytes",
    Bits => "Bits",
    Kilobits => "Kilobits",
    Megabits => "Megabits",
    Gigabits => "Gigabits",
    Terabits => "Terabits",
    Percent => "Percent",
    Count => "Count",
    BytesPerSecond => "Bytes/Second",
    KilobytesPerSecond => "Kilobytes/Second",
    MegabytesPerSecond => "Megabytes/Second",
    GigabytesPerSecond => "Gigabytes/Second",
    TerabytesPerSecond => "Terabytes/Second",
    BitsPerSecond => "Bits/Second",
    KilobitsPerSecond => "Kilobits/Second",
    MegabitsPerSecond => "Megabits/Second",
    GigabitsPerSecond => "Gigabits/Second",
    TerabitsPerSecond => "Terabits/Second",
    CountPerSecond => "Count/Second",
}

impl MetricUnit {
    /// Returns `true` if this is the "no unit" sentinel.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Display for MetricUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MetricUnit {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MetricUnit {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let string = std::borrow::Cow::<str>::deserialize(deserializer)?;
        string.parse().map_err(serde::de::Error::custom)
    }
}

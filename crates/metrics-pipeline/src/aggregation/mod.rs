//! Per-series aggregation and the windowed store.

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;

use crate::instrument::InstrumentKind;

pub mod snapshot;
pub mod store;

pub use snapshot::SeriesKey;
pub use snapshot::SeriesSnapshot;
pub use snapshot::Snapshot;
pub use store::AggregationStore;

/// Default explicit histogram bucket boundaries.
pub const DEFAULT_HISTOGRAM_BOUNDARIES: [f64; 15] = [
    0.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0, 500.0, 750.0, 1000.0, 2500.0, 5000.0,
    7500.0, 10000.0,
];

/// Accumulated state of one series within one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Aggregate {
    /// Running sum of a counter; never decreases within a window.
    Sum { value: f64 },
    /// Most recent gauge value, ordered by measurement time.
    LastValue {
        value: f64,
        observed_at: DateTime<Utc>,
    },
    Histogram(HistogramData),
}

impl Aggregate {
    pub(crate) fn new(kind: InstrumentKind, boundaries: &[f64]) -> Self {
        match kind {
            InstrumentKind::Counter => Aggregate::Sum { value: 0.0 },
            InstrumentKind::Gauge => Aggregate::LastValue {
                value: 0.0,
                observed_at: DateTime::<Utc>::MIN_UTC,
            },
            InstrumentKind::Histogram => Aggregate::Histogram(HistogramData::new(boundaries)),
        }
    }

    /// Merge one measurement using the kind-specific rule.
    pub(crate) fn update(&mut self, measurement: f64, at: DateTime<Utc>) {
        match self {
            Aggregate::Sum { value } => *value += measurement,
            Aggregate::LastValue { value, observed_at } => {
                if at >= *observed_at {
                    *value = measurement;
                    *observed_at = at;
                }
            }
            Aggregate::Histogram(data) => data.record(measurement),
        }
    }

    /// Sum of a counter aggregate.
    pub fn sum(&self) -> Option<f64> {
        match self {
            Aggregate::Sum { value } => Some(*value),
            _ => None,
        }
    }

    /// Value of a gauge aggregate.
    pub fn last_value(&self) -> Option<f64> {
        match self {
            Aggregate::LastValue { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn histogram(&self) -> Option<&HistogramData> {
        match self {
            Aggregate::Histogram(data) => Some(data),
            _ => None,
        }
    }
}

/// Explicit-bucket histogram state.
///
/// `bucket_counts` has one more element than `boundaries`: bucket `i` counts
/// values in `(boundaries[i - 1], boundaries[i]]` and the last bucket counts
/// values above the highest boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramData {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub boundaries: Vec<f64>,
    pub bucket_counts: Vec<u64>,
}

impl HistogramData {
    fn new(boundaries: &[f64]) -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            boundaries: boundaries.to_vec(),
            bucket_counts: vec![0; boundaries.len() + 1],
        }
    }

    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        let bucket = self.boundaries.partition_point(|bound| *bound < value);
        self.bucket_counts[bucket] += 1;
    }
}

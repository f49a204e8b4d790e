//! Series keys and immutable drained windows.

use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;

use crate::aggregation::Aggregate;
use crate::attributes::AttributeSet;
use crate::instrument::InstrumentDescriptor;

/// Identity of one aggregated time series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub instrument: Arc<InstrumentDescriptor>,
    pub attributes: AttributeSet,
}

impl SeriesKey {
    pub fn new(instrument: Arc<InstrumentDescriptor>, attributes: AttributeSet) -> Self {
        Self {
            instrument,
            attributes,
        }
    }
}

/// One series as captured at drain time.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesSnapshot {
    pub instrument: Arc<InstrumentDescriptor>,
    pub attributes: AttributeSet,
    pub aggregate: Aggregate,
}

/// Point-in-time copy of every aggregate of one window.
///
/// The store keeps no reference to a snapshot once it is returned from
/// [`AggregationStore::drain`](crate::aggregation::AggregationStore::drain).
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    series: Vec<SeriesSnapshot>,
}

impl Snapshot {
    /// Series are ordered by instrument name, then kind, then attributes.
    pub(crate) fn new(
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        mut series: Vec<SeriesSnapshot>,
    ) -> Self {
        series.sort_by(|a, b| {
            a.instrument
                .name()
                .cmp(b.instrument.name())
                .then_with(|| a.instrument.kind().cmp(&b.instrument.kind()))
                .then_with(|| a.attributes.cmp(&b.attributes))
        });
        Self {
            started_at,
            ended_at,
            series,
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> DateTime<Utc> {
        self.ended_at
    }

    pub fn series(&self) -> &[SeriesSnapshot] {
        &self.series
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Find the aggregate of a series by instrument name and attributes.
    pub fn find(&self, name: &str, attributes: &AttributeSet) -> Option<&Aggregate> {
        self.series
            .iter()
            .find(|s| s.instrument.name() == name && &s.attributes == attributes)
            .map(|s| &s.aggregate)
    }
}

//! Windowed aggregation store.
//!
//! The active window lives behind an [`ArcSwap`]. Recorders take a reference
//! to the current window and update one series under that series' own lock;
//! [`AggregationStore::drain`] publishes a fresh window with a single pointer
//! swap and then waits for recorders still holding the old window to finish
//! before it reads it. A measurement therefore lands in exactly one window.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::DateTime;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;
use tracing::warn;

use crate::aggregation::Aggregate;
use crate::aggregation::SeriesKey;
use crate::aggregation::SeriesSnapshot;
use crate::aggregation::Snapshot;
use crate::diagnostics::Diagnostics;
use crate::diagnostics::DIAGNOSTICS_TARGET;
use crate::error::MetricsError;
use crate::instrument::InstrumentKind;

struct Window {
    started_at: DateTime<Utc>,
    series: DashMap<SeriesKey, Mutex<Aggregate>>,
    series_count: AtomicUsize,
    overflow_reported: AtomicBool,
}

impl Window {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            series: DashMap::new(),
            series_count: AtomicUsize::new(0),
            overflow_reported: AtomicBool::new(false),
        }
    }
}

/// Thread-safe accumulation of measurements between two drains.
pub struct AggregationStore {
    current: ArcSwap<Window>,
    drain_lock: Mutex<()>,
    closed: AtomicBool,
    max_series: usize,
    boundaries: Vec<f64>,
    diagnostics: Arc<Diagnostics>,
}

impl std::fmt::Debug for AggregationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationStore")
            .field("series", &self.len())
            .field("max_series", &self.max_series)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AggregationStore {
    pub fn new(max_series: usize, boundaries: Vec<f64>, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            current: ArcSwap::from_pointee(Window::new(Utc::now())),
            drain_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            max_series,
            boundaries,
            diagnostics,
        }
    }

    /// Merge `value` into the series `key` of the current window.
    ///
    /// Every error is also counted in [`Diagnostics`] before it is returned,
    /// so callers on the recording path may discard it.
    ///
    /// # Errors
    ///
    /// - [`MetricsError::InvalidMeasurement`] for non-finite values and
    ///   negative counter increments
    /// - [`MetricsError::CardinalityLimitExceeded`] when `key` is new and the
    ///   window already holds `max_series` series
    pub fn record(&self, key: SeriesKey, value: f64, at: DateTime<Utc>) -> Result<(), MetricsError> {
        if let Err(err) = Self::check_value(&key, value) {
            self.diagnostics.report(&err);
            return Err(err);
        }
        let window = self.current.load_full();
        // checked after the load: close() precedes the final drain's swap, so
        // a recorder holding the never-drained window sees the flag
        if self.is_closed() {
            trace!(name = key.instrument.name(), "Store closed, measurement dropped");
            return Ok(());
        }

        if let Some(aggregate) = window.series.get(&key) {
            aggregate.lock().update(value, at);
            return Ok(());
        }

        let result = match window.series.entry(key) {
            Entry::Occupied(slot) => {
                slot.get().lock().update(value, at);
                Ok(())
            }
            Entry::Vacant(slot) => {
                let admitted = window
                    .series_count
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < self.max_series).then_some(n + 1)
                    })
                    .is_ok();
                if !admitted {
                    let err = MetricsError::CardinalityLimitExceeded {
                        name: slot.key().instrument.name().to_string(),
                        limit: self.max_series,
                    };
                    self.diagnostics.report(&err);
                    if !window.overflow_reported.swap(true, Ordering::AcqRel) {
                        warn!(target: DIAGNOSTICS_TARGET, error = %err, "New series dropped for the rest of this window");
                    }
                    return Err(err);
                }

                let mut aggregate = Aggregate::new(slot.key().instrument.kind(), &self.boundaries);
                aggregate.update(value, at);
                slot.insert(Mutex::new(aggregate));
                Ok(())
            }
        };
        result
    }

    fn check_value(key: &SeriesKey, value: f64) -> Result<(), MetricsError> {
        let invalid = |reason| MetricsError::InvalidMeasurement {
            name: key.instrument.name().to_string(),
            reason,
        };
        if !value.is_finite() {
            return Err(invalid("value is not finite"));
        }
        if key.instrument.kind() == InstrumentKind::Counter && value < 0.0 {
            return Err(invalid("counter increment is negative"));
        }
        Ok(())
    }

    /// Rotate to a fresh window and return the contents of the old one.
    pub fn drain(&self) -> Snapshot {
        let _guard = self.drain_lock.lock();

        let ended_at = Utc::now();
        let mut previous = self.current.swap(Arc::new(Window::new(ended_at)));

        // recorders that loaded the old window before the swap finish their
        // update before we take ownership of it
        let window = loop {
            match Arc::try_unwrap(previous) {
                Ok(window) => break window,
                Err(shared) => {
                    previous = shared;
                    std::thread::yield_now();
                }
            }
        };

        let started_at = window.started_at;
        let series = window
            .series
            .into_iter()
            .map(|(key, aggregate)| SeriesSnapshot {
                instrument: key.instrument,
                attributes: key.attributes,
                aggregate: aggregate.into_inner(),
            })
            .collect();

        let snapshot = Snapshot::new(started_at, ended_at, series);
        trace!(series = snapshot.len(), "Drained window");
        snapshot
    }

    /// Stop accepting measurements. Data already recorded stays drainable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of series in the current window.
    pub fn len(&self) -> usize {
        self.current.load().series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
